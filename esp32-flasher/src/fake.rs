//! A simulated target for exercising the stub protocol without hardware.
//!
//! `FakeTarget` models the pieces of a halted ESP32 the flasher interacts
//! with: two working-area pools (executable and general RAM), a register
//! window with LIFO binding discipline, a flash array and the stub's
//! command semantics. Allocation and binding are fully accounted so tests
//! can assert that no operation leaks a lease or a slot.

use std::time::Duration;

use crate::target::{
    Slot, SlotDirection, StubTarget, TargetError, TargetState, WorkingArea, WorkingAreaKind,
};

/// Base address of the simulated executable RAM pool.
pub const FAKE_EXEC_BASE: u32 = 0x4009_0000;

/// Base address of the simulated general RAM pool.
pub const FAKE_GENERAL_BASE: u32 = 0x3FFD_0000;

const CMD_TEST: u32 = 0;
const CMD_READ: u32 = 1;
const CMD_WRITE: u32 = 2;
const CMD_ERASE: u32 = 3;

const STATUS_OK: i32 = 0;
const STATUS_FAIL: i32 = -1;
const STATUS_NOT_SUPPORTED: i32 = -2;

/// One recorded stub invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRecord {
    /// The command code found in `a2`.
    pub command: u32,
    /// The effective flash byte address of this invocation.
    pub address: u32,
    /// The transfer size in bytes.
    pub size: u32,
}

struct Pool {
    base: u32,
    mem: Vec<u8>,
    allocations: Vec<(u32, u32)>,
}

impl Pool {
    fn new(base: u32, size: u32) -> Self {
        Self {
            base,
            mem: vec![0; size as usize],
            allocations: Vec::new(),
        }
    }

    fn end(&self) -> u32 {
        self.base + self.mem.len() as u32
    }

    /// First-fit allocation over the gaps between live leases.
    fn alloc(&mut self, size: u32) -> Option<u32> {
        let mut taken = self.allocations.clone();
        taken.sort_unstable_by_key(|&(address, _)| address);

        let mut cursor = self.base;
        for &(address, len) in &taken {
            if address - cursor >= size {
                break;
            }
            cursor = address + len;
        }
        if self.end() - cursor < size {
            return None;
        }
        self.allocations.push((cursor, size));
        Some(cursor)
    }

    fn free(&mut self, address: u32) -> bool {
        if let Some(index) = self
            .allocations
            .iter()
            .position(|&(start, _)| start == address)
        {
            self.allocations.swap_remove(index);
            true
        } else {
            false
        }
    }

    fn contains(&self, address: u32, len: usize) -> bool {
        address >= self.base && u64::from(address) + len as u64 <= u64::from(self.end())
    }
}

struct FakeSlot {
    id: u32,
    name: &'static str,
    value: u32,
}

/// The stub keeps its transfer progress in its resident data section, so
/// consecutive invocations of the same command continue where the previous
/// one stopped. Rewriting the stub's code (a fresh load) resets this.
struct OpState {
    command: u32,
    next_address: u32,
}

/// A software model of a halted target, for tests and development.
pub struct FakeTarget {
    state: TargetState,
    exec: Pool,
    general: Pool,
    flash: Vec<u8>,
    slots: Vec<FakeSlot>,
    next_slot_id: u32,
    op: Option<OpState>,
    runs: Vec<RunRecord>,
    alloc_requests: Vec<(WorkingAreaKind, u32)>,
}

impl FakeTarget {
    /// Creates a fake target with 16 KiB pools at the canonical bases and
    /// `flash_size` bytes of erased (`0xFF`) flash.
    pub fn new(flash_size: usize) -> Self {
        Self::with_layout(
            FAKE_EXEC_BASE,
            16 * 1024,
            FAKE_GENERAL_BASE,
            16 * 1024,
            flash_size,
        )
    }

    /// Creates a fake target with explicit pool geometry, e.g. to force
    /// scratch-buffer degradation.
    pub fn with_layout(
        exec_base: u32,
        exec_size: u32,
        general_base: u32,
        general_size: u32,
        flash_size: usize,
    ) -> Self {
        Self {
            state: TargetState::Halted,
            exec: Pool::new(exec_base, exec_size),
            general: Pool::new(general_base, general_size),
            flash: vec![0xFF; flash_size],
            slots: Vec::new(),
            next_slot_id: 0,
            op: None,
            runs: Vec::new(),
            alloc_requests: Vec::new(),
        }
    }

    /// Forces the reported execution state.
    pub fn set_state(&mut self, state: TargetState) {
        self.state = state;
    }

    /// Number of currently leased working areas across both pools.
    pub fn live_areas(&self) -> usize {
        self.exec.allocations.len() + self.general.allocations.len()
    }

    /// Number of currently bound parameter slots.
    pub fn bound_slots(&self) -> usize {
        self.slots.len()
    }

    /// Every stub invocation so far, in order.
    pub fn runs(&self) -> &[RunRecord] {
        &self.runs
    }

    /// Every working-area allocation request so far, including rejected
    /// ones.
    pub fn alloc_requests(&self) -> &[(WorkingAreaKind, u32)] {
        &self.alloc_requests
    }

    /// The simulated flash contents.
    pub fn flash(&self) -> &[u8] {
        &self.flash
    }

    /// Mutable access to the simulated flash, e.g. to seed test patterns.
    pub fn flash_mut(&mut self) -> &mut [u8] {
        &mut self.flash
    }

    fn pool(&mut self, kind: WorkingAreaKind) -> &mut Pool {
        match kind {
            WorkingAreaKind::Exec => &mut self.exec,
            WorkingAreaKind::General => &mut self.general,
        }
    }

    fn ram_slice_mut(&mut self, address: u32, len: usize) -> Result<&mut [u8], TargetError> {
        let pools = [&mut self.exec, &mut self.general];
        for pool in pools {
            if pool.contains(address, len) {
                let offset = (address - pool.base) as usize;
                return Ok(&mut pool.mem[offset..offset + len]);
            }
        }
        Err(TargetError::Other(anyhow::anyhow!(
            "address {address:#010x}+{len} is outside the simulated target memory"
        )))
    }

    fn require_reg(&self, name: &str) -> Result<u32, TargetError> {
        self.slots
            .iter()
            .rev()
            .find(|slot| slot.name == name)
            .map(|slot| slot.value)
            .ok_or_else(|| TargetError::Other(anyhow::anyhow!("register {name} is not bound")))
    }

    fn set_reg(&mut self, name: &str, value: u32) -> Result<(), TargetError> {
        let slot = self
            .slots
            .iter_mut()
            .rev()
            .find(|slot| slot.name == name)
            .ok_or_else(|| TargetError::Other(anyhow::anyhow!("register {name} is not bound")))?;
        slot.value = value;
        Ok(())
    }

    fn check_entry(&self, entry: u32) -> Result<(), TargetError> {
        if self.exec.contains(entry, 1) {
            Ok(())
        } else {
            Err(TargetError::Other(anyhow::anyhow!(
                "algorithm entry {entry:#010x} is outside executable memory"
            )))
        }
    }

    /// Executes one stub command based on the currently bound registers.
    fn run_stub(&mut self) -> Result<(), TargetError> {
        let command = self.require_reg("a2")?;
        let status = match command {
            CMD_TEST => {
                self.runs.push(RunRecord {
                    command,
                    address: 0,
                    size: 0,
                });
                STATUS_OK
            }
            CMD_READ | CMD_WRITE | CMD_ERASE => {
                let base = self.require_reg("a3")?;
                let size = self.require_reg("a4")?;
                let start = match &self.op {
                    Some(op) if op.command == command => op.next_address,
                    _ => base,
                };
                self.op = Some(OpState {
                    command,
                    next_address: start + size,
                });
                self.runs.push(RunRecord {
                    command,
                    address: start,
                    size,
                });

                let start = start as usize;
                let end = start + size as usize;
                if end > self.flash.len() {
                    STATUS_FAIL
                } else {
                    match command {
                        CMD_ERASE => {
                            self.flash[start..end].fill(0xFF);
                            STATUS_OK
                        }
                        CMD_READ => {
                            let buffer = self.require_reg("a5")?;
                            let chunk = self.flash[start..end].to_vec();
                            self.ram_slice_mut(buffer, chunk.len())?
                                .copy_from_slice(&chunk);
                            STATUS_OK
                        }
                        CMD_WRITE => {
                            let buffer = self.require_reg("a5")?;
                            let chunk = self.ram_slice_mut(buffer, size as usize)?.to_vec();
                            self.flash[start..end].copy_from_slice(&chunk);
                            STATUS_OK
                        }
                        _ => unreachable!(),
                    }
                }
            }
            _ => STATUS_NOT_SUPPORTED,
        };
        self.set_reg("a2", status as u32)
    }
}

impl StubTarget for FakeTarget {
    fn state(&mut self) -> TargetState {
        self.state
    }

    fn alloc_working_area(
        &mut self,
        kind: WorkingAreaKind,
        size: u32,
    ) -> Result<WorkingArea, TargetError> {
        self.alloc_requests.push((kind, size));
        match self.pool(kind).alloc(size) {
            Some(address) => Ok(WorkingArea::new(kind, address, size)),
            None => Err(TargetError::NoWorkingArea { kind, size }),
        }
    }

    fn free_working_area(&mut self, area: WorkingArea) -> Result<(), TargetError> {
        if self.pool(area.kind()).free(area.address()) {
            Ok(())
        } else {
            Err(TargetError::Other(anyhow::anyhow!(
                "freed unknown working area at {:#010x}",
                area.address()
            )))
        }
    }

    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), TargetError> {
        let len = data.len();
        data.copy_from_slice(self.ram_slice_mut(address, len)?);
        Ok(())
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError> {
        // Rewriting stub code means a fresh load: the resident stub's
        // internal transfer state is gone.
        if self.exec.contains(address, data.len()) {
            self.op = None;
        }
        self.ram_slice_mut(address, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn bind_register(
        &mut self,
        name: &'static str,
        width: u32,
        _direction: SlotDirection,
    ) -> Result<Slot, TargetError> {
        if width != 32 {
            return Err(TargetError::Other(anyhow::anyhow!(
                "only 32-bit registers are supported, got {width}"
            )));
        }
        let id = self.next_slot_id;
        self.next_slot_id += 1;
        self.slots.push(FakeSlot { id, name, value: 0 });
        Ok(Slot::new(id, name))
    }

    fn unbind_register(&mut self, slot: Slot) -> Result<(), TargetError> {
        match self.slots.last() {
            Some(last) if last.id == slot.id() => {
                self.slots.pop();
                Ok(())
            }
            _ => Err(TargetError::Other(anyhow::anyhow!(
                "parameter slot {} ({}) released out of reverse bind order",
                slot.id(),
                slot.name()
            ))),
        }
    }

    fn set_slot(&mut self, slot: &Slot, value: u32) -> Result<(), TargetError> {
        let id = slot.id();
        let entry = self
            .slots
            .iter_mut()
            .find(|candidate| candidate.id == id)
            .ok_or_else(|| TargetError::Other(anyhow::anyhow!("unknown slot {id}")))?;
        entry.value = value;
        Ok(())
    }

    fn get_slot(&mut self, slot: &Slot) -> Result<u32, TargetError> {
        let id = slot.id();
        self.slots
            .iter()
            .find(|candidate| candidate.id == id)
            .map(|candidate| candidate.value)
            .ok_or_else(|| TargetError::Other(anyhow::anyhow!("unknown slot {id}")))
    }

    fn run_algorithm(&mut self, entry: u32, _timeout: Duration) -> Result<(), TargetError> {
        self.check_entry(entry)?;
        self.run_stub()
    }

    fn run_algorithm_streaming(
        &mut self,
        entry: u32,
        data: &[u8],
        block_size: u32,
        scratch: &WorkingArea,
        _timeout: Duration,
    ) -> Result<(), TargetError> {
        self.check_entry(entry)?;
        if !self.general.contains(scratch.address(), scratch.size() as usize) {
            return Err(TargetError::Other(anyhow::anyhow!(
                "streaming scratch area is outside the general pool"
            )));
        }
        if block_size == 0 || data.len() % block_size as usize != 0 {
            return Err(TargetError::Other(anyhow::anyhow!(
                "streamed data is not a whole number of {block_size}-byte blocks"
            )));
        }

        let command = self.require_reg("a2")?;
        if command != CMD_WRITE {
            self.set_reg("a2", STATUS_NOT_SUPPORTED as u32)?;
            return Ok(());
        }
        let address = self.require_reg("a3")?;
        let count = (self.require_reg("a4")? as usize).min(data.len());
        self.runs.push(RunRecord {
            command,
            address,
            size: count as u32,
        });

        let start = address as usize;
        let status = if start + count > self.flash.len() {
            STATUS_FAIL
        } else {
            self.flash[start..start + count].copy_from_slice(&data[..count]);
            STATUS_OK
        };
        self.set_reg("a2", status as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn pool_reuses_freed_space() {
        let mut pool = Pool::new(0x1000, 256);
        let a = pool.alloc(128).unwrap();
        let b = pool.alloc(128).unwrap();
        assert_eq!((a, b), (0x1000, 0x1080));
        assert!(pool.alloc(1).is_none());

        assert!(pool.free(a));
        let c = pool.alloc(64).unwrap();
        assert_eq!(c, 0x1000);
    }

    #[test]
    fn out_of_order_unbind_is_rejected() {
        let mut target = FakeTarget::new(1024);
        let first = target
            .bind_register("a2", 32, SlotDirection::InOut)
            .unwrap();
        let _second = target.bind_register("a3", 32, SlotDirection::Out).unwrap();

        assert!(target.unbind_register(first).is_err());
    }

    #[test]
    fn double_free_is_rejected() {
        let mut target = FakeTarget::new(1024);
        let area = target
            .alloc_working_area(WorkingAreaKind::General, 64)
            .unwrap();
        let address = area.address();
        target.free_working_area(area).unwrap();
        assert!(target
            .free_working_area(WorkingArea::new(WorkingAreaKind::General, address, 64))
            .is_err());
    }
}
