//! Loading the flash stub into target memory.
//!
//! The stub is compiled against fixed working-area addresses, so loading is
//! mostly bookkeeping: lease an area per section, verify the lease landed
//! where the section was linked for, stream the bytes over, and prepare a
//! stack and a tiny trampoline the algorithm runner jumps to. All leases
//! and register bindings roll back symmetrically if any step fails.

use crate::error::FlashError;
use crate::image::StubImage;
use crate::params::ParamWindow;
use crate::target::{SlotDirection, StubTarget, TargetError, WorkingArea, WorkingAreaKind};

/// Size of the dedicated stub stack working area.
pub(crate) const STUB_STACK_SIZE: u32 = 1024;

/// Byte pattern the stack is stamped with before each run.
pub(crate) const STUB_STACK_STAMP: u8 = 0xCE;

/// Section content is streamed to the target in units of this size to
/// bound host-side buffering.
const SECTION_WRITE_CHUNK: usize = 512;

/// The stack is stamped and scanned in units of this size.
const STACK_SCAN_CHUNK: usize = 256;

/// Initial PS register value for the stub: WOE set so register windows
/// rotate on calls, CALLINC 2 to match the trampoline's call, UM (user
/// vector mode) and INTLEVEL 1 so debug interrupts stay deliverable while
/// the stub runs. The stub is built against exactly this value; it is an
/// opaque pattern of the CPU's execution model, not something to re-derive.
const STUB_INITIAL_PS: u32 = 0x6_0021;

/// Initial register window position.
const STUB_INITIAL_WINDOWBASE: u32 = 0;

/// Initial register window occupancy mask (only the base frame live).
const STUB_INITIAL_WINDOWSTART: u32 = 1;

/// Bootstrap blob the algorithm runner actually jumps to. It transfers
/// control into the stub through `a0` and parks the core on a `break` when
/// the stub returns, so the transport sees a clean halt:
///
/// ```text
/// callx0  a0
/// break   1, 1
/// ```
const STUB_TRAMPOLINE: [u8; 6] = [0xc0, 0x00, 0x00, 0x10, 0x41, 0x00];

#[derive(Debug, Clone, Copy)]
enum AreaRole {
    Code,
    Data,
    Stack,
    Trampoline,
}

/// A stub resident in target memory, ready to be invoked.
///
/// Working areas are recorded in acquisition order; [`LoadedStub::unload`]
/// releases them in reverse, followed by the bootstrap register slots in
/// reverse bind order. The same path doubles as the rollback for a
/// partially completed load.
pub(crate) struct LoadedStub {
    areas: Vec<(AreaRole, WorkingArea)>,
    boot: ParamWindow,
    entry: u32,
    stack_address: u32,
    stack_top: u32,
    trampoline_address: u32,
}

impl LoadedStub {
    /// Loads `image` into the target's working areas and prepares the
    /// initial execution context.
    pub(crate) fn load<T: StubTarget>(
        target: &mut T,
        image: &StubImage,
    ) -> Result<Self, FlashError> {
        let mut stub = Self {
            areas: Vec::new(),
            boot: ParamWindow::new(),
            entry: image.entry(),
            stack_address: 0,
            stack_top: 0,
            trampoline_address: 0,
        };
        match stub.download(target, image) {
            Ok(()) => Ok(stub),
            Err(error) => {
                if let Err(rollback) = stub.unload(target) {
                    tracing::warn!("rollback after failed stub load also failed: {rollback}");
                }
                Err(error)
            }
        }
    }

    fn download<T: StubTarget>(
        &mut self,
        target: &mut T,
        image: &StubImage,
    ) -> Result<(), FlashError> {
        tracing::info!(
            "stub: entry {:#010x}, {} sections",
            image.entry(),
            image.sections().len()
        );

        for section in image.sections() {
            let (kind, role, purpose) = if section.is_executable() {
                (WorkingAreaKind::Exec, AreaRole::Code, "stub code")
            } else {
                (WorkingAreaKind::General, AreaRole::Data, "stub data")
            };

            let area = alloc_area(target, kind, section.size(), purpose)?;
            let area_address = area.address();
            self.areas.push((role, area));

            // The stub is linked for fixed addresses; it cannot be
            // relocated here.
            if area_address != section.address() {
                return Err(FlashError::LayoutMismatch {
                    kind: if section.is_executable() {
                        "code"
                    } else {
                        "data"
                    },
                    section_address: section.address(),
                    area_address,
                });
            }

            let size = section.size() as usize;
            let mut written = 0;
            while written < size {
                let len = SECTION_WRITE_CHUNK.min(size - written);
                target
                    .write_memory(area_address + written as u32, section.read(written, len))
                    .map_err(FlashError::Transfer)?;
                written += len;
            }
            tracing::debug!(
                "loaded {purpose} section: {:#010x}, {} bytes",
                section.address(),
                section.size()
            );
        }

        let stack = alloc_area(target, WorkingAreaKind::General, STUB_STACK_SIZE, "stub stack")?;
        self.stack_address = stack.address();
        let mut stack_top = stack.address() + STUB_STACK_SIZE;
        self.areas.push((AreaRole::Stack, stack));
        if stack_top % 16 != 0 {
            tracing::debug!("aligning stack top {stack_top:#010x} down to 16 bytes");
            stack_top &= !0xF;
        }
        self.stack_top = stack_top;

        let trampoline = alloc_area(
            target,
            WorkingAreaKind::Exec,
            STUB_TRAMPOLINE.len() as u32,
            "stub trampoline",
        )?;
        self.trampoline_address = trampoline.address();
        self.areas.push((AreaRole::Trampoline, trampoline));
        target
            .write_memory(self.trampoline_address, &STUB_TRAMPOLINE)
            .map_err(FlashError::Transfer)?;

        // Bootstrap context: the trampoline expects the stub entry in a0
        // and the stack pointer in a1; the window and PS registers bring
        // the core into a state the stub can run from.
        let entry = self.boot.bind(target, "a0", SlotDirection::Out)?;
        self.boot.set(target, entry, self.entry)?;
        let stack_pointer = self.boot.bind(target, "a1", SlotDirection::Out)?;
        self.boot.set(target, stack_pointer, self.stack_top)?;
        let windowbase = self.boot.bind(target, "windowbase", SlotDirection::Out)?;
        self.boot.set(target, windowbase, STUB_INITIAL_WINDOWBASE)?;
        let windowstart = self.boot.bind(target, "windowstart", SlotDirection::Out)?;
        self.boot.set(target, windowstart, STUB_INITIAL_WINDOWSTART)?;
        let ps = self.boot.bind(target, "ps", SlotDirection::Out)?;
        self.boot.set(target, ps, STUB_INITIAL_PS)?;

        Ok(())
    }

    /// Releases every working area and bootstrap slot this stub holds, in
    /// reverse acquisition order. Safe to call on a partially loaded stub.
    pub(crate) fn unload<T: StubTarget>(&mut self, target: &mut T) -> Result<(), FlashError> {
        let mut first_error = None;
        while let Some((role, area)) = self.areas.pop() {
            if let Err(error) = target.free_working_area(area) {
                tracing::warn!("failed to free {role:?} working area: {error}");
                first_error.get_or_insert(FlashError::Transfer(error));
            }
        }
        if let Err(error) = self.boot.release(target) {
            first_error.get_or_insert(error);
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Entry address the algorithm runner invokes.
    pub(crate) fn trampoline_address(&self) -> u32 {
        self.trampoline_address
    }

    /// The 16-byte-aligned initial stack pointer.
    #[cfg(test)]
    pub(crate) fn stack_top(&self) -> u32 {
        self.stack_top
    }

    /// Base address of the stack working area.
    pub(crate) fn stack_address(&self) -> u32 {
        self.stack_address
    }

    /// Stamps the whole stack working area with [`STUB_STACK_STAMP`].
    pub(crate) fn fill_stack<T: StubTarget>(&self, target: &mut T) -> Result<(), FlashError> {
        let pattern = [STUB_STACK_STAMP; STACK_SCAN_CHUNK];
        let mut offset = 0;
        while offset < STUB_STACK_SIZE as usize {
            let len = STACK_SCAN_CHUNK.min(STUB_STACK_SIZE as usize - offset);
            target
                .write_memory(self.stack_address + offset as u32, &pattern[..len])
                .map_err(FlashError::Transfer)?;
            offset += len;
        }
        Ok(())
    }

    /// Scans the stack from its lowest address after a run.
    ///
    /// The stack grows downwards, so a corrupted byte at offset 0 means the
    /// stub ran out of stack and the run's result is untrustworthy. A
    /// non-stamp byte further up only marks the high-water mark and is
    /// reported as a diagnostic.
    pub(crate) fn check_stack<T: StubTarget>(&self, target: &mut T) -> Result<(), FlashError> {
        let mut buf = [0u8; STACK_SCAN_CHUNK];
        let mut offset = 0;
        while offset < STUB_STACK_SIZE as usize {
            let len = STACK_SCAN_CHUNK.min(STUB_STACK_SIZE as usize - offset);
            target
                .read_memory(self.stack_address + offset as u32, &mut buf[..len])
                .map_err(FlashError::Transfer)?;
            if let Some(pos) = buf[..len].iter().position(|&b| b != STUB_STACK_STAMP) {
                if offset + pos == 0 {
                    tracing::error!("stub stack overflow detected");
                    return Err(FlashError::StackOverflow);
                }
                tracing::warn!(
                    "stub stack bytes unused: {} of {}",
                    offset + pos,
                    STUB_STACK_SIZE
                );
                return Ok(());
            }
            offset += len;
        }
        Ok(())
    }
}

fn alloc_area<T: StubTarget>(
    target: &mut T,
    kind: WorkingAreaKind,
    size: u32,
    purpose: &'static str,
) -> Result<WorkingArea, FlashError> {
    match target.alloc_working_area(kind, size) {
        Ok(area) => Ok(area),
        Err(TargetError::NoWorkingArea { .. }) => {
            tracing::error!("no working area available for {purpose} ({size} bytes)");
            Err(FlashError::WorkingAreaUnavailable { purpose, size })
        }
        Err(error) => Err(FlashError::Transfer(error)),
    }
}
