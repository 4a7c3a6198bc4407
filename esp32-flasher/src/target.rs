//! The contract between the flasher and the debug-transport backend.
//!
//! Everything the stub protocol needs from a target boils down to a handful
//! of primitives: leasing target RAM, moving memory blocks, binding values
//! to CPU registers and kicking off execution at an address. A backend
//! implements [`StubTarget`] on top of its wire protocol; the rest of this
//! crate never talks to the hardware directly.

use std::time::Duration;

use thiserror::Error;

/// Execution state of the target core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// The core is stopped under debug control. This is the only state in
    /// which stub operations may be issued.
    Halted,
    /// The core is executing normally.
    Running,
    /// The core is held in reset.
    Reset,
    /// The backend could not determine the state.
    Unknown,
}

/// The two kinds of target RAM a working area can be leased from.
///
/// Stub code must live in memory the core can execute from; everything else
/// (stub data, stack, scratch buffers) goes to the general region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkingAreaKind {
    /// Executable target memory.
    Exec,
    /// General-purpose (data) target memory.
    General,
}

/// A leased region of target memory.
///
/// A working area is owned exclusively by the operation that allocated it
/// and is handed back to the backend through
/// [`StubTarget::free_working_area`], which consumes it. It is deliberately
/// neither `Clone` nor `Copy` so a released area cannot be referenced again.
#[derive(Debug)]
pub struct WorkingArea {
    kind: WorkingAreaKind,
    address: u32,
    size: u32,
}

impl WorkingArea {
    /// Creates a new working area handle. Only backends should need this.
    pub fn new(kind: WorkingAreaKind, address: u32, size: u32) -> Self {
        Self {
            kind,
            address,
            size,
        }
    }

    /// The target address of the start of the area.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// The size of the area in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// The memory region this area was leased from.
    pub fn kind(&self) -> WorkingAreaKind {
        self.kind
    }
}

/// Direction of a parameter slot, from the host's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirection {
    /// The host sets the value, the stub consumes it.
    Out,
    /// The host writes a value in and reads a (possibly different) value
    /// back after execution. Used for the opcode/status register.
    InOut,
}

/// A bound parameter slot: a host-held 32-bit value attached to a target
/// register for the duration of a stub invocation.
///
/// Like [`WorkingArea`], slots are moved into
/// [`StubTarget::unbind_register`] on release and cannot be duplicated.
#[derive(Debug)]
pub struct Slot {
    id: u32,
    name: &'static str,
}

impl Slot {
    /// Creates a new slot handle. Only backends should need this.
    pub fn new(id: u32, name: &'static str) -> Self {
        Self { id, name }
    }

    /// Backend-assigned identifier of the binding.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The register this slot is bound to.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Errors reported by a [`StubTarget`] backend.
#[derive(Debug, Error)]
pub enum TargetError {
    /// The requested working area could not be carved out of the target's
    /// memory pool. Callers may retry with a smaller size.
    #[error("no working area of {size} bytes available in the {kind:?} region")]
    NoWorkingArea {
        /// The region the allocation was attempted in.
        kind: WorkingAreaKind,
        /// The rejected allocation size.
        size: u32,
    },
    /// The algorithm did not run to completion within the given time.
    #[error("algorithm did not halt within {timeout:?}")]
    Timeout {
        /// The enforced timeout.
        timeout: Duration,
    },
    /// Any other transport-level failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Debug-transport operations the stub protocol is built on.
///
/// All calls are synchronous and blocking; the transport is an exclusive,
/// serialized channel and the target stays halted between invocations.
pub trait StubTarget {
    /// Returns the current execution state of the target core.
    fn state(&mut self) -> TargetState;

    /// Leases `size` bytes of target memory from the given region.
    ///
    /// Fails with [`TargetError::NoWorkingArea`] when no region of
    /// sufficient size is free.
    fn alloc_working_area(
        &mut self,
        kind: WorkingAreaKind,
        size: u32,
    ) -> Result<WorkingArea, TargetError>;

    /// Returns a working area to the pool.
    fn free_working_area(&mut self, area: WorkingArea) -> Result<(), TargetError>;

    /// Reads `data.len()` bytes of target memory starting at `address`.
    fn read_memory(&mut self, address: u32, data: &mut [u8]) -> Result<(), TargetError>;

    /// Writes `data` to target memory starting at `address`.
    fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), TargetError>;

    /// Binds a parameter slot to the named register.
    ///
    /// Slots must be released in strict reverse order of binding; backends
    /// are free to reject out-of-order releases.
    fn bind_register(
        &mut self,
        name: &'static str,
        width: u32,
        direction: SlotDirection,
    ) -> Result<Slot, TargetError>;

    /// Releases a previously bound slot.
    fn unbind_register(&mut self, slot: Slot) -> Result<(), TargetError>;

    /// Sets the host-side value of a bound slot.
    fn set_slot(&mut self, slot: &Slot, value: u32) -> Result<(), TargetError>;

    /// Reads back the value of a bound slot.
    fn get_slot(&mut self, slot: &Slot) -> Result<u32, TargetError>;

    /// Executes target code at `entry` with the currently bound slots,
    /// blocking until the core halts again or `timeout` expires.
    fn run_algorithm(&mut self, entry: u32, timeout: Duration) -> Result<(), TargetError>;

    /// Streaming variant of [`StubTarget::run_algorithm`]: while the
    /// algorithm runs, `data` is fed through `scratch` in `block_size`
    /// units, overlapping host-side data movement with on-target
    /// consumption.
    fn run_algorithm_streaming(
        &mut self,
        entry: u32,
        data: &[u8],
        block_size: u32,
        scratch: &WorkingArea,
        timeout: Duration,
    ) -> Result<(), TargetError>;
}
