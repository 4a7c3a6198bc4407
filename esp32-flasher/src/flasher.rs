//! The chunked transfer engine.
//!
//! Every flash operation follows the same shape: check the target is
//! halted, make the stub resident, bind the command's parameter slots,
//! possibly lease a scratch buffer, then repeat the marshal → run → verify
//! → move-data cycle until the requested range is covered. The first
//! failure aborts the operation; cleanup runs on every exit path and
//! releases the command slots, the stub and the scratch area in that
//! order.

use std::time::{Duration, Instant};

use crate::config::{StubConfig, WriteStrategy};
use crate::error::FlashError;
use crate::image::StubImage;
use crate::params::ParamWindow;
use crate::progress::FlashProgress;
use crate::stub::LoadedStub;
use crate::target::{SlotDirection, StubTarget, TargetError, TargetState, WorkingAreaKind};

/// Status the stub leaves in its result register.
const STUB_ERR_OK: i32 = 0;

/// Minimum useful scratch buffer for writes; degrading below this would
/// turn the transfer into a stream of degenerate tiny chunks.
const WRITE_SCRATCH_FLOOR: u32 = 32;

/// Initial scratch request for the streaming write strategy.
const STREAMING_SCRATCH_SIZE: u32 = 16 * 1024;

/// Pacing unit of the streaming data feed.
const STREAMING_BLOCK_SIZE: u32 = 4;

/// Commands understood by the stub, passed through its result register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StubCommand {
    Test,
    Read,
    Write,
    Erase,
}

impl StubCommand {
    pub(crate) fn code(self) -> u32 {
        match self {
            StubCommand::Test => 0,
            StubCommand::Read => 1,
            StubCommand::Write => 2,
            StubCommand::Erase => 3,
        }
    }

    fn name(self) -> &'static str {
        match self {
            StubCommand::Test => "test",
            StubCommand::Read => "read",
            StubCommand::Write => "write",
            StubCommand::Erase => "erase",
        }
    }
}

/// Drives stub-based flash operations against one target.
pub(crate) struct StubFlasher<'a, T: StubTarget> {
    target: &'a mut T,
    image: &'a StubImage,
    config: &'a StubConfig,
    progress: &'a FlashProgress,
}

impl<'a, T: StubTarget> StubFlasher<'a, T> {
    pub(crate) fn new(
        target: &'a mut T,
        image: &'a StubImage,
        config: &'a StubConfig,
        progress: &'a FlashProgress,
    ) -> Self {
        Self {
            target,
            image,
            config,
            progress,
        }
    }

    /// Runs one operation against a freshly loaded stub.
    ///
    /// This is the single funnel for the precondition check, stub
    /// residency and the multi-path cleanup: the closure does the
    /// command-specific work, then command slots, stub areas and the
    /// scratch buffer are released whether it succeeded or not. A cleanup
    /// failure is only surfaced when the operation itself succeeded.
    fn execute<R>(
        &mut self,
        f: impl FnOnce(&mut ActiveStub<'_, T>) -> Result<R, FlashError>,
    ) -> Result<R, FlashError> {
        let state = self.target.state();
        if state != TargetState::Halted {
            tracing::error!("target not halted");
            return Err(FlashError::TargetNotHalted { state });
        }

        let stub = LoadedStub::load(self.target, self.image)?;
        let mut active = ActiveStub {
            target: &mut *self.target,
            stub,
            params: ParamWindow::new(),
            scratch: None,
            timeout: self.config.timeout(),
            canary: self.config.stack_canary,
        };

        let result = f(&mut active);
        let cleanup = active.dismantle();

        match (result, cleanup) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(error)) => Err(error),
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(cleanup_error)) => {
                tracing::warn!("cleanup after failed operation also failed: {cleanup_error}");
                Err(error)
            }
        }
    }

    /// Erases `count` bytes starting at byte `offset`, both derived from
    /// whole sectors by the caller. A single stub invocation covers the
    /// whole range.
    #[tracing::instrument(skip(self))]
    pub(crate) fn erase(&mut self, offset: u32, count: u32) -> Result<(), FlashError> {
        self.execute(|active| {
            let result = active.bind("a2", SlotDirection::InOut)?;
            let address = active.bind("a3", SlotDirection::Out)?;
            let size = active.bind("a4", SlotDirection::Out)?;

            active.set(result, StubCommand::Erase.code())?;
            active.set(address, offset)?;
            active.set(size, count)?;

            active.run()?;
            active.check_status(result, StubCommand::Erase)
        })
    }

    /// Reads `out.len()` bytes starting at byte `offset` into `out`,
    /// bouncing each chunk through a scratch working area.
    #[tracing::instrument(skip(self, out), fields(count = out.len()))]
    pub(crate) fn read(&mut self, offset: u32, out: &mut [u8]) -> Result<(), FlashError> {
        if out.is_empty() {
            return Ok(());
        }
        let progress = self.progress;
        self.execute(|active| {
            let result = active.bind("a2", SlotDirection::InOut)?;
            let address = active.bind("a3", SlotDirection::Out)?;
            let size = active.bind("a4", SlotDirection::Out)?;
            let buffer = active.bind("a5", SlotDirection::Out)?;

            let (scratch_address, scratch_size) =
                active.alloc_scratch("flash read buffer", out.len() as u32, 0)?;

            // The flash address is set once; the stub tracks transfer
            // progress in its resident data section across invocations.
            active.set(address, offset)?;
            active.set(buffer, scratch_address)?;

            let mut total = 0;
            while total < out.len() {
                let started = Instant::now();
                let chunk = (scratch_size as usize).min(out.len() - total);
                // The previous run overwrote the result slot with its
                // status, so the opcode is re-armed every iteration.
                active.set(result, StubCommand::Read.code())?;
                active.set(size, chunk as u32)?;

                active.run()?;
                active.check_status(result, StubCommand::Read)?;

                active.read_scratch(scratch_address, &mut out[total..total + chunk])?;
                progress.chunk_read(chunk as u32, started.elapsed());
                total += chunk;
            }
            Ok(())
        })
    }

    /// Writes `data` starting at byte `offset`, using the configured
    /// transfer strategy.
    pub(crate) fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        match self.config.write_strategy {
            WriteStrategy::Buffered => self.write_buffered(offset, data),
            WriteStrategy::Streaming => self.write_streaming(offset, data),
        }
    }

    #[tracing::instrument(skip(self, data), fields(count = data.len()))]
    fn write_buffered(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        let progress = self.progress;
        self.execute(|active| {
            let result = active.bind("a2", SlotDirection::InOut)?;
            let address = active.bind("a3", SlotDirection::Out)?;
            let size = active.bind("a4", SlotDirection::Out)?;
            let buffer = active.bind("a5", SlotDirection::Out)?;

            let (scratch_address, scratch_size) = active.alloc_scratch(
                "flash write buffer",
                data.len() as u32,
                WRITE_SCRATCH_FLOOR,
            )?;

            active.set(address, offset)?;
            active.set(buffer, scratch_address)?;

            let mut total = 0;
            while total < data.len() {
                let started = Instant::now();
                let chunk = (scratch_size as usize).min(data.len() - total);
                active.set(result, StubCommand::Write.code())?;
                active.set(size, chunk as u32)?;

                active.write_scratch(scratch_address, &data[total..total + chunk])?;
                active.run()?;
                active.check_status(result, StubCommand::Write)?;

                progress.chunk_programmed(chunk as u32, started.elapsed());
                total += chunk;
            }
            Ok(())
        })
    }

    #[tracing::instrument(skip(self, data), fields(count = data.len()))]
    fn write_streaming(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.is_empty() {
            return Ok(());
        }
        if offset % 4 != 0 {
            return Err(FlashError::UnalignedOffset { offset });
        }

        // The stream is consumed in 4-byte blocks; pad a private copy of
        // the tail with the flash's erased value.
        let padded;
        let data = if data.len() % 4 != 0 {
            tracing::info!("odd number of bytes to write, padding with 0xff");
            let mut copy = data.to_vec();
            copy.resize(data.len().next_multiple_of(4), 0xFF);
            padded = copy;
            &padded[..]
        } else {
            data
        };

        let progress = self.progress;
        self.execute(|active| {
            let result = active.bind("a2", SlotDirection::InOut)?;
            let address = active.bind("a3", SlotDirection::Out)?;
            let size = active.bind("a4", SlotDirection::Out)?;
            let buffer = active.bind("a5", SlotDirection::Out)?;
            let buffer_end = active.bind("a6", SlotDirection::Out)?;

            let (scratch_address, scratch_size) = active.alloc_scratch(
                "flash write buffer",
                STREAMING_SCRATCH_SIZE,
                WRITE_SCRATCH_FLOOR,
            )?;

            let started = Instant::now();
            active.set(result, StubCommand::Write.code())?;
            active.set(address, offset)?;
            active.set(size, data.len() as u32)?;
            active.set(buffer, scratch_address)?;
            active.set(buffer_end, scratch_address + scratch_size)?;

            active.run_streaming(data)?;
            active.check_status(result, StubCommand::Write)?;

            progress.chunk_programmed(data.len() as u32, started.elapsed());
            Ok(())
        })
    }

    /// Issues the stub's health-check command through the full
    /// load/run/cleanup path.
    #[tracing::instrument(skip(self))]
    pub(crate) fn test(&mut self) -> Result<(), FlashError> {
        self.execute(|active| {
            let result = active.bind("a2", SlotDirection::InOut)?;
            let address = active.bind("a3", SlotDirection::Out)?;
            let size = active.bind("a4", SlotDirection::Out)?;

            active.set(result, StubCommand::Test.code())?;
            active.set(address, 0)?;
            active.set(size, 0)?;

            active.run()?;
            active.check_status(result, StubCommand::Test)
        })
    }
}

/// A loaded stub plus the per-operation resources of one command.
struct ActiveStub<'a, T: StubTarget> {
    target: &'a mut T,
    stub: LoadedStub,
    params: ParamWindow,
    scratch: Option<crate::target::WorkingArea>,
    timeout: Duration,
    canary: bool,
}

impl<T: StubTarget> ActiveStub<'_, T> {
    fn bind(&mut self, name: &'static str, direction: SlotDirection) -> Result<usize, FlashError> {
        self.params.bind(self.target, name, direction)
    }

    fn set(&mut self, index: usize, value: u32) -> Result<(), FlashError> {
        self.params.set(self.target, index, value)
    }

    /// Leases a scratch working area, halving the request on allocation
    /// failure until it succeeds or shrinks to `floor`.
    fn alloc_scratch(
        &mut self,
        purpose: &'static str,
        requested: u32,
        floor: u32,
    ) -> Result<(u32, u32), FlashError> {
        let mut size = requested;
        loop {
            match self
                .target
                .alloc_working_area(WorkingAreaKind::General, size)
            {
                Ok(area) => {
                    if size < requested {
                        tracing::debug!(
                            "scratch buffer degraded to {size} of {requested} requested bytes"
                        );
                    }
                    let address = area.address();
                    let granted = area.size();
                    self.scratch = Some(area);
                    return Ok((address, granted));
                }
                Err(TargetError::NoWorkingArea { .. }) => {
                    size /= 2;
                    if size <= floor {
                        tracing::error!("failed to alloc target buffer for flash data");
                        return Err(FlashError::WorkingAreaUnavailable {
                            purpose,
                            size: requested,
                        });
                    }
                }
                Err(error) => return Err(FlashError::Transfer(error)),
            }
        }
    }

    /// Runs the stub once: stamp the stack, execute the trampoline under
    /// the timeout, scan the stack.
    fn run(&mut self) -> Result<(), FlashError> {
        if self.canary {
            self.stub.fill_stack(self.target)?;
        }
        tracing::debug!(
            "algorithm run @ {:#010x}, stack @ {:#010x}",
            self.stub.trampoline_address(),
            self.stub.stack_address(),
        );
        self.target
            .run_algorithm(self.stub.trampoline_address(), self.timeout)
            .map_err(FlashError::Execution)?;
        if self.canary {
            self.stub.check_stack(self.target)?;
        }
        Ok(())
    }

    /// Streaming variant of [`ActiveStub::run`]: one execution paired with
    /// a continuous data feed through the scratch area.
    fn run_streaming(&mut self, data: &[u8]) -> Result<(), FlashError> {
        let Some(scratch) = self.scratch.as_ref() else {
            return Err(FlashError::Execution(TargetError::Other(anyhow::anyhow!(
                "streaming run issued without a scratch area"
            ))));
        };
        if self.canary {
            self.stub.fill_stack(self.target)?;
        }
        tracing::debug!(
            "streaming algorithm run @ {:#010x}, {} bytes through {:#010x}",
            self.stub.trampoline_address(),
            data.len(),
            scratch.address(),
        );
        self.target
            .run_algorithm_streaming(
                self.stub.trampoline_address(),
                data,
                STREAMING_BLOCK_SIZE,
                scratch,
                self.timeout,
            )
            .map_err(FlashError::Execution)?;
        if self.canary {
            self.stub.check_stack(self.target)?;
        }
        Ok(())
    }

    /// Reads back the stub's status register and surfaces any non-zero
    /// code.
    fn check_status(&mut self, index: usize, command: StubCommand) -> Result<(), FlashError> {
        let code = self.params.get(self.target, index)? as i32;
        if code != STUB_ERR_OK {
            tracing::error!("stub failed to {} flash ({code})", command.name());
            return Err(FlashError::StubStatus {
                command: command.name(),
                code,
            });
        }
        Ok(())
    }

    fn read_scratch(&mut self, address: u32, out: &mut [u8]) -> Result<(), FlashError> {
        self.target
            .read_memory(address, out)
            .map_err(FlashError::Transfer)
    }

    fn write_scratch(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        self.target
            .write_memory(address, data)
            .map_err(FlashError::Transfer)
    }

    /// Releases everything this operation acquired: command slots in
    /// reverse bind order, then the stub's working areas and bootstrap
    /// slots, then the scratch area.
    fn dismantle(mut self) -> Result<(), FlashError> {
        let mut first_error = None;
        if let Err(error) = self.params.release(self.target) {
            first_error.get_or_insert(error);
        }
        if let Err(error) = self.stub.unload(self.target) {
            first_error.get_or_insert(error);
        }
        if let Some(area) = self.scratch.take() {
            if let Err(error) = self.target.free_working_area(area) {
                tracing::warn!("failed to free the scratch working area: {error}");
                first_error.get_or_insert(FlashError::Transfer(error));
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}
