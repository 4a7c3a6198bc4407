use std::time::Duration;

/// A structure to manage progress reporting for flash operations.
///
/// This struct stores a handler closure which will be called every time an
/// event happens during an erase, read or write. Such an event can be the
/// start or end of an operation phase as well as per-chunk progress.
///
/// # Example
///
/// ```
/// use esp32_flasher::FlashProgress;
///
/// // Print events
/// let progress = FlashProgress::new(|event| println!("Event: {:?}", event));
/// ```
pub struct FlashProgress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl FlashProgress {
    /// Create a new `FlashProgress` structure with a given `handler` to be
    /// called on events.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Emit a progress event.
    fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }

    /// Signalize that the erasing procedure started.
    pub(crate) fn started_erasing(&self) {
        self.emit(ProgressEvent::StartedErasing);
    }

    /// Signalize that a sector has been erased.
    pub(crate) fn sector_erased(&self, size: u32, time: Duration) {
        self.emit(ProgressEvent::SectorErased { size, time });
    }

    /// Signalize that the erasing procedure failed.
    pub(crate) fn failed_erasing(&self) {
        self.emit(ProgressEvent::FailedErasing);
    }

    /// Signalize that the erasing procedure completed successfully.
    pub(crate) fn finished_erasing(&self) {
        self.emit(ProgressEvent::FinishedErasing);
    }

    /// Signalize that the programming procedure started.
    pub(crate) fn started_programming(&self, length: u64) {
        self.emit(ProgressEvent::StartedProgramming { length });
    }

    /// Signalize that a chunk has been programmed.
    pub(crate) fn chunk_programmed(&self, size: u32, time: Duration) {
        self.emit(ProgressEvent::ChunkProgrammed { size, time });
    }

    /// Signalize that the programming procedure failed.
    pub(crate) fn failed_programming(&self) {
        self.emit(ProgressEvent::FailedProgramming);
    }

    /// Signalize that the programming procedure completed successfully.
    pub(crate) fn finished_programming(&self) {
        self.emit(ProgressEvent::FinishedProgramming);
    }

    /// Signalize that the read-back procedure started.
    pub(crate) fn started_reading(&self, length: u64) {
        self.emit(ProgressEvent::StartedReading { length });
    }

    /// Signalize that a chunk has been read back.
    pub(crate) fn chunk_read(&self, size: u32, time: Duration) {
        self.emit(ProgressEvent::ChunkRead { size, time });
    }

    /// Signalize that the read-back procedure failed.
    pub(crate) fn failed_reading(&self) {
        self.emit(ProgressEvent::FailedReading);
    }

    /// Signalize that the read-back procedure completed successfully.
    pub(crate) fn finished_reading(&self) {
        self.emit(ProgressEvent::FinishedReading);
    }
}

impl Default for FlashProgress {
    fn default() -> Self {
        Self::new(|_| {})
    }
}

/// Possible events during a flash operation.
///
/// If an operation works without problems, events arrive as a `Started*`,
/// a number of per-chunk or per-sector events, and a `Finished*`. If an
/// error occurs in any stage, the matching `Failed*` event is emitted and
/// no further events follow.
#[derive(Debug)]
pub enum ProgressEvent {
    /// Erasing of flash sectors has started.
    StartedErasing,
    /// A sector has been erased successfully.
    SectorErased {
        /// The size of the sector in bytes.
        size: u32,
        /// The time attributed to erasing this sector.
        time: Duration,
    },
    /// Erasing failed.
    FailedErasing,
    /// Erasing finished successfully.
    FinishedErasing,
    /// Programming of the flash has started.
    StartedProgramming {
        /// Total number of bytes to program.
        length: u64,
    },
    /// A chunk has been written to the flash successfully.
    ChunkProgrammed {
        /// The size of this chunk in bytes.
        size: u32,
        /// The time it took to program this chunk.
        time: Duration,
    },
    /// Programming failed.
    FailedProgramming,
    /// Programming finished successfully.
    FinishedProgramming,
    /// Reading back flash contents has started.
    StartedReading {
        /// Total number of bytes to read.
        length: u64,
    },
    /// A chunk has been read back successfully.
    ChunkRead {
        /// The size of this chunk in bytes.
        size: u32,
        /// The time it took to read this chunk.
        time: Duration,
    },
    /// Reading failed.
    FailedReading,
    /// Reading finished successfully.
    FinishedReading,
}
