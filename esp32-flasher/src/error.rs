use thiserror::Error;

use crate::image::ImageError;
use crate::target::{TargetError, TargetState};

/// Describes any error that happened during a flash operation or in
/// preparation for it.
#[derive(Debug, Error)]
pub enum FlashError {
    /// Stub operations require the core to be stopped under debug control.
    /// Nothing was allocated or modified.
    #[error("target is not halted (state: {state:?})")]
    TargetNotHalted {
        /// The state the target was found in.
        state: TargetState,
    },

    /// The target could not spare a working area, even after adaptively
    /// shrinking the request.
    #[error("no working area large enough for {purpose} ({size} bytes requested)")]
    WorkingAreaUnavailable {
        /// What the area was needed for.
        purpose: &'static str,
        /// The originally requested size in bytes.
        size: u32,
    },

    /// A stub section did not land at the address it was linked for. The
    /// stub is position-dependent; this indicates a build or configuration
    /// defect and is never retried.
    #[error("stub {kind} section at {section_address:#010x} does not match its working area at {area_address:#010x}")]
    LayoutMismatch {
        /// Which section kind mismatched (`code` or `data`).
        kind: &'static str,
        /// The address the section was linked for.
        section_address: u32,
        /// The address of the allocated working area.
        area_address: u32,
    },

    /// A register or memory transfer to the target failed. Fatal for the
    /// current operation.
    #[error("memory or register transfer to the target failed")]
    Transfer(#[source] TargetError),

    /// Running the stub failed at the transport level or timed out.
    #[error("stub execution failed")]
    Execution(#[source] TargetError),

    /// The stack canary at the bottom of the stub stack was overwritten.
    /// The result of the run cannot be trusted.
    #[error("stub stack overflow detected, operation result is untrustworthy")]
    StackOverflow,

    /// The stub itself signalled an error through its status register.
    #[error("the stub reported failure for '{command}' (code {code})")]
    StubStatus {
        /// The command that failed.
        command: &'static str,
        /// The stub's signed status code (-1: generic failure, -2: command
        /// not supported).
        code: i32,
    },

    /// Streaming writes require 4-byte-aligned flash offsets.
    #[error("write offset {offset:#x} breaks the required 4-byte alignment")]
    UnalignedOffset {
        /// The rejected offset.
        offset: u32,
    },

    /// The erase request names sectors outside the bank.
    #[error("sector range {first}..={last} is outside the bank's {sectors} sectors")]
    SectorRange {
        /// First sector of the request.
        first: u32,
        /// Last sector of the request.
        last: u32,
        /// Number of sectors in the bank.
        sectors: u32,
    },

    /// The stub image could not be opened or parsed.
    #[error("failed to load the stub image")]
    Image(#[from] ImageError),
}
