//! # Stub-driven flash programming for ESP32 targets
//!
//! The debug host has no bus-level access to an ESP32's SPI flash
//! controller: every erase, read and write has to be delegated to a small
//! pre-built executable (the *stub*) that runs on the target itself. This
//! crate implements the host side of that protocol on top of any debug
//! transport that can lease target RAM, move memory and registers, and
//! start execution at an address (the [`StubTarget`] trait):
//!
//! * loading the stub's sections into working areas and validating its
//!   position-dependent layout,
//! * marshaling command arguments through a register parameter window,
//! * running the stub under a host-enforced timeout with stack-canary
//!   instrumentation,
//! * splitting large transfers into chunks sized to whatever scratch
//!   memory the target can currently spare.
//!
//! ## Example
//!
//! ```no_run
//! use esp32_flasher::{FlashBank, StubConfig, StubTarget};
//!
//! # fn attach() -> impl StubTarget { esp32_flasher::FakeTarget::new(0x100000) }
//! let target = attach(); // any debug-transport backend
//! let config = StubConfig::new("/opt/esp/stub_flasher.elf");
//! let mut bank = FlashBank::new(target, 0x0, 0x10_0000, config);
//!
//! bank.probe()?;
//! bank.erase(0, 15)?;
//! bank.write(0x0, &[0xde, 0xad, 0xbe, 0xef])?;
//! let readback = bank.read(0x0, 4)?;
//! # Ok::<(), esp32_flasher::FlashError>(())
//! ```
//!
//! The stub binary is an externally built artifact; its path is always
//! injected through [`StubConfig`].

#![warn(missing_docs)]

mod bank;
mod config;
mod error;
#[cfg(any(test, feature = "test"))]
mod fake;
mod flasher;
mod image;
mod params;
mod progress;
mod stub;
mod target;

pub use bank::{FlashBank, Sector, SECTOR_SIZE};
pub use config::{BankConfig, StubConfig, WriteStrategy};
pub use error::FlashError;
#[cfg(any(test, feature = "test"))]
pub use fake::{FakeTarget, RunRecord, FAKE_EXEC_BASE, FAKE_GENERAL_BASE};
pub use image::{ImageError, StubImage, StubSection};
pub use progress::{FlashProgress, ProgressEvent};
pub use target::{
    Slot, SlotDirection, StubTarget, TargetError, TargetState, WorkingArea, WorkingAreaKind,
};
