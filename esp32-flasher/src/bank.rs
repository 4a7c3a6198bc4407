//! The flash bank façade.
//!
//! Maps the generic flash-driver verbs (probe, erase, read, write,
//! protect) onto the stub protocol and owns the sector geometry. The
//! device exposes a uniform 4096-byte sector layout and no controllable
//! protection bits, so probing is pure arithmetic and the protection verbs
//! are successful no-ops.

use std::time::Instant;

use crate::config::{BankConfig, StubConfig};
use crate::error::FlashError;
use crate::flasher::StubFlasher;
use crate::image::StubImage;
use crate::progress::FlashProgress;
use crate::target::StubTarget;

/// SPI flash sector size.
pub const SECTOR_SIZE: u32 = 4096;

/// One sector of the bank's geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    /// Byte offset of the sector within the bank.
    pub offset: u32,
    /// Sector size in bytes.
    pub size: u32,
    /// Whether the sector is known to be erased. `None` after a probe.
    pub erased: Option<bool>,
    /// Whether the sector is write-protected. Always `false` on this
    /// device.
    pub protected: bool,
}

/// A flash bank programmed through the on-target stub.
///
/// All operations are synchronous and run to completion; the target must
/// be halted for any of them to succeed. The stub is loaded per operation
/// and torn down before the operation returns, so the bank holds no
/// on-target state between calls.
pub struct FlashBank<T: StubTarget> {
    target: T,
    base_address: u32,
    size: u32,
    config: StubConfig,
    sectors: Option<Vec<Sector>>,
    progress: FlashProgress,
}

impl<T: StubTarget> FlashBank<T> {
    /// Creates a bank of `size` bytes mapped at `base_address`.
    pub fn new(target: T, base_address: u32, size: u32, config: StubConfig) -> Self {
        Self {
            target,
            base_address,
            size,
            config,
            sectors: None,
            progress: FlashProgress::default(),
        }
    }

    /// Creates a bank from a declarative [`BankConfig`].
    pub fn from_config(target: T, config: BankConfig) -> Self {
        Self::new(target, config.base_address, config.size, config.stub)
    }

    /// Installs a progress handler for subsequent operations.
    pub fn set_progress(&mut self, progress: FlashProgress) {
        self.progress = progress;
    }

    /// The underlying target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the underlying target.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// (Re)computes the sector table from the bank size.
    ///
    /// Every sector starts out with unknown erase state and unprotected.
    /// Re-probing discards the previous table.
    pub fn probe(&mut self) -> Result<(), FlashError> {
        tracing::info!(
            "flash size = {} KiB @ {:#010x}",
            self.size / 1024,
            self.base_address
        );
        let count = self.size / SECTOR_SIZE;
        self.sectors = Some(
            (0..count)
                .map(|index| Sector {
                    offset: index * SECTOR_SIZE,
                    size: SECTOR_SIZE,
                    erased: None,
                    protected: false,
                })
                .collect(),
        );
        tracing::debug!("allocated {count} sectors");
        Ok(())
    }

    /// Probes the bank unless it already has a sector table.
    pub fn auto_probe(&mut self) -> Result<(), FlashError> {
        if self.sectors.is_none() {
            return self.probe();
        }
        Ok(())
    }

    /// The current sector table. Empty until the bank has been probed.
    pub fn sectors(&self) -> &[Sector] {
        self.sectors.as_deref().unwrap_or(&[])
    }

    /// Erases the whole sectors `first..=last`.
    pub fn erase(&mut self, first: u32, last: u32) -> Result<(), FlashError> {
        self.auto_probe()?;
        let sector_count = self.sectors().len() as u32;
        if first > last || last >= sector_count {
            return Err(FlashError::SectorRange {
                first,
                last,
                sectors: sector_count,
            });
        }

        let image = self.open_image()?;
        self.progress.started_erasing();
        let started = Instant::now();

        let count = last - first + 1;
        let result = StubFlasher::new(&mut self.target, &image, &self.config, &self.progress)
            .erase(first * SECTOR_SIZE, count * SECTOR_SIZE);

        match &result {
            Ok(()) => {
                // One stub invocation erases the whole range; attribute
                // the elapsed time evenly across the sectors.
                let per_sector = started.elapsed() / count;
                for _ in first..=last {
                    self.progress.sector_erased(SECTOR_SIZE, per_sector);
                }
                self.progress.finished_erasing();
            }
            Err(_) => self.progress.failed_erasing(),
        }
        result
    }

    /// Reads `count` bytes starting at byte `offset`.
    pub fn read(&mut self, offset: u32, count: usize) -> Result<Vec<u8>, FlashError> {
        let image = self.open_image()?;
        self.progress.started_reading(count as u64);

        let mut out = vec![0; count];
        let result = StubFlasher::new(&mut self.target, &image, &self.config, &self.progress)
            .read(offset, &mut out);

        match result {
            Ok(()) => {
                self.progress.finished_reading();
                Ok(out)
            }
            Err(error) => {
                self.progress.failed_reading();
                Err(error)
            }
        }
    }

    /// Writes `data` starting at byte `offset`, using the configured
    /// transfer strategy.
    pub fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        let image = self.open_image()?;
        self.progress.started_programming(data.len() as u64);

        let result = StubFlasher::new(&mut self.target, &image, &self.config, &self.progress)
            .write(offset, data);

        match &result {
            Ok(()) => self.progress.finished_programming(),
            Err(_) => self.progress.failed_programming(),
        }
        result
    }

    /// Runs the stub's health-check command.
    pub fn test(&mut self) -> Result<(), FlashError> {
        let image = self.open_image()?;
        StubFlasher::new(&mut self.target, &image, &self.config, &self.progress).test()
    }

    /// Changing sector protection is not supported by the device; always
    /// succeeds without touching the target.
    pub fn protect(&mut self, _set: bool, _first: u32, _last: u32) -> Result<(), FlashError> {
        Ok(())
    }

    /// The device exposes no protection bits to check; always succeeds.
    pub fn protect_check(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    /// Blank checking is left to the stub's erase path; always succeeds.
    pub fn blank_check(&mut self) -> Result<(), FlashError> {
        Ok(())
    }

    /// A human-readable description of the bank.
    pub fn info(&self) -> String {
        format!(
            "esp32 flash @ {:#010x}, {} KiB, {} sectors of {} bytes",
            self.base_address,
            self.size / 1024,
            self.size / SECTOR_SIZE,
            SECTOR_SIZE
        )
    }

    fn open_image(&self) -> Result<StubImage, FlashError> {
        Ok(StubImage::open(&self.config.stub_path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeTarget;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn bank_of(size: u32) -> FlashBank<FakeTarget> {
        FlashBank::new(
            FakeTarget::new(size as usize),
            0x0,
            size,
            StubConfig::new("stub.elf"),
        )
    }

    #[test]
    fn probe_computes_uniform_geometry() {
        let mut bank = bank_of(1024 * 1024);
        bank.probe().unwrap();

        let sectors = bank.sectors();
        assert_eq!(sectors.len(), 256);
        assert_eq!(sectors[0].offset, 0);
        assert_eq!(sectors[255].offset, 255 * 4096);
        assert!(sectors
            .iter()
            .all(|s| s.size == 4096 && s.erased.is_none() && !s.protected));
    }

    #[test]
    fn sectors_are_empty_before_probe() {
        let bank = bank_of(1024 * 1024);
        assert!(bank.sectors().is_empty());
    }

    #[test]
    fn auto_probe_is_idempotent() {
        let mut bank = bank_of(64 * 1024);
        bank.auto_probe().unwrap();
        assert_eq!(bank.sectors().len(), 16);
        bank.auto_probe().unwrap();
        assert_eq!(bank.sectors().len(), 16);
    }

    #[test_case(3, 2, 16; "first after last")]
    #[test_case(0, 16, 16; "last out of range")]
    #[test_case(16, 16, 16; "both out of range")]
    fn erase_validates_the_sector_range(first: u32, last: u32, sectors: u32) {
        let mut bank = bank_of(sectors * SECTOR_SIZE);
        let result = bank.erase(first, last);
        assert!(matches!(
            result,
            Err(FlashError::SectorRange {
                first: f,
                last: l,
                sectors: s,
            }) if f == first && l == last && s == sectors
        ));
        // Validation fails before anything touches the target.
        assert!(bank.target().alloc_requests().is_empty());
    }

    #[test]
    fn protection_verbs_are_no_ops() {
        let mut bank = bank_of(64 * 1024);
        bank.protect(true, 0, 15).unwrap();
        bank.protect_check().unwrap();
        bank.blank_check().unwrap();
        assert!(bank.target().alloc_requests().is_empty());
    }

    #[test]
    fn info_describes_the_geometry() {
        let bank = bank_of(1024 * 1024);
        assert_eq!(
            bank.info(),
            "esp32 flash @ 0x00000000, 1024 KiB, 256 sectors of 4096 bytes"
        );
    }
}
