//! End-to-end tests of the public flash bank API against the simulated
//! target, with the stub image loaded from an actual ELF file on disk.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use esp32_flasher::{
    FakeTarget, FlashBank, FlashError, FlashProgress, ProgressEvent, StubConfig, TargetState,
    WriteStrategy, FAKE_EXEC_BASE, FAKE_GENERAL_BASE, SECTOR_SIZE,
};
use pretty_assertions::assert_eq;

const DATA_SECTION_SIZE: u32 = 32;
const STACK_SIZE: u32 = 1024;

/// Builds a minimal little-endian ELF32 image with the given
/// `(paddr, executable, content)` segments.
fn build_stub_elf(entry: u32, segments: &[(u32, bool, &[u8])]) -> Vec<u8> {
    const EHSIZE: u32 = 52;
    const PHENTSIZE: u32 = 32;

    let mut out = Vec::new();
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&94u16.to_le_bytes()); // EM_XTENSA
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&EHSIZE.to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(PHENTSIZE as u16).to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&[0; 6]); // e_shentsize, e_shnum, e_shstrndx

    let mut offset = EHSIZE + PHENTSIZE * segments.len() as u32;
    for (paddr, executable, content) in segments {
        let flags: u32 = if *executable { 4 | 1 } else { 4 | 2 };
        out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&paddr.to_le_bytes()); // p_vaddr
        out.extend_from_slice(&paddr.to_le_bytes()); // p_paddr
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&(content.len() as u32).to_le_bytes());
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&4u32.to_le_bytes());
        offset += content.len() as u32;
    }
    for (_, _, content) in segments {
        out.extend_from_slice(content);
    }
    out
}

/// Writes a stub ELF matching the fake target's memory layout into `dir`
/// and returns its path.
fn write_stub(dir: &tempfile::TempDir) -> PathBuf {
    let code = vec![0x36u8; 64];
    let data = vec![0xaau8; DATA_SECTION_SIZE as usize];
    let elf = build_stub_elf(
        FAKE_EXEC_BASE,
        &[
            (FAKE_EXEC_BASE, true, &code),
            (FAKE_GENERAL_BASE, false, &data),
        ],
    );
    let path = dir.path().join("stub_flasher.elf");
    std::fs::write(&path, elf).unwrap();
    path
}

/// A target whose general pool leaves `scratch` bytes once the stub's data
/// section and stack are resident.
fn constrained_target(scratch: u32, flash_size: usize) -> FakeTarget {
    FakeTarget::with_layout(
        FAKE_EXEC_BASE,
        16 * 1024,
        FAKE_GENERAL_BASE,
        DATA_SECTION_SIZE + STACK_SIZE + scratch,
        flash_size,
    )
}

#[test]
fn write_read_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    let mut bank = FlashBank::new(FakeTarget::new(1024 * 1024), 0x0, 1024 * 1024, config);

    bank.probe().unwrap();
    assert_eq!(bank.sectors().len(), 256);

    let data: Vec<u8> = (0..8192u32).map(|i| (i * 7 % 256) as u8).collect();
    bank.write(0x1000, &data).unwrap();
    let readback = bank.read(0x1000, data.len()).unwrap();
    assert_eq!(readback, data);

    assert_eq!(bank.target().live_areas(), 0);
    assert_eq!(bank.target().bound_slots(), 0);
}

#[test]
fn constrained_scratch_splits_the_write_and_reports_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    let mut bank = FlashBank::new(
        constrained_target(4096 + 512, 64 * 1024),
        0x0,
        64 * 1024,
        config,
    );

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    bank.set_progress(FlashProgress::new(move |event| {
        sink.borrow_mut().push(event);
    }));

    let data = vec![0x5a; 8192];
    bank.write(0x1000, &data).unwrap();

    let events = events.borrow();
    assert!(matches!(
        events[0],
        ProgressEvent::StartedProgramming { length: 8192 }
    ));
    let chunks: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::ChunkProgrammed { size, .. } => Some(*size),
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![4096, 4096]);
    assert!(matches!(
        events.last(),
        Some(ProgressEvent::FinishedProgramming)
    ));
}

#[test]
fn erase_of_the_first_sector_touches_exactly_one_sector() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    let mut bank = FlashBank::new(FakeTarget::new(64 * 1024), 0x0, 64 * 1024, config);
    bank.target_mut().flash_mut().fill(0x42);

    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    bank.set_progress(FlashProgress::new(move |event| {
        sink.borrow_mut().push(event);
    }));

    bank.erase(0, 0).unwrap();

    let flash = bank.target().flash();
    assert!(flash[..SECTOR_SIZE as usize].iter().all(|&b| b == 0xFF));
    assert!(flash[SECTOR_SIZE as usize..].iter().all(|&b| b == 0x42));

    let sector_events = events
        .borrow()
        .iter()
        .filter(|event| matches!(event, ProgressEvent::SectorErased { .. }))
        .count();
    assert_eq!(sector_events, 1);
}

#[test]
fn streaming_strategy_works_through_the_bank() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = StubConfig::new(write_stub(&dir));
    config.write_strategy = WriteStrategy::Streaming;
    let mut bank = FlashBank::new(FakeTarget::new(64 * 1024), 0x0, 64 * 1024, config);

    let data = vec![0x99; 4096 + 3]; // padded to a multiple of 4
    bank.write(0x2000, &data).unwrap();

    let flash = bank.target().flash();
    assert_eq!(&flash[0x2000..0x2000 + data.len()], &data[..]);
    assert_eq!(flash[0x2000 + data.len()], 0xFF);
    assert_eq!(bank.target().live_areas(), 0);
    assert_eq!(bank.target().bound_slots(), 0);
}

#[test]
fn operations_on_a_running_target_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    let mut bank = FlashBank::new(FakeTarget::new(64 * 1024), 0x0, 64 * 1024, config);
    bank.target_mut().set_state(TargetState::Running);

    let result = bank.write(0x0, &[1, 2, 3, 4]);
    assert!(matches!(
        result,
        Err(FlashError::TargetNotHalted {
            state: TargetState::Running
        })
    ));
    assert!(bank.target().alloc_requests().is_empty());
    assert_eq!(bank.target().bound_slots(), 0);
}

#[test]
fn failed_operations_do_not_leak_leases() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    // 4 KiB of flash: reading past the end makes the stub report failure.
    let mut bank = FlashBank::new(FakeTarget::new(4096), 0x0, 4096, config);

    let result = bank.read(8192, 256);
    assert!(matches!(result, Err(FlashError::StubStatus { .. })));
    assert_eq!(bank.target().live_areas(), 0);
    assert_eq!(bank.target().bound_slots(), 0);
}

#[test]
fn stub_health_check_runs() {
    let dir = tempfile::tempdir().unwrap();
    let config = StubConfig::new(write_stub(&dir));
    let mut bank = FlashBank::new(FakeTarget::new(4096), 0x0, 4096, config);

    bank.test().unwrap();
    assert_eq!(bank.target().runs().len(), 1);
}

#[test]
fn missing_stub_image_is_reported() {
    let config = StubConfig::new("/nonexistent/stub_flasher.elf");
    let mut bank = FlashBank::new(FakeTarget::new(4096), 0x0, 4096, config);

    let result = bank.write(0, &[0u8; 4]);
    assert!(matches!(result, Err(FlashError::Image(_))));
}
