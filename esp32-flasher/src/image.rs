//! Parsing of the pre-built stub executable.
//!
//! The stub ships as a position-dependent ELF32 binary compiled against the
//! addresses of the target's working-area pools. Only the program headers
//! matter here: each `PT_LOAD` segment becomes a [`StubSection`] that the
//! loader places into a matching working area.

use std::fs;
use std::path::Path;

use object::elf;
use object::read::elf::{FileHeader, ProgramHeader};
use object::Endianness;
use thiserror::Error;

/// Errors opening or parsing the stub image.
#[derive(Debug, Error)]
pub enum ImageError {
    /// The stub file could not be read.
    #[error("failed to read the stub image")]
    Io(#[from] std::io::Error),
    /// The stub file is not a valid ELF32 object.
    #[error("failed to parse the stub image")]
    Parse(#[from] object::read::Error),
    /// A loadable segment points outside the file.
    #[error("stub image segment at {address:#010x} is out of file bounds")]
    SegmentOutOfBounds {
        /// Load address of the offending segment.
        address: u32,
    },
    /// The image contains nothing to load.
    #[error("the stub image contains no loadable segments")]
    NoLoadableSegments,
}

/// One loadable piece of the stub image.
#[derive(Debug, Clone)]
pub struct StubSection {
    address: u32,
    executable: bool,
    data: Vec<u8>,
}

impl StubSection {
    /// The target address this section was linked for.
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Section size in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    /// Whether the section contains code (`PF_X` set on the segment).
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Returns the `len` content bytes starting at `offset`.
    ///
    /// Panics when the range is out of bounds; callers iterate within
    /// [`StubSection::size`].
    pub fn read(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }
}

/// A parsed stub image: loadable sections plus the entry address.
#[derive(Debug, Clone)]
pub struct StubImage {
    entry: u32,
    sections: Vec<StubSection>,
}

impl StubImage {
    /// Reads and parses the stub image at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let data = fs::read(path)?;
        Self::parse(&data)
    }

    /// Parses a stub image from raw ELF bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ImageError> {
        let header = elf::FileHeader32::<Endianness>::parse(data)?;
        let endian = header.endian()?;
        let entry = header.e_entry(endian);

        let mut sections = Vec::new();
        for segment in header.program_headers(endian, data)? {
            if segment.p_type(endian) != elf::PT_LOAD || segment.p_filesz(endian) == 0 {
                continue;
            }
            let address = segment.p_paddr(endian);
            let content = segment
                .data(endian, data)
                .map_err(|()| ImageError::SegmentOutOfBounds { address })?;
            sections.push(StubSection {
                address,
                executable: segment.p_flags(endian) & elf::PF_X != 0,
                data: content.to_vec(),
            });
        }

        if sections.is_empty() {
            return Err(ImageError::NoLoadableSegments);
        }

        tracing::debug!(
            "stub image: entry {:#010x}, {} loadable sections",
            entry,
            sections.len()
        );
        Ok(Self { entry, sections })
    }

    /// Assembles an image from pre-parsed sections.
    #[cfg(any(test, feature = "test"))]
    pub fn from_sections(entry: u32, sections: Vec<(u32, bool, Vec<u8>)>) -> Self {
        Self {
            entry,
            sections: sections
                .into_iter()
                .map(|(address, executable, data)| StubSection {
                    address,
                    executable,
                    data,
                })
                .collect(),
        }
    }

    /// The stub's declared start address.
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// The loadable sections, in file order.
    pub fn sections(&self) -> &[StubSection] {
        &self.sections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Builds a minimal little-endian ELF32 with the given `(paddr,
    /// executable, content)` segments.
    fn build_elf(entry: u32, segments: &[(u32, bool, &[u8])]) -> Vec<u8> {
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
            let flags: u32 = if *executable { 4 | 1 } else { 4 | 2 }; // R+X / R+W
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

    #[test]
    fn parses_sections_and_entry() {
        let code = [0x36u8, 0x41, 0x00, 0x1d, 0xf0];
        let data = [0xaau8; 16];
        let elf = build_elf(
            0x4009_0000,
            &[(0x4009_0000, true, &code), (0x3ffd_0000, false, &data)],
        );

        let image = StubImage::parse(&elf).unwrap();
        assert_eq!(image.entry(), 0x4009_0000);
        assert_eq!(image.sections().len(), 2);

        let text = &image.sections()[0];
        assert!(text.is_executable());
        assert_eq!(text.address(), 0x4009_0000);
        assert_eq!(text.read(0, code.len()), &code);

        let rodata = &image.sections()[1];
        assert!(!rodata.is_executable());
        assert_eq!(rodata.size(), 16);
        assert_eq!(rodata.read(4, 4), &[0xaa; 4]);
    }

    #[test]
    fn empty_segments_are_skipped() {
        let code = [0x36u8, 0x41, 0x00];
        let elf = build_elf(
            0x4009_0000,
            &[(0x4009_0000, true, &code), (0x3ffd_0000, false, &[])],
        );

        let image = StubImage::parse(&elf).unwrap();
        assert_eq!(image.sections().len(), 1);
    }

    #[test]
    fn image_without_loadable_segments_is_rejected() {
        let elf = build_elf(0x4009_0000, &[]);
        assert!(matches!(
            StubImage::parse(&elf),
            Err(ImageError::NoLoadableSegments)
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            StubImage::parse(&[0u8; 20]),
            Err(ImageError::Parse(_))
        ));
    }
}
