#![forbid(unsafe_code)]
//! Section I/O layer.
//!
//! Provides `SectionStore`: random-access reads and in-place writes of
//! fixed-size sections over a seekable backing file or block device. No
//! internal caching; every call hits the backing store.

use igfs_error::{IgfsError, Result};
use igfs_ondisk::{Section, SectionHeader};
use igfs_types::{SectionNumber, SectionSize};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, trace};

/// Fixed-size section store over a backing file.
///
/// The store exclusively owns its file handle; sections read from it are
/// owned byte copies, never references into the handle.
#[derive(Debug)]
pub struct SectionStore {
    file: File,
    section_size: SectionSize,
    count: u32,
    writable: bool,
}

impl SectionStore {
    /// Open read-only, detecting the section size class from the image.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let size = detect_section_size(path.as_ref())?;
        Self::open_with_size(path, size)
    }

    /// Open read-write, detecting the section size class from the image.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let size = detect_section_size(path.as_ref())?;
        Self::open_rw_with_size(path, size)
    }

    pub fn open_with_size(path: impl AsRef<Path>, section_size: SectionSize) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Self::with_file(file, section_size, false)
    }

    pub fn open_rw_with_size(path: impl AsRef<Path>, section_size: SectionSize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        Self::with_file(file, section_size, true)
    }

    fn with_file(file: File, section_size: SectionSize, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        let size = section_size.bytes() as u64;
        if len == 0 || len % size != 0 {
            return Err(IgfsError::InvalidImage(format!(
                "backing length {len} is not a positive multiple of section size {size}"
            )));
        }
        let count = u32::try_from(len / size)
            .map_err(|_| IgfsError::InvalidImage("section count exceeds u32".to_owned()))?;
        debug!(
            target: "igfs::store",
            event = "open",
            sections = count,
            section_size = section_size.bytes(),
            writable = writable
        );
        Ok(Self {
            file,
            section_size,
            count,
            writable,
        })
    }

    #[must_use]
    pub fn section_size(&self) -> SectionSize {
        self.section_size
    }

    #[must_use]
    pub fn section_count(&self) -> u32 {
        self.count
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    fn check_range(&self, n: SectionNumber) -> Result<u64> {
        if n.0 >= self.count {
            return Err(IgfsError::OutOfRange {
                section: n.0,
                max: self.count,
            });
        }
        Ok(self.section_size.start_of_section(n))
    }

    /// Read the raw bytes of section `n`.
    pub fn read_section_bytes(&self, n: SectionNumber) -> Result<Vec<u8>> {
        let offset = self.check_range(n)?;
        let mut buf = vec![0_u8; self.section_size.bytes()];
        self.file.read_exact_at(&mut buf, offset)?;
        trace!(target: "igfs::store", event = "read", section = n.0);
        Ok(buf)
    }

    /// Read and parse section `n`.
    pub fn read_section(&self, n: SectionNumber) -> Result<Section> {
        let bytes = self.read_section_bytes(n)?;
        Ok(Section::parse(&bytes)?)
    }

    /// Read just the 32-byte header of section `n`.
    pub fn read_section_header(&self, n: SectionNumber) -> Result<SectionHeader> {
        let offset = self.check_range(n)?;
        let mut buf = [0_u8; SectionHeader::SIZE];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(SectionHeader::parse(&buf)?)
    }

    /// Write the raw bytes of section `n` in place.
    pub fn write_section_bytes(&mut self, n: SectionNumber, bytes: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(IgfsError::ReadOnly);
        }
        if bytes.len() != self.section_size.bytes() {
            return Err(IgfsError::InvalidImage(format!(
                "section write of {} bytes does not match section size {}",
                bytes.len(),
                self.section_size.bytes()
            )));
        }
        let offset = self.check_range(n)?;
        self.file.write_all_at(bytes, offset)?;
        trace!(target: "igfs::store", event = "write", section = n.0);
        Ok(())
    }

    /// Serialize and write a parsed section in place.
    pub fn write_section(&mut self, n: SectionNumber, section: &Section) -> Result<()> {
        self.write_section_bytes(n, &section.to_bytes())
    }

    /// Flush pending writes to the backing store.
    pub fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Detect the section size class of an image.
///
/// Section zero has no section header (it holds the boot registry and the
/// directory), so the probe reads the header of section one for each size
/// class dividing the image length and picks the class the header itself
/// declares. Falls back to the standard 256 KiB class, then to the largest
/// class that divides the length.
pub fn detect_section_size(path: &Path) -> Result<SectionSize> {
    const CLASSES: [SectionSize; 9] = [
        SectionSize::S64K,
        SectionSize::S128K,
        SectionSize::S256K,
        SectionSize::S512K,
        SectionSize::S1M,
        SectionSize::S2M,
        SectionSize::S4M,
        SectionSize::S8M,
        SectionSize::S16M,
    ];

    let file = File::open(path)?;
    let len = file.metadata()?.len();

    // Zeroed padding parses as a header declaring the 64K class, so a probe
    // only counts when the header also shows signs of life.
    let alive = |header: &SectionHeader| {
        header.partition_minor != 0 || header.section_in_minor != 0 || header.next_section != 0
    };

    // Largest class first: every smaller class divides the same lengths.
    for class in CLASSES.iter().rev() {
        let size = class.bytes() as u64;
        if len == 0 || len % size != 0 || len == size {
            continue;
        }
        let mut header = [0_u8; SectionHeader::SIZE];
        if file.read_exact_at(&mut header, size).is_ok() {
            if let Ok(parsed) = SectionHeader::parse(&header) {
                if parsed.declared_size() == Some(*class) && alive(&parsed) {
                    debug!(
                        target: "igfs::store",
                        event = "section_size_detected",
                        bytes = class.bytes()
                    );
                    return Ok(*class);
                }
            }
        }
    }

    // No live probe: prefer the standard class, then the largest that fits.
    let fallback = if len > 0 && len % SectionSize::STANDARD.bytes() as u64 == 0 {
        Some(SectionSize::STANDARD)
    } else {
        CLASSES
            .iter()
            .rev()
            .find(|class| len > 0 && len % class.bytes() as u64 == 0)
            .copied()
    };
    fallback.ok_or_else(|| {
        IgfsError::InvalidImage(format!(
            "image length {len} is not a multiple of any section size class"
        ))
    })
}
