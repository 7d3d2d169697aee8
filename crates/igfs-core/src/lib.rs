#![forbid(unsafe_code)]
//! IGEL filesystem facade.
//!
//! Opens an image, resolves partitions through the section-zero directory,
//! walks section chains, aggregates extents and routes every mutation
//! through the integrity pipeline (hashes, then signature, then CRCs).

use igfs_error::{IgfsError, Result};
use igfs_ondisk::{DerivedSection, Section, SectionHeader};
use igfs_types::{
    DIR_OFFSET, IGEL_BOOTREG_OFFSET, IGEL_BOOTREG_SIZE, SECTION_END_OF_CHAIN, SectionNumber,
    SectionSize,
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, trace};

pub use igfs_block::{SectionStore, detect_section_size};
pub use igfs_integrity::{
    HashSigner, RsaSigner, SIGNATURE_ALGO_RSA4096_SHA256, SignatureCheck, SignatureVerifier,
};
pub use igfs_ondisk::{BootRegistry, Directory, HashBlock, PartitionBlock, PartitionExtent};

/// Progress callback for chain walking: receives the number of sections
/// collected so far; returning `false` aborts the walk with `Cancelled`.
pub type Progress<'a> = &'a mut dyn FnMut(u32) -> bool;

// ── Partition view ──────────────────────────────────────────────────────────

/// A partition's chained sections, held as owned byte copies.
#[derive(Debug, Clone)]
pub struct Partition {
    pub minor: u32,
    pub numbers: Vec<SectionNumber>,
    pub sections: Vec<Section>,
    derived: DerivedSection,
}

impl Partition {
    #[must_use]
    pub fn section_count(&self) -> u32 {
        self.numbers.len() as u32
    }

    #[must_use]
    pub fn partition_block(&self) -> Option<&PartitionBlock> {
        self.derived.partition.as_ref()
    }

    #[must_use]
    pub fn hash_block(&self) -> Option<&HashBlock> {
        self.derived.hash.as_ref()
    }

    #[must_use]
    pub fn extents(&self) -> &[PartitionExtent] {
        self.derived
            .partition
            .as_ref()
            .map_or(&[], |block| block.extents.as_slice())
    }

    #[must_use]
    pub fn find_extent(&self, extent_type: igfs_types::ExtentType) -> Option<&PartitionExtent> {
        self.extents()
            .iter()
            .find(|extent| extent.get_type() == Some(extent_type))
    }

    #[must_use]
    pub fn find_extent_by_name(&self, name: &str) -> Option<&PartitionExtent> {
        self.extents().iter().find(|extent| extent.name() == name)
    }

    /// The partition's payload stream including extent data: everything
    /// after the headers of the first section plus the payload area of
    /// every further section.
    #[must_use]
    pub fn payload_with_extents(&self) -> Vec<u8> {
        let mut stream = Vec::new();
        for (index, section) in self.sections.iter().enumerate() {
            let skip = if index == 0 { self.derived.payload_offset } else { 0 };
            stream.extend_from_slice(&section.payload[skip..]);
        }
        stream
    }

    /// The payload stream with all extent ranges removed.
    #[must_use]
    pub fn payload(&self) -> Vec<u8> {
        let stream = self.payload_with_extents();
        let mut ranges: Vec<(usize, usize)> = self
            .extents()
            .iter()
            .map(|extent| {
                let start = usize::try_from(extent.offset).unwrap_or(usize::MAX);
                let end = start.saturating_add(usize::try_from(extent.length).unwrap_or(0));
                (start.min(stream.len()), end.min(stream.len()))
            })
            .collect();
        ranges.sort_unstable();

        let mut payload = Vec::with_capacity(stream.len());
        let mut cursor = 0;
        for (start, end) in ranges {
            if start > cursor {
                payload.extend_from_slice(&stream[cursor..start]);
            }
            cursor = cursor.max(end);
        }
        payload.extend_from_slice(&stream[cursor..]);
        payload
    }

    /// The raw bytes of one extent, concatenated across chained sections.
    pub fn extent_data(&self, extent: &PartitionExtent) -> Result<Vec<u8>> {
        let stream = self.payload_with_extents();
        let start = igfs_types::u64_to_usize(extent.offset, "extent offset")?;
        let end = start
            .checked_add(igfs_types::u64_to_usize(extent.length, "extent length")?)
            .ok_or(IgfsError::InvalidImage("extent range overflows".to_owned()))?;
        if end > stream.len() {
            return Err(IgfsError::InvalidImage(format!(
                "extent {} spans past the partition payload",
                extent.name()
            )));
        }
        Ok(stream[start..end].to_vec())
    }
}

// ── Reports ─────────────────────────────────────────────────────────────────

/// Per-partition outcome of an image verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionVerify {
    pub minor: u32,
    pub sections: u32,
    /// `"verified"` or `"unsigned"`.
    pub signature: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub sections_checked: u32,
    pub deep: bool,
    pub partitions: Vec<PartitionVerify>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtentInfo {
    pub extent_type: String,
    pub name: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionInfo {
    pub minor: u32,
    pub first_section: u32,
    pub sections: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub size_bytes: u64,
    pub has_hash_block: bool,
    pub encrypted: bool,
    pub extents: Vec<ExtentInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub sections: u32,
    pub section_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_id: Option<String>,
    pub partitions: Vec<PartitionInfo>,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// Handle on an IGFS image. Owns the backing store exclusively; derived
/// `Section` and `Partition` views hold byte copies only.
#[derive(Debug)]
pub struct Filesystem {
    store: SectionStore,
    verifier: SignatureVerifier,
}

impl Filesystem {
    /// Open an image or block device read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: SectionStore::open(path)?,
            verifier: SignatureVerifier::builtin(),
        })
    }

    /// Open read-write. Mutations still go through the integrity pipeline.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: SectionStore::open_rw(path)?,
            verifier: SignatureVerifier::builtin(),
        })
    }

    /// Replace the trusted-key set used for signature checks.
    #[must_use]
    pub fn with_verifier(mut self, verifier: SignatureVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn section_count(&self) -> u32 {
        self.store.section_count()
    }

    #[must_use]
    pub fn section_size(&self) -> SectionSize {
        self.store.section_size()
    }

    #[must_use]
    pub fn store(&self) -> &SectionStore {
        &self.store
    }

    /// Raw bytes of section zero (boot registry + directory).
    pub fn section_zero(&self) -> Result<Vec<u8>> {
        self.store.read_section_bytes(SectionNumber(0))
    }

    pub fn boot_registry(&self) -> Result<BootRegistry> {
        let zero = self.section_zero()?;
        let region = igfs_types::ensure_slice(&zero, IGEL_BOOTREG_OFFSET, IGEL_BOOTREG_SIZE)?;
        Ok(BootRegistry::parse(region)?)
    }

    /// Parse and CRC-check the section-zero directory.
    pub fn directory(&self) -> Result<Directory> {
        let zero = self.section_zero()?;
        let region = igfs_types::ensure_slice(&zero, DIR_OFFSET, Directory::SIZE)?;
        let directory = Directory::parse(region)?;
        if !directory.crc_is_valid() {
            return Err(IgfsError::ChecksumFailed { section: 0 });
        }
        Ok(directory)
    }

    /// First section of a partition, resolved through the directory.
    fn first_section_of(&self, directory: &Directory, minor: u32) -> Result<SectionNumber> {
        let descriptor = directory
            .find_partition_by_minor(minor)
            .ok_or_else(|| IgfsError::NotFound(format!("partition minor {minor}")))?;
        let first = directory.first_section_of(descriptor).ok_or_else(|| {
            IgfsError::CorruptDirectory(format!(
                "descriptor for minor {minor} points past the fragment table"
            ))
        })?;
        Ok(SectionNumber(first))
    }

    /// Collect a partition by walking its section chain.
    pub fn partition(&self, minor: u32) -> Result<Partition> {
        self.partition_with_progress(minor, None)
    }

    /// Like [`Filesystem::partition`], with cooperative cancellation.
    pub fn partition_with_progress(
        &self,
        minor: u32,
        progress: Option<Progress<'_>>,
    ) -> Result<Partition> {
        let directory = self.directory()?;
        let first = self.first_section_of(&directory, minor)?;
        let numbers = self.walk_chain(first, minor, progress)?;

        let mut sections = Vec::with_capacity(numbers.len());
        for number in &numbers {
            sections.push(self.store.read_section(*number)?);
        }
        let derived = sections[0].derive();
        debug!(
            target: "igfs::core::chain",
            event = "partition_loaded",
            minor = minor,
            sections = numbers.len()
        );
        Ok(Partition {
            minor,
            numbers,
            sections,
            derived,
        })
    }

    /// Follow `next_section` pointers from `first` until end-of-chain.
    ///
    /// Enforces minor uniformity, strictly increasing `section_in_minor`
    /// and cycle-freedom along the way.
    fn walk_chain(
        &self,
        first: SectionNumber,
        minor: u32,
        mut progress: Option<Progress<'_>>,
    ) -> Result<Vec<SectionNumber>> {
        let mut numbers = Vec::new();
        let mut visited = HashSet::new();
        let mut last_in_minor: Option<u32> = None;
        let mut current = first;

        loop {
            if !visited.insert(current.0) {
                return Err(IgfsError::CycleDetected { section: current.0 });
            }
            let header = self.store.read_section_header(current)?;
            if header.partition_minor != minor {
                return Err(IgfsError::CorruptChain {
                    section: current.0,
                    detail: format!(
                        "expected partition minor {minor}, found {}",
                        header.partition_minor
                    ),
                });
            }
            if let Some(last) = last_in_minor {
                if header.section_in_minor <= last {
                    return Err(IgfsError::CorruptChain {
                        section: current.0,
                        detail: format!(
                            "section_in_minor {} does not ascend past {last}",
                            header.section_in_minor
                        ),
                    });
                }
            }
            last_in_minor = Some(header.section_in_minor);
            numbers.push(current);
            trace!(
                target: "igfs::core::chain",
                event = "walk",
                section = current.0,
                in_minor = header.section_in_minor
            );

            if let Some(callback) = progress.as_mut() {
                if !(*callback)(numbers.len() as u32) {
                    return Err(IgfsError::Cancelled);
                }
            }

            if header.next_section == SECTION_END_OF_CHAIN {
                return Ok(numbers);
            }
            current = SectionNumber(header.next_section);
        }
    }

    /// Raw section buffers of a partition chain.
    fn chain_buffers(&self, numbers: &[SectionNumber]) -> Result<Vec<Vec<u8>>> {
        let mut buffers = Vec::with_capacity(numbers.len());
        for number in numbers {
            buffers.push(self.store.read_section_bytes(*number)?);
        }
        Ok(buffers)
    }

    /// Extract one extent of a partition by type or name.
    pub fn extent_bytes(&self, minor: u32, extent: &PartitionExtent) -> Result<Vec<u8>> {
        self.partition(minor)?.extent_data(extent)
    }

    // ── Verification ────────────────────────────────────────────────────

    /// CRC-check one section. Section zero has no section header; its
    /// directory CRC is checked instead.
    pub fn verify_section(&self, n: SectionNumber) -> Result<()> {
        if n.0 == 0 {
            self.directory().map(|_| ())
        } else {
            let bytes = self.store.read_section_bytes(n)?;
            igfs_integrity::verify_section_crc(n, &bytes)
        }
    }

    /// Verify one partition: CRCs always, digests when `deep`, signature
    /// once per partition.
    pub fn verify_partition(&self, minor: u32, deep: bool) -> Result<SignatureCheck> {
        let directory = self.directory()?;
        let first = self.first_section_of(&directory, minor)?;
        let numbers = self.walk_chain(first, minor, None)?;
        let buffers = self.chain_buffers(&numbers)?;
        igfs_integrity::verify_partition_buffers(
            &buffers,
            &numbers,
            self.section_size(),
            deep,
            &self.verifier,
        )
    }

    /// Verify the directory and every partition it lists.
    pub fn verify_image(&self, deep: bool) -> Result<VerifyReport> {
        self.verify_section(SectionNumber(0))?;
        let directory = self.directory()?;

        let mut partitions = Vec::new();
        let mut sections_checked = 1_u32;
        for minor in directory.partition_minors() {
            let first = self.first_section_of(&directory, minor)?;
            let numbers = self.walk_chain(first, minor, None)?;
            let buffers = self.chain_buffers(&numbers)?;
            let status = igfs_integrity::verify_partition_buffers(
                &buffers,
                &numbers,
                self.section_size(),
                deep,
                &self.verifier,
            )?;
            sections_checked += numbers.len() as u32;
            partitions.push(PartitionVerify {
                minor,
                sections: numbers.len() as u32,
                signature: match status {
                    SignatureCheck::Verified => "verified",
                    SignatureCheck::Unsigned => "unsigned",
                },
            });
        }
        info!(
            target: "igfs::core",
            event = "verify_image",
            deep = deep,
            sections = sections_checked,
            partitions = partitions.len()
        );
        Ok(VerifyReport {
            sections_checked,
            deep,
            partitions,
        })
    }

    /// Partition table and section statistics for reporting.
    pub fn info(&self) -> Result<ImageInfo> {
        let directory = self.directory()?;
        let boot_id = self.boot_registry().ok().and_then(|reg| reg.boot_id());

        let mut partitions = Vec::new();
        for minor in directory.partition_minors() {
            let partition = self.partition(minor)?;
            let block = partition.partition_block();
            partitions.push(PartitionInfo {
                minor,
                first_section: partition.numbers[0].0,
                sections: partition.section_count(),
                partition_type: block.and_then(|block| {
                    block
                        .header
                        .partition_type()
                        .ok()
                        .map(|t| format!("{t:?}"))
                }),
                name: block.map(|block| block.header.name()).filter(|n| !n.is_empty()),
                size_bytes: block.map_or(0, |block| block.header.partlen),
                has_hash_block: partition.hash_block().is_some(),
                encrypted: block.is_some_and(|block| block.header.has_crypt()),
                extents: partition
                    .extents()
                    .iter()
                    .map(|extent| ExtentInfo {
                        extent_type: extent
                            .get_type()
                            .map_or_else(|| format!("unknown({})", extent.extent_type), |t| t.to_string()),
                        name: extent.name(),
                        offset: extent.offset,
                        length: extent.length,
                    })
                    .collect(),
            });
        }

        Ok(ImageInfo {
            sections: self.section_count(),
            section_size: self.section_size().bytes(),
            boot_id,
            partitions,
        })
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Rewrite a partition through the full integrity pipeline.
    ///
    /// `mutate` receives the chain's raw section buffers. Afterwards the
    /// digests, the signature (when a signer is supplied) and finally every
    /// CRC are recomputed, and all buffers are written back in place. The
    /// identity mutation is byte-idempotent.
    pub fn rewrite_partition(
        &mut self,
        minor: u32,
        signer: Option<&dyn HashSigner>,
        mutate: impl FnOnce(&mut [Vec<u8>]) -> Result<()>,
    ) -> Result<()> {
        let directory = self.directory()?;
        let first = self.first_section_of(&directory, minor)?;
        let numbers = self.walk_chain(first, minor, None)?;
        let mut buffers = self.chain_buffers(&numbers)?;

        mutate(&mut buffers)?;
        igfs_integrity::rebuild_partition_buffers(
            &mut buffers,
            &numbers,
            self.section_size(),
            signer,
        )?;

        for (number, buffer) in numbers.iter().zip(&buffers) {
            self.store.write_section_bytes(*number, buffer)?;
        }
        self.store.flush()?;
        info!(
            target: "igfs::core",
            event = "partition_rewritten",
            minor = minor,
            sections = numbers.len()
        );
        Ok(())
    }

    /// Patch bytes at `offset` within a partition's payload stream
    /// (extents included), bumping the generation of touched sections and
    /// re-running the integrity pipeline.
    pub fn write_bytes(
        &mut self,
        minor: u32,
        offset: u64,
        data: &[u8],
        signer: Option<&dyn HashSigner>,
    ) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let payload_offset = {
            // Payload geometry of the first section differs from the rest.
            let directory = self.directory()?;
            let first = self.first_section_of(&directory, minor)?;
            let section = self.store.read_section(first)?;
            section.derive().payload_offset
        };
        let section_payload = self.section_size().bytes() - SectionHeader::SIZE;
        let first_payload = section_payload - payload_offset;

        let start = igfs_types::u64_to_usize(offset, "write offset")?;
        let end = start + data.len();

        self.rewrite_partition(minor, signer, |buffers| {
            let mut stream_pos = 0_usize;
            for (index, buffer) in buffers.iter_mut().enumerate() {
                let (data_start, span) = if index == 0 {
                    (SectionHeader::SIZE + payload_offset, first_payload)
                } else {
                    (SectionHeader::SIZE, section_payload)
                };
                let span_end = stream_pos + span;
                if span_end > start && stream_pos < end {
                    let copy_from = start.max(stream_pos);
                    let copy_to = end.min(span_end);
                    let dest = data_start + (copy_from - stream_pos);
                    buffer[dest..dest + (copy_to - copy_from)]
                        .copy_from_slice(&data[copy_from - start..copy_to - start]);

                    // Touched section: bump its generation counter.
                    let generation = igfs_types::read_le_u16(buffer, 16)?;
                    igfs_types::put_le_u16(buffer, 16, generation.wrapping_add(1))?;
                }
                stream_pos = span_end;
            }
            if end > stream_pos {
                return Err(IgfsError::InvalidImage(format!(
                    "write of {} bytes at offset {offset} spans past the partition payload",
                    data.len()
                )));
            }
            Ok(())
        })
    }
}
