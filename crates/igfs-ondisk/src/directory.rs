#![forbid(unsafe_code)]
//! Section-zero directory: partition and fragment descriptor tables.

use igfs_types::{
    DIR_MAX_MINORS, DIRECTORY_MAGIC, MAX_FRAGMENTS, ParseError, PartitionType, ensure_slice,
    put_bytes, put_le_u16, put_le_u32, read_fixed, read_le_u16, read_le_u32,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Run of consecutive sections belonging to one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub first_section: u32,
    /// Number of sections.
    pub length: u32,
}

impl FragmentDescriptor {
    pub const SIZE: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            first_section: read_le_u32(data, 0)?,
            length: read_le_u32(data, 4)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u32(out, 0, self.first_section)?;
        put_le_u32(out, 4, self.length)?;
        Ok(())
    }
}

/// Directory entry replicating the partition's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    /// Replication of the section header's `partition_minor`.
    pub minor: u32,
    /// Replication of the partition header's type byte.
    pub partition_type: u16,
    /// Index of the first fragment.
    pub first_fragment: u16,
    /// Number of fragments; 0 means the descriptor is unused.
    pub n_fragments: u16,
}

impl PartitionDescriptor {
    pub const SIZE: usize = 10;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            minor: read_le_u32(data, 0)?,
            partition_type: read_le_u16(data, 4)?,
            first_fragment: read_le_u16(data, 6)?,
            n_fragments: read_le_u16(data, 8)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u32(out, 0, self.minor)?;
        put_le_u16(out, 4, self.partition_type)?;
        put_le_u16(out, 6, self.first_fragment)?;
        put_le_u16(out, 8, self.n_fragments)?;
        Ok(())
    }

    #[must_use]
    pub fn is_present(&self) -> bool {
        self.n_fragments != 0
    }
}

/// The directory residing at offset 0x8000 of section zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub magic: [u8; 4],
    pub crc: u32,
    /// Allows for future extensions.
    pub dir_type: u16,
    /// Redundant, allows for a dynamic partition table.
    pub max_minors: u16,
    /// Update count, never used so far.
    pub version: u16,
    pub dummy: u16,
    /// Total number of fragments in use.
    pub n_fragments: u32,
    /// Redundant, allows for a dynamic fragment table.
    pub max_fragments: u32,
    pub extension: [u8; 8],
    pub partition: Vec<PartitionDescriptor>,
    pub fragment: Vec<FragmentDescriptor>,
}

impl Directory {
    pub const HEADER_SIZE: usize = 32;
    pub const SIZE: usize = Self::HEADER_SIZE
        + DIR_MAX_MINORS * PartitionDescriptor::SIZE
        + MAX_FRAGMENTS * FragmentDescriptor::SIZE;
    /// The directory CRC covers everything after the magic and CRC fields.
    pub const CRC_OFFSET: usize = 8;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let magic = read_fixed::<4>(data, 0)?;
        if magic != *DIRECTORY_MAGIC {
            return Err(ParseError::InvalidMagic {
                context: "directory",
            });
        }

        let mut partition = Vec::with_capacity(DIR_MAX_MINORS);
        let mut offset = Self::HEADER_SIZE;
        for _ in 0..DIR_MAX_MINORS {
            partition.push(PartitionDescriptor::parse(ensure_slice(
                data,
                offset,
                PartitionDescriptor::SIZE,
            )?)?);
            offset += PartitionDescriptor::SIZE;
        }
        let mut fragment = Vec::with_capacity(MAX_FRAGMENTS);
        for _ in 0..MAX_FRAGMENTS {
            fragment.push(FragmentDescriptor::parse(ensure_slice(
                data,
                offset,
                FragmentDescriptor::SIZE,
            )?)?);
            offset += FragmentDescriptor::SIZE;
        }

        Ok(Self {
            magic,
            crc: read_le_u32(data, 4)?,
            dir_type: read_le_u16(data, 8)?,
            max_minors: read_le_u16(data, 10)?,
            version: read_le_u16(data, 12)?,
            dummy: read_le_u16(data, 14)?,
            n_fragments: read_le_u32(data, 16)?,
            max_fragments: read_le_u32(data, 20)?,
            extension: read_fixed::<8>(data, 24)?,
            partition,
            fragment,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if self.partition.len() != DIR_MAX_MINORS || self.fragment.len() != MAX_FRAGMENTS {
            return Err(ParseError::InvalidField {
                field: "directory",
                reason: "descriptor tables must be full-sized",
            });
        }
        put_bytes(out, 0, &self.magic)?;
        put_le_u32(out, 4, self.crc)?;
        put_le_u16(out, 8, self.dir_type)?;
        put_le_u16(out, 10, self.max_minors)?;
        put_le_u16(out, 12, self.version)?;
        put_le_u16(out, 14, self.dummy)?;
        put_le_u32(out, 16, self.n_fragments)?;
        put_le_u32(out, 20, self.max_fragments)?;
        put_bytes(out, 24, &self.extension)?;
        let mut offset = Self::HEADER_SIZE;
        for descriptor in &self.partition {
            descriptor.serialize_into(&mut out[offset..offset + PartitionDescriptor::SIZE])?;
            offset += PartitionDescriptor::SIZE;
        }
        for fragment in &self.fragment {
            fragment.serialize_into(&mut out[offset..offset + FragmentDescriptor::SIZE])?;
            offset += FragmentDescriptor::SIZE;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    /// Empty directory with full-sized descriptor tables.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // table sizes are format constants
    pub fn new() -> Self {
        Self {
            magic: *DIRECTORY_MAGIC,
            crc: 0,
            dir_type: 0,
            max_minors: DIR_MAX_MINORS as u16,
            version: 1,
            dummy: 0,
            n_fragments: 0,
            max_fragments: MAX_FRAGMENTS as u32,
            extension: [0; 8],
            partition: vec![PartitionDescriptor::default(); DIR_MAX_MINORS],
            fragment: vec![FragmentDescriptor::default(); MAX_FRAGMENTS],
        }
    }

    /// CRC over the serialized directory past the magic and CRC fields.
    #[must_use]
    pub fn compute_crc(&self) -> u32 {
        crc32fast::hash(&self.to_bytes()[Self::CRC_OFFSET..])
    }

    #[must_use]
    pub fn crc_is_valid(&self) -> bool {
        self.crc == self.compute_crc()
    }

    /// Descriptor for the given partition minor, skipping unused slots.
    #[must_use]
    pub fn find_partition_by_minor(&self, minor: u32) -> Option<&PartitionDescriptor> {
        self.partition
            .iter()
            .filter(|descriptor| descriptor.is_present())
            .find(|descriptor| descriptor.minor == minor)
    }

    /// First section of the partition described by `descriptor`, or `None`
    /// when the descriptor points past the fragment table.
    #[must_use]
    pub fn first_section_of(&self, descriptor: &PartitionDescriptor) -> Option<u32> {
        self.fragment
            .get(usize::from(descriptor.first_fragment))
            .map(|fragment| fragment.first_section)
    }

    /// Fragment descriptor for the free list (partition slot 0).
    #[must_use]
    pub fn free_list(&self) -> Option<&FragmentDescriptor> {
        self.fragment.get(usize::from(self.partition.first()?.first_fragment))
    }

    /// All partition minors present in the directory. Minor 0 marks the
    /// free list and is not a partition.
    #[must_use]
    pub fn partition_minors(&self) -> BTreeSet<u32> {
        self.partition
            .iter()
            .filter(|descriptor| descriptor.is_present() && descriptor.minor != 0)
            .map(|descriptor| descriptor.minor)
            .collect()
    }

    /// Create a directory entry for a new partition chain.
    pub fn create_entry(
        &mut self,
        minor: u32,
        first_section: u32,
        length: u32,
    ) -> Result<(), ParseError> {
        if self.find_partition_by_minor(minor).is_some() {
            return Err(ParseError::InvalidField {
                field: "directory",
                reason: "entry for partition minor already exists",
            });
        }
        let slot = self
            .partition
            .iter()
            .position(|descriptor| descriptor.partition_type == PartitionType::Empty as u16
                && !descriptor.is_present())
            .ok_or(ParseError::InvalidField {
                field: "directory",
                reason: "no empty partition descriptors",
            })?;
        let fragment_slot = self
            .fragment
            .iter()
            .position(|fragment| fragment.first_section == 0 && fragment.length == 0)
            .ok_or(ParseError::InvalidField {
                field: "directory",
                reason: "no empty fragment descriptors",
            })?;

        self.partition[slot] = PartitionDescriptor {
            minor,
            partition_type: PartitionType::IgelCompressed as u16,
            first_fragment: u16::try_from(fragment_slot).map_err(|_| {
                ParseError::IntegerConversion {
                    field: "first_fragment",
                }
            })?,
            n_fragments: 1,
        };
        self.fragment[fragment_slot] = FragmentDescriptor {
            first_section,
            length,
        };
        self.n_fragments += 1;
        Ok(())
    }

    /// Update the fragment of an existing partition entry.
    pub fn update_entry(
        &mut self,
        minor: u32,
        first_section: u32,
        length: u32,
    ) -> Result<(), ParseError> {
        let descriptor = self
            .find_partition_by_minor(minor)
            .copied()
            .ok_or(ParseError::InvalidField {
                field: "directory",
                reason: "entry for partition minor does not exist",
            })?;
        let index = usize::from(descriptor.first_fragment);
        let fragment = self
            .fragment
            .get_mut(index)
            .ok_or(ParseError::InvalidField {
                field: "directory",
                reason: "first_fragment points past the fragment table",
            })?;
        fragment.first_section = first_section;
        fragment.length = length;
        Ok(())
    }

    /// Recompute and store the directory CRC. Call after any mutation.
    pub fn seal(&mut self) {
        self.crc = 0;
        self.crc = self.compute_crc();
    }
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}
