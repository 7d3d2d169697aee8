#![forbid(unsafe_code)]
//! Boot registry: the key/value store at the start of section zero.
//!
//! Two on-disk variants share the 17-byte identity string. The structured
//! variant is discriminated by the `163L` magic right after it; anything
//! else is the legacy newline-separated format.

use igfs_types::{
    BOOTREG_IDENT, BOOTREG_MAGIC, IGEL_BOOTREG_SIZE, ParseError, ensure_slice, put_bytes,
    put_le_u16, put_u8, read_fixed, read_le_u16, read_u8, trim_nul_padded,
};
use std::collections::BTreeMap;

/// Number of 64-byte entry blocks in the structured registry.
const ENTRY_COUNT: usize = 504;
/// Offset of the first entry block.
const ENTRY_OFFSET: usize = 512;

/// One 64-byte block of the structured registry.
///
/// The flag word is little-endian like every other field: bits 15..7 index
/// of the next block, bit 6 next-block-present, bits 5..0 key length (so
/// the key length lives in the low bits of the first byte on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootRegistryEntry {
    pub flag: u16,
    pub data: [u8; 62],
}

impl BootRegistryEntry {
    pub const SIZE: usize = 64;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            flag: read_le_u16(data, 0)?,
            data: read_fixed::<62>(data, 2)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u16(out, 0, self.flag)?;
        put_bytes(out, 2, &self.data)?;
        Ok(())
    }

    #[must_use]
    pub fn next_block_index(&self) -> u16 {
        self.flag >> 7
    }

    #[must_use]
    pub fn next_block_present(&self) -> bool {
        self.flag & 0x40 != 0
    }

    #[must_use]
    pub fn key_length(&self) -> usize {
        usize::from(self.flag & 0x3F)
    }

    #[must_use]
    pub fn key(&self) -> String {
        let len = self.key_length().min(self.data.len());
        String::from_utf8_lossy(&self.data[..len]).into_owned()
    }

    #[must_use]
    pub fn value(&self) -> String {
        let len = self.key_length().min(self.data.len());
        let raw = &self.data[len..];
        let end = raw
            .iter()
            .rposition(|byte| *byte != 0)
            .map_or(0, |pos| pos + 1);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }
}

/// Structured boot registry header (32 KiB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRegistryHeader {
    pub ident_legacy: [u8; 17],
    pub magic: [u8; 4],
    pub hdr_version: u8,
    pub boot_id: [u8; 21],
    pub enc_alg: u8,
    pub flags: u16,
    pub empty: [u8; 82],
    /// Bitmap of free 64-byte blocks.
    pub free: [u8; 64],
    /// Bitmap of used 64-byte blocks.
    pub used: [u8; 64],
    /// Directory bitmap (4 bits per block, key length).
    pub dir: [u8; 252],
    pub reserve: [u8; 4],
    pub entries: Vec<BootRegistryEntry>,
}

impl BootRegistryHeader {
    pub const SIZE: usize = IGEL_BOOTREG_SIZE;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let ident_legacy = read_fixed::<17>(data, 0)?;
        if ident_legacy != *BOOTREG_IDENT {
            return Err(ParseError::InvalidMagic {
                context: "boot registry",
            });
        }
        let magic = read_fixed::<4>(data, 17)?;
        if magic != *BOOTREG_MAGIC {
            return Err(ParseError::InvalidMagic {
                context: "boot registry magic",
            });
        }

        let mut entries = Vec::with_capacity(ENTRY_COUNT);
        let mut offset = ENTRY_OFFSET;
        for _ in 0..ENTRY_COUNT {
            entries.push(BootRegistryEntry::parse(ensure_slice(
                data,
                offset,
                BootRegistryEntry::SIZE,
            )?)?);
            offset += BootRegistryEntry::SIZE;
        }

        Ok(Self {
            ident_legacy,
            magic,
            hdr_version: read_u8(data, 21)?,
            boot_id: read_fixed::<21>(data, 22)?,
            enc_alg: read_u8(data, 43)?,
            flags: read_le_u16(data, 44)?,
            empty: read_fixed::<82>(data, 46)?,
            free: read_fixed::<64>(data, 128)?,
            used: read_fixed::<64>(data, 192)?,
            dir: read_fixed::<252>(data, 256)?,
            reserve: read_fixed::<4>(data, 508)?,
            entries,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if self.entries.len() != ENTRY_COUNT {
            return Err(ParseError::InvalidField {
                field: "entries",
                reason: "entry table must be full-sized",
            });
        }
        put_bytes(out, 0, &self.ident_legacy)?;
        put_bytes(out, 17, &self.magic)?;
        put_u8(out, 21, self.hdr_version)?;
        put_bytes(out, 22, &self.boot_id)?;
        put_u8(out, 43, self.enc_alg)?;
        put_le_u16(out, 44, self.flags)?;
        put_bytes(out, 46, &self.empty)?;
        put_bytes(out, 128, &self.free)?;
        put_bytes(out, 192, &self.used)?;
        put_bytes(out, 256, &self.dir)?;
        put_bytes(out, 508, &self.reserve)?;
        let mut offset = ENTRY_OFFSET;
        for entry in &self.entries {
            entry.serialize_into(&mut out[offset..offset + BootRegistryEntry::SIZE])?;
            offset += BootRegistryEntry::SIZE;
        }
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    /// Reassemble all entries into a key/value map, appending continuation
    /// blocks to the value of the preceding key.
    #[must_use]
    pub fn get_entries(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        let mut open_key: Option<String> = None;
        for entry in &self.entries {
            let value = entry.value();
            if value.is_empty() {
                continue;
            }
            match &open_key {
                Some(key) => {
                    entries
                        .entry(key.clone())
                        .and_modify(|existing: &mut String| existing.push_str(&value))
                        .or_insert(value);
                }
                None => {
                    entries.insert(entry.key(), value);
                }
            }
            if entry.next_block_present() {
                open_key = Some(open_key.unwrap_or_else(|| entry.key()));
            } else {
                open_key = None;
            }
        }
        entries
    }

    #[must_use]
    pub fn boot_id(&self) -> String {
        trim_nul_padded(&self.boot_id)
    }
}

/// Legacy boot registry: ident plus newline-separated `key=value` lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRegistryLegacy {
    pub ident_legacy: [u8; 17],
    pub entry: Vec<u8>,
}

impl BootRegistryLegacy {
    pub const SIZE: usize = IGEL_BOOTREG_SIZE;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let ident_legacy = read_fixed::<17>(data, 0)?;
        if ident_legacy != *BOOTREG_IDENT {
            return Err(ParseError::InvalidMagic {
                context: "boot registry",
            });
        }
        Ok(Self {
            ident_legacy,
            entry: data[17..Self::SIZE].to_vec(),
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        out[..17].copy_from_slice(&self.ident_legacy);
        let len = self.entry.len().min(Self::SIZE - 17);
        out[17..17 + len].copy_from_slice(&self.entry[..len]);
        out
    }

    /// Parse `key=value` lines, stopping at the `EOF` terminator line.
    /// Lines that do not split into exactly one key and one value (no `=`,
    /// or more than one) are skipped.
    #[must_use]
    pub fn get_entries(&self) -> BTreeMap<String, String> {
        let mut entries = BTreeMap::new();
        let text = String::from_utf8_lossy(&self.entry);
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            if line == "EOF" {
                break;
            }
            let mut parts = line.split('=');
            if let (Some(key), Some(value), None) = (parts.next(), parts.next(), parts.next()) {
                entries.insert(key.to_owned(), value.to_owned());
            }
        }
        entries
    }
}

/// Boot registry in either on-disk variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootRegistry {
    Structured(BootRegistryHeader),
    Legacy(BootRegistryLegacy),
}

impl BootRegistry {
    /// Detect the variant by the magic after the identity string and parse.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<4>(data, 17)?;
        if magic == *BOOTREG_MAGIC {
            Ok(Self::Structured(BootRegistryHeader::parse(data)?))
        } else {
            Ok(Self::Legacy(BootRegistryLegacy::parse(data)?))
        }
    }

    #[must_use]
    pub fn get_entries(&self) -> BTreeMap<String, String> {
        match self {
            Self::Structured(header) => header.get_entries(),
            Self::Legacy(legacy) => legacy.get_entries(),
        }
    }

    /// Boot identifier: the dedicated header field for the structured
    /// variant, the `boot_id` entry otherwise.
    #[must_use]
    pub fn boot_id(&self) -> Option<String> {
        match self {
            Self::Structured(header) => {
                let id = header.boot_id();
                (!id.is_empty()).then_some(id)
            }
            Self::Legacy(legacy) => legacy.get_entries().get("boot_id").cloned(),
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Structured(header) => header.to_bytes(),
            Self::Legacy(legacy) => legacy.to_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flag word for an entry: 9-bit next index, next-present bit, key length.
    fn flag(next_index: u16, next_present: bool, key_len: u16) -> u16 {
        (next_index << 7) | (u16::from(next_present) << 6) | (key_len & 0x3F)
    }

    fn entry(flag_word: u16, key: &[u8], value: &[u8]) -> BootRegistryEntry {
        let mut data = [0_u8; 62];
        data[..key.len()].copy_from_slice(key);
        data[key.len()..key.len() + value.len()].copy_from_slice(value);
        BootRegistryEntry {
            flag: flag_word,
            data,
        }
    }

    fn structured_with(entries: Vec<BootRegistryEntry>) -> BootRegistryHeader {
        let mut all = vec![
            BootRegistryEntry {
                flag: 0,
                data: [0; 62],
            };
            ENTRY_COUNT
        ];
        all[..entries.len()].clone_from_slice(&entries);
        let mut boot_id = [0_u8; 21];
        boot_id[..12].copy_from_slice(b"a1b2c3d4e5f6");
        BootRegistryHeader {
            ident_legacy: *BOOTREG_IDENT,
            magic: *BOOTREG_MAGIC,
            hdr_version: 1,
            boot_id,
            enc_alg: 0,
            flags: 0,
            empty: [0; 82],
            free: [0; 64],
            used: [0; 64],
            dir: [0; 252],
            reserve: [0; 4],
            entries: all,
        }
    }

    #[test]
    fn entry_flag_bits() {
        let e = entry(flag(3, true, 7), b"network", b"enabled");
        assert_eq!(e.next_block_index(), 3);
        assert!(e.next_block_present());
        assert_eq!(e.key_length(), 7);
        assert_eq!(e.key(), "network");
        assert_eq!(e.value(), "enabled");
    }

    #[test]
    fn entry_flag_is_little_endian_on_disk() {
        // Key length 7, no continuation: stored as bytes [0x07, 0x00].
        let mut raw = [0_u8; BootRegistryEntry::SIZE];
        raw[0] = 0x07;
        raw[2..9].copy_from_slice(b"network");
        raw[9..11].copy_from_slice(b"up");
        let e = BootRegistryEntry::parse(&raw).expect("parse");
        assert_eq!(e.key_length(), 7);
        assert_eq!(e.next_block_index(), 0);
        assert!(!e.next_block_present());
        assert_eq!(e.key(), "network");
        assert_eq!(e.value(), "up");

        let mut out = [0_u8; BootRegistryEntry::SIZE];
        e.serialize_into(&mut out).expect("serialize");
        assert_eq!(out, raw);
    }

    #[test]
    fn structured_round_trip_and_detection() {
        let header = structured_with(vec![entry(flag(0, false, 4), b"mode", b"full")]);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), BootRegistryHeader::SIZE);

        let registry = BootRegistry::parse(&bytes).expect("parse");
        let BootRegistry::Structured(parsed) = &registry else {
            panic!("expected structured variant");
        };
        assert_eq!(*parsed, header);
        assert_eq!(registry.boot_id().as_deref(), Some("a1b2c3d4e5f6"));
        assert_eq!(registry.to_bytes(), bytes);
    }

    #[test]
    fn structured_continuation_entries() {
        let header = structured_with(vec![
            entry(flag(1, true, 3), b"url", b"https://example"),
            entry(flag(0, false, 0), b"", b".com/path"),
            entry(flag(0, false, 4), b"next", b"value"),
        ]);
        let entries = header.get_entries();
        assert_eq!(
            entries.get("url").map(String::as_str),
            Some("https://example.com/path")
        );
        assert_eq!(entries.get("next").map(String::as_str), Some("value"));
    }

    #[test]
    fn structured_rejects_bad_ident() {
        let mut bytes = structured_with(vec![]).to_bytes();
        bytes[0] = b'x';
        assert!(BootRegistry::parse(&bytes).is_err());
    }

    fn legacy_bytes(text: &str) -> Vec<u8> {
        let mut data = vec![0_u8; BootRegistryLegacy::SIZE];
        data[..17].copy_from_slice(BOOTREG_IDENT);
        data[17..17 + text.len()].copy_from_slice(text.as_bytes());
        data
    }

    #[test]
    fn legacy_entries_stop_at_eof() {
        let bytes = legacy_bytes("boot_id=0123abcd\nsplash=1\nEOF\nghost=1\n");
        let registry = BootRegistry::parse(&bytes).expect("parse");
        assert!(matches!(registry, BootRegistry::Legacy(_)));
        let entries = registry.get_entries();
        assert_eq!(entries.get("boot_id").map(String::as_str), Some("0123abcd"));
        assert_eq!(entries.get("splash").map(String::as_str), Some("1"));
        assert!(!entries.contains_key("ghost"));
        assert_eq!(registry.boot_id().as_deref(), Some("0123abcd"));
    }

    #[test]
    fn legacy_skips_lines_with_extra_equals() {
        let bytes = legacy_bytes("cmdline=root=/dev/igf1 quiet\nsplash=1\nEOF\n");
        let entries = BootRegistry::parse(&bytes).expect("parse").get_entries();
        assert!(!entries.contains_key("cmdline"));
        assert_eq!(entries.get("splash").map(String::as_str), Some("1"));
    }

    #[test]
    fn legacy_round_trip() {
        let bytes = legacy_bytes("a=1\nEOF\n");
        let registry = BootRegistry::parse(&bytes).expect("parse");
        assert_eq!(registry.to_bytes(), bytes);
    }
}
