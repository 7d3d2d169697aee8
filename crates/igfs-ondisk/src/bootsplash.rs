#![forbid(unsafe_code)]
//! Bootsplash container inside the `SPLASH` extent.

use igfs_types::{BOOTSPLASH_MAGIC, ParseError, ensure_slice, put_bytes, put_le_u64, put_u8,
    read_fixed, read_le_u64, read_u8, u64_to_usize};
use serde::{Deserialize, Serialize};

/// Header at the start of the splash extent payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootsplashHeader {
    pub magic: [u8; 14],
    pub num_splashs: u8,
}

impl BootsplashHeader {
    pub const SIZE: usize = 15;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let magic = read_fixed::<14>(data, 0)?;
        if magic != *BOOTSPLASH_MAGIC {
            return Err(ParseError::InvalidMagic {
                context: "bootsplash",
            });
        }
        Ok(Self {
            magic,
            num_splashs: read_u8(data, 14)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_bytes(out, 0, &self.magic)?;
        put_u8(out, 14, self.num_splashs)?;
        Ok(())
    }
}

/// Descriptor for one splash image; `offset` is relative to the start of
/// the extent payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bootsplash {
    pub offset: u64,
    pub length: u64,
    pub ident: [u8; 8],
}

impl Bootsplash {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            offset: read_le_u64(data, 0)?,
            length: read_le_u64(data, 8)?,
            ident: read_fixed::<8>(data, 16)?,
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        put_le_u64(out, 0, self.offset)?;
        put_le_u64(out, 8, self.length)?;
        put_bytes(out, 16, &self.ident)?;
        Ok(())
    }
}

/// Parse the splash extent: header, records and raw image slices.
///
/// Returns the records together with the raw image bytes; decoding the
/// images is left to the caller.
pub fn parse_bootsplash_extent(
    data: &[u8],
) -> Result<(BootsplashHeader, Vec<(Bootsplash, Vec<u8>)>), ParseError> {
    let header = BootsplashHeader::parse(data)?;
    let mut splashes = Vec::with_capacity(usize::from(header.num_splashs));
    let mut offset = BootsplashHeader::SIZE;
    for _ in 0..header.num_splashs {
        let record = Bootsplash::parse(ensure_slice(data, offset, Bootsplash::SIZE)?)?;
        offset += Bootsplash::SIZE;
        let start = u64_to_usize(record.offset, "bootsplash offset")?;
        let length = u64_to_usize(record.length, "bootsplash length")?;
        let image = ensure_slice(data, start, length)?.to_vec();
        splashes.push((record, image));
    }
    Ok((header, splashes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_extent(images: &[&[u8]]) -> Vec<u8> {
        let records_end = BootsplashHeader::SIZE + images.len() * Bootsplash::SIZE;
        let mut data = vec![0_u8; records_end];
        data[..14].copy_from_slice(BOOTSPLASH_MAGIC);
        data[14] = u8::try_from(images.len()).unwrap();

        let mut cursor = records_end;
        for (index, image) in images.iter().enumerate() {
            let record = Bootsplash {
                offset: cursor as u64,
                length: image.len() as u64,
                ident: [0; 8],
            };
            let start = BootsplashHeader::SIZE + index * Bootsplash::SIZE;
            record
                .serialize_into(&mut data[start..start + Bootsplash::SIZE])
                .unwrap();
            cursor += image.len();
        }
        for image in images {
            data.extend_from_slice(image);
        }
        data
    }

    #[test]
    fn parse_extent_with_two_images() {
        let data = build_extent(&[b"\x89PNG first", b"\x89PNG second image"]);
        let (header, splashes) = parse_bootsplash_extent(&data).expect("parse");
        assert_eq!(header.num_splashs, 2);
        assert_eq!(splashes[0].1, b"\x89PNG first");
        assert_eq!(splashes[1].1, b"\x89PNG second image");
    }

    #[test]
    fn bad_magic_rejected() {
        let mut data = build_extent(&[b"img"]);
        data[0] = b'x';
        assert_eq!(
            parse_bootsplash_extent(&data),
            Err(ParseError::InvalidMagic {
                context: "bootsplash"
            })
        );
    }

    #[test]
    fn record_pointing_past_extent_rejected() {
        let mut data = build_extent(&[b"img"]);
        // Corrupt the first record's length.
        let length_offset = BootsplashHeader::SIZE + 8;
        data[length_offset..length_offset + 8].copy_from_slice(&u64::MAX.to_le_bytes()[..8]);
        assert!(parse_bootsplash_extent(&data).is_err());
    }
}
