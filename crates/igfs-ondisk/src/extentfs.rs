#![forbid(unsafe_code)]
//! Encrypted extent-filesystem container found in `WRITEABLE` extents.
//!
//! Pure layout model; the AEAD decryption lives in `igfs-kml`.

use igfs_types::{
    EXTENTFS_DATA_LEN, EXTENTFS_HEADER_LEN, EXTENTFS_MAGIC, ParseError, ensure_slice, put_bytes,
    put_le_u64, put_u8, read_fixed, read_le_u64, read_u8, u64_to_usize,
};

/// 48-byte header followed by the encrypted data area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentFilesystem {
    pub magic: [u8; 4],
    pub reserved_1: [u8; 4],
    /// Nonce material; the AEAD nonce is derived from both parts.
    pub nonce_1: [u8; 8],
    pub nonce_2: u8,
    pub reserved_2: [u8; 7],
    /// Ciphertext length within the data area.
    pub size: u64,
    /// Associated data authenticated by the AEAD.
    pub authenticated: [u8; 8],
    pub reserved_3: [u8; 8],
    pub data: Vec<u8>,
}

impl ExtentFilesystem {
    pub const SIZE: usize = EXTENTFS_HEADER_LEN + EXTENTFS_DATA_LEN;

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, Self::SIZE)?;
        let magic = read_fixed::<4>(data, 0)?;
        if magic != *EXTENTFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                context: "extent filesystem",
            });
        }
        let size = read_le_u64(data, 24)?;
        if u64_to_usize(size, "extentfs size")? > EXTENTFS_DATA_LEN {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "payload larger than data area",
            });
        }
        Ok(Self {
            magic,
            reserved_1: read_fixed::<4>(data, 4)?,
            nonce_1: read_fixed::<8>(data, 8)?,
            nonce_2: read_u8(data, 16)?,
            reserved_2: read_fixed::<7>(data, 17)?,
            size,
            authenticated: read_fixed::<8>(data, 32)?,
            reserved_3: read_fixed::<8>(data, 40)?,
            data: data[EXTENTFS_HEADER_LEN..Self::SIZE].to_vec(),
        })
    }

    pub fn serialize_into(&self, out: &mut [u8]) -> Result<(), ParseError> {
        if self.data.len() != EXTENTFS_DATA_LEN {
            return Err(ParseError::InvalidField {
                field: "data",
                reason: "data area must be full-sized",
            });
        }
        put_bytes(out, 0, &self.magic)?;
        put_bytes(out, 4, &self.reserved_1)?;
        put_bytes(out, 8, &self.nonce_1)?;
        put_u8(out, 16, self.nonce_2)?;
        put_bytes(out, 17, &self.reserved_2)?;
        put_le_u64(out, 24, self.size)?;
        put_bytes(out, 32, &self.authenticated)?;
        put_bytes(out, 40, &self.reserved_3)?;
        put_bytes(out, EXTENTFS_HEADER_LEN, &self.data)?;
        Ok(())
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0_u8; Self::SIZE];
        self.serialize_into(&mut out).expect("buffer sized to model");
        out
    }

    /// The encrypted payload: the first `size` bytes of the data area.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // size validated against data area
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Empty container with the given payload placed in the data area.
    pub fn new(
        nonce_1: [u8; 8],
        nonce_2: u8,
        authenticated: [u8; 8],
        payload: &[u8],
    ) -> Result<Self, ParseError> {
        if payload.len() > EXTENTFS_DATA_LEN {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "payload larger than data area",
            });
        }
        let mut data = vec![0_u8; EXTENTFS_DATA_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            magic: *EXTENTFS_MAGIC,
            reserved_1: [0; 4],
            nonce_1,
            nonce_2,
            reserved_2: [0; 7],
            size: payload.len() as u64,
            authenticated,
            reserved_3: [0; 8],
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extentfs_round_trip() {
        let efs = ExtentFilesystem::new([1; 8], 2, *b"aadaadaa", b"ciphertext bytes")
            .expect("container");
        let bytes = efs.to_bytes();
        assert_eq!(bytes.len(), ExtentFilesystem::SIZE);
        let parsed = ExtentFilesystem::parse(&bytes).expect("parse");
        assert_eq!(parsed, efs);
        assert_eq!(parsed.payload(), b"ciphertext bytes");
    }

    #[test]
    fn extentfs_rejects_bad_magic() {
        let mut bytes = ExtentFilesystem::new([0; 8], 0, [0; 8], b"x")
            .expect("container")
            .to_bytes();
        bytes[0] = b'?';
        assert_eq!(
            ExtentFilesystem::parse(&bytes),
            Err(ParseError::InvalidMagic {
                context: "extent filesystem"
            })
        );
    }

    #[test]
    fn extentfs_rejects_oversized_payload_length() {
        let mut bytes = ExtentFilesystem::new([0; 8], 0, [0; 8], b"x")
            .expect("container")
            .to_bytes();
        bytes[24..32].copy_from_slice(&(EXTENTFS_DATA_LEN as u64 + 1).to_le_bytes());
        assert!(ExtentFilesystem::parse(&bytes).is_err());
    }

    #[test]
    fn extentfs_truncated_fails() {
        assert!(ExtentFilesystem::parse(&[0_u8; 100]).is_err());
    }
}
