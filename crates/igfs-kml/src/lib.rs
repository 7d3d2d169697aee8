#![forbid(unsafe_code)]
//! IGEL key management layer (KML).
//!
//! Implements the encrypted extent subsystem: extent key derivation from a
//! boot identifier, XChaCha20-Poly1305 decryption of the extent-filesystem
//! container, LZF decompression and tar extraction of the key-management
//! configuration, Argon2id-based master-key derivation and AES-XTS key
//! unwrapping into a zeroizing keyring.

pub mod config;
pub mod keyring;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use igfs_error::{IgfsError, Result};
use igfs_ondisk::ExtentFilesystem;
use igfs_types::EXTENTFS_DATA_LEN;
use sha2::{Digest, Sha256};
use std::io::Read;
use zeroize::Zeroize;

pub use config::{KmlConfig, SlotConfig, SystemConfig, WrappedKey};
pub use keyring::{Keyring, MasterKey, SecretBytes};

/// AEAD key length (XChaCha20-Poly1305).
pub const AEAD_KEY_SIZE: usize = 32;
/// AEAD nonce length (XChaCha20-Poly1305).
pub const AEAD_NONCE_SIZE: usize = 24;

/// Name of the key-management configuration inside the decrypted tar.
pub const KMLCONFIG_NAME: &str = "kmlconfig.json";

/// First static pad constant of the extent key schedule.
const STATIC_KEY_1: [u8; 32] = [
    0x6f, 0x86, 0x89, 0xe7, 0x8a, 0xc0, 0x4d, 0x75, 0xf1, 0x50, 0xf1, 0x3b, 0xf1, 0xf2, 0xf7,
    0x86, 0x93, 0xf2, 0x99, 0xc5, 0x11, 0x68, 0x6b, 0x39, 0xad, 0xc2, 0x51, 0xe6, 0x5c, 0x56,
    0xf8, 0x4b,
];

/// Second static pad constant; only the first 32 bytes take part.
const STATIC_KEY_2: [u8; 33] = [
    0x65, 0x35, 0xd4, 0x19, 0xd6, 0x2c, 0x39, 0x80, 0xe9, 0xe9, 0x87, 0x4c, 0x6b, 0x88, 0x23,
    0x00, 0x94, 0x29, 0xe4, 0xef, 0x48, 0xfb, 0xd2, 0xdf, 0x6f, 0xb3, 0x61, 0x41, 0xbe, 0x6b,
    0xd4, 0xf7, 0x6f,
];

/// Derived extent key: the base64 ASCII form is the working representation;
/// the first 32 bytes of it are the AEAD key.
pub struct ExtentKey {
    ascii: Vec<u8>,
}

impl ExtentKey {
    /// Base64 ASCII bytes of the key.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.ascii
    }

    /// The AEAD key: the first 32 ASCII bytes.
    #[must_use]
    pub fn aead_key(&self) -> &[u8] {
        &self.ascii[..AEAD_KEY_SIZE]
    }

    /// The raw 32 bytes behind the base64 form.
    pub fn raw(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.ascii)
            .map_err(|error| IgfsError::KdfFailure(format!("extent key is not base64: {error}")))
    }
}

impl Drop for ExtentKey {
    fn drop(&mut self) {
        self.ascii.zeroize();
    }
}

impl std::fmt::Debug for ExtentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtentKey").field("ascii", &"[REDACTED]").finish()
    }
}

/// Derive the extent-filesystem key from a boot identifier.
///
/// SHA-256 of the identifier is XORed with a pad built from the two static
/// constants, re-hashed a data-dependent number of times, optionally folded
/// with an additional base64 key, and returned base64-encoded.
pub fn derive_extent_key(boot_id: &str, base64_key: Option<&str>) -> Result<ExtentKey> {
    let boot_id_hash: [u8; 32] = Sha256::digest(boot_id.as_bytes()).into();

    let mut result = [0_u8; 32];
    for index in 0..32 {
        let pad = 0xFF - (STATIC_KEY_2[index] ^ (STATIC_KEY_1[index] ^ 0x57));
        result[index] = boot_id_hash[index] ^ pad;
    }

    let iterations = (result.iter().map(|byte| u32::from(*byte)).sum::<u32>() & 0x1F) + 0xA;
    for _ in 0..iterations {
        result = Sha256::digest(result).into();
    }

    if let Some(base64_key) = base64_key {
        let mut bin_key = BASE64
            .decode(base64_key)
            .map_err(|error| IgfsError::KdfFailure(format!("bad base64 key: {error}")))?;
        for _ in 0..=iterations {
            bin_key = Sha256::digest(&bin_key).to_vec();
        }
        for index in 0..32 {
            result[index] ^= bin_key[index];
        }
    }

    let key = ExtentKey {
        ascii: BASE64.encode(result).into_bytes(),
    };
    result.zeroize();
    Ok(key)
}

/// AEAD nonce of an extent-filesystem container: the two nonce parts are
/// hashed separately and XORed, truncated to 24 bytes.
#[must_use]
pub fn container_nonce(efs: &ExtentFilesystem) -> [u8; AEAD_NONCE_SIZE] {
    let a: [u8; 32] = Sha256::digest(efs.nonce_1).into();
    let b: [u8; 32] = Sha256::digest([efs.nonce_2]).into();
    let mut nonce = [0_u8; AEAD_NONCE_SIZE];
    for (index, out) in nonce.iter_mut().enumerate() {
        *out = a[index] ^ b[index];
    }
    nonce
}

/// Decrypt the container payload. Authentication failure means a wrong key
/// or a tampered container.
pub fn decrypt_extent_filesystem(efs: &ExtentFilesystem, key: &ExtentKey) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.aead_key()));
    let nonce = container_nonce(efs);
    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: efs.payload(),
                aad: &efs.authenticated,
            },
        )
        .map_err(|_| IgfsError::AeadFailure)
}

/// Build an encrypted container around a plaintext payload (the inverse of
/// [`decrypt_extent_filesystem`], used when writing images and in tests).
pub fn seal_extent_filesystem(
    plaintext: &[u8],
    key: &ExtentKey,
    nonce_1: [u8; 8],
    nonce_2: u8,
    authenticated: [u8; 8],
) -> Result<ExtentFilesystem> {
    let compressed = lzf::compress(plaintext)
        .map_err(|error| IgfsError::DecompressFailure(format!("lzf compress: {error:?}")))?;
    let template = ExtentFilesystem::new(nonce_1, nonce_2, authenticated, &[])?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key.aead_key()));
    let nonce = container_nonce(&template);
    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: &compressed,
                aad: &authenticated,
            },
        )
        .map_err(|_| IgfsError::AeadFailure)?;
    Ok(ExtentFilesystem::new(
        nonce_1,
        nonce_2,
        authenticated,
        &ciphertext,
    )?)
}

/// LZF-decompress a decrypted payload; output is bounded by the container
/// data length to keep corrupt input from over-allocating.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    lzf::decompress(data, EXTENTFS_DATA_LEN)
        .map_err(|error| IgfsError::DecompressFailure(format!("lzf: {error:?}")))
}

/// Extract a single member from an in-memory tar archive.
pub fn extract_member(tar_bytes: &[u8], name: &str) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(tar_bytes);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let wanted = entry.path()?.to_string_lossy() == name;
        if wanted {
            let mut contents = Vec::new();
            entry.read_to_end(&mut contents)?;
            return Ok(contents);
        }
    }
    Err(IgfsError::NotFound(format!("tar member {name}")))
}

/// Decrypt, decompress and parse the key-management configuration out of an
/// extent-filesystem container.
pub fn read_kmlconfig(efs: &ExtentFilesystem, key: &ExtentKey) -> Result<KmlConfig> {
    let plaintext = decrypt_extent_filesystem(efs, key)?;
    let tar_bytes = decompress(&plaintext)?;
    let raw = extract_member(&tar_bytes, KMLCONFIG_NAME)?;
    config::parse_kmlconfig(&raw)
}

// ── dm-crypt container helpers ──────────────────────────────────────────────

/// On-disk magic of a LUKS header.
const LUKS_MAGIC: &[u8; 6] = b"LUKS\xba\xbe";

/// Container format of an encrypted partition payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerMode {
    /// LUKS container: open externally with the unwrapped master key.
    Luks,
    /// Plain `aes-xts-plain64` container, key-size 512.
    Plain,
}

/// LUKS first; anything else is treated as a plain container.
#[must_use]
pub fn detect_container(data: &[u8]) -> ContainerMode {
    if data.len() >= LUKS_MAGIC.len() && &data[..LUKS_MAGIC.len()] == LUKS_MAGIC {
        ContainerMode::Luks
    } else {
        ContainerMode::Plain
    }
}

/// Decrypt a plain `aes-xts-plain64` container (512-byte sectors, 64-byte
/// key) with an unwrapped partition key.
pub fn decrypt_plain_container(data: &[u8], key: &SecretBytes) -> Result<Vec<u8>> {
    const SECTOR: usize = 512;
    if data.len() % SECTOR != 0 {
        return Err(IgfsError::UnwrapFailure(format!(
            "container length {} is not sector-aligned",
            data.len()
        )));
    }
    let xts = keyring::xts_cipher(key.as_bytes())?;
    let mut plaintext = data.to_vec();
    xts.decrypt_area(&mut plaintext, SECTOR, 0, xts_mode::get_tweak_default);
    Ok(plaintext)
}

/// Encrypt a plain container; the inverse of [`decrypt_plain_container`].
pub fn encrypt_plain_container(data: &[u8], key: &SecretBytes) -> Result<Vec<u8>> {
    const SECTOR: usize = 512;
    if data.len() % SECTOR != 0 {
        return Err(IgfsError::UnwrapFailure(format!(
            "container length {} is not sector-aligned",
            data.len()
        )));
    }
    let xts = keyring::xts_cipher(key.as_bytes())?;
    let mut ciphertext = data.to_vec();
    xts.encrypt_area(&mut ciphertext, SECTOR, 0, xts_mode::get_tweak_default);
    Ok(ciphertext)
}
