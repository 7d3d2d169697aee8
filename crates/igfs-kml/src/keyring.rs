#![forbid(unsafe_code)]
//! Master-key derivation and the per-partition keyring.
//!
//! Per slot: Argon2id over a password derived from the extent key, SHA-512
//! against the slot's public material, then AES-XTS decryption of the slot
//! secret. Every `keys[]` entry is unwrapped the same way, with the master
//! key in place of the Argon2id output. All key material is wiped on drop.

use crate::config::{KmlConfig, WrappedKey};
use crate::ExtentKey;
use aes::Aes256;
use aes::cipher::KeyInit;
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use igfs_error::{IgfsError, Result};
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use tracing::debug;
use xts_mode::Xts128;
use zeroize::Zeroize;

/// Argon2id `(opslimit, memlimit bytes)` per `system.level`; out-of-range
/// levels fall back to index 0.
const KDF_CONFIG: [(u32, u64); 6] = [
    (3, 128_000_000),
    (7, 8_000_000),
    (2, 1_024_000_000),
    (3, 256_000_000),
    (3, 512_000_000),
    (4, 128_000_000),
];

/// Length of the Argon2id output feeding the slot unwrap.
const DERIVED_KEY_LEN: usize = 32;
/// Bytes of the decoded extent key that form the KDF password.
const PASSWORD_PREFIX_LEN: usize = 20;

/// Owned secret bytes, zeroized on drop and redacted in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretBytes {
    bytes: Vec<u8>,
}

impl SecretBytes {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretBytes")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// The unwrapped slot secret; usable directly as a 64-byte XTS key.
pub type MasterKey = SecretBytes;

fn decode_b64(value: &str, what: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|error| IgfsError::UnwrapFailure(format!("{what} is not base64: {error}")))
}

/// AES-256-XTS cipher over a 64-byte key.
pub(crate) fn xts_cipher(key: &[u8]) -> Result<Xts128<Aes256>> {
    if key.len() != 64 {
        return Err(IgfsError::UnwrapFailure(format!(
            "XTS key must be 64 bytes, got {}",
            key.len()
        )));
    }
    let cipher_1 = Aes256::new_from_slice(&key[..32])
        .map_err(|_| IgfsError::UnwrapFailure("bad AES key half".to_owned()))?;
    let cipher_2 = Aes256::new_from_slice(&key[32..64])
        .map_err(|_| IgfsError::UnwrapFailure("bad AES key half".to_owned()))?;
    Ok(Xts128::new(cipher_1, cipher_2))
}

/// One-shot AES-XTS decryption with the tweak sliced out of the key, the
/// way the slot scheme uses it: key bytes 32..48 tweak the single sector.
fn xts_decrypt_sliced(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 || data.len() % 16 != 0 {
        return Err(IgfsError::UnwrapFailure(format!(
            "wrapped blob of {} bytes is not AES-block aligned",
            data.len()
        )));
    }
    let xts = xts_cipher(key)?;
    let mut tweak = [0_u8; 16];
    tweak.copy_from_slice(&key[32..48]);
    let mut plaintext = data.to_vec();
    xts.decrypt_sector(&mut plaintext, tweak);
    Ok(plaintext)
}

/// Inverse of [`xts_decrypt_sliced`], for building fixtures and write paths.
pub fn xts_encrypt_sliced(data: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 16 || data.len() % 16 != 0 {
        return Err(IgfsError::UnwrapFailure(format!(
            "blob of {} bytes is not AES-block aligned",
            data.len()
        )));
    }
    let xts = xts_cipher(key)?;
    let mut tweak = [0_u8; 16];
    tweak.copy_from_slice(&key[32..48]);
    let mut ciphertext = data.to_vec();
    xts.encrypt_sector(&mut ciphertext, tweak);
    Ok(ciphertext)
}

/// Argon2id with libsodium-equivalent cost parameters for `level`.
fn argon2id_kdf(password: &[u8], salt: &[u8], level: u32) -> Result<[u8; DERIVED_KEY_LEN]> {
    let (opslimit, memlimit) = KDF_CONFIG
        .get(level as usize)
        .copied()
        .unwrap_or(KDF_CONFIG[0]);
    let m_cost_kib = u32::try_from(memlimit / 1024)
        .map_err(|_| IgfsError::KdfFailure("memory limit overflows".to_owned()))?;
    let params = Params::new(m_cost_kib, opslimit, 1, Some(DERIVED_KEY_LEN))
        .map_err(|error| IgfsError::KdfFailure(format!("bad Argon2 params: {error}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0_u8; DERIVED_KEY_LEN];
    argon2
        .hash_password_into(password, salt, &mut out)
        .map_err(|error| IgfsError::KdfFailure(format!("Argon2id: {error}")))?;
    Ok(out)
}

/// SHA-512 of `k1 || pub`, yielding the 64-byte XTS unwrap key.
fn unwrap_key_material(k1: &[u8], public: &[u8]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    Digest::update(&mut hasher, k1);
    Digest::update(&mut hasher, public);
    hasher.finalize().into()
}

/// Derive the master key for `slots[slot]`.
pub fn master_key(config: &KmlConfig, extent_key: &ExtentKey, slot: usize) -> Result<MasterKey> {
    let slot_config = config.slots.get(slot).ok_or_else(|| {
        IgfsError::UnwrapFailure(format!("key slot {slot} does not exist"))
    })?;

    let mut raw = extent_key.raw()?;
    if raw.len() < PASSWORD_PREFIX_LEN {
        raw.zeroize();
        return Err(IgfsError::KdfFailure("extent key too short".to_owned()));
    }
    let password = BASE64.encode(&raw[..PASSWORD_PREFIX_LEN]).into_bytes();
    raw.zeroize();

    let salt = decode_b64(&config.system.salt, "system.salt")?;
    let public = decode_b64(&slot_config.public, "slot.pub")?;
    let private = decode_b64(&slot_config.private, "slot.priv")?;

    let mut k1 = argon2id_kdf(&password, &salt, config.system.level)?;
    let mut k2 = unwrap_key_material(&k1, &public);
    let master = xts_decrypt_sliced(&private, &k2)?;
    k1.zeroize();
    k2.zeroize();

    debug!(target: "igfs::kml", event = "master_key_unwrapped", slot = slot);
    Ok(SecretBytes::new(master))
}

/// Unwrap one `keys[]` entry with the master key.
fn unwrap_entry(entry: &WrappedKey, master: &MasterKey) -> Result<SecretBytes> {
    let wrapped = decode_b64(&entry.wrapped, "keys.wrapped")?;
    let plaintext = match &entry.public {
        Some(public) => {
            let public = decode_b64(public, "keys.pub")?;
            let mut k2 = unwrap_key_material(master.as_bytes(), &public);
            let out = xts_decrypt_sliced(&wrapped, &k2)?;
            k2.zeroize();
            out
        }
        None => xts_decrypt_sliced(&wrapped, master.as_bytes())?,
    };
    Ok(SecretBytes::new(plaintext))
}

/// Wrap a master key into a slot entry for the given extent key; the
/// write-side counterpart of [`master_key`].
pub fn wrap_slot(
    master: &[u8],
    extent_key: &ExtentKey,
    salt: &[u8],
    public: &[u8],
    level: u32,
) -> Result<crate::config::SlotConfig> {
    let mut raw = extent_key.raw()?;
    if raw.len() < PASSWORD_PREFIX_LEN {
        raw.zeroize();
        return Err(IgfsError::KdfFailure("extent key too short".to_owned()));
    }
    let password = BASE64.encode(&raw[..PASSWORD_PREFIX_LEN]).into_bytes();
    raw.zeroize();

    let mut k1 = argon2id_kdf(&password, salt, level)?;
    let mut k2 = unwrap_key_material(&k1, public);
    let private = xts_encrypt_sliced(master, &k2)?;
    k1.zeroize();
    k2.zeroize();

    Ok(crate::config::SlotConfig {
        public: BASE64.encode(public),
        private: BASE64.encode(private),
    })
}

/// Wrap a per-partition key under the master key; the write-side
/// counterpart of the keyring unwrap.
pub fn wrap_key_entry(
    minor: u32,
    key: &[u8],
    master: &[u8],
    public: Option<&[u8]>,
) -> Result<WrappedKey> {
    let wrapped = match public {
        Some(public) => {
            let mut k2 = unwrap_key_material(master, public);
            let out = xts_encrypt_sliced(key, &k2)?;
            k2.zeroize();
            out
        }
        None => xts_encrypt_sliced(key, master)?,
    };
    Ok(WrappedKey {
        minor,
        wrapped: BASE64.encode(wrapped),
        public: public.map(|public| BASE64.encode(public)),
    })
}

/// Per-partition dm-crypt keys unwrapped from the configuration.
#[derive(Debug)]
pub struct Keyring {
    keys: BTreeMap<u32, SecretBytes>,
}

impl Keyring {
    /// Unwrap every `keys[]` entry. Fails closed on the first bad entry.
    pub fn from_config(config: &KmlConfig, master: &MasterKey) -> Result<Self> {
        let mut keys = BTreeMap::new();
        for entry in &config.keys {
            keys.insert(entry.minor, unwrap_entry(entry, master)?);
        }
        debug!(target: "igfs::kml", event = "keyring_unlocked", keys = keys.len());
        Ok(Self { keys })
    }

    /// Key for the given partition minor.
    #[must_use]
    pub fn get(&self, minor: u32) -> Option<&SecretBytes> {
        self.keys.get(&minor)
    }

    #[must_use]
    pub fn minors(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
