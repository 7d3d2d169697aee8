#![forbid(unsafe_code)]
//! IGFS public API facade.
//!
//! Re-exports the core functionality from `igfs-core` through a stable
//! external interface, plus the encrypted-extent subsystem behind the `kml`
//! feature. This is the crate downstream consumers (CLI, tooling) depend
//! on.

pub use igfs_core::*;
pub use igfs_error::{IgfsError, Result};
pub use igfs_ondisk as ondisk;
pub use igfs_types as types;

#[cfg(feature = "kml")]
pub use igfs_kml as kml;

/// Outcome of decrypting an encrypted partition.
#[derive(Debug)]
pub enum DecryptedPartition {
    /// Plain `aes-xts-plain64` container, decrypted in place.
    Plain(Vec<u8>),
    /// LUKS container: the unwrapped master key and the raw container, to
    /// be opened externally (`cryptsetup --master-key-file`).
    #[cfg(feature = "kml")]
    Luks {
        key: igfs_kml::SecretBytes,
        container: Vec<u8>,
    },
}

/// Decrypt an encrypted partition through the key management layer.
///
/// The boot identifier defaults to the one in the image's boot registry.
/// The partition's `WRITEABLE` extent yields the key-management
/// configuration; the unwrapped per-minor key then opens the partition
/// payload (extents excluded), which is the dm-crypt container.
#[cfg(feature = "kml")]
pub fn decrypt_partition(
    fs: &Filesystem,
    minor: u32,
    boot_id: Option<&str>,
    slot: usize,
) -> Result<DecryptedPartition> {
    let boot_id = match boot_id {
        Some(id) => id.to_owned(),
        None => fs
            .boot_registry()?
            .boot_id()
            .ok_or_else(|| IgfsError::KdfFailure("image carries no boot identifier".to_owned()))?,
    };

    let partition = fs.partition(minor)?;
    let efs_extent = partition
        .find_extent(types::ExtentType::Writeable)
        .copied()
        .ok_or_else(|| IgfsError::NotFound(format!("writeable extent in partition {minor}")))?;
    let efs_bytes = partition.extent_data(&efs_extent)?;
    let efs = ondisk::ExtentFilesystem::parse(&efs_bytes)?;

    let extent_key = kml::derive_extent_key(&boot_id, None)?;
    let config = kml::read_kmlconfig(&efs, &extent_key)?;
    let master = kml::keyring::master_key(&config, &extent_key, slot)?;
    let keyring = kml::Keyring::from_config(&config, &master)?;
    let key = keyring
        .get(minor)
        .ok_or_else(|| IgfsError::NotFound(format!("key for partition minor {minor}")))?;

    let container = partition.payload();
    match kml::detect_container(&container) {
        kml::ContainerMode::Plain => Ok(DecryptedPartition::Plain(
            kml::decrypt_plain_container(&container, key)?,
        )),
        kml::ContainerMode::Luks => Ok(DecryptedPartition::Luks {
            key: key.clone(),
            container,
        }),
    }
}

/// Without the `kml` feature the operation exists but reports the missing
/// capability instead of failing at load time.
#[cfg(not(feature = "kml"))]
pub fn decrypt_partition(
    _fs: &Filesystem,
    _minor: u32,
    _boot_id: Option<&str>,
    _slot: usize,
) -> Result<DecryptedPartition> {
    Err(IgfsError::FeatureNotEnabled("kml"))
}
