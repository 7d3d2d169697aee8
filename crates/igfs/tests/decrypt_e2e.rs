#![cfg(feature = "kml")]
#![forbid(unsafe_code)]
//! End-to-end decryption of an encrypted partition: a synthetic image whose
//! minor-255 partition carries a `WRITEABLE` extent (sealed key-management
//! container) and a plain `aes-xts-plain64` payload.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use igfs::kml::config::{KmlConfig, SystemConfig};
use igfs::kml::keyring::{wrap_key_entry, wrap_slot};
use igfs::kml::{self, SecretBytes};
use igfs::ondisk::{
    BootRegistryEntry, BootRegistryHeader, Directory, ExtentFilesystem, PartitionExtent,
    PartitionHeader, SectionHeader,
};
use igfs::types::{
    BOOTREG_IDENT, BOOTREG_MAGIC, ExtentType, PARTITION_FLAG_HAS_CRYPT, PartitionType,
    SECTION_END_OF_CHAIN, SectionNumber, SectionSize,
};
use igfs::{DecryptedPartition, Filesystem, IgfsError, decrypt_partition};
use std::io::Write;
use tempfile::NamedTempFile;

const SECTION_SIZE: SectionSize = SectionSize::S256K;
const BOOT_ID: &str = "deadbeef-cafe-0123";
const CHAIN_LEN: usize = 5;
const MINOR: u32 = 255;

const SALT: [u8; 16] = [0x5A; 16];
const MASTER: [u8; 64] = [0xA5; 64];

fn container_key() -> Vec<u8> {
    (0..64_u8).map(|i| i.wrapping_mul(7)).collect()
}

fn payload_geometry() -> (usize, usize, usize) {
    let span0 = SECTION_SIZE.bytes() - SectionHeader::SIZE - hdrlen();
    let total = span0 + (CHAIN_LEN - 1) * (SECTION_SIZE.bytes() - SectionHeader::SIZE);
    let container_len = (total - ExtentFilesystem::SIZE) / 512 * 512;
    (total, container_len, total - ExtentFilesystem::SIZE - container_len)
}

fn hdrlen() -> usize {
    PartitionHeader::SIZE + 2 * PartitionExtent::SIZE
}

fn container_plaintext(len: usize) -> Vec<u8> {
    b"wfs-sector-data "
        .iter()
        .copied()
        .cycle()
        .take(len)
        .collect()
}

fn sealed_kml_container() -> ExtentFilesystem {
    let extent_key = kml::derive_extent_key(BOOT_ID, None).expect("extent key");
    let slot = wrap_slot(&MASTER, &extent_key, &SALT, b"slot0pub", 1).expect("wrap slot");
    let config = KmlConfig {
        system: SystemConfig {
            salt: BASE64.encode(SALT),
            level: 1,
        },
        slots: vec![slot],
        keys: vec![wrap_key_entry(MINOR, &container_key(), &MASTER, None).expect("wrap key")],
        tpm: None,
    };
    let json = serde_json::to_vec(&config).expect("encode config");

    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(json.len() as u64);
    header.set_mode(0o600);
    header.set_cksum();
    builder
        .append_data(&mut header, kml::KMLCONFIG_NAME, json.as_slice())
        .expect("append kmlconfig");
    let tar_bytes = builder.into_inner().expect("finish tar");

    kml::seal_extent_filesystem(&tar_bytes, &extent_key, [9; 8], 1, *b"efs-aad!")
        .expect("seal container")
}

fn boot_registry_bytes() -> Vec<u8> {
    let mut boot_id = [0_u8; 21];
    boot_id[..BOOT_ID.len()].copy_from_slice(BOOT_ID.as_bytes());
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
        entries: vec![
            BootRegistryEntry {
                flag: 0,
                data: [0; 62],
            };
            504
        ],
    }
    .to_bytes()
}

fn build_image() -> NamedTempFile {
    let size = SECTION_SIZE.bytes();
    let (total, container_len, tail_len) = payload_geometry();

    // Payload stream: sealed KML container, encrypted payload, login tail.
    let efs_bytes = sealed_kml_container().to_bytes();
    let ciphertext = kml::encrypt_plain_container(
        &container_plaintext(container_len),
        &SecretBytes::new(container_key()),
    )
    .expect("encrypt container");
    let mut stream = Vec::with_capacity(total);
    stream.extend_from_slice(&efs_bytes);
    stream.extend_from_slice(&ciphertext);
    stream.extend_from_slice(&vec![0x4C_u8; tail_len]);
    assert_eq!(stream.len(), total);

    let mut part = PartitionHeader::new(PartitionType::IgelRaw, PARTITION_FLAG_HAS_CRYPT, 2);
    part.partlen = (CHAIN_LEN * size) as u64;
    part.name[..3].copy_from_slice(b"wfs");
    let extents = [
        PartitionExtent {
            extent_type: ExtentType::Writeable as u16,
            offset: 0,
            length: ExtentFilesystem::SIZE as u64,
            name: *b"wfs\0\0\0\0\0",
        },
        PartitionExtent {
            extent_type: ExtentType::Login as u16,
            offset: (ExtentFilesystem::SIZE + container_len) as u64,
            length: tail_len as u64,
            name: *b"login\0\0\0",
        },
    ];

    // Distribute the stream over the chain.
    let mut buffers = Vec::with_capacity(CHAIN_LEN);
    let mut numbers = Vec::with_capacity(CHAIN_LEN);
    let mut cursor = 0_usize;
    for index in 0..CHAIN_LEN {
        let number = SectionNumber(1 + index as u32);
        let next = if index + 1 == CHAIN_LEN {
            SECTION_END_OF_CHAIN
        } else {
            number.0 + 1
        };
        let mut buffer = vec![0_u8; size];
        SectionHeader::new(SECTION_SIZE, MINOR, index as u32, next)
            .serialize_into(&mut buffer)
            .expect("header");
        let mut data_start = SectionHeader::SIZE;
        if index == 0 {
            part.serialize_into(&mut buffer[data_start..]).expect("partition header");
            data_start += PartitionHeader::SIZE;
            for extent in &extents {
                extent.serialize_into(&mut buffer[data_start..]).expect("extent");
                data_start += PartitionExtent::SIZE;
            }
        }
        let span = size - data_start;
        buffer[data_start..].copy_from_slice(&stream[cursor..cursor + span]);
        cursor += span;
        buffers.push(buffer);
        numbers.push(number);
    }
    assert_eq!(cursor, total);
    igfs_integrity::rebuild_partition_buffers(&mut buffers, &numbers, SECTION_SIZE, None)
        .expect("seal CRCs");

    // Section zero.
    let mut zero = vec![0_u8; size];
    let bootreg = boot_registry_bytes();
    zero[..bootreg.len()].copy_from_slice(&bootreg);
    let mut directory = Directory::new();
    directory
        .create_entry(MINOR, 1, CHAIN_LEN as u32)
        .expect("directory entry");
    directory.seal();
    let dir_bytes = directory.to_bytes();
    zero[igfs::types::DIR_OFFSET..igfs::types::DIR_OFFSET + dir_bytes.len()]
        .copy_from_slice(&dir_bytes);

    let mut file = NamedTempFile::new().expect("tempfile");
    file.write_all(&zero).expect("section zero");
    for buffer in &buffers {
        file.write_all(buffer).expect("partition section");
    }
    file.flush().expect("flush");
    file
}

#[test]
fn decrypt_encrypted_partition_end_to_end() {
    let image = build_image();
    let fs = Filesystem::open(image.path()).expect("open");

    let decrypted =
        decrypt_partition(&fs, MINOR, Some(BOOT_ID), 0).expect("decrypt partition");
    let DecryptedPartition::Plain(plaintext) = decrypted else {
        panic!("expected a plain container");
    };
    let (_, container_len, _) = payload_geometry();
    assert_eq!(plaintext, container_plaintext(container_len));
}

#[test]
fn boot_id_defaults_to_registry() {
    let image = build_image();
    let fs = Filesystem::open(image.path()).expect("open");
    let decrypted = decrypt_partition(&fs, MINOR, None, 0).expect("decrypt via registry id");
    assert!(matches!(decrypted, DecryptedPartition::Plain(_)));
}

#[test]
fn wrong_boot_id_fails_authentication() {
    let image = build_image();
    let fs = Filesystem::open(image.path()).expect("open");
    assert!(matches!(
        decrypt_partition(&fs, MINOR, Some("not-the-right-box"), 0),
        Err(IgfsError::AeadFailure)
    ));
}

#[test]
fn kmlconfig_survives_the_trip() {
    let image = build_image();
    let fs = Filesystem::open(image.path()).expect("open");
    let partition = fs.partition(MINOR).expect("partition");
    let extent = partition
        .find_extent(ExtentType::Writeable)
        .copied()
        .expect("writeable extent");
    let efs =
        ExtentFilesystem::parse(&partition.extent_data(&extent).expect("extent bytes"))
            .expect("container");

    let extent_key = kml::derive_extent_key(BOOT_ID, None).expect("extent key");
    let config = kml::read_kmlconfig(&efs, &extent_key).expect("kmlconfig");
    let salt = BASE64.decode(config.system.salt).expect("salt");
    assert_eq!(salt.len(), 16);
    assert_eq!(config.keys.len(), 1);
    assert_eq!(config.keys[0].minor, MINOR);
}
