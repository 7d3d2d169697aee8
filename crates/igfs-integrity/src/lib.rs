#![forbid(unsafe_code)]
//! Integrity pipeline: CRC32, BLAKE2b hash chain and RSA signatures.
//!
//! Write ordering is mandatory and enforced by [`rebuild_partition_buffers`]:
//! first the per-section BLAKE2b digests with the exclude mask applied, then
//! the RSA signature over the digests and the exclude table, and the CRC32
//! of every section last.

pub mod trusted;

use blake2::Blake2bVar;
use blake2::digest::{Update, VariableOutput};
use igfs_error::{IgfsError, Result};
use igfs_ondisk::{DerivedSection, HashBlock, HashExclude, SectionHeader};
use igfs_types::{
    HASH_SIGNATURE_TYPE_NONE, SECTION_IMAGE_CRC_START, SIGNATURE_BYTE_SIZE, SectionNumber,
    SectionSize,
};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::ops::Range;
use tracing::{debug, warn};

/// `signature_algo` value for RSA-4096 over SHA-256.
pub const SIGNATURE_ALGO_RSA4096_SHA256: u8 = 1;

// ── CRC32 ───────────────────────────────────────────────────────────────────

/// CRC32 (IEEE, as zlib computes it) of a section, skipping the CRC field.
#[must_use]
pub fn section_crc(bytes: &[u8]) -> u32 {
    crc32fast::hash(&bytes[SECTION_IMAGE_CRC_START.min(bytes.len())..])
}

/// Check the stored CRC of a section image.
pub fn verify_section_crc(n: SectionNumber, bytes: &[u8]) -> Result<()> {
    let stored = igfs_types::read_le_u32(bytes, 0)?;
    if stored != section_crc(bytes) {
        return Err(IgfsError::ChecksumFailed { section: n.0 });
    }
    Ok(())
}

/// Store the CRC of a section image in place. The final step of any write.
pub fn write_section_crc(bytes: &mut [u8]) -> Result<()> {
    let crc = section_crc(bytes);
    igfs_types::put_le_u32(bytes, 0, crc)?;
    Ok(())
}

// ── Exclude masks ───────────────────────────────────────────────────────────

/// Translate absolute exclude records into in-section byte ranges.
///
/// A record with `repeat == 0` is a single `[start, start + size)` range;
/// otherwise the range recurs every `repeat` bytes while its start stays at
/// or below `end`. Only the parts overlapping
/// `[section_base, section_base + section_len)` are returned, relative to
/// the section start.
#[must_use]
pub fn exclude_ranges_for_section(
    excludes: &[HashExclude],
    section_base: u64,
    section_len: usize,
) -> Vec<Range<usize>> {
    let section_end = section_base.saturating_add(section_len as u64);
    let mut ranges = Vec::new();

    for exclude in excludes {
        let size = u64::from(exclude.size);
        if size == 0 {
            continue;
        }
        if exclude.repeat == 0 {
            clamp_range(&mut ranges, exclude.start, size, section_base, section_end);
            continue;
        }

        let repeat = u64::from(exclude.repeat);
        // First occurrence whose end can reach into this section.
        let first = if section_base > exclude.start.saturating_add(size) {
            (section_base - exclude.start - size) / repeat
        } else {
            0
        };
        let mut occurrence = exclude.start.saturating_add(first.saturating_mul(repeat));
        while occurrence < section_end && occurrence <= exclude.end {
            clamp_range(&mut ranges, occurrence, size, section_base, section_end);
            let Some(next) = occurrence.checked_add(repeat) else {
                break;
            };
            occurrence = next;
        }
    }

    ranges.sort_by_key(|range| range.start);
    ranges
}

#[allow(clippy::cast_possible_truncation)] // clamped to section_len
fn clamp_range(
    ranges: &mut Vec<Range<usize>>,
    start: u64,
    size: u64,
    section_base: u64,
    section_end: u64,
) {
    let lo = start.max(section_base);
    let hi = start.saturating_add(size).min(section_end);
    if lo < hi {
        ranges.push((lo - section_base) as usize..(hi - section_base) as usize);
    }
}

/// BLAKE2b digest of a section with the exclude mask applied: masked bytes
/// read as zero.
pub fn masked_section_hash(
    bytes: &[u8],
    ranges: &[Range<usize>],
    hash_bytes: usize,
) -> Result<Vec<u8>> {
    let mut masked = bytes.to_vec();
    for range in ranges {
        let end = range.end.min(masked.len());
        if range.start < end {
            masked[range.start..end].fill(0);
        }
    }
    let mut hasher = Blake2bVar::new(hash_bytes)
        .map_err(|_| IgfsError::InvalidImage(format!("unsupported digest width {hash_bytes}")))?;
    hasher.update(&masked);
    let mut out = vec![0_u8; hash_bytes];
    hasher
        .finalize_variable(&mut out)
        .map_err(|_| IgfsError::InvalidImage(format!("unsupported digest width {hash_bytes}")))?;
    Ok(out)
}

/// The five standard excludes for a signed partition: the per-section CRC,
/// generation and next pointer (repeating across the whole chain), the
/// signature field and the digest region in the first section.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // field sizes are format constants
pub fn standard_excludes(
    first_section_base: u64,
    section_count: u64,
    section_size: SectionSize,
    signature_abs: u64,
    values_abs: u64,
    values_len: u32,
) -> Vec<HashExclude> {
    let stride = section_size.bytes() as u64;
    let chain_end = first_section_base + section_count * stride - 1;
    let repeating = |offset: u64, size: u32| HashExclude {
        start: first_section_base + offset,
        size,
        repeat: stride as u32,
        end: chain_end,
    };
    vec![
        repeating(0, 4),   // SectionHeader.crc
        repeating(16, 2),  // SectionHeader.generation
        repeating(22, 4),  // SectionHeader.next_section
        HashExclude {
            start: signature_abs,
            size: SIGNATURE_BYTE_SIZE as u32,
            repeat: 0,
            end: 0,
        },
        HashExclude {
            start: values_abs,
            size: values_len,
            repeat: 0,
            end: 0,
        },
    ]
}

// ── Signatures ──────────────────────────────────────────────────────────────

/// SHA-256 digest covered by the hash-block signature.
#[must_use]
pub fn signed_digest(hash_values: &[u8], excludes_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    Digest::update(&mut hasher, hash_values);
    Digest::update(&mut hasher, excludes_bytes);
    hasher.finalize().into()
}

/// Outcome of a signature check on a hash block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureCheck {
    Verified,
    /// The hash block carries no signature (`signature_algo == 0`).
    Unsigned,
}

/// Verifier over a set of trusted RSA public keys.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    keys: Vec<RsaPublicKey>,
}

impl SignatureVerifier {
    /// Verifier over the keys bundled with the library.
    #[must_use]
    pub fn builtin() -> Self {
        let keys = trusted::TRUSTED_KEYS_DER
            .iter()
            .filter_map(|der| match RsaPublicKey::from_pkcs1_der(der) {
                Ok(key) => Some(key),
                Err(error) => {
                    warn!(target: "igfs::integrity", event = "bad_trusted_key", %error);
                    None
                }
            })
            .collect();
        Self { keys }
    }

    #[must_use]
    pub fn with_keys(keys: Vec<RsaPublicKey>) -> Self {
        Self { keys }
    }

    pub fn from_der_keys(ders: &[&[u8]]) -> Result<Self> {
        let mut keys = Vec::with_capacity(ders.len());
        for der in ders {
            keys.push(
                RsaPublicKey::from_pkcs1_der(der)
                    .map_err(|error| IgfsError::InvalidImage(format!("bad public key: {error}")))?,
            );
        }
        Ok(Self { keys })
    }

    /// Verify the signature of a hash block over its digests and exclude
    /// table. Returns `Unsigned` when the block declares no signature.
    pub fn verify_hash_block(&self, block: &HashBlock) -> Result<SignatureCheck> {
        if block.header.signature_algo == HASH_SIGNATURE_TYPE_NONE {
            return Ok(SignatureCheck::Unsigned);
        }
        if self.keys.is_empty() {
            return Err(IgfsError::UntrustedSigner);
        }

        let digest = signed_digest(&block.values, &block.excludes_bytes());
        for key in &self.keys {
            let len = key.size().min(block.header.signature.len());
            if key
                .verify(
                    Pkcs1v15Sign::new::<Sha256>(),
                    &digest,
                    &block.header.signature[..len],
                )
                .is_ok()
            {
                return Ok(SignatureCheck::Verified);
            }
        }
        Err(IgfsError::SignatureInvalid)
    }
}

/// Capability for producing hash-block signatures. The library bundles no
/// private keys; callers provide this when writing signed partitions.
pub trait HashSigner {
    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>>;
}

/// PKCS#1 v1.5 signer over an in-memory RSA private key.
pub struct RsaSigner {
    key: RsaPrivateKey,
}

impl RsaSigner {
    #[must_use]
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }
}

impl HashSigner for RsaSigner {
    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), digest)
            .map_err(|error| IgfsError::SignerFailure(error.to_string()))
    }
}

// ── Partition-level verify and rebuild ──────────────────────────────────────

fn derive_first(buffers: &[Vec<u8>]) -> Result<DerivedSection> {
    let first = buffers.first().ok_or_else(|| {
        IgfsError::InvalidImage("partition has no sections".to_owned())
    })?;
    igfs_types::ensure_slice(first, 0, SectionHeader::SIZE)?;
    Ok(DerivedSection::parse(&first[SectionHeader::SIZE..]))
}

/// Verify a partition given its raw section buffers.
///
/// CRCs are always checked. With `deep`, every section is re-hashed with
/// the exclude mask and compared against the stored digest; the signature
/// is checked once via `verifier`.
pub fn verify_partition_buffers(
    buffers: &[Vec<u8>],
    numbers: &[SectionNumber],
    section_size: SectionSize,
    deep: bool,
    verifier: &SignatureVerifier,
) -> Result<SignatureCheck> {
    for (buffer, number) in buffers.iter().zip(numbers) {
        verify_section_crc(*number, buffer)?;
    }

    let derived = derive_first(buffers)?;
    let Some(hash) = derived.hash else {
        return Ok(SignatureCheck::Unsigned);
    };

    if hash.header.count_hash != buffers.len() as u64 {
        return Err(IgfsError::InvalidImage(format!(
            "hash block covers {} sections but chain has {}",
            hash.header.count_hash,
            buffers.len()
        )));
    }

    let status = verifier.verify_hash_block(&hash)?;

    if deep {
        let width = usize::from(hash.header.hash_bytes);
        for (index, (buffer, number)) in buffers.iter().zip(numbers).enumerate() {
            let base = section_size.start_of_section(*number);
            let ranges = exclude_ranges_for_section(&hash.excludes, base, buffer.len());
            let digest = masked_section_hash(buffer, &ranges, width)?;
            if hash.value_for(index) != Some(digest.as_slice()) {
                return Err(IgfsError::HashMismatch { section: number.0 });
            }
        }
        debug!(
            target: "igfs::integrity",
            event = "deep_verify",
            sections = buffers.len(),
            signature = ?status
        );
    }

    Ok(status)
}

/// Re-establish integrity of a partition's section buffers after mutation,
/// in the mandatory order: digests, signature, CRCs.
///
/// Without a signer the stored signature is left untouched (callers that
/// mutate payload bytes of a signed partition must provide one for the
/// signature to remain valid).
pub fn rebuild_partition_buffers(
    buffers: &mut [Vec<u8>],
    numbers: &[SectionNumber],
    section_size: SectionSize,
    signer: Option<&dyn HashSigner>,
) -> Result<()> {
    let derived = derive_first(buffers)?;

    if let Some(hash) = derived.hash {
        if signer.is_some() && hash.header.signature_algo == HASH_SIGNATURE_TYPE_NONE {
            // The algo byte is inside the hashed region, so it must be in
            // its final state before any digest is computed.
            return Err(IgfsError::SignerFailure(
                "hash block is marked unsigned; set signature_algo before rebuilding".to_owned(),
            ));
        }
        let width = usize::from(hash.header.hash_bytes);
        let values_at = SectionHeader::SIZE + hash.values_offset();
        let signature_at = SectionHeader::SIZE + hash.signature_offset();

        // Digests first; the values region itself is excluded from hashing,
        // so the iteration order over sections does not matter.
        let mut values = Vec::with_capacity(width * buffers.len());
        for (buffer, number) in buffers.iter().zip(numbers) {
            let base = section_size.start_of_section(*number);
            let ranges = exclude_ranges_for_section(&hash.excludes, base, buffer.len());
            values.extend_from_slice(&masked_section_hash(buffer, &ranges, width)?);
        }
        igfs_types::put_bytes(&mut buffers[0], values_at, &values)?;

        // Signature second, over the fresh digests and the exclude table.
        if let Some(signer) = signer {
            let digest = signed_digest(&values, &hash.excludes_bytes());
            let signature = signer.sign(&digest)?;
            if signature.len() > SIGNATURE_BYTE_SIZE {
                return Err(IgfsError::SignerFailure(format!(
                    "signature of {} bytes exceeds the {SIGNATURE_BYTE_SIZE}-byte field",
                    signature.len()
                )));
            }
            let mut padded = vec![0_u8; SIGNATURE_BYTE_SIZE];
            padded[..signature.len()].copy_from_slice(&signature);
            igfs_types::put_bytes(&mut buffers[0], signature_at, &padded)?;
        }
    }

    // CRCs last.
    for buffer in buffers.iter_mut() {
        write_section_crc(buffer)?;
    }
    Ok(())
}
