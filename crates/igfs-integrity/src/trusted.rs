#![forbid(unsafe_code)]
//! Trusted signer keys bundled with the library.
//!
//! PKCS#1 DER blobs of the RSA-4096 public keys accepted for hash-block
//! signatures. Deployments pin their vendor keys here; callers can always
//! supply their own set via `SignatureVerifier::with_keys`.

/// DER-encoded RSA public keys, tried in order.
pub const TRUSTED_KEYS_DER: &[&[u8]] = &[include_bytes!("igel_master_0.der")];
