#![forbid(unsafe_code)]
//! Error types for the IGFS workspace.
//!
//! Defines `IgfsError` and a `Result<T>` alias used throughout the workspace.
//! Includes the exit-code mapping used by the `igfs` binary.

use igfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all IGFS operations.
#[derive(Debug, Error)]
pub enum IgfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("invalid image: {0}")]
    InvalidImage(String),

    #[error("section {section} out of range (image has {max} sections)")]
    OutOfRange { section: u32, max: u32 },

    #[error("corrupt directory: {0}")]
    CorruptDirectory(String),

    #[error("partition chain revisits section {section}")]
    CycleDetected { section: u32 },

    #[error("corrupt chain at section {section}: {detail}")]
    CorruptChain { section: u32, detail: String },

    #[error("CRC mismatch in section {section}")]
    ChecksumFailed { section: u32 },

    #[error("hash mismatch in section {section}")]
    HashMismatch { section: u32 },

    #[error("hash block signature does not verify")]
    SignatureInvalid,

    #[error("no trusted key verifies the hash block signature")]
    UntrustedSigner,

    #[error("AEAD authentication failed")]
    AeadFailure,

    #[error("key derivation failed: {0}")]
    KdfFailure(String),

    #[error("key unwrap failed: {0}")]
    UnwrapFailure(String),

    #[error("decompression failed: {0}")]
    DecompressFailure(String),

    #[error("signer capability failed: {0}")]
    SignerFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store is read-only")]
    ReadOnly,

    #[error("feature not enabled: {0}")]
    FeatureNotEnabled(&'static str),

    #[error("operation cancelled")]
    Cancelled,
}

impl IgfsError {
    /// Map this error onto the process exit codes used by the CLI:
    /// 3 corrupt image, 4 signature invalid, 5 decryption failed, 1 other.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse(_)
            | Self::InvalidImage(_)
            | Self::OutOfRange { .. }
            | Self::CorruptDirectory(_)
            | Self::CycleDetected { .. }
            | Self::CorruptChain { .. }
            | Self::ChecksumFailed { .. }
            | Self::HashMismatch { .. } => 3,
            Self::SignatureInvalid | Self::UntrustedSigner => 4,
            Self::AeadFailure
            | Self::KdfFailure(_)
            | Self::UnwrapFailure(_)
            | Self::DecompressFailure(_) => 5,
            Self::Io(_)
            | Self::SignerFailure(_)
            | Self::NotFound(_)
            | Self::ReadOnly
            | Self::FeatureNotEnabled(_)
            | Self::Cancelled => 1,
        }
    }
}

/// Result alias using `IgfsError`.
pub type Result<T> = std::result::Result<T, IgfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(IgfsError::ChecksumFailed { section: 3 }.exit_code(), 3);
        assert_eq!(IgfsError::SignatureInvalid.exit_code(), 4);
        assert_eq!(IgfsError::UntrustedSigner.exit_code(), 4);
        assert_eq!(IgfsError::AeadFailure.exit_code(), 5);
        assert_eq!(IgfsError::Cancelled.exit_code(), 1);
        assert_eq!(
            IgfsError::Parse(ParseError::InvalidMagic { context: "directory" }).exit_code(),
            3
        );
    }
}
