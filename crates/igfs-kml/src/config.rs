#![forbid(unsafe_code)]
//! `kmlconfig.json`: the key-management configuration inside the decrypted
//! extent filesystem.

use igfs_error::{IgfsError, Result};
use serde::{Deserialize, Serialize};

/// Top-level key-management configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KmlConfig {
    pub system: SystemConfig,
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub keys: Vec<WrappedKey>,
    /// TPM sealing data; opaque to this library.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<serde_json::Value>,
}

/// Global KDF parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Base64-encoded Argon2id salt (16 bytes).
    pub salt: String,
    /// Index into the KDF cost table.
    pub level: u32,
}

/// One key slot: public salt material and the wrapped slot secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotConfig {
    #[serde(rename = "pub")]
    pub public: String,
    #[serde(rename = "priv")]
    pub private: String,
}

/// Wrapped dm-crypt key for one partition minor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub minor: u32,
    pub wrapped: String,
    /// Optional per-key salt material; absent entries unwrap directly with
    /// the master key.
    #[serde(rename = "pub", default, skip_serializing_if = "Option::is_none")]
    pub public: Option<String>,
}

/// Parse the configuration, failing closed on malformed JSON.
pub fn parse_kmlconfig(raw: &[u8]) -> Result<KmlConfig> {
    serde_json::from_slice(raw)
        .map_err(|error| IgfsError::UnwrapFailure(format!("kmlconfig.json: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let raw = br#"{
            "system": {"salt": "AAECAwQFBgcICQoLDA0ODw==", "level": 1},
            "slots": [{"pub": "cHVi", "priv": "cHJpdg=="}],
            "keys": [
                {"minor": 255, "wrapped": "d3JhcHBlZA=="},
                {"minor": 254, "wrapped": "d3JhcHBlZA==", "pub": "cHVi"}
            ],
            "tpm": {"sealed": true}
        }"#;
        let config = parse_kmlconfig(raw).expect("parse");
        assert_eq!(config.system.level, 1);
        assert_eq!(config.slots.len(), 1);
        assert_eq!(config.keys.len(), 2);
        assert_eq!(config.keys[0].minor, 255);
        assert!(config.keys[0].public.is_none());
        assert_eq!(config.keys[1].public.as_deref(), Some("cHVi"));
        assert!(config.tpm.is_some());
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let raw = br#"{"system": {"salt": "c2FsdHNhbHRzYWx0c2FsdA==", "level": 0}}"#;
        let config = parse_kmlconfig(raw).expect("parse");
        assert!(config.slots.is_empty());
        assert!(config.keys.is_empty());
        assert!(config.tpm.is_none());
    }

    #[test]
    fn malformed_json_fails_closed() {
        assert!(matches!(
            parse_kmlconfig(b"not json"),
            Err(IgfsError::UnwrapFailure(_))
        ));
    }

    #[test]
    fn config_round_trips_through_serde() {
        let raw = br#"{"system":{"salt":"c2FsdA==","level":2},"slots":[],"keys":[]}"#;
        let config = parse_kmlconfig(raw).expect("parse");
        let encoded = serde_json::to_vec(&config).expect("encode");
        let reparsed = parse_kmlconfig(&encoded).expect("reparse");
        assert_eq!(reparsed.system.salt, config.system.salt);
        assert_eq!(reparsed.system.level, config.system.level);
    }
}
