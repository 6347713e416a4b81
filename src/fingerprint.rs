//! Content-addressed pipeline identifiers.
//!
//! Each pipeline stage gets a short identifier derived from its
//! configuration; equality between a stored identifier and the current one
//! means "this stage's inputs are unchanged". The combined pipeline hash
//! digests all six identifiers and is the authoritative "has this exact
//! pipeline already produced this file" check.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Pipeline format generation. Bump when the identifier scheme, the
/// persisted attribute layout, or the stage semantics change incompatibly.
pub const PIPELINE_GENERATION: &str = "1";

/// Number of hex characters kept from a stage-config digest.
const IDENTIFIER_DIGEST_LEN: usize = 8;

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Identifier for one stage: `<code>:<first 8 hex of sha256 over the
/// stage's canonical-JSON config>`. `serde_json` maps are key-ordered, so
/// serializing the kwargs value yields a canonical byte form.
#[must_use]
pub fn stage_identifier(code: &str, kwargs: &Value) -> String {
    let encoded = serde_json::to_vec(kwargs).unwrap_or_default();
    let digest = sha256_hex(&encoded);
    format!("{code}:{}", &digest[..IDENTIFIER_DIGEST_LEN])
}

/// The six per-stage identifiers of one pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FingerprintSet {
    pub generation: String,
    pub data: String,
    pub background: String,
    pub segmenter: String,
    pub feature: String,
    pub gate: String,
}

impl FingerprintSet {
    /// A set with every identifier `"0"`, the stored default for a file
    /// that was never processed.
    #[must_use]
    pub fn unset() -> Self {
        Self {
            generation: "0".to_owned(),
            data: "0".to_owned(),
            background: "0".to_owned(),
            segmenter: "0".to_owned(),
            feature: "0".to_owned(),
            gate: "0".to_owned(),
        }
    }

    /// Combined digest over all six identifiers, in stage order.
    #[must_use]
    pub fn pipeline_hash(&self) -> String {
        let joined = format!(
            "{}|{}|{}|{}|{}|{}",
            self.generation, self.data, self.background, self.segmenter, self.feature, self.gate
        );
        sha256_hex(joined.as_bytes())
    }
}
