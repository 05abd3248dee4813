use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Longest vendor label we hand downstream.
pub const VENDOR_MAX_LEN: usize = 30;

/// Compatibility-decomposes (NFKD) and drops accents, case-folds, drops
/// apostrophes, treats every other non-alphanumeric character as a
/// separator and collapses runs of whitespace.
pub fn normalize_description(s: &str) -> String {
    s.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| *c != '\'' && *c != '\u{2019}')
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// ASCII-only, uppercase, punctuation-free vendor label capped at
/// [`VENDOR_MAX_LEN`] characters.
pub fn clean_vendor(s: &str) -> String {
    let ascii: String = s
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_ascii() && !c.is_ascii_punctuation() && !c.is_ascii_control())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let collapsed = ascii.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(VENDOR_MAX_LEN).collect::<String>().trim_end().to_string()
}

/// Stable cache key derived from a normalized description.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hex length of a fingerprint (first 8 bytes of the SHA-256 digest).
    pub const LEN: usize = 16;

    pub fn of(normalized: &str) -> Self {
        let digest = sha256_bytes(normalized.as_bytes());
        Fingerprint(to_hex(&digest[..Self::LEN / 2]))
    }

    /// Accepts a previously persisted fingerprint, rejecting anything that
    /// is not exactly [`Self::LEN`] lowercase hex characters.
    pub fn parse(s: &str) -> Option<Self> {
        let valid = s.len() == Self::LEN
            && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        valid.then(|| Fingerprint(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
