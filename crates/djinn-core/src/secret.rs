//! The deployment-wide shared secret.
//!
//! Every remote call carries the secret in clear text; the controller keeps
//! only its SHA-256 digest for comparison, plus the raw value it needs to
//! authenticate its own outgoing peer calls.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};

#[derive(Clone)]
pub struct Secret {
    raw: String,
    digest: [u8; 32],
}

impl Secret {
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let digest = Sha256::digest(raw.as_bytes()).into();
        Self { raw, digest }
    }

    /// Read the secret from a key file, ignoring surrounding whitespace.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::new(content.trim()))
    }

    /// Compare a caller-supplied token against this secret.
    pub fn verify(&self, candidate: &str) -> bool {
        let other: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        self.digest
            .iter()
            .zip(other.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }

    pub fn expose(&self) -> &str {
        &self.raw
    }

    /// Hex fingerprint, safe to log.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.digest[..4])
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_matches_only_exact_value() {
        let secret = Secret::new("abc123");
        assert!(secret.verify("abc123"));
        assert!(!secret.verify("abc124"));
        assert!(!secret.verify(""));
        assert!(!secret.verify("abc123 "));
    }

    #[test]
    fn debug_does_not_leak_raw_value() {
        let secret = Secret::new("hunter2");
        let shown = format!("{secret:?}");
        assert!(!shown.contains("hunter2"));
        assert_eq!(secret.fingerprint().len(), 8);
    }

    #[test]
    fn load_trims_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret.key");
        std::fs::write(&path, "tok3n\n").unwrap();
        let secret = Secret::load(&path).unwrap();
        assert!(secret.verify("tok3n"));
        assert_eq!(secret.expose(), "tok3n");
    }
}
