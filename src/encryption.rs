//! Encryption strategy for stored resource configs.
//!
//! Resource configs are stored either as plaintext JSON or as ciphertext
//! accompanied by a nonce. The strategy is injected where configs are read;
//! the engine itself ships only the no-op strategy.

use crate::error::{EngineError, Result};

pub trait EncryptionStrategy: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(String, Option<String>)>;

    /// Decrypt a stored config blob. `nonce` is `None` for plaintext rows.
    fn decrypt(&self, ciphertext: &str, nonce: Option<&str>) -> Result<Vec<u8>>;
}

/// Pass-through strategy for deployments without encryption at rest.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl EncryptionStrategy for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<(String, Option<String>)> {
        let text = std::str::from_utf8(plaintext)
            .map_err(|e| EngineError::Consistency(format!("non-utf8 config: {e}")))?;
        Ok((text.to_string(), None))
    }

    fn decrypt(&self, ciphertext: &str, nonce: Option<&str>) -> Result<Vec<u8>> {
        if nonce.is_some() {
            return Err(EngineError::Consistency(
                "encrypted config but no encryption strategy configured".to_string(),
            ));
        }
        Ok(ciphertext.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_encryption_round_trips() {
        let strategy = NoEncryption;
        let (stored, nonce) = strategy.encrypt(b"{\"uri\":\"git://x\"}").unwrap();
        assert!(nonce.is_none());
        assert_eq!(strategy.decrypt(&stored, None).unwrap(), b"{\"uri\":\"git://x\"}");
    }

    #[test]
    fn no_encryption_rejects_nonced_rows() {
        let strategy = NoEncryption;
        assert!(strategy.decrypt("deadbeef", Some("abc")).is_err());
    }
}
