//! Wrappers around NATS nkeys for the two key families the broker uses.
//!
//! `SigningKey` is an Ed25519 nkey pair (account/user/server class) used to
//! sign minted credentials and authorization responses. `ExchangeKey` is a
//! Curve25519 xkey pair used to open sealed authorization requests and seal
//! responses when the server presents its xkey.
//!
//! Seed material lives inside `nkeys`, which zeroizes it on drop.

use std::fmt;
use std::sync::Arc;

use crate::errors::{CredentialError, CredentialResult};
use crate::redact::redact_key;

#[derive(Clone)]
pub struct SigningKey {
    inner: Arc<nkeys::KeyPair>,
}

impl SigningKey {
    pub fn from_seed(seed: &str) -> CredentialResult<Self> {
        let pair = nkeys::KeyPair::from_seed(seed.trim())
            .map_err(|err| CredentialError::InvalidSeed(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(pair),
        })
    }

    /// Build a verification-only key from a public nkey.
    pub fn from_public_key(public_key: &str) -> CredentialResult<Self> {
        let pair = nkeys::KeyPair::from_public_key(public_key.trim())
            .map_err(|err| CredentialError::InvalidSeed(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(pair),
        })
    }

    pub fn generate_account() -> Self {
        Self {
            inner: Arc::new(nkeys::KeyPair::new_account()),
        }
    }

    pub fn generate_user() -> Self {
        Self {
            inner: Arc::new(nkeys::KeyPair::new_user()),
        }
    }

    pub fn generate_server() -> Self {
        Self {
            inner: Arc::new(nkeys::KeyPair::new_server()),
        }
    }

    pub fn public_key(&self) -> String {
        self.inner.public_key()
    }

    pub fn seed(&self) -> CredentialResult<String> {
        Ok(self.inner.seed()?)
    }

    pub fn sign(&self, input: &[u8]) -> CredentialResult<Vec<u8>> {
        Ok(self.inner.sign(input)?)
    }

    pub fn verify(&self, input: &[u8], signature: &[u8]) -> CredentialResult<()> {
        self.inner
            .verify(input, signature)
            .map_err(|_| CredentialError::BadSignature)
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("public_key", &self.public_key())
            .finish()
    }
}

#[derive(Clone)]
pub struct ExchangeKey {
    inner: Arc<nkeys::XKey>,
}

impl ExchangeKey {
    pub fn from_seed(seed: &str) -> CredentialResult<Self> {
        let key = nkeys::XKey::from_seed(seed.trim())
            .map_err(|err| CredentialError::InvalidSeed(err.to_string()))?;
        Ok(Self {
            inner: Arc::new(key),
        })
    }

    pub fn generate() -> Self {
        Self {
            inner: Arc::new(nkeys::XKey::new()),
        }
    }

    pub fn public_key(&self) -> String {
        self.inner.public_key()
    }

    pub fn seed(&self) -> CredentialResult<String> {
        Ok(self.inner.seed()?)
    }

    /// Open a sealed box addressed to this key from `sender_public_xkey`.
    pub fn open(&self, sealed: &[u8], sender_public_xkey: &str) -> CredentialResult<Vec<u8>> {
        let sender = nkeys::XKey::from_public_key(sender_public_xkey)
            .map_err(|err| CredentialError::InvalidSeed(err.to_string()))?;
        Ok(self.inner.open(sealed, &sender)?)
    }

    /// Seal `plaintext` for `recipient_public_xkey`.
    pub fn seal(&self, plaintext: &[u8], recipient_public_xkey: &str) -> CredentialResult<Vec<u8>> {
        let recipient = nkeys::XKey::from_public_key(recipient_public_xkey)
            .map_err(|err| CredentialError::InvalidSeed(err.to_string()))?;
        Ok(self.inner.seal(plaintext, &recipient)?)
    }
}

impl fmt::Debug for ExchangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeKey")
            .field("public_key", &redact_key(&self.public_key()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_key_round_trip() {
        let key = SigningKey::generate_account();
        let seed_pub = key.public_key();
        assert!(seed_pub.starts_with('A'));

        let sig = key.sign(b"payload").expect("sign");
        key.verify(b"payload", &sig).expect("verify");
        assert!(key.verify(b"tampered", &sig).is_err());
    }

    #[test]
    fn verification_only_key_verifies() {
        let key = SigningKey::generate_user();
        let sig = key.sign(b"hello").expect("sign");

        let public_only = SigningKey::from_public_key(&key.public_key()).expect("public");
        public_only.verify(b"hello", &sig).expect("verify");
    }

    #[test]
    fn exchange_key_seal_open() {
        let broker = ExchangeKey::generate();
        let server = ExchangeKey::generate();

        let sealed = broker
            .seal(b"authorization request", &server.public_key())
            .expect("seal");
        assert_ne!(sealed.as_slice(), b"authorization request");

        let opened = server
            .open(&sealed, &broker.public_key())
            .expect("open");
        assert_eq!(opened, b"authorization request");
    }

    #[test]
    fn bad_seed_is_rejected() {
        assert!(SigningKey::from_seed("not-a-seed").is_err());
        assert!(ExchangeKey::from_seed("SANOTANXKEY").is_err());
    }
}
