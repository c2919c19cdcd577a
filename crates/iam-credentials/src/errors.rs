use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid nkey seed: {0}")]
    InvalidSeed(String),
    #[error("key error: {0}")]
    Key(#[from] nkeys::error::Error),
    #[error("malformed jwt: {0}")]
    MalformedJwt(String),
    #[error("jwt algorithm not supported: {0}")]
    UnsupportedAlgorithm(String),
    #[error("jwt signature verification failed")]
    BadSignature,
    #[error("claims validation failed: {0}")]
    InvalidClaims(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type CredentialResult<T> = Result<T, CredentialError>;
