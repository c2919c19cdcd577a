//! Credential primitives shared by the iam-broker service and its tests.
//!
//! # Purpose
//! Centralizes NATS key material handling (signing nkeys and curve xkeys),
//! the NATS JWT v2 claim envelopes the auth-callout protocol speaks, and the
//! secure-log redaction applied wherever key material could reach a log line.
//!
//! # How it fits
//! The broker service decodes authorization requests, mints user credentials,
//! and signs authorization responses using the types in this crate; tests use
//! the same types to fabricate requests and open sealed replies.
//!
//! # Key invariants
//! - Credentials are Ed25519/"ed25519-nkey" only; no other algorithm is
//!   produced or accepted.
//! - Seed material is wiped on drop by the underlying key types.

mod claims;
mod errors;
mod jwt;
mod keys;
mod redact;

pub use claims::{
    AuthRequestClaims, AuthRequestNats, AuthResponseClaims, AuthResponseNats, ClientInfo,
    ConnectOptions, GenericClaims, Limits, Permission, Permissions, ResponsePermission, ServerId,
    TimeRange, UserClaims, UserNats,
};
pub use errors::{CredentialError, CredentialResult};
pub use jwt::{decode_auth_request, decode_claims, sign_claims};
pub use keys::{ExchangeKey, SigningKey};
pub use redact::redact_key;
