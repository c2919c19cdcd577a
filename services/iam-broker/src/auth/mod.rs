//! Verification, policy, and minting for authorization requests.

pub mod claims;
pub mod expiry;
pub mod rbac;
pub mod service;
pub mod verifier;

pub use claims::IdpClaims;
pub use service::{AuditSink, AuthService, BrokerOptions, Reply, XKEY_HEADER};
