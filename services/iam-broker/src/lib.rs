//! Auth-callout broker library crate.
//!
//! # Purpose
//! Exposes the broker's subsystems (configuration, verification/policy,
//! NATS adapter) for use by the binary and integration tests.

pub mod auth;
pub mod config;
pub mod server;
