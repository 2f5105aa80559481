//! # Pod Identity Agent Library
//!
//! Provides a node-local HTTP endpoint that exchanges Kubernetes
//! service-account tokens for temporary cloud credentials, caching them in
//! a bounded refreshing cache so restarting workloads do not hammer the
//! identity-exchange service.
//!
//! Modules:
//! - `config` — agent configuration and validation
//! - `credentials` — credential models and the provider trait
//! - `validation` — target-host and token-shape checks
//! - `cache` — refreshing credential cache with single-flight fetch
//! - `refresh` — background sweeper and rate limiting
//! - `exchange` — HTTP client for the identity-exchange service
//! - `server` — credential, probe, and metrics listeners

pub mod cache;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod exchange;
pub mod helpers;
pub mod observability;
pub mod refresh;
pub mod resilience;
pub mod server;
pub mod utils;
pub mod validation;

#[cfg(test)]
pub mod tests;

pub use crate::config::settings::AgentConfig;
pub use crate::credentials::{CredentialProvider, CredentialRequest, Credentials};
