//! Minimal HTTP client for the Vault API.
//!
//! Covers the endpoints a test fixture needs: initialization and health
//! status, plus token self-lookup to confirm a client is authenticated.

pub mod client;
pub mod sys;

pub use client::{Client, ClientError, DEFAULT_REQUEST_TIMEOUT};
pub use sys::{HealthResponse, TokenInfo};
