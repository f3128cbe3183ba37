//! gardisto - authentication and session-lifecycle core.
//!
//! Credential verification, RS256 access tokens, rotating refresh tokens
//! with reuse detection, TOTP second factor with backup codes, sliding-window
//! rate limiting with account lockout, and per-account device tracking.
//!
//! The crate is transport-agnostic: [`service::AuthService`] is the entry
//! point, persistence goes through [`store::AuthStore`] (in-memory and
//! Postgres implementations included), and outbound email goes through
//! [`notify::Notifier`]. HTTP handlers, mailers, and schedulers live in the
//! embedding application.

pub mod config;
pub mod device;
pub mod error;
pub mod mfa;
pub mod models;
pub mod notify;
pub mod password;
pub mod pending;
pub mod rate_limit;
pub mod service;
pub mod store;
pub mod token;
pub mod util;

pub use config::AuthConfig;
pub use error::{Error, Result};
pub use service::{
    AuthService, AuthTokens, CleanupReport, ClientContext, LoginOutcome, Registration,
};
