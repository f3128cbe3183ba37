//! Auth configuration: thresholds, windows, and TTLs.

use secrecy::SecretString;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i64 = 300;
const DEFAULT_RATE_LIMIT_MAX_ATTEMPTS: u64 = 10;
const DEFAULT_MAX_FAILED_ATTEMPTS: u32 = 5;
const DEFAULT_LOCK_DURATION_SECONDS: i64 = 30 * 60;
const DEFAULT_PENDING_SESSION_TTL_SECONDS: u64 = 5 * 60;
const DEFAULT_ATTEMPT_RETENTION_SECONDS: i64 = 30 * 24 * 60 * 60;
const DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_RESET_TOKEN_TTL_SECONDS: i64 = 60 * 60;
const DEFAULT_ISSUER: &str = "gardisto";

/// Configuration for the auth core: policy defaults plus `with_*`
/// overrides. Tests shrink the TTLs instead of mocking a clock.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    issuer: String,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    rate_limit_window_seconds: i64,
    rate_limit_max_attempts: u64,
    max_failed_attempts: u32,
    lock_duration_seconds: i64,
    pending_session_ttl_seconds: u64,
    attempt_retention_seconds: i64,
    email_verification_enabled: bool,
    verification_token_ttl_seconds: i64,
    reset_token_ttl_seconds: i64,
    signing_key_pem: Option<SecretString>,
}

impl AuthConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            issuer: DEFAULT_ISSUER.to_string(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            rate_limit_window_seconds: DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            rate_limit_max_attempts: DEFAULT_RATE_LIMIT_MAX_ATTEMPTS,
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lock_duration_seconds: DEFAULT_LOCK_DURATION_SECONDS,
            pending_session_ttl_seconds: DEFAULT_PENDING_SESSION_TTL_SECONDS,
            attempt_retention_seconds: DEFAULT_ATTEMPT_RETENTION_SECONDS,
            email_verification_enabled: true,
            verification_token_ttl_seconds: DEFAULT_VERIFICATION_TOKEN_TTL_SECONDS,
            reset_token_ttl_seconds: DEFAULT_RESET_TOKEN_TTL_SECONDS,
            signing_key_pem: None,
        }
    }

    #[must_use]
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit_window_seconds(mut self, seconds: i64) -> Self {
        self.rate_limit_window_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_rate_limit_max_attempts(mut self, attempts: u64) -> Self {
        self.rate_limit_max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_max_failed_attempts(mut self, attempts: u32) -> Self {
        self.max_failed_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_lock_duration_seconds(mut self, seconds: i64) -> Self {
        self.lock_duration_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_pending_session_ttl_seconds(mut self, seconds: u64) -> Self {
        self.pending_session_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_attempt_retention_seconds(mut self, seconds: i64) -> Self {
        self.attempt_retention_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_email_verification_enabled(mut self, enabled: bool) -> Self {
        self.email_verification_enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_verification_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.verification_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.reset_token_ttl_seconds = seconds;
        self
    }

    /// RS256 private key for access-token signing, PEM-encoded.
    #[must_use]
    pub fn with_signing_key_pem(mut self, pem: SecretString) -> Self {
        self.signing_key_pem = Some(pem);
        self
    }

    #[must_use]
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[must_use]
    pub fn access_token_ttl_seconds(&self) -> i64 {
        self.access_token_ttl_seconds
    }

    #[must_use]
    pub fn refresh_token_ttl_seconds(&self) -> i64 {
        self.refresh_token_ttl_seconds
    }

    #[must_use]
    pub fn rate_limit_window_seconds(&self) -> i64 {
        self.rate_limit_window_seconds
    }

    #[must_use]
    pub fn rate_limit_max_attempts(&self) -> u64 {
        self.rate_limit_max_attempts
    }

    #[must_use]
    pub fn max_failed_attempts(&self) -> u32 {
        self.max_failed_attempts
    }

    #[must_use]
    pub fn lock_duration_seconds(&self) -> i64 {
        self.lock_duration_seconds
    }

    #[must_use]
    pub fn pending_session_ttl_seconds(&self) -> u64 {
        self.pending_session_ttl_seconds
    }

    #[must_use]
    pub fn attempt_retention_seconds(&self) -> i64 {
        self.attempt_retention_seconds
    }

    #[must_use]
    pub fn email_verification_enabled(&self) -> bool {
        self.email_verification_enabled
    }

    #[must_use]
    pub fn verification_token_ttl_seconds(&self) -> i64 {
        self.verification_token_ttl_seconds
    }

    #[must_use]
    pub fn reset_token_ttl_seconds(&self) -> i64 {
        self.reset_token_ttl_seconds
    }

    #[must_use]
    pub fn signing_key_pem(&self) -> Option<&SecretString> {
        self.signing_key_pem.as_ref()
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}
