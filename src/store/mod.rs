//! Abstract persistence seam for the auth core.
//!
//! Persistence technology is deliberately out of scope; everything the core
//! needs is expressed on [`AuthStore`]. Two implementations ship with the
//! crate: [`MemoryStore`] for tests and embedding, and [`PgStore`] backed by
//! Postgres.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Account, AuthDevice, CredentialToken, CredentialTokenKind, LoginAttempt, MfaSettings,
    RefreshTokenRecord,
};

#[async_trait]
pub trait AuthStore: Send + Sync {
    // -- accounts -------------------------------------------------------

    /// Insert a new account. Fails with `DuplicateEmail` / `DuplicateUsername`
    /// when the identity is already taken.
    async fn insert_account(&self, account: &Account) -> Result<()>;

    async fn find_account_by_id(&self, id: Uuid) -> Result<Option<Account>>;

    /// Look up by normalized email.
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    async fn username_taken(&self, username: &str) -> Result<bool>;

    /// Persist mutated account state (counters, lock, password, flags).
    async fn update_account(&self, account: &Account) -> Result<()>;

    // -- refresh tokens -------------------------------------------------

    /// Insert a refresh-token record. Returns `false` on a token-hash
    /// collision so the caller can regenerate, `Ok(true)` otherwise.
    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<bool>;

    async fn find_refresh_token(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>>;

    /// Atomically revoke the token iff it is currently live, returning the
    /// claimed record. This is the rotation linchpin: of two concurrent
    /// claims on the same hash, exactly one receives the record.
    async fn claim_refresh_token(
        &self,
        token_hash: &[u8],
        now: i64,
    ) -> Result<Option<RefreshTokenRecord>>;

    /// Idempotent revoke; unknown or already-revoked hashes are a no-op.
    async fn revoke_refresh_token(&self, token_hash: &[u8], now: i64) -> Result<()>;

    async fn revoke_all_refresh_tokens(&self, account_id: Uuid, now: i64) -> Result<()>;

    /// Delete expired or revoked records; returns how many were removed.
    async fn delete_stale_refresh_tokens(&self, now: i64) -> Result<u64>;

    // -- login attempts -------------------------------------------------

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<()>;

    async fn count_failed_attempts_by_email(&self, email: &str, since: i64) -> Result<u64>;

    async fn count_failed_attempts_by_ip(&self, ip_address: &str, since: i64) -> Result<u64>;

    async fn delete_attempts_before(&self, cutoff: i64) -> Result<u64>;

    // -- MFA settings ---------------------------------------------------

    async fn find_mfa_settings(&self, account_id: Uuid) -> Result<Option<MfaSettings>>;

    async fn upsert_mfa_settings(&self, settings: &MfaSettings) -> Result<()>;

    // -- devices --------------------------------------------------------

    async fn find_device(&self, account_id: Uuid, fingerprint: &str)
        -> Result<Option<AuthDevice>>;

    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<AuthDevice>>;

    async fn upsert_device(&self, device: &AuthDevice) -> Result<()>;

    async fn delete_device(&self, device_id: Uuid) -> Result<()>;

    async fn list_devices(&self, account_id: Uuid) -> Result<Vec<AuthDevice>>;

    // -- credential tokens (email verification / password reset) --------

    /// Insert a credential token, replacing any outstanding tokens of the
    /// same kind for the account.
    async fn insert_credential_token(&self, token: &CredentialToken) -> Result<()>;

    /// Atomically mark the token consumed iff still valid, returning it.
    async fn consume_credential_token(
        &self,
        token_hash: &[u8],
        kind: CredentialTokenKind,
        now: i64,
    ) -> Result<Option<CredentialToken>>;

    async fn delete_stale_credential_tokens(&self, now: i64) -> Result<u64>;
}
