//! Rotating opaque refresh tokens.
//!
//! Tokens are 64 random bytes, base64url-encoded; only the SHA-256 hash is
//! persisted. Rotation revokes the presented token and issues a replacement
//! carrying the same account/device metadata. The revoke step is an atomic
//! claim in the store, so two concurrent rotations of one raw token produce
//! exactly one new token.

use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::RefreshTokenRecord;
use crate::store::AuthStore;
use crate::util::{generate_opaque_token, hash_token, now_unix};

const TOKEN_BYTES: usize = 64;
const INSERT_RETRIES: usize = 3;

pub struct RefreshTokens {
    store: Arc<dyn AuthStore>,
    ttl_seconds: i64,
}

impl RefreshTokens {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    /// Issue a fresh refresh token and return the raw value. The raw value
    /// is never retrievable again.
    pub async fn issue(
        &self,
        account_id: Uuid,
        device_fingerprint: &str,
        ip_address: &str,
        user_agent: &str,
    ) -> Result<String> {
        let now = now_unix();
        for _ in 0..INSERT_RETRIES {
            let raw = generate_opaque_token(TOKEN_BYTES)?;
            let record = RefreshTokenRecord {
                id: Uuid::new_v4(),
                token_hash: hash_token(&raw),
                account_id,
                device_fingerprint: device_fingerprint.to_string(),
                ip_address: ip_address.to_string(),
                user_agent: user_agent.to_string(),
                issued_at: now,
                expires_at: now + self.ttl_seconds,
                revoked: false,
                revoked_at: None,
            };
            if self.store.insert_refresh_token(&record).await? {
                debug!(account_id = %account_id, "issued refresh token");
                return Ok(raw);
            }
            // Hash collision; regenerate.
        }
        Err(Error::Internal(anyhow::anyhow!(
            "failed to generate unique refresh token"
        )))
    }

    /// Validate the presented raw token and rotate it.
    ///
    /// Returns the new raw token plus the claimed (now revoked) record so
    /// the caller can resolve the owning account.
    pub async fn validate_and_rotate(&self, raw: &str) -> Result<(String, RefreshTokenRecord)> {
        let now = now_unix();
        let token_hash = hash_token(raw);

        let Some(claimed) = self.store.claim_refresh_token(&token_hash, now).await? else {
            match self.store.find_refresh_token(&token_hash).await? {
                Some(record) => warn!(
                    account_id = %record.account_id,
                    revoked = record.revoked,
                    "refresh token presented but not live"
                ),
                None => warn!("unknown refresh token presented"),
            }
            return Err(Error::InvalidRefreshToken);
        };

        let new_raw = self
            .issue(
                claimed.account_id,
                &claimed.device_fingerprint,
                &claimed.ip_address,
                &claimed.user_agent,
            )
            .await?;
        debug!(account_id = %claimed.account_id, "rotated refresh token");
        Ok((new_raw, claimed))
    }

    /// Best-effort revoke; already-revoked or unknown tokens are a no-op.
    pub async fn revoke(&self, raw: &str) -> Result<()> {
        self.store
            .revoke_refresh_token(&hash_token(raw), now_unix())
            .await
    }

    /// Revoke every live token for the account (all devices).
    pub async fn revoke_all(&self, account_id: Uuid) -> Result<()> {
        self.store
            .revoke_all_refresh_tokens(account_id, now_unix())
            .await
    }

    /// Storage reclamation for expired/revoked records; invoked by an
    /// external scheduler.
    pub async fn cleanup(&self, now: i64) -> Result<u64> {
        self.store.delete_stale_refresh_tokens(now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn service() -> (RefreshTokens, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (RefreshTokens::new(store.clone(), 3600), store)
    }

    #[tokio::test]
    async fn issued_token_is_stored_hashed() {
        let (tokens, store) = service();
        let account_id = Uuid::new_v4();
        let raw = tokens.issue(account_id, "fp", "127.0.0.1", "ua").await.unwrap();

        // The raw value itself must not be usable as a lookup key.
        assert!(store
            .find_refresh_token(raw.as_bytes())
            .await
            .unwrap()
            .is_none());
        let record = store
            .find_refresh_token(&hash_token(&raw))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.account_id, account_id);
        assert!(!record.revoked);
    }

    #[tokio::test]
    async fn rotation_invalidates_the_old_token() {
        let (tokens, _) = service();
        let raw = tokens
            .issue(Uuid::new_v4(), "fp", "127.0.0.1", "ua")
            .await
            .unwrap();

        let (new_raw, claimed) = tokens.validate_and_rotate(&raw).await.unwrap();
        assert_ne!(new_raw, raw);
        assert!(claimed.revoked);

        // Presenting the old token again always fails.
        assert!(matches!(
            tokens.validate_and_rotate(&raw).await,
            Err(Error::InvalidRefreshToken)
        ));
        // The new token rotates fine.
        assert!(tokens.validate_and_rotate(&new_raw).await.is_ok());
    }

    #[tokio::test]
    async fn rotation_carries_metadata_forward() {
        let (tokens, store) = service();
        let account_id = Uuid::new_v4();
        let raw = tokens
            .issue(account_id, "laptop", "10.0.0.1", "Firefox")
            .await
            .unwrap();

        let (new_raw, _) = tokens.validate_and_rotate(&raw).await.unwrap();
        let record = store
            .find_refresh_token(&hash_token(&new_raw))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.account_id, account_id);
        assert_eq!(record.device_fingerprint, "laptop");
        assert_eq!(record.ip_address, "10.0.0.1");
        assert_eq!(record.user_agent, "Firefox");
    }

    #[tokio::test]
    async fn concurrent_rotations_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let tokens = Arc::new(RefreshTokens::new(store, 3600));
        let raw = tokens
            .issue(Uuid::new_v4(), "fp", "127.0.0.1", "ua")
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tokens = tokens.clone();
            let raw = raw.clone();
            handles.push(tokio::spawn(async move {
                tokens.validate_and_rotate(&raw).await.is_ok()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn unknown_token_fails_with_invalid_refresh_token() {
        let (tokens, _) = service();
        assert!(matches!(
            tokens.validate_and_rotate("no-such-token").await,
            Err(Error::InvalidRefreshToken)
        ));
    }

    #[tokio::test]
    async fn revoke_all_covers_every_device() {
        let (tokens, _) = service();
        let account_id = Uuid::new_v4();
        let raw_a = tokens.issue(account_id, "a", "ip", "ua").await.unwrap();
        let raw_b = tokens.issue(account_id, "b", "ip", "ua").await.unwrap();

        tokens.revoke_all(account_id).await.unwrap();
        assert!(tokens.validate_and_rotate(&raw_a).await.is_err());
        assert!(tokens.validate_and_rotate(&raw_b).await.is_err());
    }

    #[tokio::test]
    async fn revoke_is_idempotent_for_missing_tokens() {
        let (tokens, _) = service();
        assert!(tokens.revoke("never-issued").await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_removes_rotated_leftovers() {
        let (tokens, _) = service();
        let raw = tokens
            .issue(Uuid::new_v4(), "fp", "127.0.0.1", "ua")
            .await
            .unwrap();
        tokens.validate_and_rotate(&raw).await.unwrap();

        // One revoked record (the rotated-out one) is reclaimable.
        assert_eq!(tokens.cleanup(now_unix()).await.unwrap(), 1);
    }
}
