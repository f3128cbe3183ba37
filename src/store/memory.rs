//! In-memory store used by the test suite and lightweight embeddings.
//!
//! Every map sits behind its own lock; the claim operations do their
//! check-and-set while holding the lock, which gives the same atomicity the
//! Postgres store gets from conditional updates.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::AuthStore;
use crate::error::{Error, Result};
use crate::models::{
    Account, AuthDevice, CredentialToken, CredentialTokenKind, LoginAttempt, MfaSettings,
    RefreshTokenRecord,
};

#[derive(Clone, Default)]
pub struct MemoryStore {
    accounts: Arc<Mutex<HashMap<Uuid, Account>>>,
    refresh_tokens: Arc<Mutex<HashMap<Vec<u8>, RefreshTokenRecord>>>,
    attempts: Arc<Mutex<Vec<LoginAttempt>>>,
    mfa: Arc<Mutex<HashMap<Uuid, MfaSettings>>>,
    devices: Arc<Mutex<HashMap<Uuid, AuthDevice>>>,
    credential_tokens: Arc<Mutex<Vec<CredentialToken>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let mut accounts = self.accounts.lock().await;
        if accounts.values().any(|a| a.email == account.email) {
            return Err(Error::DuplicateEmail);
        }
        if let Some(username) = &account.username {
            if accounts
                .values()
                .any(|a| a.username.as_deref() == Some(username.as_str()))
            {
                return Err(Error::DuplicateUsername);
            }
        }
        accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn find_account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.lock().await.get(&id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .find(|account| account.email == email)
            .cloned())
    }

    async fn username_taken(&self, username: &str) -> Result<bool> {
        Ok(self
            .accounts
            .lock()
            .await
            .values()
            .any(|account| account.username.as_deref() == Some(username)))
    }

    async fn update_account(&self, account: &Account) -> Result<()> {
        self.accounts
            .lock()
            .await
            .insert(account.id, account.clone());
        Ok(())
    }

    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<bool> {
        let mut tokens = self.refresh_tokens.lock().await;
        if tokens.contains_key(&record.token_hash) {
            return Ok(false);
        }
        tokens.insert(record.token_hash.clone(), record.clone());
        Ok(true)
    }

    async fn find_refresh_token(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>> {
        Ok(self.refresh_tokens.lock().await.get(token_hash).cloned())
    }

    async fn claim_refresh_token(
        &self,
        token_hash: &[u8],
        now: i64,
    ) -> Result<Option<RefreshTokenRecord>> {
        let mut tokens = self.refresh_tokens.lock().await;
        match tokens.get_mut(token_hash) {
            Some(record) if record.is_live(now) => {
                record.revoked = true;
                record.revoked_at = Some(now);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_refresh_token(&self, token_hash: &[u8], now: i64) -> Result<()> {
        let mut tokens = self.refresh_tokens.lock().await;
        if let Some(record) = tokens.get_mut(token_hash) {
            if !record.revoked {
                record.revoked = true;
                record.revoked_at = Some(now);
            }
        }
        Ok(())
    }

    async fn revoke_all_refresh_tokens(&self, account_id: Uuid, now: i64) -> Result<()> {
        let mut tokens = self.refresh_tokens.lock().await;
        for record in tokens.values_mut() {
            if record.account_id == account_id && !record.revoked {
                record.revoked = true;
                record.revoked_at = Some(now);
            }
        }
        Ok(())
    }

    async fn delete_stale_refresh_tokens(&self, now: i64) -> Result<u64> {
        let mut tokens = self.refresh_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, record| record.is_live(now));
        Ok((before - tokens.len()) as u64)
    }

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<()> {
        self.attempts.lock().await.push(attempt.clone());
        Ok(())
    }

    async fn count_failed_attempts_by_email(&self, email: &str, since: i64) -> Result<u64> {
        Ok(self
            .attempts
            .lock()
            .await
            .iter()
            .filter(|a| !a.success && a.email == email && a.attempted_at >= since)
            .count() as u64)
    }

    async fn count_failed_attempts_by_ip(&self, ip_address: &str, since: i64) -> Result<u64> {
        Ok(self
            .attempts
            .lock()
            .await
            .iter()
            .filter(|a| !a.success && a.ip_address == ip_address && a.attempted_at >= since)
            .count() as u64)
    }

    async fn delete_attempts_before(&self, cutoff: i64) -> Result<u64> {
        let mut attempts = self.attempts.lock().await;
        let before = attempts.len();
        attempts.retain(|a| a.attempted_at >= cutoff);
        Ok((before - attempts.len()) as u64)
    }

    async fn find_mfa_settings(&self, account_id: Uuid) -> Result<Option<MfaSettings>> {
        Ok(self.mfa.lock().await.get(&account_id).cloned())
    }

    async fn upsert_mfa_settings(&self, settings: &MfaSettings) -> Result<()> {
        self.mfa
            .lock()
            .await
            .insert(settings.account_id, settings.clone());
        Ok(())
    }

    async fn find_device(
        &self,
        account_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<AuthDevice>> {
        Ok(self
            .devices
            .lock()
            .await
            .values()
            .find(|d| d.account_id == account_id && d.fingerprint == fingerprint)
            .cloned())
    }

    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<AuthDevice>> {
        Ok(self.devices.lock().await.get(&device_id).cloned())
    }

    async fn upsert_device(&self, device: &AuthDevice) -> Result<()> {
        self.devices.lock().await.insert(device.id, device.clone());
        Ok(())
    }

    async fn delete_device(&self, device_id: Uuid) -> Result<()> {
        self.devices.lock().await.remove(&device_id);
        Ok(())
    }

    async fn list_devices(&self, account_id: Uuid) -> Result<Vec<AuthDevice>> {
        let mut devices: Vec<AuthDevice> = self
            .devices
            .lock()
            .await
            .values()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect();
        devices.sort_by_key(|d| std::cmp::Reverse(d.last_seen));
        Ok(devices)
    }

    async fn insert_credential_token(&self, token: &CredentialToken) -> Result<()> {
        let mut tokens = self.credential_tokens.lock().await;
        tokens.retain(|t| !(t.account_id == token.account_id && t.kind == token.kind));
        tokens.push(token.clone());
        Ok(())
    }

    async fn consume_credential_token(
        &self,
        token_hash: &[u8],
        kind: CredentialTokenKind,
        now: i64,
    ) -> Result<Option<CredentialToken>> {
        let mut tokens = self.credential_tokens.lock().await;
        for token in tokens.iter_mut() {
            if token.token_hash == token_hash && token.kind == kind {
                if !token.is_valid(now) {
                    return Ok(None);
                }
                token.consumed_at = Some(now);
                return Ok(Some(token.clone()));
            }
        }
        Ok(None)
    }

    async fn delete_stale_credential_tokens(&self, now: i64) -> Result<u64> {
        let mut tokens = self.credential_tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|t| t.is_valid(now));
        Ok((before - tokens.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::util::hash_token;

    fn account(email: &str, username: Option<&str>) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: email.into(),
            username: username.map(Into::into),
            display_name: None,
            role: Role::Member,
            password_hash: "hash".into(),
            enabled: true,
            email_verified: true,
            failed_attempts: 0,
            locked_until: None,
            created_at: 0,
        }
    }

    fn token_record(hash: Vec<u8>, account_id: Uuid, expires_at: i64) -> RefreshTokenRecord {
        RefreshTokenRecord {
            id: Uuid::new_v4(),
            token_hash: hash,
            account_id,
            device_fingerprint: "fp".into(),
            ip_address: "127.0.0.1".into(),
            user_agent: "ua".into(),
            issued_at: 0,
            expires_at,
            revoked: false,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn duplicate_email_rejected() {
        let store = MemoryStore::new();
        store.insert_account(&account("a@x.com", None)).await.unwrap();
        let err = store.insert_account(&account("a@x.com", None)).await;
        assert!(matches!(err, Err(Error::DuplicateEmail)));
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let store = MemoryStore::new();
        store
            .insert_account(&account("a@x.com", Some("alice")))
            .await
            .unwrap();
        let err = store
            .insert_account(&account("b@x.com", Some("alice")))
            .await;
        assert!(matches!(err, Err(Error::DuplicateUsername)));
        assert!(store.username_taken("alice").await.unwrap());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = MemoryStore::new();
        let hash = hash_token("raw");
        store
            .insert_refresh_token(&token_record(hash.clone(), Uuid::new_v4(), 1_000))
            .await
            .unwrap();

        assert!(store
            .claim_refresh_token(&hash, 10)
            .await
            .unwrap()
            .is_some());
        // A second claim observes the token as already revoked.
        assert!(store
            .claim_refresh_token(&hash, 10)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = Arc::new(MemoryStore::new());
        let hash = hash_token("raw");
        store
            .insert_refresh_token(&token_record(hash.clone(), Uuid::new_v4(), 1_000))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let hash = hash.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_refresh_token(&hash, 10)
                    .await
                    .unwrap()
                    .is_some()
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
    async fn claim_rejects_expired_tokens() {
        let store = MemoryStore::new();
        let hash = hash_token("raw");
        store
            .insert_refresh_token(&token_record(hash.clone(), Uuid::new_v4(), 5))
            .await
            .unwrap();
        assert!(store
            .claim_refresh_token(&hash, 10)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let store = MemoryStore::new();
        let hash = hash_token("raw");
        store
            .insert_refresh_token(&token_record(hash.clone(), Uuid::new_v4(), 1_000))
            .await
            .unwrap();

        store.revoke_refresh_token(&hash, 10).await.unwrap();
        let first_revoked_at = store
            .find_refresh_token(&hash)
            .await
            .unwrap()
            .unwrap()
            .revoked_at;

        // Second revoke keeps the original timestamp; unknown hashes are fine.
        store.revoke_refresh_token(&hash, 99).await.unwrap();
        store.revoke_refresh_token(b"missing", 99).await.unwrap();
        let record = store.find_refresh_token(&hash).await.unwrap().unwrap();
        assert_eq!(record.revoked_at, first_revoked_at);
    }

    #[tokio::test]
    async fn stale_refresh_tokens_are_deleted() {
        let store = MemoryStore::new();
        let live = hash_token("live");
        let expired = hash_token("expired");
        store
            .insert_refresh_token(&token_record(live.clone(), Uuid::new_v4(), 1_000))
            .await
            .unwrap();
        store
            .insert_refresh_token(&token_record(expired.clone(), Uuid::new_v4(), 5))
            .await
            .unwrap();

        let removed = store.delete_stale_refresh_tokens(10).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_refresh_token(&live).await.unwrap().is_some());
        assert!(store.find_refresh_token(&expired).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attempt_counters_respect_window_and_key() {
        let store = MemoryStore::new();
        for (email, ip, at, success) in [
            ("a@x.com", "1.1.1.1", 100, false),
            ("a@x.com", "1.1.1.1", 150, false),
            ("a@x.com", "2.2.2.2", 10, false), // outside window
            ("a@x.com", "1.1.1.1", 160, true), // success does not count
            ("b@x.com", "1.1.1.1", 170, false),
        ] {
            store
                .insert_login_attempt(&LoginAttempt {
                    email: email.into(),
                    ip_address: ip.into(),
                    user_agent: "ua".into(),
                    success,
                    failure_reason: None,
                    attempted_at: at,
                })
                .await
                .unwrap();
        }

        assert_eq!(
            store
                .count_failed_attempts_by_email("a@x.com", 50)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            store
                .count_failed_attempts_by_ip("1.1.1.1", 50)
                .await
                .unwrap(),
            3
        );
        assert_eq!(store.delete_attempts_before(50).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn credential_token_consume_once() {
        let store = MemoryStore::new();
        let hash = hash_token("verify");
        store
            .insert_credential_token(&CredentialToken {
                token_hash: hash.clone(),
                account_id: Uuid::new_v4(),
                kind: CredentialTokenKind::EmailVerification,
                expires_at: 1_000,
                consumed_at: None,
            })
            .await
            .unwrap();

        assert!(store
            .consume_credential_token(&hash, CredentialTokenKind::EmailVerification, 10)
            .await
            .unwrap()
            .is_some());
        assert!(store
            .consume_credential_token(&hash, CredentialTokenKind::EmailVerification, 11)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn credential_token_kind_must_match() {
        let store = MemoryStore::new();
        let hash = hash_token("reset");
        store
            .insert_credential_token(&CredentialToken {
                token_hash: hash.clone(),
                account_id: Uuid::new_v4(),
                kind: CredentialTokenKind::PasswordReset,
                expires_at: 1_000,
                consumed_at: None,
            })
            .await
            .unwrap();

        assert!(store
            .consume_credential_token(&hash, CredentialTokenKind::EmailVerification, 10)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn new_credential_token_replaces_outstanding_one() {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        let old = hash_token("old");
        let new = hash_token("new");
        for hash in [&old, &new] {
            store
                .insert_credential_token(&CredentialToken {
                    token_hash: hash.clone(),
                    account_id,
                    kind: CredentialTokenKind::PasswordReset,
                    expires_at: 1_000,
                    consumed_at: None,
                })
                .await
                .unwrap();
        }

        assert!(store
            .consume_credential_token(&old, CredentialTokenKind::PasswordReset, 10)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .consume_credential_token(&new, CredentialTokenKind::PasswordReset, 10)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn devices_sorted_by_last_seen() {
        let store = MemoryStore::new();
        let account_id = Uuid::new_v4();
        for (fp, last_seen) in [("fp1", 10), ("fp2", 30), ("fp3", 20)] {
            store
                .upsert_device(&AuthDevice {
                    id: Uuid::new_v4(),
                    account_id,
                    fingerprint: fp.into(),
                    device_name: "Web Browser".into(),
                    last_ip: "127.0.0.1".into(),
                    last_user_agent: "ua".into(),
                    first_seen: last_seen,
                    last_seen,
                    trusted: false,
                })
                .await
                .unwrap();
        }
        let devices = store.list_devices(account_id).await.unwrap();
        let fingerprints: Vec<&str> = devices.iter().map(|d| d.fingerprint.as_str()).collect();
        assert_eq!(fingerprints, vec!["fp2", "fp3", "fp1"]);
    }
}
