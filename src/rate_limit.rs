//! Sliding-window rate limiting and account lockout.
//!
//! Both checks read the persisted login-attempt log, so every instance of
//! the service sees the same counters. The window counts failed attempts
//! only; the per-account lockout escalates independently by incrementing a
//! counter on the account row.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::error::Result;
use crate::models::{Account, LoginAttempt};
use crate::store::AuthStore;
use crate::util::now_unix;

pub struct RateLimiter {
    store: Arc<dyn AuthStore>,
    config: Arc<AuthConfig>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, config: Arc<AuthConfig>) -> Self {
        Self { store, config }
    }

    /// Append one attempt to the audit log.
    pub async fn record_attempt(
        &self,
        email: &str,
        ip_address: &str,
        user_agent: &str,
        success: bool,
        failure_reason: Option<&str>,
    ) -> Result<()> {
        self.store
            .insert_login_attempt(&LoginAttempt {
                email: email.to_string(),
                ip_address: ip_address.to_string(),
                user_agent: user_agent.to_string(),
                success,
                failure_reason: failure_reason.map(ToString::to_string),
                attempted_at: now_unix(),
            })
            .await
    }

    /// True when the email has reached the failed-attempt threshold within
    /// the sliding window.
    pub async fn is_email_rate_limited(&self, email: &str) -> Result<bool> {
        let since = now_unix() - self.config.rate_limit_window_seconds();
        let failed = self.store.count_failed_attempts_by_email(email, since).await?;
        if failed >= self.config.rate_limit_max_attempts() {
            warn!(email, failed, "email rate limited");
            return Ok(true);
        }
        Ok(false)
    }

    /// True when the source IP has reached the failed-attempt threshold
    /// within the sliding window.
    pub async fn is_ip_rate_limited(&self, ip_address: &str) -> Result<bool> {
        let since = now_unix() - self.config.rate_limit_window_seconds();
        let failed = self.store.count_failed_attempts_by_ip(ip_address, since).await?;
        if failed >= self.config.rate_limit_max_attempts() {
            warn!(ip_address, failed, "ip rate limited");
            return Ok(true);
        }
        Ok(false)
    }

    /// Increment the account's failure counter and apply a lock at the
    /// threshold. Returns true when this call locked the account.
    pub async fn handle_failed_login(&self, account: &mut Account) -> Result<bool> {
        account.failed_attempts = account.failed_attempts.saturating_add(1);
        let locked = account.failed_attempts >= self.config.max_failed_attempts();
        if locked {
            let until = now_unix() + self.config.lock_duration_seconds();
            account.locked_until = Some(until);
            info!(
                account_id = %account.id,
                failed_attempts = account.failed_attempts,
                locked_until = until,
                "account locked after repeated failures"
            );
        }
        self.store.update_account(account).await?;
        Ok(locked)
    }

    /// Reset the failure counter after a fully successful authentication.
    /// An active time lock is left in place; it expires on its own.
    pub async fn handle_successful_login(&self, account: &mut Account) -> Result<()> {
        if account.failed_attempts == 0 {
            return Ok(());
        }
        account.failed_attempts = 0;
        self.store.update_account(account).await
    }

    /// Drop attempt rows older than the retention period.
    pub async fn cleanup(&self, now: i64) -> Result<u64> {
        let cutoff = now - self.config.attempt_retention_seconds();
        let removed = self.store.delete_attempts_before(cutoff).await?;
        if removed > 0 {
            debug!(removed, "pruned login attempts");
        }
        Ok(removed)
    }
}
