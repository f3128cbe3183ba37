//! TOTP second factor with single-use backup codes.
//!
//! Setup is two-phase: a provisioning step that creates (or re-serves) a
//! disabled secret plus a backup-code set, then a confirmation step that
//! proves the authenticator works before the factor is enforced. Backup
//! codes are 8-digit, single use, and only ever replaced as a whole set.

use std::sync::Arc;
use rand::{rngs::OsRng, Rng};
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{Error, Result};
use crate::models::{Account, MfaSettings};
use crate::store::AuthStore;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP: u64 = 30;
const BACKUP_CODE_COUNT: usize = 10;

/// Material handed to the client during setup.
#[derive(Clone, Debug)]
pub struct MfaProvisioning {
    /// Base32 secret for manual entry.
    pub secret: String,
    /// otpauth:// URL for QR-code rendering.
    pub otpauth_url: String,
    /// Single-use recovery codes. Shown during setup; consumed codes are
    /// never re-issued individually.
    pub backup_codes: Vec<String>,
}

pub struct MfaEngine {
    store: Arc<dyn AuthStore>,
    config: Arc<AuthConfig>,
}

impl MfaEngine {
    #[must_use]
    pub fn new(store: Arc<dyn AuthStore>, config: Arc<AuthConfig>) -> Self {
        Self { store, config }
    }

    pub async fn is_enabled(&self, account_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .find_mfa_settings(account_id)
            .await?
            .is_some_and(|settings| settings.enabled))
    }

    /// Create a disabled secret and backup-code set for the account, or
    /// re-serve the existing ones if setup was started but never confirmed.
    pub async fn begin_setup(&self, account: &Account) -> Result<MfaProvisioning> {
        let settings = match self.store.find_mfa_settings(account.id).await? {
            Some(settings) if settings.enabled => {
                return Err(Error::Internal(anyhow::anyhow!(
                    "mfa already enabled for account {}",
                    account.id
                )));
            }
            Some(settings) => settings,
            None => {
                let settings = MfaSettings {
                    account_id: account.id,
                    secret: Secret::generate_secret().to_encoded().to_string(),
                    enabled: false,
                    backup_codes: generate_backup_codes(),
                };
                self.store.upsert_mfa_settings(&settings).await?;
                settings
            }
        };
        let otpauth_url = self.totp(&settings.secret, &account.email)?.get_url();
        Ok(MfaProvisioning {
            secret: settings.secret,
            otpauth_url,
            backup_codes: settings.backup_codes,
        })
    }

    /// Verify the first code from the authenticator and enable the factor.
    /// The only transition from disabled to enabled.
    pub async fn confirm_setup(&self, account: &Account, code: &str) -> Result<()> {
        let mut settings = self
            .store
            .find_mfa_settings(account.id)
            .await?
            .ok_or(Error::NotFound("mfa setup"))?;
        if settings.enabled {
            return Ok(());
        }
        if !self.check_totp(&settings.secret, &account.email, code)? {
            warn!(account_id = %account.id, "mfa confirmation code rejected");
            return Err(Error::InvalidMfaCode);
        }
        settings.enabled = true;
        self.store.upsert_mfa_settings(&settings).await?;
        info!(account_id = %account.id, "mfa enabled");
        Ok(())
    }

    /// Check a challenge code against the current TOTP window, falling back
    /// to the backup-code set. A matching backup code is consumed.
    pub async fn validate(&self, account: &Account, code: &str) -> Result<bool> {
        let Some(mut settings) = self.store.find_mfa_settings(account.id).await? else {
            return Ok(false);
        };
        if !settings.enabled {
            return Ok(false);
        }
        if self.check_totp(&settings.secret, &account.email, code)? {
            return Ok(true);
        }
        if let Some(index) = settings.backup_codes.iter().position(|c| c == code) {
            settings.backup_codes.remove(index);
            self.store.upsert_mfa_settings(&settings).await?;
            info!(
                account_id = %account.id,
                remaining = settings.backup_codes.len(),
                "backup code consumed"
            );
            return Ok(true);
        }
        Ok(false)
    }

    /// Turn the factor off. Secret and backup codes stay stored, so a
    /// later re-enable walks the same provisioning and confirmation steps
    /// without regenerating.
    pub async fn disable(&self, account_id: Uuid) -> Result<()> {
        let Some(mut settings) = self.store.find_mfa_settings(account_id).await? else {
            return Ok(());
        };
        settings.enabled = false;
        self.store.upsert_mfa_settings(&settings).await?;
        info!(account_id = %account_id, "mfa disabled");
        Ok(())
    }

    /// Replace the whole backup-code set. Requires an enabled factor.
    pub async fn regenerate_backup_codes(&self, account_id: Uuid) -> Result<Vec<String>> {
        let mut settings = self
            .store
            .find_mfa_settings(account_id)
            .await?
            .filter(|settings| settings.enabled)
            .ok_or(Error::NotFound("mfa settings"))?;
        let backup_codes = generate_backup_codes();
        settings.backup_codes = backup_codes.clone();
        self.store.upsert_mfa_settings(&settings).await?;
        Ok(backup_codes)
    }

    fn totp(&self, secret: &str, email: &str) -> Result<TOTP> {
        let bytes = Secret::Encoded(secret.to_string())
            .to_bytes()
            .map_err(|err| anyhow::anyhow!("invalid totp secret: {err:?}"))?;
        TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP,
            bytes,
            Some(self.config.issuer().to_string()),
            email.to_string(),
        )
        .map_err(|err| Error::Internal(anyhow::anyhow!("totp construction: {err}")))
    }

    fn check_totp(&self, secret: &str, email: &str, code: &str) -> Result<bool> {
        let totp = self.totp(secret, email)?;
        totp.check_current(code)
            .map_err(|err| Error::Internal(anyhow::anyhow!("system clock: {err}")))
    }
}

fn generate_backup_codes() -> Vec<String> {
    let mut rng = OsRng;
    (0..BACKUP_CODE_COUNT)
        .map(|_| format!("{:08}", rng.gen_range(0..100_000_000u32)))
        .collect()
}
