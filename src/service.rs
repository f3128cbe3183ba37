//! Authentication orchestrator.
//!
//! [`AuthService`] wires the sub-services together and owns the login,
//! refresh, and credential-recovery flows end to end. Handlers call it;
//! it never touches a socket or renders a response.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::device::DeviceTracker;
use crate::error::{Error, Result};
use crate::mfa::MfaEngine;
use crate::models::{Account, CredentialToken, CredentialTokenKind, Role};
use crate::notify::{self, Event, Notification, Notifier};
use crate::password::PasswordHasher;
use crate::pending::PendingSessions;
use crate::rate_limit::RateLimiter;
use crate::store::AuthStore;
use crate::token::access::TokenError;
use crate::token::{AccessTokenClaims, AccessTokens, RefreshTokens};
use crate::util::{generate_opaque_token, hash_token, normalize_email, now_unix, valid_email};

const CREDENTIAL_TOKEN_BYTES: usize = 32;

/// New-account request. Accounts without an explicit role become members.
#[derive(Clone, Debug)]
pub struct Registration {
    pub email: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub password: String,
    pub role: Option<Role>,
}

/// Client-supplied request context carried through a login.
#[derive(Clone, Debug)]
pub struct ClientContext {
    pub device_fingerprint: String,
    pub ip_address: String,
    pub user_agent: String,
}

/// Issued token pair plus the authenticated account.
#[derive(Debug)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub account: Account,
}

/// Result of a password login: either a finished session or an MFA
/// challenge that must be answered within the pending-session TTL.
#[derive(Debug)]
pub enum LoginOutcome {
    Success(AuthTokens),
    MfaRequired { session_id: Uuid },
}

/// Counts from one storage-reclamation sweep.
#[derive(Clone, Copy, Debug, Default)]
pub struct CleanupReport {
    pub refresh_tokens: u64,
    pub login_attempts: u64,
    pub credential_tokens: u64,
}

pub struct AuthService {
    store: Arc<dyn AuthStore>,
    config: Arc<AuthConfig>,
    hasher: Arc<dyn PasswordHasher>,
    notifier: Arc<dyn Notifier>,
    access_tokens: AccessTokens,
    refresh_tokens: RefreshTokens,
    rate_limiter: RateLimiter,
    mfa: MfaEngine,
    devices: DeviceTracker,
    pending: PendingSessions,
}

impl AuthService {
    #[must_use]
    pub fn new(
        store: Arc<dyn AuthStore>,
        config: Arc<AuthConfig>,
        hasher: Arc<dyn PasswordHasher>,
        notifier: Arc<dyn Notifier>,
        access_tokens: AccessTokens,
    ) -> Self {
        let refresh_tokens = RefreshTokens::new(store.clone(), config.refresh_token_ttl_seconds());
        let rate_limiter = RateLimiter::new(store.clone(), config.clone());
        let mfa = MfaEngine::new(store.clone(), config.clone());
        let devices = DeviceTracker::new(store.clone());
        let pending = PendingSessions::new(Duration::from_secs(config.pending_session_ttl_seconds()));
        Self {
            store,
            config,
            hasher,
            notifier,
            access_tokens,
            refresh_tokens,
            rate_limiter,
            mfa,
            devices,
            pending,
        }
    }

    /// Build with the RS256 signing key taken from the configuration.
    pub fn from_config(
        store: Arc<dyn AuthStore>,
        config: Arc<AuthConfig>,
        hasher: Arc<dyn PasswordHasher>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let pem = config
            .signing_key_pem()
            .ok_or_else(|| Error::Internal(anyhow!("signing key not configured")))?;
        let access_tokens = AccessTokens::from_key_bytes(
            pem.expose_secret().as_bytes(),
            config.issuer(),
            config.access_token_ttl_seconds(),
        )
        .map_err(token_internal)?;
        Ok(Self::new(store, config, hasher, notifier, access_tokens))
    }

    /// MFA setup and backup-code management for the embedding layer.
    #[must_use]
    pub fn mfa(&self) -> &MfaEngine {
        &self.mfa
    }

    /// Device listing, trust, and removal for the embedding layer.
    #[must_use]
    pub fn devices(&self) -> &DeviceTracker {
        &self.devices
    }

    /// Verify a bearer access token and return its claims.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessTokenClaims> {
        self.access_tokens
            .verify(token, now_unix())
            .map_err(|err| {
                warn!(error = %err, "access token rejected");
                Error::SessionNotFound
            })
    }

    // -- registration ---------------------------------------------------

    pub async fn register(&self, request: Registration) -> Result<Account> {
        let email = normalize_email(&request.email);
        if !valid_email(&email) {
            return Err(Error::InvalidEmail);
        }
        if let Some(username) = request.username.as_deref() {
            if self.store.username_taken(username).await? {
                return Err(Error::DuplicateUsername);
            }
        }

        let verification_pending = self.config.email_verification_enabled();
        let account = Account {
            id: Uuid::new_v4(),
            email,
            username: request.username,
            display_name: request.display_name,
            role: request.role.unwrap_or(Role::Member),
            password_hash: self.hasher.hash(&request.password)?,
            enabled: true,
            email_verified: !verification_pending,
            failed_attempts: 0,
            locked_until: None,
            created_at: now_unix(),
        };
        self.store.insert_account(&account).await?;
        info!(account_id = %account.id, role = account.role.as_str(), "account registered");

        if verification_pending {
            self.send_credential_token(
                &account,
                CredentialTokenKind::EmailVerification,
                Event::VerifyEmail,
            )
            .await?;
        }
        notify::dispatch(
            &self.notifier,
            Notification {
                account_id: account.id,
                email: account.email.clone(),
                event: Event::Welcome,
                payload: json!({}),
            },
        );
        Ok(account)
    }

    // -- login ----------------------------------------------------------

    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ctx: &ClientContext,
    ) -> Result<LoginOutcome> {
        let email = normalize_email(email);

        if self.rate_limiter.is_email_rate_limited(&email).await?
            || self.rate_limiter.is_ip_rate_limited(&ctx.ip_address).await?
        {
            self.record_failure(&email, ctx, "Rate limited").await?;
            return Err(Error::RateLimited);
        }

        let Some(mut account) = self.store.find_account_by_email(&email).await? else {
            self.record_failure(&email, ctx, "Invalid credentials").await?;
            return Err(Error::InvalidCredentials);
        };

        if !account.enabled {
            self.record_failure(&email, ctx, "Invalid credentials").await?;
            return Err(Error::InvalidCredentials);
        }

        if !self.hasher.verify(password, &account.password_hash)? {
            self.record_failure(&email, ctx, "Invalid credentials").await?;
            let locked = self.rate_limiter.handle_failed_login(&mut account).await?;
            if locked {
                notify::dispatch(
                    &self.notifier,
                    Notification {
                        account_id: account.id,
                        email: account.email.clone(),
                        event: Event::AccountLocked,
                        payload: json!({ "locked_until": account.locked_until }),
                    },
                );
                return Err(Error::AccountLocked);
            }
            return Err(Error::InvalidCredentials);
        }

        // Lock state is only reported once the credentials hold.
        if account.is_locked(now_unix()) {
            self.record_failure(&email, ctx, "Account locked").await?;
            return Err(Error::AccountLocked);
        }

        if self.config.email_verification_enabled() && !account.email_verified {
            self.record_failure(&email, ctx, "Email not verified").await?;
            return Err(Error::EmailNotVerified);
        }

        if self.mfa.is_enabled(account.id).await? {
            let session_id = self
                .pending
                .insert(
                    account.id,
                    ctx.device_fingerprint.clone(),
                    ctx.ip_address.clone(),
                    ctx.user_agent.clone(),
                )
                .await;
            // Credentials held; the attempt is a success pending the second
            // factor, so it never feeds the failure window.
            self.rate_limiter
                .record_attempt(
                    &email,
                    &ctx.ip_address,
                    &ctx.user_agent,
                    true,
                    Some("MFA required"),
                )
                .await?;
            return Ok(LoginOutcome::MfaRequired { session_id });
        }

        let tokens = self.complete_login(account, ctx).await?;
        Ok(LoginOutcome::Success(tokens))
    }

    /// Answer a pending MFA challenge. The session is consumed on success
    /// and on expiry; a wrong code leaves it available for a retry until
    /// the original TTL runs out.
    pub async fn verify_mfa_challenge(&self, session_id: Uuid, code: &str) -> Result<AuthTokens> {
        let Some(session) = self.pending.take(session_id).await else {
            return Err(Error::SessionNotFound);
        };
        let Some(account) = self.store.find_account_by_id(session.account_id).await? else {
            return Err(Error::SessionNotFound);
        };

        let ctx = ClientContext {
            device_fingerprint: session.device_fingerprint.clone(),
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
        };
        if !self.mfa.validate(&account, code).await? {
            self.record_failure(&account.email, &ctx, "Invalid MFA code").await?;
            self.pending.restore(session_id, session).await;
            return Err(Error::InvalidMfaCode);
        }
        self.complete_login(account, &ctx).await
    }

    // -- session lifecycle ----------------------------------------------

    /// Rotate a refresh token and mint a fresh access token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<AuthTokens> {
        let (new_refresh, claimed) = self.refresh_tokens.validate_and_rotate(refresh_token).await?;
        let Some(account) = self.store.find_account_by_id(claimed.account_id).await? else {
            return Err(Error::InvalidRefreshToken);
        };
        if !account.enabled {
            // The rotation already revoked the presented token; kill the
            // replacement too so the chain ends here.
            self.refresh_tokens.revoke(&new_refresh).await?;
            return Err(Error::InvalidRefreshToken);
        }

        self.devices
            .track(
                account.id,
                &claimed.device_fingerprint,
                &claimed.ip_address,
                &claimed.user_agent,
            )
            .await?;
        let access_token = self
            .access_tokens
            .issue(&account, now_unix())
            .map_err(token_internal)?;
        Ok(AuthTokens {
            access_token,
            refresh_token: new_refresh,
            account,
        })
    }

    /// Revoke one refresh token. Unknown tokens are a no-op.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        self.refresh_tokens.revoke(refresh_token).await
    }

    /// Revoke every refresh token for the account, all devices.
    pub async fn logout_all(&self, account_id: Uuid) -> Result<()> {
        info!(account_id = %account_id, "revoking all sessions");
        self.refresh_tokens.revoke_all(account_id).await
    }

    // -- credential management ------------------------------------------

    pub async fn change_password(
        &self,
        account_id: Uuid,
        current_password: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<()> {
        if new_password != confirm_password {
            return Err(Error::PasswordMismatch);
        }
        let mut account = self
            .store
            .find_account_by_id(account_id)
            .await?
            .ok_or(Error::NotFound("account"))?;
        if !self.hasher.verify(current_password, &account.password_hash)? {
            return Err(Error::InvalidCredentials);
        }

        account.password_hash = self.hasher.hash(new_password)?;
        self.store.update_account(&account).await?;
        self.refresh_tokens.revoke_all(account.id).await?;
        info!(account_id = %account.id, "password changed");
        notify::dispatch(
            &self.notifier,
            Notification {
                account_id: account.id,
                email: account.email.clone(),
                event: Event::PasswordChanged,
                payload: json!({}),
            },
        );
        Ok(())
    }

    /// Consume an email-verification token and mark the account verified.
    pub async fn verify_email(&self, token: &str) -> Result<()> {
        let consumed = self
            .consume_credential_token(token, CredentialTokenKind::EmailVerification)
            .await?
            .ok_or(Error::NotFound("verification token"))?;
        let mut account = self
            .store
            .find_account_by_id(consumed.account_id)
            .await?
            .ok_or(Error::NotFound("account"))?;
        if !account.email_verified {
            account.email_verified = true;
            self.store.update_account(&account).await?;
            info!(account_id = %account.id, "email verified");
        }
        Ok(())
    }

    /// Issue a fresh verification token. Succeeds silently for unknown or
    /// already-verified emails so the endpoint cannot be used to probe for
    /// accounts.
    pub async fn resend_verification(&self, email: &str) -> Result<()> {
        let email = normalize_email(email);
        let Some(account) = self.store.find_account_by_email(&email).await? else {
            return Ok(());
        };
        if account.email_verified {
            return Ok(());
        }
        self.send_credential_token(
            &account,
            CredentialTokenKind::EmailVerification,
            Event::VerifyEmail,
        )
        .await
    }

    /// Start a password reset. Silent for unknown emails, same as
    /// [`Self::resend_verification`].
    pub async fn request_password_reset(&self, email: &str) -> Result<()> {
        let email = normalize_email(email);
        let Some(account) = self.store.find_account_by_email(&email).await? else {
            return Ok(());
        };
        self.send_credential_token(&account, CredentialTokenKind::PasswordReset, Event::PasswordReset)
            .await
    }

    /// Finish a password reset. Clears any lockout, since the reset proves
    /// control of the mailbox, and revokes every open session.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
        confirm_password: &str,
    ) -> Result<()> {
        if new_password != confirm_password {
            return Err(Error::PasswordMismatch);
        }
        let consumed = self
            .consume_credential_token(token, CredentialTokenKind::PasswordReset)
            .await?
            .ok_or(Error::NotFound("reset token"))?;
        let mut account = self
            .store
            .find_account_by_id(consumed.account_id)
            .await?
            .ok_or(Error::NotFound("account"))?;

        account.password_hash = self.hasher.hash(new_password)?;
        account.failed_attempts = 0;
        account.locked_until = None;
        self.store.update_account(&account).await?;
        self.refresh_tokens.revoke_all(account.id).await?;
        info!(account_id = %account.id, "password reset completed");
        notify::dispatch(
            &self.notifier,
            Notification {
                account_id: account.id,
                email: account.email.clone(),
                event: Event::PasswordChanged,
                payload: json!({}),
            },
        );
        Ok(())
    }

    // -- maintenance ----------------------------------------------------

    /// Reclaim stale rows across the stores. Driven by an external
    /// scheduler; safe to run concurrently with live traffic.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let now = now_unix();
        let report = CleanupReport {
            refresh_tokens: self.refresh_tokens.cleanup(now).await?,
            login_attempts: self.rate_limiter.cleanup(now).await?,
            credential_tokens: self.store.delete_stale_credential_tokens(now).await?,
        };
        info!(
            refresh_tokens = report.refresh_tokens,
            login_attempts = report.login_attempts,
            credential_tokens = report.credential_tokens,
            "cleanup sweep finished"
        );
        Ok(report)
    }

    // -- internals ------------------------------------------------------

    async fn complete_login(&self, mut account: Account, ctx: &ClientContext) -> Result<AuthTokens> {
        self.rate_limiter.handle_successful_login(&mut account).await?;

        let (device, is_new) = self
            .devices
            .track(
                account.id,
                &ctx.device_fingerprint,
                &ctx.ip_address,
                &ctx.user_agent,
            )
            .await?;
        if is_new {
            notify::dispatch(
                &self.notifier,
                Notification {
                    account_id: account.id,
                    email: account.email.clone(),
                    event: Event::NewDeviceLogin,
                    payload: json!({
                        "device_name": device.device_name,
                        "ip_address": ctx.ip_address,
                    }),
                },
            );
        }

        self.rate_limiter
            .record_attempt(&account.email, &ctx.ip_address, &ctx.user_agent, true, None)
            .await?;
        let access_token = self
            .access_tokens
            .issue(&account, now_unix())
            .map_err(token_internal)?;
        let refresh_token = self
            .refresh_tokens
            .issue(
                account.id,
                &ctx.device_fingerprint,
                &ctx.ip_address,
                &ctx.user_agent,
            )
            .await?;
        info!(account_id = %account.id, "login completed");
        Ok(AuthTokens {
            access_token,
            refresh_token,
            account,
        })
    }

    async fn record_failure(&self, email: &str, ctx: &ClientContext, reason: &str) -> Result<()> {
        self.rate_limiter
            .record_attempt(email, &ctx.ip_address, &ctx.user_agent, false, Some(reason))
            .await
    }

    /// Mint a single-use credential token, store its hash, and hand the raw
    /// value to the notifier.
    async fn send_credential_token(
        &self,
        account: &Account,
        kind: CredentialTokenKind,
        event: Event,
    ) -> Result<()> {
        let raw = generate_opaque_token(CREDENTIAL_TOKEN_BYTES)?;
        let ttl = match kind {
            CredentialTokenKind::EmailVerification => self.config.verification_token_ttl_seconds(),
            CredentialTokenKind::PasswordReset => self.config.reset_token_ttl_seconds(),
        };
        self.store
            .insert_credential_token(&CredentialToken {
                token_hash: hash_token(&raw),
                account_id: account.id,
                kind,
                expires_at: now_unix() + ttl,
                consumed_at: None,
            })
            .await?;
        notify::dispatch(
            &self.notifier,
            Notification {
                account_id: account.id,
                email: account.email.clone(),
                event,
                payload: json!({ "token": raw }),
            },
        );
        Ok(())
    }

    async fn consume_credential_token(
        &self,
        raw: &str,
        kind: CredentialTokenKind,
    ) -> Result<Option<CredentialToken>> {
        self.store
            .consume_credential_token(&hash_token(raw), kind, now_unix())
            .await
    }
}

fn token_internal(err: TokenError) -> Error {
    Error::Internal(anyhow::Error::new(err))
}
