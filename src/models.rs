//! Core data model: accounts, refresh tokens, login attempts, MFA settings,
//! devices, and single-use credential tokens.
//!
//! Timestamps are unix seconds throughout so retention windows and TTLs are
//! directly computable without a time library.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Enumerated capability set resolved server-side.
///
/// Roles are never trusted from token claims alone; the permission list is
/// derived from this enum at issuance and re-derived from account state on
/// re-verification.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Staff,
    Member,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Staff => "staff",
            Self::Member => "member",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "admin" => Some(Self::Admin),
            "staff" => Some(Self::Staff),
            "member" => Some(Self::Member),
            _ => None,
        }
    }

    /// Permission names embedded in access-token claims.
    #[must_use]
    pub fn permissions(self) -> &'static [&'static str] {
        match self {
            Self::Admin => &[
                "accounts:read",
                "accounts:write",
                "sessions:read",
                "sessions:revoke",
                "admin:manage",
            ],
            Self::Staff => &["accounts:read", "sessions:read", "sessions:revoke"],
            Self::Member => &["self:read", "self:write"],
        }
    }
}

/// Persistent user record with lock/verification state.
///
/// Accounts are never deleted; disabling is the deletion substitute.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    /// Normalized (trimmed, lowercased) email.
    pub email: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub enabled: bool,
    pub email_verified: bool,
    pub failed_attempts: u32,
    /// Unix seconds until which the account is locked, if any.
    pub locked_until: Option<i64>,
    pub created_at: i64,
}

impl Account {
    #[must_use]
    pub fn is_locked(&self, now: i64) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Persisted refresh token. Only the SHA-256 hash of the opaque secret is
/// stored; the raw value is returned to the caller exactly once.
#[derive(Clone, Debug)]
pub struct RefreshTokenRecord {
    pub id: Uuid,
    pub token_hash: Vec<u8>,
    pub account_id: Uuid,
    pub device_fingerprint: String,
    pub ip_address: String,
    pub user_agent: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

impl RefreshTokenRecord {
    /// A token is live when unrevoked and unexpired. Once revoked it can
    /// never become valid again.
    #[must_use]
    pub fn is_live(&self, now: i64) -> bool {
        !self.revoked && self.expires_at > now
    }
}

/// Immutable audit row for a login attempt. Write-only; read for rate-limit
/// windows and deleted after the retention period.
#[derive(Clone, Debug)]
pub struct LoginAttempt {
    pub email: String,
    pub ip_address: String,
    pub user_agent: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attempted_at: i64,
}

/// One-to-one MFA settings for an account. The TOTP secret is immutable once
/// created; backup codes are single-use and replaced only as a whole set.
#[derive(Clone, Debug)]
pub struct MfaSettings {
    pub account_id: Uuid,
    /// Base32-encoded TOTP shared secret.
    pub secret: String,
    pub enabled: bool,
    pub backup_codes: Vec<String>,
}

/// Known device for an account, keyed by (account, fingerprint).
#[derive(Clone, Debug)]
pub struct AuthDevice {
    pub id: Uuid,
    pub account_id: Uuid,
    pub fingerprint: String,
    pub device_name: String,
    pub last_ip: String,
    pub last_user_agent: String,
    pub first_seen: i64,
    pub last_seen: i64,
    pub trusted: bool,
}

/// What a single-use credential token authorizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CredentialTokenKind {
    EmailVerification,
    PasswordReset,
}

impl CredentialTokenKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmailVerification => "email_verification",
            Self::PasswordReset => "password_reset",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email_verification" => Some(Self::EmailVerification),
            "password_reset" => Some(Self::PasswordReset),
            _ => None,
        }
    }
}

/// Single-use token backing email verification and password reset links.
/// Hash-only persistence, same as refresh tokens.
#[derive(Clone, Debug)]
pub struct CredentialToken {
    pub token_hash: Vec<u8>,
    pub account_id: Uuid,
    pub kind: CredentialTokenKind,
    pub expires_at: i64,
    pub consumed_at: Option<i64>,
}

impl CredentialToken {
    #[must_use]
    pub fn is_valid(&self, now: i64) -> bool {
        self.consumed_at.is_none() && self.expires_at > now
    }
}
