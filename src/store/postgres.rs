//! Postgres-backed [`AuthStore`].
//!
//! Plain SQL over an sqlx pool. Timestamps are unix seconds in BIGINT
//! columns, token hashes are BYTEA, and the conditional UPDATE in
//! [`claim_refresh_token`] is what makes refresh rotation single-winner
//! across service instances.
//!
//! [`claim_refresh_token`]: AuthStore::claim_refresh_token

use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::{PgDatabaseError, PgPool, PgRow};
use sqlx::Row;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::AuthStore;
use crate::error::{Error, Result};
use crate::models::{
    Account, AuthDevice, CredentialToken, CredentialTokenKind, LoginAttempt, MfaSettings,
    RefreshTokenRecord, Role,
};

const UNIQUE_VIOLATION: &str = "23505";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Map a unique-violation on the accounts table to the identity error the
/// caller can act on.
fn map_account_insert_error(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(pg_err) = db_err.as_error().downcast_ref::<PgDatabaseError>() {
            if pg_err.code() == UNIQUE_VIOLATION {
                return match pg_err.constraint() {
                    Some("accounts_email_key") => Error::DuplicateEmail,
                    Some("accounts_username_key") => Error::DuplicateUsername,
                    _ => Error::Internal(anyhow::Error::new(err)),
                };
            }
        }
    }
    Error::Internal(anyhow::Error::new(err))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err
                .as_error()
                .downcast_ref::<PgDatabaseError>()
                .map(PgDatabaseError::code)
                == Some(UNIQUE_VIOLATION)
    )
}

fn account_from_row(row: &PgRow) -> anyhow::Result<Account> {
    let role: String = row.try_get("role")?;
    let failed_attempts: i32 = row.try_get("failed_attempts")?;
    Ok(Account {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        username: row.try_get("username")?,
        display_name: row.try_get("display_name")?,
        role: Role::parse(&role).with_context(|| format!("unknown role in accounts row: {role}"))?,
        password_hash: row.try_get("password_hash")?,
        enabled: row.try_get("enabled")?,
        email_verified: row.try_get("email_verified")?,
        failed_attempts: u32::try_from(failed_attempts).unwrap_or(0),
        locked_until: row.try_get("locked_until")?,
        created_at: row.try_get("created_at")?,
    })
}

fn refresh_token_from_row(row: &PgRow) -> anyhow::Result<RefreshTokenRecord> {
    Ok(RefreshTokenRecord {
        id: row.try_get("id")?,
        token_hash: row.try_get("token_hash")?,
        account_id: row.try_get("account_id")?,
        device_fingerprint: row.try_get("device_fingerprint")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn device_from_row(row: &PgRow) -> anyhow::Result<AuthDevice> {
    Ok(AuthDevice {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        fingerprint: row.try_get("fingerprint")?,
        device_name: row.try_get("device_name")?,
        last_ip: row.try_get("last_ip")?,
        last_user_agent: row.try_get("last_user_agent")?,
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
        trusted: row.try_get("trusted")?,
    })
}

fn credential_token_from_row(row: &PgRow) -> anyhow::Result<CredentialToken> {
    let kind: String = row.try_get("kind")?;
    Ok(CredentialToken {
        token_hash: row.try_get("token_hash")?,
        account_id: row.try_get("account_id")?,
        kind: CredentialTokenKind::parse(&kind)
            .with_context(|| format!("unknown credential token kind: {kind}"))?,
        expires_at: row.try_get("expires_at")?,
        consumed_at: row.try_get("consumed_at")?,
    })
}

#[async_trait]
impl AuthStore for PgStore {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        let query = "INSERT INTO accounts \
            (id, email, username, display_name, role, password_hash, enabled, email_verified, failed_attempts, locked_until, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(account.id)
            .bind(&account.email)
            .bind(account.username.as_deref())
            .bind(account.display_name.as_deref())
            .bind(account.role.as_str())
            .bind(&account.password_hash)
            .bind(account.enabled)
            .bind(account.email_verified)
            .bind(i32::try_from(account.failed_attempts).unwrap_or(i32::MAX))
            .bind(account.locked_until)
            .bind(account.created_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .map_err(map_account_insert_error)?;
        Ok(())
    }

    async fn find_account_by_id(&self, id: Uuid) -> Result<Option<Account>> {
        let query = "SELECT * FROM accounts WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch account by id")?;
        row.as_ref().map(account_from_row).transpose().map_err(Error::from)
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        let query = "SELECT * FROM accounts WHERE email = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch account by email")?;
        row.as_ref().map(account_from_row).transpose().map_err(Error::from)
    }

    async fn username_taken(&self, username: &str) -> Result<bool> {
        let query = "SELECT EXISTS(SELECT 1 FROM accounts WHERE username = $1) AS taken";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let taken: bool = sqlx::query_scalar(query)
            .bind(username)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("Failed to check username")?;
        Ok(taken)
    }

    async fn update_account(&self, account: &Account) -> Result<()> {
        let query = "UPDATE accounts SET \
            email = $2, username = $3, display_name = $4, role = $5, password_hash = $6, \
            enabled = $7, email_verified = $8, failed_attempts = $9, locked_until = $10 \
            WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(account.id)
            .bind(&account.email)
            .bind(account.username.as_deref())
            .bind(account.display_name.as_deref())
            .bind(account.role.as_str())
            .bind(&account.password_hash)
            .bind(account.enabled)
            .bind(account.email_verified)
            .bind(i32::try_from(account.failed_attempts).unwrap_or(i32::MAX))
            .bind(account.locked_until)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to update account")?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound("account"));
        }
        Ok(())
    }

    async fn insert_refresh_token(&self, record: &RefreshTokenRecord) -> Result<bool> {
        let query = "INSERT INTO refresh_tokens \
            (id, token_hash, account_id, device_fingerprint, ip_address, user_agent, issued_at, expires_at, revoked, revoked_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(record.id)
            .bind(&record.token_hash)
            .bind(record.account_id)
            .bind(&record.device_fingerprint)
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .bind(record.revoked)
            .bind(record.revoked_at)
            .execute(&self.pool)
            .instrument(span)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(err) if is_unique_violation(&err) => Ok(false),
            Err(err) => Err(Error::Internal(
                anyhow::Error::new(err).context("Failed to insert refresh token"),
            )),
        }
    }

    async fn find_refresh_token(&self, token_hash: &[u8]) -> Result<Option<RefreshTokenRecord>> {
        let query = "SELECT * FROM refresh_tokens WHERE token_hash = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch refresh token")?;
        row.as_ref()
            .map(refresh_token_from_row)
            .transpose()
            .map_err(Error::from)
    }

    async fn claim_refresh_token(
        &self,
        token_hash: &[u8],
        now: i64,
    ) -> Result<Option<RefreshTokenRecord>> {
        let query = "UPDATE refresh_tokens \
            SET revoked = TRUE, revoked_at = $2 \
            WHERE token_hash = $1 AND revoked = FALSE AND expires_at > $2 \
            RETURNING *";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to claim refresh token")?;
        row.as_ref()
            .map(refresh_token_from_row)
            .transpose()
            .map_err(Error::from)
    }

    async fn revoke_refresh_token(&self, token_hash: &[u8], now: i64) -> Result<()> {
        let query = "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2 \
            WHERE token_hash = $1 AND revoked = FALSE";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(token_hash)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to revoke refresh token")?;
        Ok(())
    }

    async fn revoke_all_refresh_tokens(&self, account_id: Uuid, now: i64) -> Result<()> {
        let query = "UPDATE refresh_tokens SET revoked = TRUE, revoked_at = $2 \
            WHERE account_id = $1 AND revoked = FALSE";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(account_id)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to revoke account refresh tokens")?;
        Ok(())
    }

    async fn delete_stale_refresh_tokens(&self, now: i64) -> Result<u64> {
        let query = "DELETE FROM refresh_tokens WHERE revoked = TRUE OR expires_at <= $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete stale refresh tokens")?;
        Ok(result.rows_affected())
    }

    async fn insert_login_attempt(&self, attempt: &LoginAttempt) -> Result<()> {
        let query = "INSERT INTO login_attempts \
            (email, ip_address, user_agent, success, failure_reason, attempted_at) \
            VALUES ($1, $2, $3, $4, $5, $6)";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(&attempt.email)
            .bind(&attempt.ip_address)
            .bind(&attempt.user_agent)
            .bind(attempt.success)
            .bind(attempt.failure_reason.as_deref())
            .bind(attempt.attempted_at)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to insert login attempt")?;
        Ok(())
    }

    async fn count_failed_attempts_by_email(&self, email: &str, since: i64) -> Result<u64> {
        let query = "SELECT COUNT(*) FROM login_attempts \
            WHERE email = $1 AND success = FALSE AND attempted_at >= $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let count: i64 = sqlx::query_scalar(query)
            .bind(email)
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("Failed to count attempts by email")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn count_failed_attempts_by_ip(&self, ip_address: &str, since: i64) -> Result<u64> {
        let query = "SELECT COUNT(*) FROM login_attempts \
            WHERE ip_address = $1 AND success = FALSE AND attempted_at >= $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let count: i64 = sqlx::query_scalar(query)
            .bind(ip_address)
            .bind(since)
            .fetch_one(&self.pool)
            .instrument(span)
            .await
            .context("Failed to count attempts by ip")?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn delete_attempts_before(&self, cutoff: i64) -> Result<u64> {
        let query = "DELETE FROM login_attempts WHERE attempted_at < $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(cutoff)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete old login attempts")?;
        Ok(result.rows_affected())
    }

    async fn find_mfa_settings(&self, account_id: Uuid) -> Result<Option<MfaSettings>> {
        let query = "SELECT * FROM mfa_settings WHERE account_id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch mfa settings")?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(MfaSettings {
            account_id: row.try_get("account_id").map_err(anyhow::Error::new)?,
            secret: row.try_get("secret").map_err(anyhow::Error::new)?,
            enabled: row.try_get("enabled").map_err(anyhow::Error::new)?,
            backup_codes: row.try_get("backup_codes").map_err(anyhow::Error::new)?,
        }))
    }

    async fn upsert_mfa_settings(&self, settings: &MfaSettings) -> Result<()> {
        let query = "INSERT INTO mfa_settings (account_id, secret, enabled, backup_codes) \
            VALUES ($1, $2, $3, $4) \
            ON CONFLICT (account_id) DO UPDATE \
            SET secret = EXCLUDED.secret, enabled = EXCLUDED.enabled, backup_codes = EXCLUDED.backup_codes";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(settings.account_id)
            .bind(&settings.secret)
            .bind(settings.enabled)
            .bind(&settings.backup_codes)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to upsert mfa settings")?;
        Ok(())
    }

    async fn find_device(
        &self,
        account_id: Uuid,
        fingerprint: &str,
    ) -> Result<Option<AuthDevice>> {
        let query = "SELECT * FROM auth_devices WHERE account_id = $1 AND fingerprint = $2";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(account_id)
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch device")?;
        row.as_ref().map(device_from_row).transpose().map_err(Error::from)
    }

    async fn find_device_by_id(&self, device_id: Uuid) -> Result<Option<AuthDevice>> {
        let query = "SELECT * FROM auth_devices WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to fetch device by id")?;
        row.as_ref().map(device_from_row).transpose().map_err(Error::from)
    }

    async fn upsert_device(&self, device: &AuthDevice) -> Result<()> {
        let query = "INSERT INTO auth_devices \
            (id, account_id, fingerprint, device_name, last_ip, last_user_agent, first_seen, last_seen, trusted) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
            ON CONFLICT (id) DO UPDATE \
            SET device_name = EXCLUDED.device_name, last_ip = EXCLUDED.last_ip, \
                last_user_agent = EXCLUDED.last_user_agent, last_seen = EXCLUDED.last_seen, \
                trusted = EXCLUDED.trusted";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        sqlx::query(query)
            .bind(device.id)
            .bind(device.account_id)
            .bind(&device.fingerprint)
            .bind(&device.device_name)
            .bind(&device.last_ip)
            .bind(&device.last_user_agent)
            .bind(device.first_seen)
            .bind(device.last_seen)
            .bind(device.trusted)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to upsert device")?;
        Ok(())
    }

    async fn delete_device(&self, device_id: Uuid) -> Result<()> {
        let query = "DELETE FROM auth_devices WHERE id = $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(device_id)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete device")?;
        Ok(())
    }

    async fn list_devices(&self, account_id: Uuid) -> Result<Vec<AuthDevice>> {
        let query = "SELECT * FROM auth_devices WHERE account_id = $1 ORDER BY last_seen DESC";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let rows = sqlx::query(query)
            .bind(account_id)
            .fetch_all(&self.pool)
            .instrument(span)
            .await
            .context("Failed to list devices")?;
        rows.iter()
            .map(|row| device_from_row(row).map_err(Error::from))
            .collect()
    }

    async fn insert_credential_token(&self, token: &CredentialToken) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin transaction")?;

        // A new token supersedes any outstanding one of the same kind.
        sqlx::query("DELETE FROM credential_tokens WHERE account_id = $1 AND kind = $2")
            .bind(token.account_id)
            .bind(token.kind.as_str())
            .execute(&mut *tx)
            .await
            .context("Failed to clear outstanding credential tokens")?;

        sqlx::query(
            "INSERT INTO credential_tokens (token_hash, account_id, kind, expires_at, consumed_at) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&token.token_hash)
        .bind(token.account_id)
        .bind(token.kind.as_str())
        .bind(token.expires_at)
        .bind(token.consumed_at)
        .execute(&mut *tx)
        .await
        .context("Failed to insert credential token")?;

        tx.commit().await.context("Failed to commit transaction")?;
        Ok(())
    }

    async fn consume_credential_token(
        &self,
        token_hash: &[u8],
        kind: CredentialTokenKind,
        now: i64,
    ) -> Result<Option<CredentialToken>> {
        let query = "UPDATE credential_tokens SET consumed_at = $3 \
            WHERE token_hash = $1 AND kind = $2 AND consumed_at IS NULL AND expires_at > $3 \
            RETURNING *";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(token_hash)
            .bind(kind.as_str())
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("Failed to consume credential token")?;
        row.as_ref()
            .map(credential_token_from_row)
            .transpose()
            .map_err(Error::from)
    }

    async fn delete_stale_credential_tokens(&self, now: i64) -> Result<u64> {
        let query = "DELETE FROM credential_tokens WHERE consumed_at IS NOT NULL OR expires_at <= $1";
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(now)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("Failed to delete stale credential tokens")?;
        Ok(result.rows_affected())
    }
}
