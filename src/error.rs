//! Error kinds surfaced by the auth core.
//!
//! Every variant renders a user-safe message; storage and crypto internals
//! are wrapped in [`Error::Internal`] and never appear in `Display` output.
//! Credential failures deliberately do not distinguish "no such account"
//! from "wrong password".

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("email already registered")]
    DuplicateEmail,
    #[error("username already taken")]
    DuplicateUsername,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("account is locked, try again later")]
    AccountLocked,
    #[error("email address is not verified")]
    EmailNotVerified,
    #[error("too many login attempts, try again later")]
    RateLimited,
    #[error("invalid two-factor code")]
    InvalidMfaCode,
    #[error("invalid or expired session")]
    SessionNotFound,
    #[error("invalid or expired refresh token")]
    InvalidRefreshToken,
    #[error("new passwords do not match")]
    PasswordMismatch,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::Error;
    use anyhow::anyhow;

    #[test]
    fn credential_error_does_not_reveal_which_factor() {
        let message = Error::InvalidCredentials.to_string();
        assert!(!message.contains("account"));
        assert!(!message.contains("hash"));
        assert_eq!(message, "invalid email or password");
    }

    #[test]
    fn internal_error_hides_cause_in_display() {
        let err = Error::Internal(anyhow!("connection refused to db host 10.0.0.3"));
        assert_eq!(err.to_string(), "internal error");
    }

    #[test]
    fn not_found_names_the_resource() {
        assert_eq!(Error::NotFound("role").to_string(), "role not found");
    }
}
