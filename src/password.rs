//! Password hashing seam.
//!
//! The orchestrator only depends on the [`PasswordHasher`] trait; the
//! provided implementation is Argon2id with per-hash random salts.

use anyhow::anyhow;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

/// Abstract password hasher: `hash(plain) -> hash`, `verify(plain, hash) -> bool`.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, plain: &str) -> Result<String>;
    fn verify(&self, plain: &str, hash: &str) -> Result<bool>;
}

/// Argon2id hasher with library-default parameters.
#[derive(Clone, Debug, Default)]
pub struct Argon2PasswordHasher;

impl PasswordHasher for Argon2PasswordHasher {
    fn hash(&self, plain: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = argon2::PasswordHasher::hash_password(&Argon2::default(), plain.as_bytes(), &salt)
            .map_err(|err| Error::Internal(anyhow!("failed to hash password: {err}")))?;
        Ok(hash.to_string())
    }

    fn verify(&self, plain: &str, hash: &str) -> Result<bool> {
        let parsed =
            PasswordHash::new(hash).map_err(|err| Error::Internal(anyhow!("invalid password hash: {err}")))?;
        match Argon2::default().verify_password(plain.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(argon2::password_hash::Error::Password) => Ok(false),
            Err(err) => Err(Error::Internal(anyhow!("password verification failed: {err}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hasher = Argon2PasswordHasher;
        let hash = hasher.hash("Secret123!").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("Secret123!", &hash).unwrap());
        assert!(!hasher.verify("wrong", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let hasher = Argon2PasswordHasher;
        let first = hasher.hash("Secret123!").unwrap();
        let second = hasher.hash("Secret123!").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn malformed_hash_is_an_internal_error() {
        let hasher = Argon2PasswordHasher;
        assert!(hasher.verify("whatever", "not-a-phc-string").is_err());
    }
}
