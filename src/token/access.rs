//! Stateless RS256-signed access tokens (JWT).
//!
//! Claims carry the account email as subject, the account id, and the
//! permission list resolved from the account's role at issuance time.
//! Verification fails closed: any parse, signature, or claim problem yields
//! an error, never a partially-trusted token.

use base64ct::{Base64UrlUnpadded, Encoding};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::models::Account;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("failed to parse RSA key")]
    KeyParse,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("token not yet valid")]
    IssuedInFuture,
    #[error("invalid issuer")]
    InvalidIssuer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Header {
    alg: String,
    typ: String,
}

impl Header {
    fn rs256() -> Self {
        Self {
            alg: "RS256".to_string(),
            typ: "JWT".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    /// Account email.
    pub sub: String,
    /// Account id.
    pub uid: String,
    pub permissions: Vec<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Signer/verifier pair for access tokens.
pub struct AccessTokens {
    signing_key: SigningKey<Sha256>,
    verifying_key: VerifyingKey<Sha256>,
    issuer: String,
    ttl_seconds: i64,
}

impl AccessTokens {
    /// Build from an RSA private key; the verifying key is derived from it.
    #[must_use]
    pub fn new(private_key: RsaPrivateKey, issuer: impl Into<String>, ttl_seconds: i64) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            signing_key: SigningKey::new(private_key),
            verifying_key: VerifyingKey::new(public_key),
            issuer: issuer.into(),
            ttl_seconds,
        }
    }

    /// Build from a PEM or DER encoded private key (PKCS#8 or PKCS#1).
    pub fn from_key_bytes(
        pem_or_der: &[u8],
        issuer: impl Into<String>,
        ttl_seconds: i64,
    ) -> Result<Self, TokenError> {
        Ok(Self::new(
            decode_private_key(pem_or_der)?,
            issuer,
            ttl_seconds,
        ))
    }

    /// Sign an access token for `account`, valid from `now`.
    pub fn issue(&self, account: &Account, now: i64) -> Result<String, TokenError> {
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            sub: account.email.clone(),
            uid: account.id.to_string(),
            permissions: account
                .role
                .permissions()
                .iter()
                .map(ToString::to_string)
                .collect(),
            iat: now,
            exp: now + self.ttl_seconds,
        };

        let header_b64 = b64e_json(&Header::rs256())?;
        let claims_b64 = b64e_json(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature: Signature = self.signing_key.sign(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&signature.to_vec());
        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token and return its claims.
    pub fn verify(&self, token: &str, now: i64) -> Result<AccessTokenClaims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(TokenError::TokenFormat);
        }

        let header: Header = b64d_json(header_b64)?;
        if header.alg != "RS256" {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature_bytes =
            Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|_| TokenError::InvalidSignature)?;
        self.verifying_key
            .verify(signing_input.as_bytes(), &signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: AccessTokenClaims = b64d_json(claims_b64)?;
        if claims.iss != self.issuer {
            return Err(TokenError::InvalidIssuer);
        }
        if claims.iat > now {
            return Err(TokenError::IssuedInFuture);
        }
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn decode_private_key(pem_or_der: &[u8]) -> Result<RsaPrivateKey, TokenError> {
    if pem_or_der.starts_with(b"-----BEGIN") {
        let s = std::str::from_utf8(pem_or_der).map_err(|_| TokenError::KeyParse)?;
        if let Ok(k) = RsaPrivateKey::from_pkcs8_pem(s) {
            return Ok(k);
        }
        if let Ok(k) = RsaPrivateKey::from_pkcs1_pem(s) {
            return Ok(k);
        }
        return Err(TokenError::KeyParse);
    }

    if let Ok(k) = RsaPrivateKey::from_pkcs8_der(pem_or_der) {
        return Ok(k);
    }
    if let Ok(k) = RsaPrivateKey::from_pkcs1_der(pem_or_der) {
        return Ok(k);
    }
    Err(TokenError::KeyParse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use std::sync::OnceLock;
    use uuid::Uuid;

    const NOW: i64 = 1_700_000_000;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| {
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("generate test key")
        })
    }

    fn tokens() -> AccessTokens {
        AccessTokens::new(test_key().clone(), "gardisto.test", 900)
    }

    fn account(role: Role) -> Account {
        Account {
            id: Uuid::new_v4(),
            email: "alice@example.com".into(),
            username: None,
            display_name: None,
            role,
            password_hash: String::new(),
            enabled: true,
            email_verified: true,
            failed_attempts: 0,
            locked_until: None,
            created_at: NOW,
        }
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let tokens = tokens();
        let account = account(Role::Member);
        let token = tokens.issue(&account, NOW).unwrap();

        let claims = tokens.verify(&token, NOW + 10).unwrap();
        assert_eq!(claims.sub, "alice@example.com");
        assert_eq!(claims.uid, account.id.to_string());
        assert_eq!(claims.iss, "gardisto.test");
        assert_eq!(claims.exp, NOW + 900);
        assert_eq!(claims.permissions, vec!["self:read", "self:write"]);
    }

    #[test]
    fn admin_permissions_resolve_from_role() {
        let tokens = tokens();
        let token = tokens.issue(&account(Role::Admin), NOW).unwrap();
        let claims = tokens.verify(&token, NOW).unwrap();
        assert!(claims.permissions.contains(&"admin:manage".to_string()));
    }

    #[test]
    fn expired_token_is_rejected() {
        let tokens = tokens();
        let token = tokens.issue(&account(Role::Member), NOW).unwrap();
        assert!(matches!(
            tokens.verify(&token, NOW + 901),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn tampered_claims_fail_signature_check() {
        let tokens = tokens();
        let token = tokens.issue(&account(Role::Member), NOW).unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged = b64e_json(&AccessTokenClaims {
            iss: "gardisto.test".into(),
            sub: "mallory@example.com".into(),
            uid: Uuid::new_v4().to_string(),
            permissions: vec!["admin:manage".into()],
            iat: NOW,
            exp: NOW + 900,
        })
        .unwrap();
        parts[1] = &forged;
        let forged_token = parts.join(".");

        assert!(matches!(
            tokens.verify(&forged_token, NOW),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn token_from_another_key_is_rejected() {
        let other_key =
            RsaPrivateKey::new(&mut rand::rngs::OsRng, 2048).expect("generate test key");
        let other = AccessTokens::new(other_key, "gardisto.test", 900);
        let token = other.issue(&account(Role::Member), NOW).unwrap();
        assert!(matches!(
            tokens().verify(&token, NOW),
            Err(TokenError::InvalidSignature)
        ));
    }

    #[test]
    fn wrong_issuer_is_rejected() {
        let issuer_a = AccessTokens::new(test_key().clone(), "a", 900);
        let issuer_b = AccessTokens::new(test_key().clone(), "b", 900);
        let token = issuer_a.issue(&account(Role::Member), NOW).unwrap();
        assert!(matches!(
            issuer_b.verify(&token, NOW),
            Err(TokenError::InvalidIssuer)
        ));
    }

    #[test]
    fn garbage_fails_closed() {
        let tokens = tokens();
        for junk in ["", "a.b", "a.b.c.d", "not a token at all"] {
            assert!(tokens.verify(junk, NOW).is_err());
        }
    }
}
