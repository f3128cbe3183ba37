//! Token issuance: stateless RS256 access tokens and rotating opaque
//! refresh tokens.

pub mod access;
pub mod refresh;

pub use access::{AccessTokenClaims, AccessTokens};
pub use refresh::RefreshTokens;
