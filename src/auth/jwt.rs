//! Short-lived bearer JWTs for the MCP tool surface.
//!
//! Tokens carry the user and workspace ids plus an expiry claim.
//! Verification rejects tokens whose workspace does not match the
//! requested resource.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Default bearer lifetime.
const TOKEN_LIFETIME_HOURS: i64 = 1;

/// Claims carried by a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerToken {
    pub user_id: i64,
    pub workspace_id: i64,
    pub exp: i64,
}

/// Mints and verifies bearer tokens with the process secret.
#[derive(Clone)]
pub struct JwtIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtIssuer {
    pub fn new(process_secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(process_secret.as_bytes()),
            decoding: DecodingKey::from_secret(process_secret.as_bytes()),
        }
    }

    /// Mints a token for the user/workspace pair.
    ///
    /// Returns the token and its expiry as a unix timestamp.
    pub fn mint_bearer(&self, user_id: i64, workspace_id: i64) -> Result<(String, i64)> {
        let expires_at = (Utc::now() + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp();
        let claims = BearerToken {
            user_id,
            workspace_id,
            exp: expires_at,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| GatewayError::internal(format!("JWT signing failed: {e}")))?;
        Ok((token, expires_at))
    }

    /// Verifies a token's signature and expiry.
    pub fn verify(&self, token: &str) -> Result<BearerToken> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<BearerToken>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    GatewayError::auth("bearer token has expired")
                }
                _ => GatewayError::auth(format!("bearer token invalid: {e}")),
            })
    }

    /// Verifies a token and checks it grants the requested workspace.
    pub fn verify_for_workspace(&self, token: &str, workspace_id: i64) -> Result<BearerToken> {
        let claims = self.verify(token)?;
        if claims.workspace_id != workspace_id {
            return Err(GatewayError::auth(format!(
                "token is scoped to workspace {}, not {}",
                claims.workspace_id, workspace_id
            )));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mint_and_verify() {
        let issuer = JwtIssuer::new("secret");
        let (token, expires_at) = issuer.mint_bearer(7, 42).unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.user_id, 7);
        assert_eq!(claims.workspace_id, 42);
        assert_eq!(claims.exp, expires_at);
        assert!(expires_at > Utc::now().timestamp());
    }

    #[test]
    fn test_workspace_mismatch_rejected() {
        let issuer = JwtIssuer::new("secret");
        let (token, _) = issuer.mint_bearer(7, 42).unwrap();
        assert!(issuer.verify_for_workspace(&token, 42).is_ok());
        let err = issuer.verify_for_workspace(&token, 43).unwrap_err();
        assert_eq!(err.kind(), "AuthExpired");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = JwtIssuer::new("secret-a");
        let (token, _) = issuer.mint_bearer(1, 1).unwrap();
        let other = JwtIssuer::new("secret-b");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let issuer = JwtIssuer::new("secret");
        let (token, _) = issuer.mint_bearer(1, 1).unwrap();
        let tampered = format!("{}x", token);
        assert!(issuer.verify(&tampered).is_err());
    }
}
