//! Identity verification at connection handshake.
//!
//! Credentials are HS256 JWTs presented as `Authorization: Bearer <token>`
//! or `?token=<token>` (the latter for WebSocket clients that cannot set
//! headers). A failed verification rejects the handshake before any room
//! or channel registration happens. `/health` stays unauthenticated.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tutorlink_protocol::Role;

/// Authenticated user identity attached to a connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid or expired credential: {0}")]
    InvalidCredential(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    role: Role,
    exp: usize,
}

/// Verifies bearer credentials into user identities.
#[derive(Clone)]
pub struct IdentityVerifier {
    decoding_key: DecodingKey,
}

impl IdentityVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Verify a raw token. Invoked once per connection at handshake.
    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .map_err(|e| AuthError::InvalidCredential(e.to_string()))?;

        Ok(Identity {
            user_id: data.claims.sub,
            name: data.claims.name,
            role: data.claims.role,
        })
    }
}

/// Extract the bearer credential from an Authorization header value or a
/// raw query string. Header wins when both are present.
pub fn extract_token(auth_header: Option<&str>, query: Option<&str>) -> Result<String, AuthError> {
    if let Some(value) = auth_header {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if !token.is_empty() {
                return Ok(token.to_string());
            }
        }
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    return Ok(token.to_string());
                }
            }
        }
    }

    Err(AuthError::MissingCredential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token_for(sub: &str, role: Role, exp: usize) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            name: format!("{} name", sub),
            role,
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .expect("encode")
    }

    fn far_future() -> usize {
        4_102_444_800 // 2100-01-01
    }

    #[test]
    fn verifies_valid_token() {
        let verifier = IdentityVerifier::new(SECRET);
        let token = token_for("student-1", Role::Student, far_future());
        let identity = verifier.verify(&token).expect("verify");
        assert_eq!(identity.user_id, "student-1");
        assert_eq!(identity.role, Role::Student);
    }

    #[test]
    fn rejects_wrong_secret() {
        let verifier = IdentityVerifier::new("other-secret");
        let token = token_for("student-1", Role::Student, far_future());
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let verifier = IdentityVerifier::new(SECRET);
        let token = token_for("student-1", Role::Student, 1_000_000);
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn extracts_from_header_then_query() {
        assert_eq!(
            extract_token(Some("Bearer abc"), None).expect("header"),
            "abc"
        );
        assert_eq!(
            extract_token(None, Some("foo=1&token=xyz")).expect("query"),
            "xyz"
        );
        assert!(extract_token(None, None).is_err());
        assert!(extract_token(Some("Basic abc"), Some("foo=1")).is_err());
    }
}
