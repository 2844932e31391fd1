//! Session handshake tokens (§6).
//!
//! The realtime socket's HTTP upgrade carries a bearer JWT (HS256) whose
//! claims supply the session's identity and vars. Mechanism is unchanged
//! from the teacher's own `TokenService` (`jsonwebtoken` encode/decode,
//! `exp`-based expiry checked by the `jsonwebtoken` validator itself) —
//! only the claims shape is re-scoped to what the handshake needs.

use std::collections::HashMap;

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject: user-id.
    pub sub: String,
    pub username: String,
    pub exp: u64,
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

/// Verifies the session-handshake JWT. Minting is left to whatever issues
/// player tokens outside this crate (§6 Non-goals); the core only needs to
/// validate them at upgrade time.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mints a handshake token. Exposed mainly for tests and local tooling
    /// that needs to hand a client a token without a separate auth server.
    pub fn generate(&self, user_id: &str, username: &str, expiry_secs: u64, vars: HashMap<String, String>) -> Result<String> {
        let claims = SessionClaims { sub: user_id.to_string(), username: username.to_string(), exp: unix_timestamp() + expiry_secs, vars };
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| AuthError::Internal(e.to_string()))
    }

    /// Verify(token) → claims; rejected → `Unauthorized`-class error;
    /// expired → `TokenExpired` (mapped to `session-expired` by the caller).
    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        decode::<SessionClaims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_token_roundtrip() {
        let service = TokenService::new("test-secret-key-at-least-32-ch");
        let token = service.generate("user-123", "Player1", 3600, HashMap::new()).unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.username, "Player1");
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = TokenService::new("test-secret-key-at-least-32-ch");
        let token = service.generate("user-123", "Player1", 0, HashMap::new()).unwrap();

        std::thread::sleep(std::time::Duration::from_secs(1));
        assert!(matches!(service.verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let a = TokenService::new("secret-key-one-at-least-32-chars");
        let b = TokenService::new("secret-key-two-at-least-32-chars");

        let token = a.generate("user-123", "Player1", 3600, HashMap::new()).unwrap();
        assert!(matches!(b.verify(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn test_vars_roundtrip() {
        let service = TokenService::new("test-secret-key-at-least-32-ch");
        let mut vars = HashMap::new();
        vars.insert("region".to_string(), "eu".to_string());
        let token = service.generate("user-123", "Player1", 3600, vars.clone()).unwrap();

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.vars, vars);
    }
}
