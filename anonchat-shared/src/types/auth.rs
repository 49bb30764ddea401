use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, ErrorCode};

/// Claims carried by the access token a client presents when connecting.
///
/// `sub` is the stable external identity of the user; the matchmaker never
/// sees anything else about them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn new(user_id: Uuid, duration_secs: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            sub: user_id,
            iat: now,
            exp: now + duration_secs,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    pub fn encode(&self, secret: &str) -> Result<String, AppError> {
        encode(&Header::new(Algorithm::HS256), self, &EncodingKey::from_secret(secret.as_bytes()))
            .map_err(|e| AppError::internal(format!("failed to sign token: {e}")))
    }
}

/// Validate an HS256 token and return its claims.
pub fn validate_token(token: &str, secret: &str) -> Result<Claims, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::new(ErrorCode::Unauthorized, "token has expired")
            }
            _ => AppError::new(ErrorCode::Unauthorized, format!("invalid token: {e}")),
        })?;

    if token_data.claims.is_expired() {
        return Err(AppError::new(ErrorCode::Unauthorized, "token has expired"));
    }

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_keeps_subject() {
        let user = Uuid::new_v4();
        let token = Claims::new(user, 60).encode("secret").unwrap();
        let claims = validate_token(&token, "secret").unwrap();
        assert_eq!(claims.sub, user);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = Claims::new(Uuid::new_v4(), 60).encode("secret").unwrap();
        let err = validate_token(&token, "other").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn expired_token_is_rejected() {
        let mut claims = Claims::new(Uuid::new_v4(), 60);
        claims.iat -= 7200;
        claims.exp -= 7200;
        let token = claims.encode("secret").unwrap();
        assert!(validate_token(&token, "secret").is_err());
    }
}
