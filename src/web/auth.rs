//! WebSocket authentication.
//!
//! Clients pass an HS256 JWT in the `token` query parameter of the upgrade
//! URL. The configured user id claim must hold an integer (number or numeric
//! string).

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{sys_debug, sys_warn};

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    pub user_id_claim: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("claim '{0}' missing or not an integer user id")]
    BadUserId(String),
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Identity {
    User(i64),
    /// Auth disabled; measurements are not persisted.
    Anonymous,
}

impl Identity {
    pub fn user_id(self) -> Option<i64> {
        match self {
            Identity::User(id) => Some(id),
            Identity::Anonymous => None,
        }
    }
}

impl AuthConfig {
    /// Verify a token and extract the user id.
    pub fn verify(&self, token: &str) -> Result<i64, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        match &self.issuer {
            Some(iss) => validation.set_issuer(&[iss]),
            None => validation.iss = None,
        }
        match &self.audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }

        let data = decode::<Map<String, Value>>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        })?;

        let bad_claim = || AuthError::BadUserId(self.user_id_claim.clone());
        match data.claims.get(&self.user_id_claim) {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(bad_claim),
            Some(Value::String(s)) => s.trim().parse::<i64>().map_err(|_| bad_claim()),
            _ => Err(bad_claim()),
        }
    }
}

/// Value of `name` in a raw query string, percent-decoded.
pub fn query_param(query: Option<&str>, name: &str) -> Option<String> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then(|| {
            urlencoding::decode(&value.replace('+', " "))
                .map(|v| v.into_owned())
                .unwrap_or_else(|_| value.to_string())
        })
    })
}

/// Resolve the identity for an upgrade request's query string.
pub fn authenticate(auth: Option<&AuthConfig>, query: Option<&str>) -> Result<Identity, AuthError> {
    let Some(auth) = auth else {
        return Ok(Identity::Anonymous);
    };
    let token = query_param(query, "token")
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::MissingToken)?;

    match auth.verify(&token) {
        Ok(user_id) => {
            sys_debug!("[AUTH] Token accepted for user {user_id}");
            Ok(Identity::User(user_id))
        }
        Err(e) => {
            sys_warn!("[AUTH] Rejected WebSocket token: {e}");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn config() -> AuthConfig {
        AuthConfig {
            secret: SECRET.to_string(),
            issuer: None,
            audience: None,
            user_id_claim: "sub".to_string(),
        }
    }

    fn token(claims: Value, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[test]
    fn test_verify_numeric_and_string_ids() {
        let cfg = config();
        assert_eq!(cfg.verify(&token(json!({"sub": "42"}), SECRET)), Ok(42));
        assert_eq!(
            cfg.verify(&token(json!({"sub": 7, "exp": now() + 600}), SECRET)),
            Ok(7)
        );
    }

    #[test]
    fn test_verify_rejections() {
        let cfg = config();
        assert!(matches!(
            cfg.verify(&token(json!({"sub": "1"}), "other-secret")),
            Err(AuthError::Invalid(_))
        ));
        assert_eq!(
            cfg.verify(&token(json!({"sub": "1", "exp": now() - 3600}), SECRET)),
            Err(AuthError::Expired)
        );
        assert_eq!(
            cfg.verify(&token(json!({"sub": "alice"}), SECRET)),
            Err(AuthError::BadUserId("sub".to_string()))
        );
        assert!(cfg.verify("not.a.jwt").is_err());
    }

    #[test]
    fn test_issuer_audience_and_custom_claim() {
        let cfg = AuthConfig {
            issuer: Some("textneck".to_string()),
            audience: Some("posture".to_string()),
            user_id_claim: "user_id".to_string(),
            ..config()
        };
        let good = token(
            json!({"user_id": 9, "iss": "textneck", "aud": "posture"}),
            SECRET,
        );
        assert_eq!(cfg.verify(&good), Ok(9));

        let wrong_iss = token(json!({"user_id": 9, "iss": "x", "aud": "posture"}), SECRET);
        assert!(matches!(cfg.verify(&wrong_iss), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn test_query_param() {
        assert_eq!(
            query_param(Some("a=1&token=abc%2Edef&b"), "token").as_deref(),
            Some("abc.def")
        );
        assert_eq!(query_param(Some("b"), "token"), None);
        assert_eq!(query_param(None, "token"), None);
    }

    #[test]
    fn test_authenticate() {
        assert_eq!(authenticate(None, None), Ok(Identity::Anonymous));

        let cfg = config();
        assert_eq!(
            authenticate(Some(&cfg), Some("token=")),
            Err(AuthError::MissingToken)
        );
        let query = format!("token={}", token(json!({"sub": 5}), SECRET));
        assert_eq!(
            authenticate(Some(&cfg), Some(&query)).map(Identity::user_id),
            Ok(Some(5))
        );
    }
}
