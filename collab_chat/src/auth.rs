use crate::error::{ChatError, Result};
use axum::http::{header, HeaderMap};
use chat_protocol::UserId;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Claims carried by bearer tokens issued by the account service. The
/// user id may arrive as `sub`, `userId` or `id`; tokens often carry more
/// than one of them.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<UserId>,
    pub exp: usize,
}

impl Claims {
    pub fn subject(self) -> Option<UserId> {
        self.sub.or(self.user_id).or(self.id)
    }
}

/// Verifies HS256 bearer tokens and resolves them to a user id. Shared by
/// the HTTP middleware and the WebSocket handshake.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Resolve a token to its user. Bad signature, expiry and a missing
    /// user-id claim all map to `Unauthorized`.
    pub fn verify(&self, token: &str) -> Result<UserId> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "token rejected");
            ChatError::Unauthorized
        })?;
        data.claims.subject().ok_or(ChatError::Unauthorized)
    }

    /// Issue a token for `user` valid for the provided duration.
    pub fn issue(&self, user: &UserId, valid_for: Duration) -> Result<String> {
        let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp().max(0) as usize;
        let claims = Claims {
            sub: Some(user.clone()),
            user_id: None,
            id: None,
            exp,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ChatError::Internal(format!("token encoding failed: {e}")))
    }
}

/// Extract the token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn uid(s: &str) -> UserId {
        UserId::parse(s).unwrap()
    }

    #[test]
    fn jwt_issue_and_verify() {
        let verifier = TokenVerifier::new(b"secret");
        let token = verifier.issue(&uid("user"), Duration::seconds(60)).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), uid("user"));
    }

    #[test]
    fn jwt_expiry() {
        let verifier = TokenVerifier::new(b"secret");
        let token = verifier.issue(&uid("user"), Duration::seconds(-10)).unwrap();
        assert!(matches!(verifier.verify(&token), Err(ChatError::Unauthorized)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = TokenVerifier::new(b"one")
            .issue(&uid("user"), Duration::seconds(60))
            .unwrap();
        assert!(TokenVerifier::new(b"two").verify(&token).is_err());
        assert!(TokenVerifier::new(b"one").verify("garbage").is_err());
    }

    #[test]
    fn user_id_claim_is_required() {
        let secret = b"secret";
        let exp = (OffsetDateTime::now_utc() + Duration::minutes(5)).unix_timestamp() as usize;
        let encode_with = |claims: serde_json::Value| {
            encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
        };
        let verifier = TokenVerifier::new(secret);

        let missing = encode_with(serde_json::json!({ "exp": exp }));
        assert!(matches!(verifier.verify(&missing), Err(ChatError::Unauthorized)));

        let numeric = encode_with(serde_json::json!({ "userId": 17, "exp": exp }));
        assert_eq!(verifier.verify(&numeric).unwrap(), uid("17"));

        let by_id = encode_with(serde_json::json!({ "id": "u2", "exp": exp }));
        assert_eq!(verifier.verify(&by_id).unwrap(), uid("u2"));
    }

    #[test]
    fn several_user_id_claims_prefer_sub() {
        let secret = b"secret";
        let exp = (OffsetDateTime::now_utc() + Duration::minutes(5)).unix_timestamp() as usize;
        let verifier = TokenVerifier::new(secret);
        let token = encode(
            &Header::default(),
            &serde_json::json!({ "sub": "u1", "id": "u1", "userId": 9, "exp": exp }),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), uid("u1"));

        let token = encode(
            &Header::default(),
            &serde_json::json!({ "id": "u3", "userId": "u4", "exp": exp }),
            &EncodingKey::from_secret(secret),
        )
        .unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), uid("u4"));
    }

    #[test]
    fn bearer_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }
}
