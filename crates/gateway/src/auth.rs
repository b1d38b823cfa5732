//! Wire types for the upstream sign-in, sign-out, and recovery endpoints
//!
//! Recovery contract: `POST <base>/<recovery>` with the refresh token as a
//! bearer header. Success is `{success:true, data:{accessToken, refreshToken}}`,
//! failure is `{success:false, message}`.
//!
//! Sign-in takes `{email, password}` and answers with a flat payload holding
//! the user fields next to both tokens, optionally wrapped in `data`.

use common::Secret;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{NormalizedError, codes};

/// Upstream paths for the auth endpoints, relative to the upstream base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub sign_in: String,
    pub sign_out: String,
    pub recovery: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            sign_in: "auth/login".into(),
            sign_out: "auth/logout".into(),
            recovery: "auth/refresh".into(),
        }
    }
}

/// Credentials posted to the sign-in endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    #[serde(deserialize_with = "deserialize_secret")]
    pub password: Secret<String>,
}

impl SignInRequest {
    pub fn new(email: impl Into<String>, password: impl Into<Secret<String>>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }

    pub(crate) fn to_body(&self) -> Value {
        serde_json::json!({
            "email": self.email,
            "password": self.password.expose(),
        })
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(d: D) -> Result<Secret<String>, D::Error> {
    String::deserialize(d).map(Secret::new)
}

/// Access token plus the refresh token when the backend rotated it.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: Secret<String>,
    pub refresh: Option<Secret<String>>,
}

#[derive(Deserialize)]
struct RawTokens {
    #[serde(rename = "accessToken")]
    access_token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
}

impl TokenPair {
    /// Parse a recovery response body.
    pub fn from_recovery_body(status: u16, body: &Value) -> Result<Self, NormalizedError> {
        let succeeded = (200..300).contains(&status)
            && body.get("success").and_then(Value::as_bool) == Some(true);
        if !succeeded {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("refresh token rejected");
            return Err(NormalizedError::recovery_failed(format!(
                "recovery endpoint returned {status}: {message}"
            )));
        }

        let data = body.get("data").cloned().unwrap_or(Value::Null);
        let raw: RawTokens = serde_json::from_value(data).map_err(|e| {
            NormalizedError::recovery_failed(format!("invalid recovery payload: {e}"))
        })?;

        let access = raw
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| NormalizedError::recovery_failed("recovery payload has no accessToken"))?;

        Ok(Self {
            access: Secret::new(access),
            refresh: raw.refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
        })
    }
}

/// Response envelope fields that are not part of a user profile.
const ENVELOPE_KEYS: &[&str] = &["success", "message"];

/// Flat sign-in payload: the user profile plus both tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct SignInPayload {
    #[serde(deserialize_with = "deserialize_subject_id")]
    pub id: u64,
    #[serde(rename = "accessToken", deserialize_with = "deserialize_secret")]
    pub access_token: Secret<String>,
    #[serde(rename = "refreshToken", deserialize_with = "deserialize_secret")]
    pub refresh_token: Secret<String>,
    /// Every other user field, passed through untouched.
    #[serde(flatten)]
    pub profile: Map<String, Value>,
}

impl SignInPayload {
    /// Parse a sign-in response, with or without a `data` envelope.
    pub fn from_body(status: u16, body: Value) -> Result<Self, NormalizedError> {
        if !(200..300).contains(&status) || body.get("success").and_then(Value::as_bool) == Some(false)
        {
            return Err(NormalizedError::from_upstream(status, &body));
        }

        let (payload, flat) = match body {
            Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => {
                (map.remove("data").unwrap_or(Value::Null), false)
            }
            other => (other, true),
        };

        let mut parsed: Self = serde_json::from_value(payload).map_err(|e| {
            NormalizedError::new(
                codes::INVALID_RESPONSE,
                format!("invalid sign-in payload: {e}"),
                500,
            )
        })?;
        if flat {
            // Envelope keys share the top level with the user fields
            for key in ENVELOPE_KEYS {
                parsed.profile.remove(*key);
            }
        }
        Ok(parsed)
    }

    /// User fields safe to hand to the browser (no tokens).
    pub fn public_profile(&self) -> Value {
        let mut profile = self.profile.clone();
        profile.insert("id".into(), Value::from(self.id));
        Value::Object(profile)
    }
}

/// User ids arrive as numbers or numeric strings depending on the endpoint.
fn deserialize_subject_id<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Number(u64),
        Text(String),
    }

    match Id::deserialize(d)? {
        Id::Number(n) => Ok(n),
        Id::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Outcome of the best-effort upstream sign-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SignOutOutcome {
    Acknowledged,
    Skipped,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recovery_success_parses_both_tokens() {
        let body = json!({"success": true, "data": {"accessToken": "at_new", "refreshToken": "rt_new"}});
        let pair = TokenPair::from_recovery_body(200, &body).unwrap();
        assert_eq!(pair.access.expose(), "at_new");
        assert_eq!(pair.refresh.unwrap().expose(), "rt_new");
    }

    #[test]
    fn recovery_without_rotation_keeps_refresh_none() {
        let body = json!({"success": true, "data": {"accessToken": "at_new"}});
        let pair = TokenPair::from_recovery_body(200, &body).unwrap();
        assert!(pair.refresh.is_none());
    }

    #[test]
    fn recovery_failure_message_is_carried() {
        let body = json!({"success": false, "message": "Refresh token expired"});
        let err = TokenPair::from_recovery_body(401, &body).unwrap_err();
        assert_eq!(err.code, codes::RECOVERY_FAILED);
        assert!(err.message.contains("Refresh token expired"));
    }

    #[test]
    fn recovery_success_flag_false_is_failure_even_on_200() {
        let body = json!({"success": false, "message": "revoked"});
        assert!(TokenPair::from_recovery_body(200, &body).is_err());
    }

    #[test]
    fn recovery_missing_access_token_is_failure() {
        let body = json!({"success": true, "data": {"refreshToken": "rt"}});
        assert!(TokenPair::from_recovery_body(200, &body).is_err());
    }

    #[test]
    fn sign_in_payload_accepts_envelope_and_string_id() {
        let body = json!({
            "success": true,
            "message": "Login successful",
            "data": {"id": "17", "email": "ops@example.com", "accessToken": "at", "refreshToken": "rt"}
        });
        let payload = SignInPayload::from_body(200, body).unwrap();
        assert_eq!(payload.id, 17);
        assert_eq!(payload.profile["email"], "ops@example.com");
    }

    #[test]
    fn sign_in_payload_accepts_flat_body() {
        let body = json!({"id": 3, "accessToken": "at", "refreshToken": "rt", "fullName": "Ada"});
        let payload = SignInPayload::from_body(200, body).unwrap();
        assert_eq!(payload.id, 3);
        let public = payload.public_profile();
        assert_eq!(public["fullName"], "Ada");
        assert!(public.get("accessToken").is_none());
        assert!(public.get("refreshToken").is_none());
    }

    #[test]
    fn flat_body_envelope_keys_stay_out_of_profile() {
        let body = json!({
            "success": true,
            "message": "Login successful",
            "id": 3,
            "name": "Ada",
            "accessToken": "at",
            "refreshToken": "rt"
        });
        let public = SignInPayload::from_body(200, body).unwrap().public_profile();
        assert_eq!(public, json!({"id": 3, "name": "Ada"}));
    }

    #[test]
    fn sign_in_rejection_is_normalized() {
        let body = json!({"success": false, "message": "Invalid credentials"});
        let err = SignInPayload::from_body(401, body).unwrap_err();
        assert_eq!(err.http_status, 401);
        assert_eq!(err.message, "Invalid credentials");
    }

    #[test]
    fn sign_in_request_debug_hides_password() {
        let request = SignInRequest::new("a@b.c", "hunter2");
        assert!(!format!("{request:?}").contains("hunter2"));
        assert_eq!(request.to_body()["password"], "hunter2");
    }
}
