//! Normalized error shape shared by every layer

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Stable error codes. Callers branch on these, never on `message`.
pub mod codes {
    /// Upstream answered with something other than JSON.
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    /// Upstream could not be reached (connect, DNS, timeout, body read).
    pub const PROXY_ERROR: &str = "PROXY_ERROR";
    /// Access token missing or expired.
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    /// Refresh token rejected; the session is over.
    pub const RECOVERY_FAILED: &str = "RECOVERY_FAILED";
    /// The inbound call could not be turned into an upstream call.
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    /// Upstream failure that carried no code of its own.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
}

/// `{code, message, httpStatus}` produced by every failing component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code} ({http_status}): {message}")]
pub struct NormalizedError {
    pub code: String,
    pub message: String,
    #[serde(rename = "httpStatus")]
    pub http_status: u16,
}

impl NormalizedError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, http_status: u16) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            http_status,
        }
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_RESPONSE, message, 500)
    }

    pub fn proxy_error(message: impl Into<String>) -> Self {
        Self::new(codes::PROXY_ERROR, message, 500)
    }

    pub fn recovery_failed(message: impl Into<String>) -> Self {
        Self::new(codes::RECOVERY_FAILED, message, 401)
    }

    /// Build from a non-2xx upstream response.
    ///
    /// Understands `{error:{code,message}}`, `{code,message}` and
    /// `{message}` bodies. A 401 without its own code becomes `UNAUTHORIZED`.
    pub fn from_upstream(status: u16, body: &Value) -> Self {
        let source = body.get("error").filter(|e| e.is_object()).unwrap_or(body);

        let code = source
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| match status {
                401 => codes::UNAUTHORIZED.to_owned(),
                _ => codes::UNKNOWN_ERROR.to_owned(),
            });

        let message = source
            .get("message")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| format!("upstream returned status {status}"));

        Self::new(code, message, status)
    }

    /// Wire body: `{success:false, error:{code, message}}`.
    pub fn to_body(&self) -> Value {
        json!({
            "success": false,
            "error": {
                "code": self.code,
                "message": self.message,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_are_500() {
        assert_eq!(NormalizedError::invalid_response("html").http_status, 500);
        assert_eq!(NormalizedError::proxy_error("refused").http_status, 500);
        assert_eq!(
            NormalizedError::proxy_error("refused").code,
            codes::PROXY_ERROR
        );
    }

    #[test]
    fn from_upstream_reads_nested_error() {
        let body = json!({"success": false, "error": {"code": "ORDER_LOCKED", "message": "locked"}});
        let err = NormalizedError::from_upstream(409, &body);
        assert_eq!(err.code, "ORDER_LOCKED");
        assert_eq!(err.message, "locked");
        assert_eq!(err.http_status, 409);
    }

    #[test]
    fn from_upstream_reads_flat_message() {
        let body = json!({"success": false, "message": "Token expired"});
        let err = NormalizedError::from_upstream(401, &body);
        assert_eq!(err.code, codes::UNAUTHORIZED);
        assert_eq!(err.message, "Token expired");
    }

    #[test]
    fn from_upstream_without_body_fields() {
        let err = NormalizedError::from_upstream(503, &Value::Null);
        assert_eq!(err.code, codes::UNKNOWN_ERROR);
        assert_eq!(err.message, "upstream returned status 503");
    }

    #[test]
    fn body_omits_http_status() {
        let body = NormalizedError::invalid_response("not json").to_body();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], "INVALID_RESPONSE");
        assert!(body["error"].get("httpStatus").is_none());
    }

    #[test]
    fn serde_uses_http_status_camel_case() {
        let err = NormalizedError::new("X", "y", 418);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["httpStatus"], 418);
    }
}
