//! Upstream response classification and the normalized response envelope

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::error::NormalizedError;

/// Maximum number of characters of a non-JSON body written to the log.
const LOGGED_BODY_LIMIT: usize = 2048;

/// What the upstream sent back, by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamBody {
    /// Parsed JSON. An empty body counts as `null` unless it was labelled
    /// with a non-JSON content type.
    Structured(Value),
    /// Anything else, kept raw for diagnosis.
    Unstructured {
        content_type: Option<String>,
        raw: String,
    },
}

impl UpstreamBody {
    /// Classify a response body by its `Content-Type` and content.
    ///
    /// A JSON content type with an unparseable body is unstructured too, and
    /// so is an empty body labelled `text/html` or similar.
    pub fn classify(content_type: Option<&str>, bytes: &[u8]) -> Self {
        let is_json = content_type.is_some_and(is_json_content_type);
        if bytes.is_empty() && (is_json || content_type.is_none()) {
            return UpstreamBody::Structured(Value::Null);
        }
        if is_json {
            if let Ok(value) = serde_json::from_slice(bytes) {
                return UpstreamBody::Structured(value);
            }
        }
        UpstreamBody::Unstructured {
            content_type: content_type.map(str::to_owned),
            raw: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Turn into a relay result. Unstructured bodies become
    /// `INVALID_RESPONSE` and are logged.
    pub fn into_result(self, status: u16) -> UpstreamResult {
        match self {
            UpstreamBody::Structured(body) => Ok(RelayResponse { status, body }),
            UpstreamBody::Unstructured { content_type, raw } => {
                let logged: String = raw.chars().take(LOGGED_BODY_LIMIT).collect();
                error!(
                    status,
                    content_type = content_type.as_deref().unwrap_or("<none>"),
                    body = %logged,
                    "upstream returned a non-JSON response"
                );
                Err(NormalizedError::invalid_response(format!(
                    "upstream returned non-JSON response (status {status}, content-type {})",
                    content_type.as_deref().unwrap_or("<none>")
                )))
            }
        }
    }
}

fn is_json_content_type(value: &str) -> bool {
    let mime = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    mime == "application/json" || mime.ends_with("+json")
}

/// A structurally valid upstream answer: status and JSON body, unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayResponse {
    pub status: u16,
    pub body: Value,
}

impl RelayResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Outcome of one relay.
pub type UpstreamResult = std::result::Result<RelayResponse, NormalizedError>;

/// The only shape the typed API wrapper hands to application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NormalizedResponse<T> {
    Success {
        success: bool,
        #[serde(default)]
        message: String,
        data: T,
    },
    Failure {
        success: bool,
        error: NormalizedError,
    },
}

impl<T> NormalizedResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        NormalizedResponse::Success {
            success: true,
            message: message.into(),
            data,
        }
    }

    pub fn failed(error: NormalizedError) -> Self {
        NormalizedResponse::Failure {
            success: false,
            error,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NormalizedResponse::Success { .. })
    }

    pub fn into_result(self) -> std::result::Result<T, NormalizedError> {
        match self {
            NormalizedResponse::Success { data, .. } => Ok(data),
            NormalizedResponse::Failure { error, .. } => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use serde_json::json;

    #[test]
    fn json_content_types_are_structured() {
        let body = UpstreamBody::classify(Some("application/json; charset=utf-8"), br#"{"a":1}"#);
        assert_eq!(body, UpstreamBody::Structured(json!({"a": 1})));

        let problem = UpstreamBody::classify(Some("application/problem+json"), br#"{"b":2}"#);
        assert!(matches!(problem, UpstreamBody::Structured(_)));
    }

    #[test]
    fn html_is_unstructured() {
        let body = UpstreamBody::classify(Some("text/html"), b"<html>502 Bad Gateway</html>");
        assert!(matches!(body, UpstreamBody::Unstructured { .. }));
    }

    #[test]
    fn malformed_json_is_unstructured() {
        let body = UpstreamBody::classify(Some("application/json"), b"{not json");
        assert!(matches!(body, UpstreamBody::Unstructured { .. }));
    }

    #[test]
    fn empty_body_is_null() {
        let body = UpstreamBody::classify(None, b"");
        assert_eq!(body, UpstreamBody::Structured(Value::Null));
    }

    #[test]
    fn empty_body_with_html_content_type_is_unstructured() {
        let body = UpstreamBody::classify(Some("text/html"), b"");
        assert!(matches!(body, UpstreamBody::Unstructured { .. }));

        let err = body.into_result(502).unwrap_err();
        assert_eq!(err.code, codes::INVALID_RESPONSE);
        assert_eq!(err.http_status, 500);
    }

    #[test]
    fn empty_body_with_json_content_type_is_null() {
        let body = UpstreamBody::classify(Some("application/json"), b"");
        assert_eq!(body, UpstreamBody::Structured(Value::Null));
    }

    #[test]
    fn unstructured_becomes_invalid_response_500() {
        let err = UpstreamBody::classify(Some("text/html"), b"<html></html>")
            .into_result(502)
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_RESPONSE);
        assert_eq!(err.http_status, 500);
    }

    #[test]
    fn structured_keeps_status_and_body() {
        let relayed = UpstreamBody::Structured(json!({"success": false}))
            .into_result(404)
            .unwrap();
        assert_eq!(relayed.status, 404);
        assert!(!relayed.is_success());
    }

    #[test]
    fn normalized_response_round_trips_both_shapes() {
        let ok: NormalizedResponse<Value> =
            serde_json::from_value(json!({"success": true, "message": "ok", "data": [1]})).unwrap();
        assert!(ok.is_success());

        let failed: NormalizedResponse<Value> = serde_json::from_value(json!({
            "success": false,
            "error": {"code": "PROXY_ERROR", "message": "down", "httpStatus": 500}
        }))
        .unwrap();
        assert_eq!(failed.into_result().unwrap_err().code, codes::PROXY_ERROR);
    }
}
