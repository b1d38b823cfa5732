//! Relay route
//!
//! `/api/proxy/{*path}` forwards to the upstream base with the access token
//! taken from the `accessToken` cookie. The browser never sees the token and
//! never sends it as a header; whatever `Authorization` or `Cookie` it does
//! send stays here.

use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use gateway::{NormalizedError, RelayRequest, RelayResponse, codes};
use serde_json::{Value, json};
use session::CookieSessionStore;
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::error::error_response;
use crate::metrics;

/// Inbound bodies larger than this are rejected before relaying.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const PROXY_PREFIX: &str = "/api/proxy/";

/// The path tail after the proxy prefix, still percent-encoded.
fn proxied_path(uri: &Uri) -> &str {
    uri.path().strip_prefix(PROXY_PREFIX).unwrap_or_default()
}

/// Relay one inbound call and translate the outcome into a response.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %path))]
pub async fn relay(
    state: &AppState,
    path: String,
    request: Request,
    request_id: String,
) -> Response {
    let started = Instant::now();
    let _in_flight = state.stats.begin();
    let method = request.method().clone();

    let cookie_header = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let store = CookieSessionStore::from_cookie_header(cookie_header.as_deref(), state.cookies.clone());

    let mut outbound = RelayRequest::new(method.clone(), path).with_headers(request.headers().clone());
    if let Some(query) = request.uri().query() {
        outbound = outbound.with_query(query);
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let error = NormalizedError::new(
                codes::INVALID_REQUEST,
                format!("invalid request body: {e}"),
                400,
            );
            return finish_error(state, &error, method.as_str(), started);
        }
    };
    if !body.is_empty() {
        outbound = outbound.with_body(body);
    }

    match state.gateway.relay(&store, outbound).await {
        Ok(relayed) => {
            let status = relayed.status;
            metrics::record_request(status, method.as_str(), started.elapsed().as_secs_f64());
            info!(status, elapsed_ms = started.elapsed().as_millis() as u64, "relayed");
            relayed_response(relayed)
        }
        Err(error) => finish_error(state, &error, method.as_str(), started),
    }
}

fn finish_error(state: &AppState, error: &NormalizedError, method: &str, started: Instant) -> Response {
    state.stats.record_error();
    metrics::record_relay_error(&error.code);
    metrics::record_request(error.http_status, method, started.elapsed().as_secs_f64());
    warn!(code = %error.code, status = error.http_status, message = %error.message, "relay failed");
    error_response(error)
}

/// Upstream status and JSON body, unmodified.
///
/// An empty upstream body is only kept empty for statuses that forbid one;
/// otherwise the browser gets the normalized envelope for that status.
fn relayed_response(relayed: RelayResponse) -> Response {
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let success = relayed.is_success();
    let body = match relayed.body {
        Value::Null if matches!(relayed.status, 204 | 205 | 304) => {
            return status.into_response();
        }
        Value::Null if success => json!({"success": true, "message": "", "data": null}),
        Value::Null => NormalizedError::from_upstream(relayed.status, &Value::Null).to_body(),
        body => body,
    };
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        Body::from(body.to_string()),
    )
        .into_response()
}

/// axum handler wrapper: assigns the request id and takes the raw path tail.
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    let path = proxied_path(request.uri()).to_owned();
    relay(&state, path, request, request_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn relayed_response_keeps_status_and_body() {
        let resp = relayed_response(RelayResponse {
            status: 404,
            body: json!({"success": false, "message": "not found"}),
        });
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn empty_no_content_body_stays_empty() {
        let resp = relayed_response(RelayResponse {
            status: 204,
            body: Value::Null,
        });
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
    }

    #[tokio::test]
    async fn empty_error_body_gets_normalized_json() {
        let resp = relayed_response(RelayResponse {
            status: 401,
            body: Value::Null,
        });
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], codes::UNAUTHORIZED);
    }

    #[test]
    fn proxied_path_stays_encoded() {
        let uri: Uri = "/api/proxy/tags/%23urgent?page=2".parse().unwrap();
        assert_eq!(proxied_path(&uri), "tags/%23urgent");

        let uri: Uri = "/api/proxy/x/..%2Fsecret".parse().unwrap();
        assert_eq!(proxied_path(&uri), "x/..%2Fsecret");
    }
}
