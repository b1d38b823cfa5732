//! Upstream relay
//!
//! Forwards one call to the upstream backend with the session's access token
//! attached. Every relay resolves its own token and shares nothing mutable
//! with other relays, so any number can run concurrently.

use std::time::Duration;

use bytes::Bytes;
use common::Secret;
use reqwest::Method;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::Value;
use session::SessionStore;
use tracing::{debug, error, instrument, warn};

use crate::auth::{Endpoints, SignInPayload, SignInRequest, SignOutOutcome, TokenPair};
use crate::error::{NormalizedError, codes};
use crate::response::{UpstreamBody, UpstreamResult};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers that never reach upstream. Credentials come from the
/// session store only; host and length are recomputed by the client.
const NEVER_FORWARDED: &[&str] = &["authorization", "cookie", "host", "content-length"];

/// One outbound call: method, path under the upstream base, query, headers,
/// and an optional body forwarded byte-for-byte.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl RelayRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_json(self, body: &Value) -> Self {
        let bytes = serde_json::to_vec(body).unwrap_or_default();
        self.with_body(bytes)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }
}

/// Join `path` and `query` under the upstream base.
///
/// `join_upstream_url("https://api/v1/", "orders/5", Some("page=2"))` is
/// `https://api/v1/orders/5?page=2`.
pub fn join_upstream_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    if let Some(q) = query.map(|q| q.trim_start_matches('?')).filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Check a still-encoded path before it goes under the upstream base.
///
/// Segments are compared after percent-decoding, so `%2E%2E` and `..%2F`
/// count as dot segments. The path itself is forwarded encoded.
pub fn checked_path(path: &str) -> Result<&str, NormalizedError> {
    let invalid = |reason: &str| {
        NormalizedError::new(
            codes::INVALID_REQUEST,
            format!("path {path:?} {reason}"),
            400,
        )
    };
    if path.contains(['#', '?']) {
        return Err(invalid("contains a fragment or query delimiter"));
    }
    for segment in path.split('/') {
        let decoded =
            urlencoding::decode(segment).map_err(|_| invalid("is not valid percent-encoded UTF-8"))?;
        if decoded.split(['/', '\\']).any(|part| part == "." || part == "..") {
            return Err(invalid("contains a dot segment"));
        }
    }
    Ok(path)
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_forwardable(name: &str) -> bool {
    !is_hop_by_hop(name) && !NEVER_FORWARDED.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// The credential-injecting relay.
#[derive(Debug, Clone)]
pub struct Gateway {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    endpoints: Endpoints,
}

impl Gateway {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
            endpoints: Endpoints::default(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Relay one call with the session's access token attached.
    ///
    /// Without a stored access token the call goes out unauthenticated and the
    /// upstream decides (normally a 401).
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn relay(&self, store: &dyn SessionStore, request: RelayRequest) -> UpstreamResult {
        let access = store.read_access_credential().await;
        if access.is_none() {
            debug!("no access credential, relaying unauthenticated");
        }
        self.send(request, access.as_ref()).await
    }

    /// Trade a refresh token for a new access token.
    #[instrument(skip_all)]
    pub async fn recover(&self, refresh: &Secret<String>) -> Result<TokenPair, NormalizedError> {
        let request = RelayRequest::new(Method::POST, self.endpoints.recovery.clone());
        let relayed = self
            .send(request, Some(refresh))
            .await
            .map_err(|e| NormalizedError::recovery_failed(e.message))?;
        TokenPair::from_recovery_body(relayed.status, &relayed.body)
    }

    /// Exchange email and password for a session payload.
    #[instrument(skip_all, fields(email = %credentials.email))]
    pub async fn sign_in(
        &self,
        credentials: &SignInRequest,
    ) -> Result<SignInPayload, NormalizedError> {
        let request = RelayRequest::new(Method::POST, self.endpoints.sign_in.clone())
            .with_json(&credentials.to_body());
        let relayed = self.send(request, None).await?;
        SignInPayload::from_body(relayed.status, relayed.body)
    }

    /// Tell the upstream the session is over. Never fails: callers clear the
    /// local session whatever happens here.
    #[instrument(skip_all)]
    pub async fn sign_out(&self, access: Option<&Secret<String>>) -> SignOutOutcome {
        let Some(access) = access else {
            return SignOutOutcome::Skipped;
        };
        let request = RelayRequest::new(Method::POST, self.endpoints.sign_out.clone());
        match self.send(request, Some(access)).await {
            Ok(relayed) if relayed.is_success() => SignOutOutcome::Acknowledged,
            Ok(relayed) => {
                warn!(status = relayed.status, "upstream sign-out rejected");
                SignOutOutcome::Failed(format!("upstream returned {}", relayed.status))
            }
            Err(e) => {
                warn!(error = %e, "upstream sign-out failed");
                SignOutOutcome::Failed(e.message)
            }
        }
    }

    async fn send(&self, request: RelayRequest, bearer: Option<&Secret<String>>) -> UpstreamResult {
        let path = checked_path(&request.path)?;
        let url = join_upstream_url(&self.base_url, path, request.query.as_deref());

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            if is_forwardable(name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }

        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&token.bearer()).map_err(|e| {
                NormalizedError::proxy_error(format!("credential is not a valid header value: {e}"))
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let mut outbound = self
            .client
            .request(request.method.clone(), &url)
            .timeout(self.timeout);

        if let Some(body) = request.body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            outbound = outbound.body(body);
        }

        let response = outbound.headers(headers).send().await.map_err(|e| {
            error!(error = %e, url = %url, "upstream request failed");
            NormalizedError::proxy_error(e.to_string())
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let bytes = response.bytes().await.map_err(|e| {
            error!(error = %e, status, "failed to read upstream response body");
            NormalizedError::proxy_error(format!("upstream response read error: {e}"))
        })?;

        debug!(status, bytes = bytes.len(), "upstream responded");
        UpstreamBody::classify(content_type.as_deref(), &bytes).into_result(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use session::{MemorySessionStore, Session};
    use tokio::net::TcpListener;

    #[test]
    fn join_appends_path_and_query() {
        assert_eq!(
            join_upstream_url("https://api.test/v1", "orders/5", Some("page=2")),
            "https://api.test/v1/orders/5?page=2"
        );
        assert_eq!(
            join_upstream_url("https://api.test/v1/", "/orders", None),
            "https://api.test/v1/orders"
        );
        assert_eq!(
            join_upstream_url("https://api.test", "orders", Some("")),
            "https://api.test/orders"
        );
    }

    #[test]
    fn encoded_paths_pass_unchanged() {
        assert_eq!(checked_path("tags/%23urgent").unwrap(), "tags/%23urgent");
        assert_eq!(checked_path("a%3Fadmin=1").unwrap(), "a%3Fadmin=1");
        assert_eq!(checked_path("files/report..v2.pdf").unwrap(), "files/report..v2.pdf");
    }

    #[test]
    fn dot_segments_are_rejected_encoded_or_not() {
        for path in [
            "../secret",
            "x/./y",
            "x/%2E%2E/secret",
            "x/..%2F..%2Fsecret",
            "x/..%5Csecret",
            "orders#frag",
            "orders?page=2",
        ] {
            let err = checked_path(path).unwrap_err();
            assert_eq!(err.code, codes::INVALID_REQUEST, "{path}");
            assert_eq!(err.http_status, 400, "{path}");
        }
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_forwardable("Cookie"));
        assert!(!is_forwardable("authorization"));
        assert!(is_forwardable("x-request-id"));
    }

    /// Start a mock upstream that echoes the request, or serves fixed
    /// responses on `/html` and `/teapot`.
    async fn start_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            let app = axum::Router::new()
                .route(
                    "/html",
                    axum::routing::get(|| async {
                        (
                            StatusCode::BAD_GATEWAY,
                            [("content-type", "text/html")],
                            "<html><body>nginx</body></html>",
                        )
                    }),
                )
                .route(
                    "/teapot",
                    axum::routing::get(|| async {
                        (
                            StatusCode::IM_A_TEAPOT,
                            axum::Json(serde_json::json!({"success": false, "message": "short and stout"})),
                        )
                    }),
                )
                .fallback(|request: Request<Body>| async move {
                    let authorization = request
                        .headers()
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    let content_type = request
                        .headers()
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    let cookie = request.headers().get("cookie").is_some();
                    let method = request.method().to_string();
                    let path = request.uri().path().to_string();
                    let query = request.uri().query().map(str::to_owned);
                    let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                        .await
                        .unwrap();
                    axum::Json(serde_json::json!({
                        "authorization": authorization,
                        "content_type": content_type,
                        "cookie_forwarded": cookie,
                        "method": method,
                        "path": path,
                        "query": query,
                        "body": String::from_utf8_lossy(&body),
                    }))
                });
            axum::serve(listener, app).await.unwrap();
        });

        url
    }

    fn gateway(url: &str) -> Gateway {
        Gateway::new(reqwest::Client::new(), url, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn relay_attaches_bearer_and_joins_path() {
        let url = start_upstream().await;
        let store = MemorySessionStore::with_session(Session::new("at_live", "rt_live", 1));

        let request = RelayRequest::new(Method::GET, "orders/5").with_query("page=2");
        let relayed = gateway(&url).relay(&store, request).await.unwrap();

        assert_eq!(relayed.status, 200);
        assert_eq!(relayed.body["path"], "/orders/5");
        assert_eq!(relayed.body["query"], "page=2");
        assert_eq!(relayed.body["authorization"], "Bearer at_live");
    }

    #[tokio::test]
    async fn relay_without_session_omits_authorization() {
        let url = start_upstream().await;
        let store = MemorySessionStore::new();

        let relayed = gateway(&url)
            .relay(&store, RelayRequest::new(Method::GET, "orders"))
            .await
            .unwrap();
        assert!(relayed.body["authorization"].is_null());
    }

    #[tokio::test]
    async fn relay_sets_json_content_type_and_forwards_body() {
        let url = start_upstream().await;
        let store = MemorySessionStore::new();

        let request = RelayRequest::new(Method::PATCH, "orders/5").with_body(r#"{"status":"paid"}"#);
        let relayed = gateway(&url).relay(&store, request).await.unwrap();

        assert_eq!(relayed.body["method"], "PATCH");
        assert_eq!(relayed.body["content_type"], "application/json");
        assert_eq!(relayed.body["body"], r#"{"status":"paid"}"#);
    }

    #[tokio::test]
    async fn relay_never_forwards_inbound_credentials() {
        let url = start_upstream().await;
        let store = MemorySessionStore::new();

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer forged"));
        headers.insert("cookie", HeaderValue::from_static("accessToken=at"));
        let request = RelayRequest::new(Method::GET, "me").with_headers(headers);
        let relayed = gateway(&url).relay(&store, request).await.unwrap();

        assert!(relayed.body["authorization"].is_null());
        assert_eq!(relayed.body["cookie_forwarded"], false);
    }

    #[tokio::test]
    async fn upstream_json_errors_pass_through_unchanged() {
        let url = start_upstream().await;
        let store = MemorySessionStore::new();

        let relayed = gateway(&url)
            .relay(&store, RelayRequest::new(Method::GET, "teapot"))
            .await
            .unwrap();
        assert_eq!(relayed.status, 418);
        assert_eq!(relayed.body["message"], "short and stout");
    }

    #[tokio::test]
    async fn html_error_page_becomes_invalid_response() {
        let url = start_upstream().await;
        let store = MemorySessionStore::new();

        let err = gateway(&url)
            .relay(&store, RelayRequest::new(Method::GET, "html"))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_RESPONSE);
        assert_eq!(err.http_status, 500);
    }

    #[tokio::test]
    async fn traversal_is_rejected_before_any_upstream_call() {
        let store = MemorySessionStore::with_session(Session::new("at_live", "rt_live", 1));
        // Nothing listens here; reaching the network would be PROXY_ERROR
        let err = gateway("http://127.0.0.1:1/v1")
            .relay(&store, RelayRequest::new(Method::GET, "x/..%2F..%2Fsecret"))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_proxy_error() {
        // Bind then drop to get a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let store = MemorySessionStore::new();
        let err = gateway(&url)
            .relay(&store, RelayRequest::new(Method::GET, "orders"))
            .await
            .unwrap_err();
        assert_eq!(err.code, codes::PROXY_ERROR);
        assert_eq!(err.http_status, 500);
        assert!(!err.message.is_empty());
    }

    #[tokio::test]
    async fn sign_out_without_token_is_skipped() {
        let gateway = gateway("http://127.0.0.1:9");
        assert_eq!(gateway.sign_out(None).await, SignOutOutcome::Skipped);
    }
}
