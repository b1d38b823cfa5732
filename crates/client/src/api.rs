//! Typed API wrapper
//!
//! The call surface for application code. One method per verb; each returns
//! the decoded `data` of a successful response or an [`ApiError`] carrying
//! the normalized code, message, and status. Credential expiry never reaches
//! this layer except as `RECOVERY_FAILED`.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use gateway::{
    Gateway, NormalizedError, NormalizedResponse, RelayRequest, RelayResponse, SignInRequest,
    SignOutOutcome, codes,
};
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use session::{Session, SessionStore};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::events::SessionEvent;
use crate::lifecycle::LifecycleManager;
use crate::transport::{GatewayTransport, Transport};

/// Per-call options: query, body, and header overrides.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    query: Option<String>,
    body: Option<Value>,
    headers: HeaderMap,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    /// Attach a JSON body.
    pub fn json<B: Serialize>(mut self, body: &B) -> ApiResult<Self> {
        let value = serde_json::to_value(body).map_err(|e| {
            ApiError(NormalizedError::new(
                codes::INVALID_REQUEST,
                format!("request body is not serializable: {e}"),
                400,
            ))
        })?;
        self.body = Some(value);
        Ok(self)
    }

    /// Override a header for this call. Invalid names or values are
    /// rejected rather than silently dropped.
    pub fn header(mut self, name: &str, value: &str) -> ApiResult<Self> {
        let invalid = |e: String| {
            ApiError(NormalizedError::new(
                codes::INVALID_REQUEST,
                format!("invalid header {name}: {e}"),
                400,
            ))
        };
        let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(self)
    }
}

/// Decoded success: the upstream's `message` and typed `data`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse<T> {
    pub status: u16,
    pub message: String,
    pub data: T,
}

impl<T> ApiResponse<T> {
    /// Fold a call result into the wire envelope.
    pub fn normalize(result: ApiResult<ApiResponse<T>>) -> NormalizedResponse<T> {
        match result {
            Ok(response) => NormalizedResponse::ok(response.message, response.data),
            Err(e) => NormalizedResponse::failed(e.into_normalized()),
        }
    }
}

/// Application-facing client composing the lifecycle manager and gateway.
#[derive(Clone)]
pub struct ApiClient {
    lifecycle: Arc<LifecycleManager>,
}

impl ApiClient {
    /// Compose an in-process client: calls relay through `gateway` using
    /// credentials from `store`.
    pub fn new(gateway: Gateway, store: Arc<dyn SessionStore>) -> Self {
        let transport = Arc::new(GatewayTransport::new(gateway, store.clone()));
        Self::with_transport(transport, store)
    }

    /// Convenience constructor with a default `reqwest` client.
    pub fn for_upstream(base_url: &str, timeout: Duration, store: Arc<dyn SessionStore>) -> Self {
        Self::new(
            Gateway::new(reqwest::Client::new(), base_url, timeout),
            store,
        )
    }

    pub fn with_transport(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            lifecycle: Arc::new(LifecycleManager::new(transport, store)),
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    /// Session change notifications; `Expired` means redirect to sign-in.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.lifecycle.subscribe()
    }

    /// Id of the signed-in user, without a network round trip.
    pub async fn current_subject_id(&self) -> Option<u64> {
        self.lifecycle.store().read_subject_id().await
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        self.call(Method::GET, path, options).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        self.call(Method::POST, path, options).await
    }

    pub async fn put<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        self.call(Method::PUT, path, options).await
    }

    pub async fn patch<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        self.call(Method::PATCH, path, options).await
    }

    pub async fn delete<T: DeserializeOwned>(
        &self,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        self.call(Method::DELETE, path, options).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> ApiResult<ApiResponse<T>> {
        let request = build_request(method, path, options);
        let relayed = self.lifecycle.execute(request).await?;
        decode(relayed)
    }

    /// Sign in and store the new session. Returns the user profile without
    /// tokens.
    pub async fn sign_in(&self, email: &str, password: Secret<String>) -> ApiResult<Value> {
        let credentials = SignInRequest::new(email, password);
        let payload = self.lifecycle.transport().sign_in(&credentials).await?;

        let session = Session::new(
            payload.access_token.clone(),
            payload.refresh_token.clone(),
            payload.id,
        );
        self.lifecycle.store().write(session).await.map_err(|e| {
            ApiError(NormalizedError::new(
                codes::UNKNOWN_ERROR,
                format!("storing session: {e}"),
                500,
            ))
        })?;

        info!(subject_id = payload.id, "signed in");
        self.lifecycle.emit(SessionEvent::SignedIn {
            subject_id: payload.id,
        });
        Ok(payload.public_profile())
    }

    /// Sign out: tell the upstream (best effort), then clear the local
    /// session no matter what the upstream said.
    pub async fn sign_out(&self) -> ApiResult<SignOutOutcome> {
        let store = self.lifecycle.store();
        let access = store.read_access_credential().await;
        let outcome = self.lifecycle.transport().sign_out(access.as_ref()).await;
        if let SignOutOutcome::Failed(reason) = &outcome {
            warn!(reason, "upstream sign-out failed, clearing local session anyway");
        }

        store.clear().await.map_err(|e| {
            ApiError(NormalizedError::new(
                codes::UNKNOWN_ERROR,
                format!("clearing session: {e}"),
                500,
            ))
        })?;
        self.lifecycle.emit(SessionEvent::SignedOut);
        Ok(outcome)
    }
}

fn build_request(method: Method, path: &str, options: RequestOptions) -> RelayRequest {
    // A query embedded in the path is kept; an explicit one is appended.
    let (path, inline_query) = match path.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (path, None),
    };
    let query = match (inline_query, options.query) {
        (Some(a), Some(b)) => Some(format!("{a}&{b}")),
        (a, b) => a.or(b),
    };

    let mut request = RelayRequest::new(method, path).with_headers(options.headers);
    if let Some(query) = query {
        request = request.with_query(query);
    }
    if let Some(body) = options.body {
        request = request.with_json(&body);
    }
    request
}

/// Decode a relayed answer into a typed response or a typed error.
///
/// A 2xx whose body says `success:false` is a business failure too.
fn decode<T: DeserializeOwned>(relayed: RelayResponse) -> ApiResult<ApiResponse<T>> {
    let RelayResponse { status, body } = relayed;
    let flagged_failure = body.get("success").and_then(Value::as_bool) == Some(false);
    if !(200..300).contains(&status) || flagged_failure {
        return Err(ApiError(NormalizedError::from_upstream(status, &body)));
    }

    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let data = match body {
        Value::Object(mut map) if map.contains_key("data") => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };

    let data = serde_json::from_value(data).map_err(|e| {
        ApiError(NormalizedError::invalid_response(format!(
            "response data did not match the expected type: {e}"
        )))
    })?;

    Ok(ApiResponse {
        status,
        message,
        data,
    })
}
