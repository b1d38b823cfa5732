//! Session routes
//!
//! The server half of the cookie session: sign-in sets the three cookies,
//! refresh rotates the token cookies, sign-out expires them. Tokens only ever
//! travel in `Set-Cookie` headers, never in a response body.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use gateway::{NormalizedError, SignInRequest, codes};
use serde_json::{Value, json};
use session::{CookieSessionStore, Session, SessionStore};
use tracing::{info, instrument, warn};

use crate::AppState;
use crate::error::error_response;
use crate::metrics;

fn cookie_store(state: &AppState, headers: &HeaderMap) -> CookieSessionStore {
    let header = headers.get(header::COOKIE).and_then(|v| v.to_str().ok());
    CookieSessionStore::from_cookie_header(header, state.cookies.clone())
}

/// JSON success body with the store's queued `Set-Cookie` values attached.
async fn with_cookies(store: &CookieSessionStore, status: StatusCode, body: Value) -> Response {
    let mut response = (status, axum::Json(body)).into_response();
    attach_cookies(store, &mut response).await;
    response
}

async fn attach_cookies(store: &CookieSessionStore, response: &mut Response) {
    for cookie in store.take_set_cookies().await {
        match HeaderValue::from_str(&cookie) {
            Ok(value) => {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "dropping unrepresentable Set-Cookie value"),
        }
    }
}

fn store_failure(e: session::Error) -> NormalizedError {
    NormalizedError::new(codes::UNKNOWN_ERROR, format!("session store: {e}"), 500)
}

/// `POST /api/auth/login`
#[instrument(skip_all)]
pub async fn login(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let credentials: SignInRequest = match serde_json::from_slice(&body) {
        Ok(c) => c,
        Err(e) => {
            return error_response(&NormalizedError::new(
                codes::INVALID_REQUEST,
                format!("expected {{email, password}}: {e}"),
                400,
            ));
        }
    };

    let payload = match state.gateway.sign_in(&credentials).await {
        Ok(p) => p,
        Err(e) => {
            warn!(code = %e.code, status = e.http_status, "sign-in rejected");
            return error_response(&e);
        }
    };

    let store = cookie_store(&state, &headers);
    let session = Session::new(
        payload.access_token.clone(),
        payload.refresh_token.clone(),
        payload.id,
    );
    if let Err(e) = store.write(session).await {
        return error_response(&store_failure(e));
    }

    info!(subject_id = payload.id, "signed in");
    with_cookies(
        &store,
        StatusCode::OK,
        json!({"success": true, "message": "signed in", "data": payload.public_profile()}),
    )
    .await
}

/// `POST /api/auth/refresh`
///
/// Any failure expires all three cookies and answers `RECOVERY_FAILED`, which
/// the browser treats as "go to sign-in".
#[instrument(skip_all)]
pub async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let store = cookie_store(&state, &headers);

    let outcome = recover(&state, &store).await;
    metrics::record_recovery(outcome.is_ok());
    match outcome {
        Ok(subject_id) => {
            info!(subject_id, "session refreshed");
            with_cookies(
                &store,
                StatusCode::OK,
                json!({"success": true, "message": "token refreshed", "data": {"userId": subject_id}}),
            )
            .await
        }
        Err(e) => {
            warn!(message = %e.message, "refresh failed, clearing session cookies");
            if let Err(clear_err) = store.clear().await {
                warn!(error = %clear_err, "failed to clear session cookies");
            }
            let mut response = error_response(&e);
            attach_cookies(&store, &mut response).await;
            response
        }
    }
}

async fn recover(state: &AppState, store: &CookieSessionStore) -> Result<u64, NormalizedError> {
    let refresh = store
        .read_refresh_credential()
        .await
        .ok_or_else(|| NormalizedError::recovery_failed("no refresh token cookie"))?;
    let subject_id = store
        .read_subject_id()
        .await
        .ok_or_else(|| NormalizedError::recovery_failed("no userId cookie"))?;

    let pair = state.gateway.recover(&refresh).await?;
    let session = Session::recovered(pair.access, pair.refresh, refresh, subject_id);
    store
        .write(session)
        .await
        .map_err(|e| NormalizedError::recovery_failed(e.to_string()))?;
    Ok(subject_id)
}

/// `POST /api/auth/logout`
#[instrument(skip_all)]
pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let store = cookie_store(&state, &headers);
    let access = store.read_access_credential().await;
    let outcome = state.gateway.sign_out(access.as_ref()).await;

    if let Err(e) = store.clear().await {
        return error_response(&store_failure(e));
    }
    info!(?outcome, "signed out");
    with_cookies(
        &store,
        StatusCode::OK,
        json!({"success": true, "message": "signed out", "data": {"upstream": outcome}}),
    )
    .await
}

/// `GET /api/auth/session`
///
/// `authenticated` follows the `HttpOnly` refresh cookie. The readable
/// `userId` cookie is echoed for display and decides nothing.
pub async fn current_session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let store = cookie_store(&state, &headers);
    let authenticated = store.read_refresh_credential().await.is_some();
    let subject_id = store.read_subject_id().await;
    (
        StatusCode::OK,
        axum::Json(json!({
            "success": true,
            "message": "",
            "data": {"authenticated": authenticated, "userId": subject_id},
        })),
    )
        .into_response()
}
