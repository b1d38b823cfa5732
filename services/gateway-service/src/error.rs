//! JSON error responses
//!
//! Every failure the service produces itself goes out as
//! `{success:false, error:{code, message}}` with the normalized status.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gateway::NormalizedError;

/// Render a normalized error as an HTTP response.
pub fn error_response(error: &NormalizedError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        error.to_body().to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway::codes;

    #[tokio::test]
    async fn error_response_uses_normalized_status_and_shape() {
        let resp = error_response(&NormalizedError::proxy_error("connection refused"));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["code"], codes::PROXY_ERROR);
        assert_eq!(body["error"]["message"], "connection refused");
    }

    #[test]
    fn out_of_range_status_falls_back_to_500() {
        let resp = error_response(&NormalizedError::new(codes::UNKNOWN_ERROR, "odd", 42));
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
