//! 请求级错误类型与 HTTP 响应映射。

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use std::fmt;
use tracing::error;

use crate::frontend::render_message;

#[derive(Debug)]
pub enum DropError {
    AuthFailed,
    AlreadyBlocked,
    RateExceeded(u64),
    NoFileProvided,
    BadRequest(String),
    PayloadTooLarge,
    Internal(String),
}

impl fmt::Display for DropError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropError::AuthFailed => f.write_str("wrong code"),
            DropError::AlreadyBlocked => f.write_str("address blocked"),
            DropError::RateExceeded(retry_after) => {
                write!(f, "too many uploads, retry in {retry_after}s")
            }
            DropError::NoFileProvided => f.write_str("no file"),
            DropError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            DropError::PayloadTooLarge => f.write_str("upload too large"),
            DropError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl IntoResponse for DropError {
    fn into_response(self) -> Response {
        match self {
            // Rejections are rendered as 200 pages so the browser form stays simple.
            DropError::AuthFailed => Html(render_message("wrong code")).into_response(),
            DropError::AlreadyBlocked => {
                Html(render_message("wrong code: this device is blocked")).into_response()
            }
            DropError::RateExceeded(retry_after) => {
                let mut headers = HeaderMap::new();
                headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
                let body = render_message(&format!(
                    "too many uploads, try again in {retry_after} seconds"
                ));
                (StatusCode::TOO_MANY_REQUESTS, headers, Html(body)).into_response()
            }
            DropError::NoFileProvided => {
                (StatusCode::BAD_REQUEST, Html(render_message("no file"))).into_response()
            }
            DropError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Html(render_message(&msg))).into_response()
            }
            DropError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                Html(render_message("upload too large")),
            )
                .into_response(),
            DropError::Internal(msg) => {
                error!(error = msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Html(render_message("something went wrong, please try again")),
                )
                    .into_response()
            }
        }
    }
}
