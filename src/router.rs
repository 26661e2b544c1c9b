//! 路由装配：表单页、上传入口、404 回退与通用中间件。

use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Router, middleware};
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::error::DropError;
use crate::frontend::{self, PageContext};
use crate::guard::AbuseGuard;
use crate::http::{add_security_headers, make_request_span};
use crate::session::SessionAuthenticator;
use crate::storage::UploadDir;
use crate::upload;

/// Shared state handed to every request.
pub struct AppState {
    pub session: Arc<SessionAuthenticator>,
    pub guard: Arc<AbuseGuard>,
    pub upload_dir: Arc<UploadDir>,
    pub page: Arc<PageContext>,
    /// Request body ceiling in bytes, `0` disables it.
    pub upload_max_size: u64,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = if state.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(state.upload_max_size).unwrap_or(usize::MAX))
    };

    Router::new()
        .route(
            "/",
            get(frontend::serve_form)
                .post(upload::upload_files)
                .layer(body_limit),
        )
        .fallback(frontend::not_found)
        .layer(middleware::from_fn(upload::block_gate))
        .layer(middleware::from_fn(add_security_headers))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| make_request_span(request))
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(state.session))
        .layer(Extension(state.guard))
        .layer(Extension(state.upload_dir))
        .layer(Extension(state.page))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(message) = err.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = err.downcast_ref::<&str>() {
        message.to_string()
    } else {
        "unknown panic".to_string()
    };
    DropError::Internal(format!("handler panicked: {detail}")).into_response()
}
