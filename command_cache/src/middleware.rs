//! Request body limits and request logging.

use axum::{extract::Request, http::StatusCode, middleware::Next, response::Response};
use std::time::Instant;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{info, warn};

/// Create request body size limit layer
pub fn create_body_limit_layer(max_bytes: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_bytes)
}

/// Log every request with its status and latency; error responses at warn level
pub async fn request_logging_middleware(
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed = start.elapsed();

    if status.is_client_error() || status.is_server_error() {
        warn!("{} {} -> {} in {:?}", method, uri, status, elapsed);
    } else {
        info!("{} {} -> {} in {:?}", method, uri, status, elapsed);
    }

    Ok(response)
}
