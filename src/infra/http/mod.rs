//! HTTP surface of the cache engine.

mod cache;
mod error;
mod health;
mod middleware;
mod preload;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use axum::{Router, middleware as axum_middleware, routing::get, routing::post};

use crate::cache::CacheEngine;

use middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub cache: CacheEngine,
}

impl HttpState {
    pub fn new(cache: CacheEngine) -> Self {
        Self { cache }
    }
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/api/cache",
            get(cache::get_entry)
                .post(cache::post_action)
                .delete(cache::delete_entries),
        )
        .route("/api/cache/health", get(health::cache_health))
        .route("/api/cache/stats", get(health::cache_stats))
        .route("/api/preload", post(preload::post_preload))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}
