//! `/api/preload` handler.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use devpulse_api_types::{ActionResponse, PreloadRequest};

use crate::cache::{InvalidationError, Provider, required};

use super::HttpState;
use super::cache::as_data;
use super::error::ApiError;

pub(super) async fn post_preload(
    State(state): State<HttpState>,
    payload: Result<Json<PreloadRequest>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(request) = payload?;
    let warmer = state.cache.warmer();

    let report = match request {
        PreloadRequest::Intelligent {
            user_id,
            navigation_patterns,
        } => {
            let user_id = required(user_id, "userId")?;
            let patterns = navigation_patterns
                .ok_or_else(|| InvalidationError::validation("navigationPatterns is required"))?;
            warmer.intelligent_preload(&user_id, &patterns).await?
        }
        PreloadRequest::TimeBased {
            user_id,
            time_based_paths,
        } => {
            let user_id = required(user_id, "userId")?;
            warmer
                .time_based_preload(&user_id, &time_based_paths.unwrap_or_default())
                .await?
        }
        PreloadRequest::Critical { user_id } => {
            let user_id = required(user_id, "userId")?;
            warmer.warm_critical_session(&user_id).await?
        }
        PreloadRequest::ProviderSpecific { user_id, provider } => {
            let user_id = required(user_id, "userId")?;
            let provider: Provider = required(provider, "provider")?.parse()?;
            warmer.warm_provider(&user_id, provider).await?
        }
    };

    Ok(Json(ActionResponse::ok().with_data(as_data(&report)?)))
}
