//! `/api/cache` handlers.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use devpulse_api_types::{
    ActionResponse, CacheAction, CacheDeleteQuery, CacheEntryQuery, CacheEntryResponse,
    InvalidationOp,
};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::cache::{
    CacheEngine, Category, DELIMITER, InvalidationError, InvalidationRequest, Provider, required,
};

use super::HttpState;
use super::error::ApiError;

const DEFAULT_KEY_LIMIT: usize = 100;
const MAX_KEY_LIMIT: usize = 1_000;

/// Blank parameters count as absent.
fn present(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(super) fn as_data<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|err| ApiError::internal(err.to_string()))
}

pub(super) async fn get_entry(
    State(state): State<HttpState>,
    Query(query): Query<CacheEntryQuery>,
) -> Result<Json<CacheEntryResponse>, ApiError> {
    let store = state.cache.store();

    if let Some(key) = present(query.key) {
        let key = store.keys().qualify(&key);
        let value = store.get_value(&key).await;
        let ttl = store.ttl(&key).await;
        return Ok(Json(CacheEntryResponse::Entry { key, value, ttl }));
    }

    if let Some(pattern) = present(query.pattern) {
        let pattern = store.keys().qualify(&pattern);
        let limit = query
            .limit
            .unwrap_or(DEFAULT_KEY_LIMIT)
            .clamp(1, MAX_KEY_LIMIT);
        let keys = store.keys_matching(&pattern, limit).await?;
        return Ok(Json(CacheEntryResponse::Keys { pattern, keys }));
    }

    Err(ApiError::invalid_input("key or pattern is required"))
}

pub(super) async fn delete_entries(
    State(state): State<HttpState>,
    Query(query): Query<CacheDeleteQuery>,
) -> Result<Json<ActionResponse>, ApiError> {
    let invalidation = state.cache.invalidation();

    let removed = if let Some(key) = present(query.key) {
        let store = invalidation.store();
        u64::from(store.del(&store.keys().qualify(&key)).await)
    } else if let Some(pattern) = present(query.pattern) {
        invalidation.invalidate_pattern(&pattern).await?
    } else if let Some(tag) = present(query.tag) {
        invalidation.invalidate_tag(&tag).await?
    } else {
        return Err(ApiError::invalid_input("key, pattern or tag is required"));
    };

    Ok(Json(ActionResponse::invalidated(removed)))
}

pub(super) async fn post_action(
    State(state): State<HttpState>,
    payload: Result<Json<CacheAction>, JsonRejection>,
) -> Result<Json<ActionResponse>, ApiError> {
    let Json(action) = payload?;
    let response = run_action(&state.cache, action).await?;
    Ok(Json(response))
}

async fn run_action(cache: &CacheEngine, action: CacheAction) -> Result<ActionResponse, ApiError> {
    match action {
        CacheAction::Set {
            key,
            value,
            ttl,
            tags,
        } => {
            let key = required(key, "key")?;
            let value = value.ok_or_else(|| InvalidationError::validation("value is required"))?;
            let store = cache.store();
            let key = store.keys().qualify(&key);
            let ttl = ttl.or_else(|| default_ttl(cache, &key));
            if !store.set(&key, &value, ttl, &tags).await {
                return Err(ApiError::store(format!("failed to write `{key}`")));
            }
            Ok(ActionResponse::ok().with_message(format!("stored {key}")))
        }
        CacheAction::Expire { key, ttl } => {
            let key = required(key, "key")?;
            let ttl = match ttl {
                Some(ttl) if ttl > 0 => ttl,
                Some(_) => return Err(ApiError::invalid_input("ttl must be greater than zero")),
                None => return Err(ApiError::invalid_input("ttl is required")),
            };
            let store = cache.store();
            let updated = store.expire(&store.keys().qualify(&key), ttl).await;
            let message = if updated {
                "expiry updated"
            } else {
                "key not found"
            };
            Ok(ActionResponse::ok().with_message(message))
        }
        CacheAction::FlushNamespace { category } => {
            let category = present(category)
                .map(|category| category.parse::<Category>())
                .transpose()?;
            let removed = cache.invalidation().flush(category).await?;
            Ok(ActionResponse::invalidated(removed))
        }
        CacheAction::WarmCache { user_id, provider } => {
            let user_id = required(user_id, "userId")?;
            let report = match present(provider) {
                Some(provider) => {
                    let provider: Provider = provider.parse()?;
                    cache.warmer().warm_provider(&user_id, provider).await?
                }
                None => cache.warmer().warm_critical_session(&user_id).await?,
            };
            Ok(ActionResponse::ok().with_data(as_data(&report)?))
        }
        CacheAction::InvalidateUser { user_id } => {
            invalidate(cache, InvalidationOp::User { user_id }).await
        }
        CacheAction::InvalidateGithub {
            user_id,
            repository,
        } => {
            invalidate(
                cache,
                InvalidationOp::Github {
                    user_id,
                    repository,
                },
            )
            .await
        }
        CacheAction::InvalidateSlack { user_id, channel } => {
            invalidate(cache, InvalidationOp::Slack { user_id, channel }).await
        }
        CacheAction::SmartInvalidation {
            change_type,
            user_id,
            context,
        } => {
            invalidate(
                cache,
                InvalidationOp::Smart {
                    change_type,
                    user_id,
                    context,
                },
            )
            .await
        }
        CacheAction::TriggerEvent {
            event_type,
            data_type,
            context,
            deferred,
        } => {
            let event_type = required(event_type, "eventType")?;
            let data_type = required(data_type, "dataType")?;
            let triggers = cache.triggers();
            let event = triggers.event(event_type, data_type, context);
            if deferred {
                info!(event_id = %event.id, "Domain event queued");
                triggers.publish(event);
                return Ok(ActionResponse::ok().with_message("event queued"));
            }
            let report = triggers.fire(&event).await;
            Ok(ActionResponse::invalidated(report.invalidated_entries).with_data(as_data(&report)?))
        }
        CacheAction::BatchInvalidation { operations } => {
            let operations =
                operations.ok_or_else(|| InvalidationError::validation("operations is required"))?;
            let report = cache.invalidation().batch(operations).await;
            Ok(ActionResponse::invalidated(report.invalidated_entries).with_data(as_data(&report)?))
        }
    }
}

async fn invalidate(cache: &CacheEngine, op: InvalidationOp) -> Result<ActionResponse, ApiError> {
    let request = InvalidationRequest::try_from(op)?;
    let removed = cache.invalidation().execute(request).await?;
    Ok(ActionResponse::invalidated(removed))
}

/// Category default for a qualified key, from its second segment.
fn default_ttl(cache: &CacheEngine, key: &str) -> Option<u64> {
    let category = key.split(DELIMITER).nth(1)?.parse::<Category>().ok()?;
    cache.config().ttl.for_category(category)
}
