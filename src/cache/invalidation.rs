//! Invalidation intents translated into store operations.
//!
//! Every request is validated before the store is touched: a missing
//! identifier is an [`InvalidationError::Validation`] and no key is read or
//! deleted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use devpulse_api_types::{BatchFailure, BatchReport, ContextMap, InvalidationOp};
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use super::backend::StoreError;
use super::events::context_keys;
use super::keys::{Category, KeyError, KeySpace, Provider, escape_glob};
use super::store::KeyedStore;
use super::trigger::ResolvedAction;

#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl InvalidationError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }
}

impl From<KeyError> for InvalidationError {
    fn from(err: KeyError) -> Self {
        Self::Validation(err.to_string())
    }
}

/// Kind of upstream change reported to smart invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Github,
    Slack,
    Ai,
    User,
    Settings,
}

impl FromStr for ChangeType {
    type Err = InvalidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "slack" => Ok(Self::Slack),
            "ai" => Ok(Self::Ai),
            "user" => Ok(Self::User),
            "settings" => Ok(Self::Settings),
            other => Err(InvalidationError::validation(format!(
                "unknown changeType `{other}`"
            ))),
        }
    }
}

/// Kind of single-resource update reported to realtime invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    Github,
    Slack,
    Ai,
    User,
}

impl FromStr for UpdateType {
    type Err = InvalidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Self::Github),
            "slack" => Ok(Self::Slack),
            "ai" => Ok(Self::Ai),
            "user" => Ok(Self::User),
            other => Err(InvalidationError::validation(format!(
                "unknown updateType `{other}`"
            ))),
        }
    }
}

/// A validated invalidation request.
#[derive(Debug, Clone)]
pub enum InvalidationRequest {
    User {
        user_id: String,
    },
    Provider {
        provider: Provider,
        user_id: String,
        resource: Option<String>,
    },
    Ai {
        user_id: String,
        date: Option<String>,
    },
    Api {
        endpoint: String,
        params: Vec<String>,
    },
    Pattern {
        pattern: String,
    },
    Smart {
        change_type: ChangeType,
        user_id: String,
        context: ContextMap,
    },
    Realtime {
        update_type: UpdateType,
        user_id: String,
        resource_id: String,
    },
    /// Operations are validated one by one when the batch runs.
    Batch {
        operations: Vec<InvalidationOp>,
    },
}

impl fmt::Display for InvalidationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User { .. } => "user",
            Self::Provider { .. } => "provider",
            Self::Ai { .. } => "ai",
            Self::Api { .. } => "api",
            Self::Pattern { .. } => "pattern",
            Self::Smart { .. } => "smart",
            Self::Realtime { .. } => "realtime",
            Self::Batch { .. } => "batch",
        };
        f.write_str(name)
    }
}

/// A present, non-blank identifier.
pub fn required(value: Option<String>, field: &'static str) -> Result<String, InvalidationError> {
    match value.map(|value| value.trim().to_string()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(InvalidationError::validation(format!("{field} is required"))),
    }
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl TryFrom<InvalidationOp> for InvalidationRequest {
    type Error = InvalidationError;

    fn try_from(op: InvalidationOp) -> Result<Self, Self::Error> {
        let request = match op {
            InvalidationOp::User { user_id } => Self::User {
                user_id: required(user_id, "userId")?,
            },
            InvalidationOp::Github {
                user_id,
                repository,
            } => Self::Provider {
                provider: Provider::Github,
                user_id: required(user_id, "userId")?,
                resource: optional(repository),
            },
            InvalidationOp::Slack { user_id, channel } => Self::Provider {
                provider: Provider::Slack,
                user_id: required(user_id, "userId")?,
                resource: optional(channel),
            },
            InvalidationOp::Ai { user_id, date } => Self::Ai {
                user_id: required(user_id, "userId")?,
                date: optional(date),
            },
            InvalidationOp::Api { endpoint, params } => Self::Api {
                endpoint: required(endpoint, "endpoint")?,
                params,
            },
            InvalidationOp::Pattern { pattern } => Self::Pattern {
                pattern: required(pattern, "pattern")?,
            },
            InvalidationOp::Smart {
                change_type,
                user_id,
                context,
            } => Self::Smart {
                change_type: required(change_type, "changeType")?.parse()?,
                user_id: required(user_id, "userId")?,
                context,
            },
            InvalidationOp::Realtime {
                update_type,
                user_id,
                resource_id,
            } => Self::Realtime {
                update_type: required(update_type, "updateType")?.parse()?,
                user_id: required(user_id, "userId")?,
                resource_id: required(resource_id, "resourceId")?,
            },
            InvalidationOp::Batch { operations } => Self::Batch { operations },
        };
        Ok(request)
    }
}

pub struct InvalidationService {
    store: Arc<KeyedStore>,
}

impl InvalidationService {
    pub fn new(store: Arc<KeyedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        &self.store
    }

    fn keys(&self) -> &KeySpace {
        self.store.keys()
    }

    /// Everything namespaced to the user in every category, plus every
    /// entry tagged `user:<userId>`.
    pub async fn invalidate_user(&self, user_id: &str) -> Result<u64, InvalidationError> {
        super::keys::require(user_id, "userId")?;
        let keys = self.keys();

        let subtrees: Vec<_> = Category::USER_SCOPED
            .iter()
            .map(|category| keys.subtree(*category, &[user_id]))
            .collect();
        let results = join_all(
            subtrees
                .iter()
                .map(|subtree| self.store.delete_subtree(subtree)),
        )
        .await;
        let tagged = self
            .store
            .invalidate_by_tag(&KeySpace::user_tag(user_id))
            .await;

        let mut total = 0;
        let mut first_error = None;
        for result in results.into_iter().chain(std::iter::once(tagged)) {
            match result {
                Ok(count) => total += count,
                Err(err) => {
                    warn!(user_id, error = %err, "User invalidation step failed");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_error {
            return Err(err.into());
        }

        info!(user_id, invalidated = total, "User cache invalidated");
        Ok(total)
    }

    /// Provider data for one user, optionally narrowed to one repository or channel.
    pub async fn invalidate_provider(
        &self,
        provider: Provider,
        user_id: &str,
        resource: Option<&str>,
    ) -> Result<u64, InvalidationError> {
        super::keys::require(user_id, "userId")?;
        let subtree = match resource {
            Some(resource) => self
                .keys()
                .subtree(provider.category(), &[user_id, resource]),
            None => self.keys().subtree(provider.category(), &[user_id]),
        };
        let removed = self.store.delete_subtree(&subtree).await?;
        info!(
            provider = %provider,
            user_id,
            resource = resource.unwrap_or("*"),
            invalidated = removed,
            "Provider cache invalidated"
        );
        Ok(removed)
    }

    /// AI summaries for one user, optionally one date.
    pub async fn invalidate_ai(
        &self,
        user_id: &str,
        date: Option<&str>,
    ) -> Result<u64, InvalidationError> {
        super::keys::require(user_id, "userId")?;
        let subtree = match date {
            Some(date) => self
                .keys()
                .subtree(Category::Ai, &[user_id, "summary", date]),
            None => self.keys().subtree(Category::Ai, &[user_id]),
        };
        Ok(self.store.delete_subtree(&subtree).await?)
    }

    /// Memoized responses of `endpoint`, optionally narrowed by leading params.
    pub async fn invalidate_api(
        &self,
        endpoint: &str,
        params: &[String],
    ) -> Result<u64, InvalidationError> {
        super::keys::require(endpoint, "endpoint")?;
        let mut qualifiers: Vec<&str> = Vec::with_capacity(params.len() + 1);
        qualifiers.push(endpoint);
        qualifiers.extend(params.iter().map(String::as_str));
        let subtree = self.keys().subtree(Category::Api, &qualifiers);
        Ok(self.store.delete_subtree(&subtree).await?)
    }

    /// Keys matching `pattern`, resolved inside the namespace.
    ///
    /// A pattern without the namespace prefix is treated as relative to it,
    /// so no pattern can reach keys the application does not own.
    pub async fn invalidate_pattern(&self, pattern: &str) -> Result<u64, InvalidationError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(InvalidationError::validation("pattern is required"));
        }
        let qualified = self.keys().qualify(pattern);
        let removed = self.store.delete_by_pattern(&qualified).await?;
        info!(pattern = %qualified, invalidated = removed, "Pattern invalidated");
        Ok(removed)
    }

    pub async fn invalidate_tag(&self, tag: &str) -> Result<u64, InvalidationError> {
        super::keys::require(tag, "tag")?;
        Ok(self.store.invalidate_by_tag(tag).await?)
    }

    /// Flush one category, or the whole namespace.
    pub async fn flush(&self, category: Option<Category>) -> Result<u64, InvalidationError> {
        let pattern = match category {
            Some(category) => self.keys().category_pattern(category),
            None => self.keys().all(),
        };
        let removed = self.store.delete_by_pattern(&pattern).await?;
        info!(pattern = %pattern, invalidated = removed, "Namespace flushed");
        Ok(removed)
    }

    /// Invalidate whatever a change of `change_type` can have made stale.
    pub async fn smart(
        &self,
        change_type: ChangeType,
        user_id: &str,
        context: &ContextMap,
    ) -> Result<u64, InvalidationError> {
        super::keys::require(user_id, "userId")?;
        let total = match change_type {
            ChangeType::Github | ChangeType::Slack => {
                let (provider, resource_key) = if change_type == ChangeType::Github {
                    (Provider::Github, context_keys::REPOSITORY)
                } else {
                    (Provider::Slack, context_keys::CHANNEL)
                };
                let resource = context
                    .get(resource_key)
                    .map(|value| value.trim())
                    .filter(|value| !value.is_empty());
                let dashboard = [self.keys().dashboard(user_id)];
                let (provider_count, ai_count, dashboard_count) = futures::join!(
                    self.invalidate_provider(provider, user_id, resource),
                    self.invalidate_ai(user_id, None),
                    self.store.delete_keys(&dashboard),
                );
                provider_count? + ai_count? + dashboard_count?
            }
            ChangeType::Ai => {
                let date = context
                    .get(context_keys::DATE)
                    .map(|value| value.trim())
                    .filter(|value| !value.is_empty());
                self.invalidate_ai(user_id, date).await?
            }
            ChangeType::User | ChangeType::Settings => self.invalidate_user(user_id).await?,
        };
        info!(?change_type, user_id, invalidated = total, "Smart invalidation complete");
        Ok(total)
    }

    /// Narrowest invalidation for one changed resource.
    ///
    /// Deletes exact keys plus the subtree below the one resource; never
    /// scans a whole category.
    pub async fn realtime(
        &self,
        update_type: UpdateType,
        user_id: &str,
        resource_id: &str,
    ) -> Result<u64, InvalidationError> {
        super::keys::require(user_id, "userId")?;
        super::keys::require(resource_id, "resourceId")?;
        let keys = self.keys();

        let removed = match update_type {
            UpdateType::Github | UpdateType::Slack => {
                let provider = if update_type == UpdateType::Github {
                    Provider::Github
                } else {
                    Provider::Slack
                };
                let resource_key = keys.provider(provider, user_id, Some(resource_id));
                let below = format!("{}:*", escape_glob(&resource_key));
                let exact = self
                    .store
                    .delete_keys(&[resource_key, keys.dashboard(user_id)])
                    .await?;
                exact + self.store.delete_by_pattern(&below).await?
            }
            UpdateType::Ai => {
                self.store
                    .delete_keys(&[keys.ai_summary(user_id, resource_id)])
                    .await?
            }
            UpdateType::User => {
                self.store
                    .delete_keys(&[keys.key(Category::User, &[user_id, resource_id])])
                    .await?
            }
        };
        info!(
            ?update_type,
            user_id,
            resource_id,
            invalidated = removed,
            "Realtime invalidation complete"
        );
        Ok(removed)
    }

    /// Run operations concurrently, summing counts and recording failures.
    ///
    /// Each operation is validated on its own, so one malformed or failing
    /// operation never aborts the rest.
    pub async fn batch(&self, operations: Vec<InvalidationOp>) -> BatchReport {
        let outcomes = join_all(operations.into_iter().map(|op| async move {
            match InvalidationRequest::try_from(op) {
                Ok(request) => self.execute_single(request).await,
                Err(err) => Err(err),
            }
        }))
        .await;

        let mut report = BatchReport::default();
        for (index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(count) => {
                    report.invalidated_entries += count;
                    report.succeeded += 1;
                }
                Err(err) => {
                    warn!(index, error = %err, "Batch invalidation operation failed");
                    report.failed.push(BatchFailure {
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            invalidated = report.invalidated_entries,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            "Batch invalidation complete"
        );
        report
    }

    /// Execute one validated request.
    pub async fn execute(&self, request: InvalidationRequest) -> Result<u64, InvalidationError> {
        match request {
            InvalidationRequest::Batch { operations } => {
                Ok(self.batch(operations).await.invalidated_entries)
            }
            other => self.execute_single(other).await,
        }
    }

    async fn execute_single(&self, request: InvalidationRequest) -> Result<u64, InvalidationError> {
        match request {
            InvalidationRequest::User { user_id } => self.invalidate_user(&user_id).await,
            InvalidationRequest::Provider {
                provider,
                user_id,
                resource,
            } => {
                self.invalidate_provider(provider, &user_id, resource.as_deref())
                    .await
            }
            InvalidationRequest::Ai { user_id, date } => {
                self.invalidate_ai(&user_id, date.as_deref()).await
            }
            InvalidationRequest::Api { endpoint, params } => {
                self.invalidate_api(&endpoint, &params).await
            }
            InvalidationRequest::Pattern { pattern } => self.invalidate_pattern(&pattern).await,
            InvalidationRequest::Smart {
                change_type,
                user_id,
                context,
            } => self.smart(change_type, &user_id, &context).await,
            InvalidationRequest::Realtime {
                update_type,
                user_id,
                resource_id,
            } => self.realtime(update_type, &user_id, &resource_id).await,
            InvalidationRequest::Batch { .. } => Err(InvalidationError::validation(
                "nested batch operations are not supported",
            )),
        }
    }

    /// Execute one resolved trigger action.
    pub async fn execute_action(&self, action: &ResolvedAction) -> Result<u64, InvalidationError> {
        match action {
            ResolvedAction::Key(key) => Ok(self.store.delete_keys(std::slice::from_ref(key)).await?),
            ResolvedAction::Pattern(pattern) => self.invalidate_pattern(pattern).await,
            ResolvedAction::Tag(tag) => self.invalidate_tag(tag).await,
            ResolvedAction::User(user_id) => self.invalidate_user(user_id).await,
            ResolvedAction::Provider {
                provider,
                user_id,
                resource,
            } => {
                self.invalidate_provider(*provider, user_id, resource.as_deref())
                    .await
            }
            ResolvedAction::Api { endpoint, params } => self.invalidate_api(endpoint, params).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::store::tests::{DownBackend, memory_store};
    use super::super::config::CacheConfig;
    use super::*;

    async fn seeded() -> InvalidationService {
        let store = Arc::new(memory_store());
        let keys = store.keys().clone();
        let user_tag = vec![KeySpace::user_tag("u1")];
        for key in [
            keys.session("u1"),
            keys.dashboard("u1"),
            keys.user_profile("u1"),
            keys.provider(Provider::Github, "u1", None),
            keys.provider(Provider::Github, "u1", Some("acme/api")),
            keys.provider(Provider::Github, "u1", Some("acme/web")),
            keys.provider(Provider::Slack, "u1", Some("C1")),
            keys.ai_summary("u1", "2026-10-18"),
            keys.ai_summary("u1", "2026-10-19"),
            keys.session("u10"),
            keys.provider(Provider::Github, "u10", Some("acme/api")),
        ] {
            assert!(store.set(&key, &"v", Some(300), &[]).await);
        }
        assert!(store.set(&keys.api("activity", &["u1", "7d"]), &"v", None, &user_tag).await);
        assert!(store.set(&keys.api("activity", &["u2", "7d"]), &"v", None, &[]).await);
        InvalidationService::new(store)
    }

    #[tokio::test]
    async fn invalidate_user_spans_categories_and_tags() {
        let service = seeded().await;
        let removed = service.invalidate_user("u1").await.expect("invalidated");
        // seven categories plus the tagged API response
        assert_eq!(removed, 10);

        let keys = service.store().keys().clone();
        assert!(service.store().exists(&keys.session("u10")).await);
        assert!(!service.store().exists(&keys.api("activity", &["u1", "7d"])).await);
        assert!(service.store().exists(&keys.api("activity", &["u2", "7d"])).await);
    }

    #[tokio::test]
    async fn provider_invalidation_narrows_to_resource() {
        let service = seeded().await;
        let removed = service
            .invalidate_provider(Provider::Github, "u1", Some("acme/api"))
            .await
            .expect("invalidated");
        assert_eq!(removed, 1);

        let removed = service
            .invalidate_provider(Provider::Github, "u1", None)
            .await
            .expect("invalidated");
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn api_invalidation_uses_leading_params() {
        let service = seeded().await;
        let removed = service
            .invalidate_api("activity", &["u1".to_string()])
            .await
            .expect("invalidated");
        assert_eq!(removed, 1);
    }

    #[tokio::test]
    async fn pattern_is_confined_to_namespace() {
        let service = seeded().await;
        let removed = service
            .invalidate_pattern("session:*")
            .await
            .expect("invalidated");
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn smart_github_hits_provider_ai_and_dashboard() {
        let service = seeded().await;
        let context = ContextMap::from([("repository".to_string(), "acme/web".to_string())]);
        let removed = service
            .smart(ChangeType::Github, "u1", &context)
            .await
            .expect("invalidated");
        // acme/web, two AI summaries, dashboard
        assert_eq!(removed, 4);
    }

    #[test]
    fn unknown_change_type_is_a_validation_error() {
        let err = "gitlab".parse::<ChangeType>().expect_err("unknown");
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn realtime_deletes_only_the_resource() {
        let service = seeded().await;
        let removed = service
            .realtime(UpdateType::Github, "u1", "acme/api")
            .await
            .expect("invalidated");
        // resource key plus dashboard
        assert_eq!(removed, 2);
        let keys = service.store().keys().clone();
        assert!(service
            .store()
            .exists(&keys.provider(Provider::Github, "u1", Some("acme/web")))
            .await);
    }

    #[tokio::test]
    async fn missing_user_id_fails_before_store_access() {
        let config = CacheConfig::default();
        let keys = KeySpace::new(&config.namespace).expect("valid namespace");
        let store = Arc::new(KeyedStore::new(Arc::new(DownBackend), keys, &config));
        let service = InvalidationService::new(store);

        let err = InvalidationRequest::try_from(InvalidationOp::User { user_id: None })
            .expect_err("userId required");
        assert!(err.is_validation());

        let err = service.invalidate_user("  ").await.expect_err("blank user");
        assert!(err.is_validation());
        assert_eq!(service.store().stats().snapshot().errors, 0);
    }

    #[tokio::test]
    async fn batch_tolerates_partial_failure() {
        let service = seeded().await;
        let report = service
            .batch(vec![
                InvalidationOp::Github {
                    user_id: Some("u1".to_string()),
                    repository: Some("acme/api".to_string()),
                },
                InvalidationOp::User { user_id: None },
                InvalidationOp::Batch {
                    operations: Vec::new(),
                },
                InvalidationOp::Ai {
                    user_id: Some("u1".to_string()),
                    date: None,
                },
            ])
            .await;

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.invalidated_entries, 3);
        let failed: Vec<_> = report.failed.iter().map(|failure| failure.index).collect();
        assert_eq!(failed, vec![1, 2]);
    }

    #[tokio::test]
    async fn execute_action_dispatches_resolved_scopes() {
        let service = seeded().await;
        let keys = service.store().keys().clone();
        let removed = service
            .execute_action(&ResolvedAction::Key(keys.dashboard("u1")))
            .await
            .expect("deleted");
        assert_eq!(removed, 1);
        let removed = service
            .execute_action(&ResolvedAction::Pattern(format!("{}:ai:u1:*", keys.namespace())))
            .await
            .expect("deleted");
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn flush_removes_one_category() {
        let service = seeded().await;
        let removed = service.flush(Some(Category::Slack)).await.expect("flushed");
        assert_eq!(removed, 1);
    }
}
