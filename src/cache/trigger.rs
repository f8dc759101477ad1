//! Declarative invalidation triggers.
//!
//! A trigger matches events by `(event_type, data_type)` and carries an
//! ordered list of actions. Each action's scope is a template over the event
//! context (`{userId}`, `{repository}`, ...) resolved into a concrete key,
//! pattern, tag or typed target when the trigger fires.

use std::collections::HashSet;
use std::fmt;

use thiserror::Error;

use super::events::{EventContext, context_keys, data_types, event_types};
use super::keys::{DELIMITER, KeyError, KeySpace, Provider, escape_glob};

/// Matches any value in a trigger condition.
pub const WILDCARD: &str = "*";

const PLACEHOLDERS: [&str; 6] = [
    context_keys::USER_ID,
    context_keys::REPOSITORY,
    context_keys::CHANNEL,
    context_keys::RESOURCE_ID,
    context_keys::ENDPOINT,
    context_keys::DATE,
];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("trigger id must not be empty")]
    EmptyId,
    #[error("duplicate trigger id `{0}`")]
    DuplicateId(String),
    #[error("trigger `{id}` has no actions")]
    NoActions { id: String },
    #[error("trigger `{id}` is missing condition `{field}`")]
    MissingCondition { id: String, field: &'static str },
    #[error("trigger `{id}` has an invalid scope `{scope}`: {reason}")]
    InvalidScope {
        id: String,
        scope: String,
        reason: String,
    },
    #[error("unknown trigger `{0}`")]
    UnknownTrigger(String),
    #[error("event context is missing `{0}`")]
    MissingContext(String),
    #[error(transparent)]
    Key(#[from] KeyError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationType {
    /// One exact key.
    Key,
    /// Every key matching a glob pattern.
    Pattern,
    /// Every member of a tag.
    Tag,
    /// Everything owned by a user.
    User,
    /// Provider data for a user, optionally one resource.
    Provider,
    /// Memoized responses of one API endpoint.
    Api,
}

impl fmt::Display for InvalidationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvalidationType::Key => "key",
            InvalidationType::Pattern => "pattern",
            InvalidationType::Tag => "tag",
            InvalidationType::User => "user",
            InvalidationType::Provider => "provider",
            InvalidationType::Api => "api",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConditions {
    pub event_type: String,
    pub data_type: String,
}

impl TriggerConditions {
    pub fn new(event_type: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data_type: data_type.into(),
        }
    }

    pub fn matches(&self, event_type: &str, data_type: &str) -> bool {
        condition_matches(&self.event_type, event_type)
            && condition_matches(&self.data_type, data_type)
    }
}

fn condition_matches(condition: &str, value: &str) -> bool {
    condition == WILDCARD || condition == value
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerAction {
    pub invalidation_type: InvalidationType,
    /// Template over the event context.
    pub scope: String,
}

/// A trigger action with its scope resolved against one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResolvedAction {
    Key(String),
    Pattern(String),
    Tag(String),
    User(String),
    Provider {
        provider: Provider,
        user_id: String,
        resource: Option<String>,
    },
    Api {
        endpoint: String,
        params: Vec<String>,
    },
}

impl fmt::Display for ResolvedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedAction::Key(key) => write!(f, "key:{key}"),
            ResolvedAction::Pattern(pattern) => write!(f, "pattern:{pattern}"),
            ResolvedAction::Tag(tag) => write!(f, "tag:{tag}"),
            ResolvedAction::User(user_id) => write!(f, "user:{user_id}"),
            ResolvedAction::Provider {
                provider,
                user_id,
                resource,
            } => match resource {
                Some(resource) => write!(f, "provider:{provider}:{user_id}:{resource}"),
                None => write!(f, "provider:{provider}:{user_id}"),
            },
            ResolvedAction::Api { endpoint, params } => {
                write!(f, "api:{endpoint}")?;
                for param in params {
                    write!(f, ":{param}")?;
                }
                Ok(())
            }
        }
    }
}

impl TriggerAction {
    pub fn new(invalidation_type: InvalidationType, scope: impl Into<String>) -> Self {
        Self {
            invalidation_type,
            scope: scope.into(),
        }
    }

    /// Resolve the scope against `context`.
    ///
    /// Fails when the scope references a placeholder the context lacks.
    pub fn resolve(
        &self,
        context: &EventContext,
        keys: &KeySpace,
    ) -> Result<ResolvedAction, TriggerError> {
        let resolved = match self.invalidation_type {
            InvalidationType::Key => {
                let segments = self
                    .scope
                    .split(DELIMITER)
                    .map(|segment| substitute(segment, context, false))
                    .collect::<Result<Vec<_>, _>>()?;
                let key = if segments.first().map(String::as_str) == Some(keys.namespace()) {
                    keys.generate(&segments[1..])
                } else {
                    keys.generate(&segments)
                };
                ResolvedAction::Key(key)
            }
            InvalidationType::Pattern => {
                ResolvedAction::Pattern(keys.qualify(&substitute(&self.scope, context, true)?))
            }
            InvalidationType::Tag => ResolvedAction::Tag(substitute(&self.scope, context, false)?),
            InvalidationType::User => {
                ResolvedAction::User(substitute(&self.scope, context, false)?)
            }
            InvalidationType::Provider => {
                let mut parts = self.scope.splitn(3, DELIMITER);
                let provider = parts.next().unwrap_or_default().parse::<Provider>()?;
                let user_id = substitute(parts.next().unwrap_or_default(), context, false)?;
                let resource = parts
                    .next()
                    .map(|segment| substitute(segment, context, false))
                    .transpose()?;
                ResolvedAction::Provider {
                    provider,
                    user_id,
                    resource,
                }
            }
            InvalidationType::Api => {
                let mut segments = self
                    .scope
                    .split(DELIMITER)
                    .map(|segment| substitute(segment, context, false))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter();
                let endpoint = segments.next().unwrap_or_default();
                ResolvedAction::Api {
                    endpoint,
                    params: segments.collect(),
                }
            }
        };
        Ok(resolved)
    }
}

/// Replace `{name}` placeholders with context values.
///
/// Values are glob-escaped when the result is used as a pattern.
fn substitute(template: &str, context: &EventContext, escape: bool) -> Result<String, TriggerError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        let value = context
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| TriggerError::MissingContext(name.to_string()))?;
        if escape {
            out.push_str(&escape_glob(value));
        } else {
            out.push_str(value);
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    template.split('{').skip(1).filter_map(|chunk| chunk.split_once('}').map(|(name, _)| name))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationTrigger {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub conditions: TriggerConditions,
    pub actions: Vec<TriggerAction>,
}

impl InvalidationTrigger {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        conditions: TriggerConditions,
        actions: Vec<TriggerAction>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            conditions,
            actions,
        }
    }

    fn validate(&self) -> Result<(), TriggerError> {
        if self.id.trim().is_empty() {
            return Err(TriggerError::EmptyId);
        }
        if self.conditions.event_type.trim().is_empty() {
            return Err(TriggerError::MissingCondition {
                id: self.id.clone(),
                field: "eventType",
            });
        }
        if self.conditions.data_type.trim().is_empty() {
            return Err(TriggerError::MissingCondition {
                id: self.id.clone(),
                field: "dataType",
            });
        }
        if self.actions.is_empty() {
            return Err(TriggerError::NoActions {
                id: self.id.clone(),
            });
        }
        for action in &self.actions {
            self.validate_scope(action)?;
        }
        Ok(())
    }

    fn validate_scope(&self, action: &TriggerAction) -> Result<(), TriggerError> {
        let invalid = |reason: String| TriggerError::InvalidScope {
            id: self.id.clone(),
            scope: action.scope.clone(),
            reason,
        };

        if action.scope.trim().is_empty() {
            return Err(invalid("scope must not be empty".to_string()));
        }
        if let Some(unknown) = placeholders(&action.scope).find(|name| !PLACEHOLDERS.contains(name)) {
            return Err(invalid(format!("unknown placeholder `{{{unknown}}}`")));
        }
        if action.invalidation_type == InvalidationType::Provider {
            let mut parts = action.scope.splitn(3, DELIMITER);
            parts
                .next()
                .unwrap_or_default()
                .parse::<Provider>()
                .map_err(|err| invalid(err.to_string()))?;
            if parts.next().is_none_or(|user| user.is_empty()) {
                return Err(invalid("provider scope needs a user segment".to_string()));
            }
        }
        Ok(())
    }
}

/// Immutable set of triggers, built once and shared behind an `Arc`.
///
/// Enabling or disabling a trigger produces a new registry.
#[derive(Debug, Clone, Default)]
pub struct TriggerRegistry {
    triggers: Vec<InvalidationTrigger>,
}

impl TriggerRegistry {
    /// Validate and build a registry.
    pub fn new(triggers: Vec<InvalidationTrigger>) -> Result<Self, TriggerError> {
        let mut seen = HashSet::new();
        for trigger in &triggers {
            trigger.validate()?;
            if !seen.insert(trigger.id.as_str()) {
                return Err(TriggerError::DuplicateId(trigger.id.clone()));
            }
        }
        Ok(Self { triggers })
    }

    /// Registry with the built-in provider, user, AI and settings triggers.
    pub fn builtin() -> Result<Self, TriggerError> {
        Self::new(default_triggers())
    }

    /// Enabled triggers whose conditions match, in registration order.
    pub fn matching<'a>(
        &'a self,
        event_type: &'a str,
        data_type: &'a str,
    ) -> impl Iterator<Item = &'a InvalidationTrigger> + 'a {
        self.triggers
            .iter()
            .filter(move |trigger| trigger.enabled && trigger.conditions.matches(event_type, data_type))
    }

    /// Copy of this registry with one trigger toggled.
    pub fn with_enabled(&self, id: &str, enabled: bool) -> Result<Self, TriggerError> {
        let mut next = self.clone();
        let trigger = next
            .triggers
            .iter_mut()
            .find(|trigger| trigger.id == id)
            .ok_or_else(|| TriggerError::UnknownTrigger(id.to_string()))?;
        trigger.enabled = enabled;
        Ok(next)
    }

    pub fn get(&self, id: &str) -> Option<&InvalidationTrigger> {
        self.triggers.iter().find(|trigger| trigger.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &InvalidationTrigger> {
        self.triggers.iter()
    }

    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.triggers.iter().filter(|trigger| trigger.enabled).count()
    }
}

fn default_triggers() -> Vec<InvalidationTrigger> {
    use InvalidationType::{Key, Pattern, Provider as ProviderScope, User};

    let github = |id: &str, name: &str, event_type: &str| {
        InvalidationTrigger::new(
            id,
            name,
            TriggerConditions::new(event_type, data_types::GITHUB),
            vec![
                TriggerAction::new(ProviderScope, "github:{userId}"),
                TriggerAction::new(Pattern, "ai:{userId}:*"),
                TriggerAction::new(Key, "dashboard:{userId}"),
            ],
        )
    };

    vec![
        github("github-push", "GitHub push", event_types::PUSH),
        github(
            "github-pull-request",
            "GitHub pull request",
            event_types::PULL_REQUEST,
        ),
        github("github-issues", "GitHub issues", event_types::ISSUES),
        InvalidationTrigger::new(
            "slack-message",
            "Slack message",
            TriggerConditions::new(event_types::MESSAGE, data_types::SLACK),
            vec![
                TriggerAction::new(ProviderScope, "slack:{userId}:{channel}"),
                TriggerAction::new(Key, "dashboard:{userId}"),
            ],
        ),
        InvalidationTrigger::new(
            "user-profile-update",
            "User profile update",
            TriggerConditions::new(event_types::PROFILE_UPDATE, data_types::USER),
            vec![TriggerAction::new(User, "{userId}")],
        ),
        InvalidationTrigger::new(
            "ai-summary-regenerate",
            "AI summary regeneration",
            TriggerConditions::new(event_types::REGENERATE, data_types::AI),
            vec![TriggerAction::new(Pattern, "ai:{userId}:*")],
        ),
        InvalidationTrigger::new(
            "settings-change",
            "Settings change",
            TriggerConditions::new(event_types::SETTINGS_CHANGE, data_types::SETTINGS),
            vec![
                TriggerAction::new(Key, "dashboard:{userId}"),
                TriggerAction::new(Key, "session:{userId}"),
            ],
        ),
    ]
}
