//! Cache key namespace.
//!
//! Every key has the shape `<namespace>:<category>:<qualifier>...`. The
//! namespace always comes first so `<namespace>:*` addresses everything the
//! application owns, and the category comes second so one pattern can address
//! a whole data class. Pattern-based invalidation depends on this ordering.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Separator between key segments.
pub const DELIMITER: char = ':';

/// Segments longer than this are replaced by a digest.
const MAX_SEGMENT_LEN: usize = 64;
const DIGEST_PREFIX: &str = "h-";
const DIGEST_HEX_LEN: usize = 16;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("namespace must not be empty")]
    EmptyNamespace,
    #[error("namespace `{0}` must not contain `:` or glob characters")]
    InvalidNamespace(String),
    #[error("{field} must not be empty")]
    EmptySegment { field: &'static str },
    #[error("unknown category `{0}`")]
    UnknownCategory(String),
    #[error("unknown provider `{0}`")]
    UnknownProvider(String),
}

/// Data class of a cache entry; the second key segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    User,
    Session,
    Dashboard,
    Github,
    Slack,
    Ai,
    Api,
    Preload,
    Tag,
    Health,
}

impl Category {
    /// Categories whose third segment is a user id.
    pub const USER_SCOPED: [Category; 7] = [
        Category::User,
        Category::Session,
        Category::Dashboard,
        Category::Github,
        Category::Slack,
        Category::Ai,
        Category::Preload,
    ];

    /// Categories reported by the health endpoint.
    pub const ALL: [Category; 10] = [
        Category::User,
        Category::Session,
        Category::Dashboard,
        Category::Github,
        Category::Slack,
        Category::Ai,
        Category::Api,
        Category::Preload,
        Category::Tag,
        Category::Health,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::User => "user",
            Category::Session => "session",
            Category::Dashboard => "dashboard",
            Category::Github => "github",
            Category::Slack => "slack",
            Category::Ai => "ai",
            Category::Api => "api",
            Category::Preload => "preload",
            Category::Tag => "tag",
            Category::Health => "health",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.as_str() == value)
            .ok_or_else(|| KeyError::UnknownCategory(value.to_string()))
    }
}

/// External activity provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Github,
    Slack,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        self.category().as_str()
    }

    pub fn category(self) -> Category {
        match self {
            Provider::Github => Category::Github,
            Provider::Slack => Category::Slack,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = KeyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::Github),
            "slack" => Ok(Provider::Slack),
            other => Err(KeyError::UnknownProvider(other.to_string())),
        }
    }
}

/// An exact root key plus the pattern matching everything below it.
///
/// Deleting a subtree deletes both, so `github:u1` and `github:u1:*` go
/// together without `github:u1*` also catching user `u10`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subtree {
    pub root: String,
    pub pattern: String,
}

/// Deterministic key generator bound to one application namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    namespace: Arc<str>,
}

impl KeySpace {
    pub fn new(namespace: impl AsRef<str>) -> Result<Self, KeyError> {
        let namespace = namespace.as_ref().trim();
        if namespace.is_empty() {
            return Err(KeyError::EmptyNamespace);
        }
        if namespace.contains(DELIMITER) || namespace.chars().any(is_glob_char) {
            return Err(KeyError::InvalidNamespace(namespace.to_string()));
        }
        Ok(Self {
            namespace: Arc::from(namespace),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Join segments under the namespace.
    ///
    /// The same segments always produce the same key.
    pub fn generate<I, S>(&self, segments: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut key = String::from(&*self.namespace);
        for segment in segments {
            key.push(DELIMITER);
            key.push_str(&normalize_segment(segment.as_ref()));
        }
        key
    }

    /// Key for `category` followed by `qualifiers`.
    pub fn key(&self, category: Category, qualifiers: &[&str]) -> String {
        self.generate(std::iter::once(category.as_str()).chain(qualifiers.iter().copied()))
    }

    /// Subtree rooted at `category:qualifiers...`, with qualifiers escaped.
    pub fn subtree(&self, category: Category, qualifiers: &[&str]) -> Subtree {
        let root = self.key(category, qualifiers);
        let pattern = format!("{}{DELIMITER}*", escape_glob(&root));
        Subtree { root, pattern }
    }

    /// Pattern matching every key in `category`.
    pub fn category_pattern(&self, category: Category) -> String {
        format!("{}{DELIMITER}{}{DELIMITER}*", self.namespace, category.as_str())
    }

    /// Pattern matching every key the application owns.
    pub fn all(&self) -> String {
        format!("{}{DELIMITER}*", self.namespace)
    }

    /// Key or pattern resolved against the namespace.
    ///
    /// Input that already starts with the namespace is returned unchanged;
    /// anything else is treated as relative.
    pub fn qualify(&self, key_or_pattern: &str) -> String {
        if self.owns(key_or_pattern) {
            key_or_pattern.to_string()
        } else {
            format!("{}{DELIMITER}{}", self.namespace, key_or_pattern.trim_start_matches(DELIMITER))
        }
    }

    /// Whether `key_or_pattern` lives inside the namespace.
    pub fn owns(&self, key_or_pattern: &str) -> bool {
        key_or_pattern
            .strip_prefix(&*self.namespace)
            .is_some_and(|rest| rest.starts_with(DELIMITER))
    }

    pub fn session(&self, user_id: &str) -> String {
        self.key(Category::Session, &[user_id])
    }

    pub fn dashboard(&self, user_id: &str) -> String {
        self.key(Category::Dashboard, &[user_id])
    }

    pub fn user_profile(&self, user_id: &str) -> String {
        self.key(Category::User, &[user_id, "profile"])
    }

    /// Provider data for one user, optionally one resource (repository or channel).
    pub fn provider(&self, provider: Provider, user_id: &str, resource: Option<&str>) -> String {
        match resource {
            Some(resource) => self.key(provider.category(), &[user_id, resource]),
            None => self.key(provider.category(), &[user_id]),
        }
    }

    pub fn ai_summary(&self, user_id: &str, date: &str) -> String {
        self.key(Category::Ai, &[user_id, "summary", date])
    }

    /// Memoized API response for `endpoint` with positional `params`.
    pub fn api(&self, endpoint: &str, params: &[&str]) -> String {
        let mut qualifiers = Vec::with_capacity(params.len() + 1);
        qualifiers.push(endpoint);
        qualifiers.extend_from_slice(params);
        self.key(Category::Api, &qualifiers)
    }

    pub fn preload(&self, user_id: &str, path: &str) -> String {
        let path = path.trim_matches('/');
        let path = if path.is_empty() { "root" } else { path };
        self.key(Category::Preload, &[user_id, path])
    }

    /// Set holding the members of `tag`.
    pub fn tag(&self, tag: &str) -> String {
        self.key(Category::Tag, &[tag])
    }

    /// Set holding the tags currently attached to `key`.
    pub fn tags_of(&self, key: &str) -> String {
        self.generate(["tagsof", key])
    }

    /// Tag attached to every entry owned by a user.
    pub fn user_tag(user_id: &str) -> String {
        format!("user{DELIMITER}{user_id}")
    }

    pub fn health_probe(&self, nonce: &str) -> String {
        self.key(Category::Health, &["probe", nonce])
    }
}

/// Reject empty identifiers before they reach a key.
pub fn require(value: &str, field: &'static str) -> Result<(), KeyError> {
    if value.trim().is_empty() {
        Err(KeyError::EmptySegment { field })
    } else {
        Ok(())
    }
}

fn normalize_segment(segment: &str) -> Cow<'_, str> {
    if segment.len() <= MAX_SEGMENT_LEN {
        return Cow::Borrowed(segment);
    }
    let digest = hex::encode(Sha256::digest(segment.as_bytes()));
    Cow::Owned(format!("{DIGEST_PREFIX}{}", &digest[..DIGEST_HEX_LEN]))
}

fn is_glob_char(ch: char) -> bool {
    matches!(ch, '*' | '?' | '[' | ']' | '\\')
}

/// Escape glob metacharacters so `value` only matches itself in a pattern.
pub fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if is_glob_char(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
