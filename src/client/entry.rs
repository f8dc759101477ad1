use axum::http::Method;
use bytes::Bytes;
use url::Url;

/// Header injected on every stored response, in milliseconds since the epoch.
pub const CACHED_AT_HEADER: &str = "sw-cached-at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
        }
    }

    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Method::GET, Url::parse(url)?))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Storage key within a class.
    pub fn cache_key(&self) -> String {
        self.url.to_string()
    }

    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Copy stamped with `cached_at_ms`, replacing any earlier stamp.
    pub fn stamped(&self, cached_at_ms: u64) -> Self {
        let mut headers: Vec<_> = self
            .headers
            .iter()
            .filter(|(key, _)| !key.eq_ignore_ascii_case(CACHED_AT_HEADER))
            .cloned()
            .collect();
        headers.push((CACHED_AT_HEADER.to_string(), cached_at_ms.to_string()));
        Self {
            status: self.status,
            headers,
            body: self.body.clone(),
        }
    }

    pub fn cached_at(&self) -> Option<u64> {
        self.header(CACHED_AT_HEADER)?.parse().ok()
    }

    /// Expired once older than `max_age_secs`; unstamped entries are always expired.
    pub fn is_expired(&self, now_ms: u64, max_age_secs: u64) -> bool {
        match self.cached_at() {
            Some(cached_at) => now_ms.saturating_sub(cached_at) / 1000 > max_age_secs,
            None => true,
        }
    }

    /// Approximate storage footprint.
    pub fn size_bytes(&self) -> u64 {
        let headers: usize = self
            .headers
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        (self.body.len() + headers) as u64
    }
}
