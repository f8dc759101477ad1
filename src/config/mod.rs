//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

mod cli;

pub use cli::{
    CliArgs, Command, FlushArgs, HealthArgs, ServeArgs, ServeOverrides, StoreOverride,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "devpulse";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_NAMESPACE: &str = "devpulse";
const DEFAULT_SCAN_BATCH_SIZE: u64 = 100;
const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_TTL_USER_SECS: u64 = 60 * 60;
const DEFAULT_TTL_SESSION_SECS: u64 = 30 * 60;
const DEFAULT_TTL_DASHBOARD_SECS: u64 = 5 * 60;
const DEFAULT_TTL_GITHUB_SECS: u64 = 10 * 60;
const DEFAULT_TTL_SLACK_SECS: u64 = 5 * 60;
const DEFAULT_TTL_AI_SECS: u64 = 24 * 60 * 60;
const DEFAULT_TTL_API_SECS: u64 = 5 * 60;
const DEFAULT_TTL_PRELOAD_SECS: u64 = 15 * 60;
const DEFAULT_AUTO_CONSUME_INTERVAL_MS: u64 = 5_000;
const DEFAULT_CONSUME_BATCH_LIMIT: u64 = 100;
const DEFAULT_EVENT_QUEUE_LIMIT: u64 = 10_000;
const DEFAULT_WARMING_TOP_N: u64 = 3;
const DEFAULT_WARMING_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_WARMING_CONCURRENCY: u64 = 4;
const DEFAULT_CLIENT_QUOTA_BYTES: u64 = 50 * 1024 * 1024;
const DEFAULT_CLIENT_QUOTA_THRESHOLD: f64 = 0.9;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub store: StoreSettings,
    pub cache: CacheSettings,
    pub warming: WarmingSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Redis URL; `None` selects the in-process backend.
    pub redis_url: Option<String>,
    pub namespace: String,
    pub scan_batch_size: NonZeroUsize,
    pub operation_timeout: Duration,
    pub ttl: TtlSettings,
}

/// Default expiry per data class.
#[derive(Debug, Clone, Copy)]
pub struct TtlSettings {
    pub user: Duration,
    pub session: Duration,
    pub dashboard: Duration,
    pub github: Duration,
    pub slack: Duration,
    pub ai: Duration,
    pub api: Duration,
    pub preload: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub auto_consume_interval_ms: u64,
    pub consume_batch_limit: usize,
    pub event_queue_limit: usize,
}

#[derive(Debug, Clone)]
pub struct WarmingSettings {
    pub top_n: usize,
    pub timeout: Duration,
    pub concurrency: NonZeroUsize,
    /// Base URL fresh values are loaded from; `None` disables loading.
    pub origin: Option<Url>,
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub quota_bytes: u64,
    pub quota_threshold: f64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("DEVPULSE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Flush(args)) => raw.apply_store_override(&args.store),
        Some(Command::Health(args)) => raw.apply_store_override(&args.store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    store: RawStoreSettings,
    cache: RawCacheSettings,
    warming: RawWarmingSettings,
    client: RawClientSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(interval) = overrides.cache_auto_consume_interval_ms {
            self.cache.auto_consume_interval_ms = Some(interval);
        }
        if let Some(origin) = overrides.warming_origin.as_ref() {
            self.warming.origin = Some(origin.clone());
        }
        if let Some(concurrency) = overrides.warming_concurrency {
            self.warming.concurrency = Some(concurrency);
        }

        self.apply_store_override(&overrides.store);
    }

    fn apply_store_override(&mut self, overrides: &StoreOverride) {
        if let Some(url) = overrides.redis_url.as_ref() {
            self.store.redis_url = Some(url.clone());
        }
        if let Some(namespace) = overrides.namespace.as_ref() {
            self.store.namespace = Some(namespace.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            store,
            cache,
            warming,
            client,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            store: build_store_settings(store)?,
            cache: build_cache_settings(cache)?,
            warming: build_warming_settings(warming)?,
            client: build_client_settings(client)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_store_settings(store: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let redis_url = store.redis_url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });
    if let Some(url) = redis_url.as_deref() {
        let parsed = Url::parse(url)
            .map_err(|err| LoadError::invalid("store.redis_url", format!("invalid url: {err}")))?;
        if !matches!(parsed.scheme(), "redis" | "rediss" | "redis+unix" | "unix") {
            return Err(LoadError::invalid(
                "store.redis_url",
                format!("unsupported scheme `{}`", parsed.scheme()),
            ));
        }
    }

    let namespace = store
        .namespace
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
        .trim()
        .to_string();
    if namespace.is_empty() {
        return Err(LoadError::invalid("store.namespace", "must not be empty"));
    }
    if namespace.contains(':') || namespace.contains(['*', '?', '[', ']', '\\']) {
        return Err(LoadError::invalid(
            "store.namespace",
            "must not contain `:` or glob characters",
        ));
    }

    let scan_batch_size = non_zero_usize(
        store.scan_batch_size.unwrap_or(DEFAULT_SCAN_BATCH_SIZE),
        "store.scan_batch_size",
    )?;

    let timeout_ms = store
        .operation_timeout_ms
        .unwrap_or(DEFAULT_STORE_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "store.operation_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(StoreSettings {
        redis_url,
        namespace,
        scan_batch_size,
        operation_timeout: Duration::from_millis(timeout_ms),
        ttl: build_ttl_settings(store.ttl)?,
    })
}

fn build_ttl_settings(ttl: RawTtlSettings) -> Result<TtlSettings, LoadError> {
    let seconds = |value: Option<u64>, default: u64, key: &'static str| {
        let value = value.unwrap_or(default);
        if value == 0 {
            Err(LoadError::invalid(key, "must be greater than zero"))
        } else {
            Ok(Duration::from_secs(value))
        }
    };

    Ok(TtlSettings {
        user: seconds(ttl.user, DEFAULT_TTL_USER_SECS, "store.ttl.user")?,
        session: seconds(ttl.session, DEFAULT_TTL_SESSION_SECS, "store.ttl.session")?,
        dashboard: seconds(
            ttl.dashboard,
            DEFAULT_TTL_DASHBOARD_SECS,
            "store.ttl.dashboard",
        )?,
        github: seconds(ttl.github, DEFAULT_TTL_GITHUB_SECS, "store.ttl.github")?,
        slack: seconds(ttl.slack, DEFAULT_TTL_SLACK_SECS, "store.ttl.slack")?,
        ai: seconds(ttl.ai, DEFAULT_TTL_AI_SECS, "store.ttl.ai")?,
        api: seconds(ttl.api, DEFAULT_TTL_API_SECS, "store.ttl.api")?,
        preload: seconds(ttl.preload, DEFAULT_TTL_PRELOAD_SECS, "store.ttl.preload")?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let auto_consume_interval_ms = cache
        .auto_consume_interval_ms
        .unwrap_or(DEFAULT_AUTO_CONSUME_INTERVAL_MS);
    let consume_batch_limit = non_zero_usize(
        cache
            .consume_batch_limit
            .unwrap_or(DEFAULT_CONSUME_BATCH_LIMIT),
        "cache.consume_batch_limit",
    )?;
    let event_queue_limit = non_zero_usize(
        cache.event_queue_limit.unwrap_or(DEFAULT_EVENT_QUEUE_LIMIT),
        "cache.event_queue_limit",
    )?;

    Ok(CacheSettings {
        auto_consume_interval_ms,
        consume_batch_limit: consume_batch_limit.get(),
        event_queue_limit: event_queue_limit.get(),
    })
}

fn build_warming_settings(warming: RawWarmingSettings) -> Result<WarmingSettings, LoadError> {
    let top_n = non_zero_usize(
        warming.top_n.unwrap_or(DEFAULT_WARMING_TOP_N),
        "warming.top_n",
    )?;

    let timeout_ms = warming.timeout_ms.unwrap_or(DEFAULT_WARMING_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "warming.timeout_ms",
            "must be greater than zero",
        ));
    }

    let concurrency = non_zero_usize(
        warming.concurrency.unwrap_or(DEFAULT_WARMING_CONCURRENCY),
        "warming.concurrency",
    )?;

    let origin = match warming.origin.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(
            Url::parse(value)
                .map_err(|err| LoadError::invalid("warming.origin", format!("invalid url: {err}")))?,
        ),
    };

    Ok(WarmingSettings {
        top_n: top_n.get(),
        timeout: Duration::from_millis(timeout_ms),
        concurrency,
        origin,
    })
}

fn build_client_settings(client: RawClientSettings) -> Result<ClientSettings, LoadError> {
    let quota_bytes = client.quota_bytes.unwrap_or(DEFAULT_CLIENT_QUOTA_BYTES);
    if quota_bytes == 0 {
        return Err(LoadError::invalid(
            "client.quota_bytes",
            "must be greater than zero",
        ));
    }

    let quota_threshold = client
        .quota_threshold
        .unwrap_or(DEFAULT_CLIENT_QUOTA_THRESHOLD);
    if !(quota_threshold > 0.0 && quota_threshold <= 1.0) {
        return Err(LoadError::invalid(
            "client.quota_threshold",
            "must be within (0, 1]",
        ));
    }

    Ok(ClientSettings {
        quota_bytes,
        quota_threshold,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    redis_url: Option<String>,
    namespace: Option<String>,
    scan_batch_size: Option<u64>,
    operation_timeout_ms: Option<u64>,
    ttl: RawTtlSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTtlSettings {
    user: Option<u64>,
    session: Option<u64>,
    dashboard: Option<u64>,
    github: Option<u64>,
    slack: Option<u64>,
    ai: Option<u64>,
    api: Option<u64>,
    preload: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    auto_consume_interval_ms: Option<u64>,
    consume_batch_limit: Option<u64>,
    event_queue_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWarmingSettings {
    top_n: Option<u64>,
    timeout_ms: Option<u64>,
    concurrency: Option<u64>,
    origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClientSettings {
    quota_bytes: Option<u64>,
    quota_threshold: Option<f64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: u64, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    let value = non_zero_u32(value, key)?;
    usize::try_from(value.get())
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| LoadError::invalid(key, "value exceeds supported range for usize"))
}
