use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the devpulse binary.
#[derive(Debug, Parser)]
#[command(
    name = "devpulse",
    version,
    about = "Devpulse cache coherency and warming service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "DEVPULSE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache HTTP service.
    Serve(Box<ServeArgs>),
    /// Delete every key in the namespace, or one category of it.
    Flush(FlushArgs),
    /// Run one health probe against the store and print the report as JSON.
    Health(HealthArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct StoreOverride {
    /// Override the Redis connection URL. Without one the in-process store is used.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the key namespace.
    #[arg(long = "store-namespace", value_name = "NAME")]
    pub namespace: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the background event consumption interval.
    #[arg(long = "cache-auto-consume-interval-ms", value_name = "MILLIS")]
    pub cache_auto_consume_interval_ms: Option<u64>,

    /// Override the origin the warmer loads fresh values from.
    #[arg(long = "warming-origin", value_name = "URL")]
    pub warming_origin: Option<String>,

    /// Override the number of keys warmed concurrently.
    #[arg(long = "warming-concurrency", value_name = "COUNT")]
    pub warming_concurrency: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct FlushArgs {
    #[command(flatten)]
    pub store: StoreOverride,

    /// Only flush this category (for example `github` or `ai`).
    #[arg(long, value_name = "CATEGORY")]
    pub category: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct HealthArgs {
    #[command(flatten)]
    pub store: StoreOverride,
}
