use std::process;

use devpulse::{
    application::error::AppError,
    cache::{CacheEngine, Category},
    config::{self, FlushArgs},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use devpulse_api_types::HealthStatus;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Flush(args) => run_flush(settings, args).await,
        config::Command::Health(_) => run_health(settings).await,
    }
}

async fn connect(settings: &config::Settings) -> Result<CacheEngine, AppError> {
    CacheEngine::connect(settings)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = connect(&settings).await?;
    info!(
        backend = cache.store().backend_name(),
        namespace = cache.store().keys().namespace(),
        triggers = cache.triggers().registry().len(),
        "Cache engine ready"
    );
    let client = cache.client();
    match client.activate().await {
        Ok(purged) => info!(
            classes = ?client.config().cache_names(),
            quota_bytes = client.config().quota_bytes,
            purged = purged.len(),
            "Client response cache ready"
        ),
        Err(err) => warn!(error = %err, "Client response cache activation failed"),
    }

    let consume_handle = cache.spawn_auto_consume();
    let router = http::build_router(HttpState::new(cache.clone()));

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "Listening");

    let grace = settings.server.graceful_shutdown;
    let result = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")));

    if let Some(handle) = consume_handle {
        handle.abort();
        let _ = handle.await;
    }

    // Drain events queued before shutdown.
    match tokio::time::timeout(grace, cache.consumer().consume()).await {
        Ok(report) if !report.is_empty() => {
            info!(events = report.events, "Drained pending events on shutdown");
        }
        Ok(_) => {}
        Err(_) => warn!(
            grace_ms = grace.as_millis() as u64,
            "Pending events not drained before shutdown deadline"
        ),
    }

    result
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn run_flush(settings: config::Settings, args: FlushArgs) -> Result<(), AppError> {
    let category = args
        .category
        .as_deref()
        .map(str::parse::<Category>)
        .transpose()
        .map_err(|err| AppError::validation(err.to_string()))?;

    let cache = connect(&settings).await?;
    let removed = cache
        .invalidation()
        .flush(category)
        .await
        .map_err(|err| AppError::unexpected(format!("flush failed: {err}")))?;

    info!(
        namespace = cache.store().keys().namespace(),
        category = category.map(Category::as_str).unwrap_or("*"),
        removed,
        "Flush complete"
    );
    Ok(())
}

async fn run_health(settings: config::Settings) -> Result<(), AppError> {
    let cache = connect(&settings).await?;
    let report = cache.health().report().await;
    let json = serde_json::to_string_pretty(&report)
        .map_err(|err| AppError::unexpected(format!("failed to encode health report: {err}")))?;
    println!("{json}");

    if report.status == HealthStatus::Unhealthy {
        return Err(AppError::unexpected("cache store unreachable"));
    }
    Ok(())
}
