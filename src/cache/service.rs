//! Wiring of the cache engine components.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use super::backend::{MemoryBackend, StoreBackend, StoreError};
use super::config::CacheConfig;
use super::consumer::EventConsumer;
use super::engine::TriggerEngine;
use super::events::EventQueue;
use super::health::HealthReporter;
use super::invalidation::InvalidationService;
use super::keys::{KeyError, KeySpace};
use super::redis::RedisBackend;
use super::store::KeyedStore;
use super::trigger::{TriggerError, TriggerRegistry};
use super::warming::{CacheWarmer, DisabledWarmLoader, HttpWarmLoader, WarmLoader, WarmingConfig};
use crate::client::{ClientCacheConfig, ResponseCacheManager};
use crate::config::Settings;

#[derive(Debug, Error)]
pub enum CacheInitError {
    #[error("invalid key namespace: {0}")]
    Key(#[from] KeyError),
    #[error("invalid trigger registry: {0}")]
    Trigger(#[from] TriggerError),
    #[error("store connection failed: {0}")]
    Store(#[from] StoreError),
}

/// All cache components, sharing one store.
#[derive(Clone)]
pub struct CacheEngine {
    config: CacheConfig,
    store: Arc<KeyedStore>,
    invalidation: Arc<InvalidationService>,
    triggers: Arc<TriggerEngine>,
    consumer: Arc<EventConsumer>,
    warmer: Arc<CacheWarmer>,
    health: Arc<HealthReporter>,
    client: ResponseCacheManager,
}

impl CacheEngine {
    pub fn new(
        backend: Arc<dyn StoreBackend>,
        config: CacheConfig,
        warming: WarmingConfig,
        loader: Arc<dyn WarmLoader>,
    ) -> Result<Self, CacheInitError> {
        let keys = KeySpace::new(&config.namespace)?;
        let store = Arc::new(KeyedStore::new(backend, keys, &config));
        let invalidation = Arc::new(InvalidationService::new(store.clone()));
        let triggers = Arc::new(TriggerEngine::new(
            TriggerRegistry::builtin()?,
            Arc::new(EventQueue::new(config.event_queue_limit)),
            invalidation.clone(),
        ));
        let warmer = Arc::new(CacheWarmer::new(store.clone(), loader, config.ttl, warming));
        let consumer = Arc::new(EventConsumer::new(
            config.clone(),
            triggers.clone(),
            Some(warmer.clone()),
        ));
        let health = Arc::new(HealthReporter::new(store.clone(), triggers.clone()));

        Ok(Self {
            config,
            store,
            invalidation,
            triggers,
            consumer,
            warmer,
            health,
            client: ResponseCacheManager::in_memory(ClientCacheConfig::default()),
        })
    }

    /// Replace the client response cache.
    pub fn with_client(mut self, client: ResponseCacheManager) -> Self {
        self.client = client;
        self
    }

    /// Engine over an in-process store with warming disabled.
    pub fn in_memory(config: CacheConfig) -> Result<Self, CacheInitError> {
        Self::new(
            Arc::new(MemoryBackend::new()),
            config,
            WarmingConfig::default(),
            Arc::new(DisabledWarmLoader),
        )
    }

    /// Connect to the configured store and warming origin.
    ///
    /// Without a Redis URL the engine runs on the in-process backend.
    pub async fn connect(settings: &Settings) -> Result<Self, CacheInitError> {
        let backend: Arc<dyn StoreBackend> = match &settings.store.redis_url {
            Some(url) => Arc::new(RedisBackend::connect(url, settings.store.operation_timeout).await?),
            None => {
                info!("No redis url configured; using in-process store");
                Arc::new(MemoryBackend::new())
            }
        };
        let loader: Arc<dyn WarmLoader> = match &settings.warming.origin {
            Some(origin) => Arc::new(HttpWarmLoader::new(origin.clone())),
            None => Arc::new(DisabledWarmLoader),
        };
        let engine = Self::new(
            backend,
            CacheConfig::from(settings),
            WarmingConfig::from(&settings.warming),
            loader,
        )?;
        Ok(engine.with_client(ResponseCacheManager::from_settings(&settings.client)))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<KeyedStore> {
        &self.store
    }

    pub fn invalidation(&self) -> &Arc<InvalidationService> {
        &self.invalidation
    }

    pub fn triggers(&self) -> &Arc<TriggerEngine> {
        &self.triggers
    }

    pub fn consumer(&self) -> &Arc<EventConsumer> {
        &self.consumer
    }

    pub fn warmer(&self) -> &Arc<CacheWarmer> {
        &self.warmer
    }

    pub fn health(&self) -> &Arc<HealthReporter> {
        &self.health
    }

    pub fn client(&self) -> &ResponseCacheManager {
        &self.client
    }

    /// Consume queued events on a fixed interval, if enabled.
    pub fn spawn_auto_consume(&self) -> Option<JoinHandle<()>> {
        let period = self.config.auto_consume_interval()?;
        let consumer = self.consumer.clone();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // Skip the first immediate tick
            loop {
                interval.tick().await;
                consumer.consume().await;
            }
        }))
    }
}
