//! Redis backend over a long-lived connection manager.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, info};

use super::backend::{StoreBackend, StoreError};

pub struct RedisBackend {
    manager: ConnectionManager,
    timeout: Duration,
}

impl RedisBackend {
    /// Open a client for `url` and establish the managed connection.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        info!(url = %sanitize_url(url), "Connecting to redis");
        let client = redis::Client::open(url)?;
        let manager = bounded("connect", timeout, ConnectionManager::new(client)).await?;
        info!("Redis connection established");
        Ok(Self { manager, timeout })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        bounded(op, self.timeout, fut).await
    }
}

async fn bounded<T, F>(op: &'static str, timeout: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout {
            op,
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Redis URL with the password masked, for logs.
pub fn sanitize_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid_url".to_string(),
    }
}

#[async_trait]
impl StoreBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        let _: String = self
            .run("ping", redis::cmd("PING").query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.manager.clone();
        match self.run("get", conn.get::<_, Option<String>>(key)).await {
            Err(StoreError::Redis(err)) if err.kind() == redis::ErrorKind::TypeError => {
                Err(StoreError::WrongType(key.to_string()))
            }
            other => other,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.manager.clone();
        match ttl_secs {
            Some(secs) => self.run("set", conn.set_ex::<_, _, ()>(key, value, secs)).await,
            None => self.run("set", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(secs) = ttl_secs {
            cmd.arg("EX").arg(secs);
        }
        // SET NX replies nil when the key already exists.
        let reply: Option<String> = self.run("set_nx", cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        self.run("del", conn.del::<_, u64>(keys)).await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        self.run("exists", conn.exists::<_, bool>(key)).await
    }

    async fn ttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.manager.clone();
        self.run("ttl", conn.ttl::<_, i64>(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        let seconds = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        self.run("expire", conn.expire::<_, bool>(key, seconds)).await
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.manager.clone();
        self.run("persist", conn.persist::<_, bool>(key)).await
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<String>), StoreError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SCAN");
        cmd.arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count);
        let (next, keys): (u64, Vec<String>) =
            self.run("scan", cmd.query_async(&mut conn)).await?;
        debug!(cursor, next, returned = keys.len(), "Redis scan step");
        Ok((next, keys))
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        self.run("sadd", conn.sadd::<_, _, u64>(key, members)).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.manager.clone();
        self.run("smembers", conn.smembers::<_, Vec<String>>(key))
            .await
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut conn = self.manager.clone();
        self.run("srem", conn.srem::<_, _, u64>(key, members)).await
    }
}
