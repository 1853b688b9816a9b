use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    error::{GatekeeperError, Result},
    store::{CounterStore, WindowCount},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
    /// Use `PEXPIRE ... NX` (Redis 7+) so the first hit of a window fixes its expiry
    pub expire_nx: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_millis(100),
            expire_nx: true,
        }
    }
}

/// Redis client wrapper for fixed-window counting
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
}

impl RedisClient {
    /// Connect and verify the server answers PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!(url = %config.url, "Creating Redis client");

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            GatekeeperError::Redis(e)
        })?;

        let connection = match tokio::time::timeout(
            config.connection_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(GatekeeperError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({:?})",
                    config.connection_timeout
                );
                return Err(GatekeeperError::StoreUnavailable(
                    "timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let mut conn = connection.clone();
        match tokio::time::timeout(
            config.connection_timeout,
            redis::cmd("PING").query_async::<_, ()>(&mut conn),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(GatekeeperError::Redis(e));
            }
            Err(_) => {
                warn!("Redis PING timeout ({:?})", config.connection_timeout);
                return Err(GatekeeperError::StoreUnavailable(
                    "timeout while testing Redis connection".to_string(),
                ));
            }
        }

        info!("Redis client initialized successfully");
        Ok(Self { connection, config })
    }

    pub fn config(&self) -> &RedisConfig {
        &self.config
    }
}

/// Build the single-round-trip pipeline: `INCR`, `PEXPIRE` (reply ignored), `PTTL`.
///
/// Not wrapped in MULTI; the expiry may land a moment after the increment.
pub(crate) fn window_pipeline(key: &str, window: Duration, expire_nx: bool) -> redis::Pipeline {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1);

    let mut pipe = redis::pipe();
    pipe.incr(key, 1_i64);
    pipe.cmd("PEXPIRE").arg(key).arg(window_ms);
    if expire_nx {
        pipe.arg("NX");
    }
    pipe.ignore();
    pipe.cmd("PTTL").arg(key);
    pipe
}

fn ttl_from_pttl(pttl: i64) -> Option<Duration> {
    u64::try_from(pttl)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[async_trait]
impl CounterStore for RedisClient {
    async fn increment_with_expiry(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.connection.clone();
        let (count, pttl): (i64, i64) = window_pipeline(key, window, self.config.expire_nx)
            .query_async(&mut conn)
            .await?;

        Ok(WindowCount {
            count,
            ttl: ttl_from_pttl(pttl),
        })
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
