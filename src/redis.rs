use redis::{aio::ConnectionManager, Script};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{AdmissionError, Result};

// Fixed window stored as a hash {start, count}. A window closes when the
// caller's clock passes start + window or when the key expires, whichever
// comes first.
const INCREMENT_WINDOW: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local start = tonumber(redis.call('HGET', KEYS[1], 'start'))
if (not start) or now >= start + window then
  start = now
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'start', ARGV[1])
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, start}
"#;

const ROLLBACK_WINDOW: &str = r#"
if redis.call('HGET', KEYS[1], 'start') ~= ARGV[1] then
  return 0
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
if count > 0 then
  redis.call('HINCRBY', KEYS[1], 'count', -1)
  return 1
end
return 0
"#;

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Duration,
    pub command_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(1),
        }
    }
}

/// Redis client wrapper for shared window counters
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    config: RedisConfig,
    increment_script: Script,
    rollback_script: Script,
}

impl RedisClient {
    /// Connect and verify the server answers PING
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", config.url);

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            AdmissionError::Redis(e)
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
                return Err(AdmissionError::Redis(e));
            }
            Err(_) => {
                warn!(
                    "Timeout while creating connection manager ({}ms)",
                    config.connection_timeout.as_millis()
                );
                return Err(AdmissionError::Store(
                    "Timeout while creating Redis connection manager".to_string(),
                ));
            }
        };

        let redis_client = Self {
            connection,
            config,
            increment_script: Script::new(INCREMENT_WINDOW),
            rollback_script: Script::new(ROLLBACK_WINDOW),
        };
        redis_client.health_check().await?;

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    /// Count one hit in the window stored at `key`, opening a window at
    /// `now_ms` when none is open. Returns `(count, window_start_ms)`.
    pub async fn increment_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<(u64, u64)> {
        let mut conn = self.connection.clone();
        let mut invocation = self.increment_script.key(key);
        invocation.arg(now_ms).arg(window_ms);

        self.bounded("increment", invocation.invoke_async::<_, (u64, u64)>(&mut conn))
            .await
    }

    /// Undo one hit, but only while the window that counted it is still open
    pub async fn rollback_window(&self, key: &str, window_start_ms: u64) -> Result<bool> {
        let mut conn = self.connection.clone();
        let mut invocation = self.rollback_script.key(key);
        invocation.arg(window_start_ms);

        let released = self
            .bounded("rollback", invocation.invoke_async::<_, i64>(&mut conn))
            .await?;
        Ok(released == 1)
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let ping = redis::cmd("PING");
        self.bounded("ping", ping.query_async::<_, ()>(&mut conn)).await
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.config.command_timeout, fut).await {
            Ok(result) => result.map_err(AdmissionError::Redis),
            Err(_) => Err(AdmissionError::Store(format!(
                "Redis {} timed out after {}ms",
                operation,
                self.config.command_timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.command_timeout, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let config = RedisConfig {
            url: "not a redis url".to_string(),
            ..Default::default()
        };
        assert!(RedisClient::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_server_fails_within_timeout() {
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
        };

        let started = std::time::Instant::now();
        assert!(RedisClient::new(config).await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
