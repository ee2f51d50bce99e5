//! Reply cache — a redis-backed decorator keyed by the prompt, backend and model.
//!
//! Cache failures are logged and never fail a call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{ClientError, TextGenerationClient};

const KEY_PREFIX: &str = "fieldfill:reply:";

pub struct CachedClient {
    inner: Arc<dyn TextGenerationClient>,
    redis: redis::Client,
    ttl_secs: u64,
}

impl CachedClient {
    pub fn new(inner: Arc<dyn TextGenerationClient>, redis: redis::Client, ttl_secs: u64) -> Self {
        Self {
            inner,
            redis,
            ttl_secs,
        }
    }

    async fn lookup(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        conn.get(key).await
    }

    async fn store(&self, key: &str, reply: &str) -> redis::RedisResult<()> {
        let mut conn = self.redis.get_multiplexed_async_connection().await?;
        conn.set_ex(key, reply, self.ttl_secs).await
    }
}

/// `fieldfill:reply:<hex sha256 of prompt, backend id and model>`.
/// Each part is length-prefixed so part boundaries cannot shift.
pub fn cache_key(prompt: &str, client_id: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [prompt, client_id, model] {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    format!("{KEY_PREFIX}{:x}", hasher.finalize())
}

#[async_trait]
impl TextGenerationClient for CachedClient {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn execute(&self, prompt: &str, timeout: Duration) -> Result<String, ClientError> {
        let key = cache_key(prompt, self.inner.id(), self.inner.model());

        match self.lookup(&key).await {
            Ok(Some(reply)) => {
                debug!("Reply cache hit: {key}");
                return Ok(reply);
            }
            Ok(None) => {}
            Err(e) => warn!("Reply cache lookup failed, calling uncached: {e}"),
        }

        let reply = self.inner.execute(prompt, timeout).await?;

        if let Err(e) = self.store(&key, &reply).await {
            warn!("Reply cache store failed: {e}");
        }
        Ok(reply)
    }
}
