//! Typed helpers over the raw coordination cache: JSON values, read-through
//! caching and per-order locks.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

use super::traits::CoordinationCache;
use crate::error::Result;

/// Cache keys, namespaced by purpose
pub mod keys {
    use uuid::Uuid;

    pub fn lock(order_id: &Uuid) -> String {
        format!("lock:{order_id}")
    }

    pub fn quote(order_id: &Uuid) -> String {
        format!("quote:{order_id}")
    }

    pub fn user(user_id: i64) -> String {
        format!("user:{user_id}")
    }

    pub fn settlement(order_id: &Uuid) -> String {
        format!("settlement:{order_id}")
    }

    /// Present while some trigger for the order is still being redelivered
    pub fn trigger(order_id: &Uuid) -> String {
        format!("trigger:{order_id}")
    }
}

fn is_falsy(raw: &str) -> bool {
    matches!(raw.trim(), "" | "null" | "false" | "0" | "\"\"")
}

#[async_trait]
pub trait CacheExt: CoordinationCache {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send;

    async fn set_json<T>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()>
    where
        T: Serialize + Sync;

    /// Return the cached value if present and not falsy, else compute, store and return it.
    /// A computed value that serializes to `null` is returned but not stored.
    async fn get_or_set<T, F, Fut>(&self, key: &str, ttl_secs: u64, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send;
}

#[async_trait]
impl<C> CacheExt for C
where
    C: CoordinationCache + ?Sized,
{
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        let Some(raw) = self.get(key).await? else {
            return Ok(None);
        };
        if is_falsy(&raw) {
            return Ok(None);
        }

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Discarding undecodable cache entry");
                Ok(None)
            }
        }
    }

    async fn set_json<T>(&self, key: &str, value: &T, ttl_secs: u64) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw, ttl_secs).await
    }

    async fn get_or_set<T, F, Fut>(&self, key: &str, ttl_secs: u64, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(cached) = self.get_json::<T>(key).await? {
            debug!(key, "Cache hit");
            return Ok(cached);
        }

        let fresh = compute().await?;
        let raw = serde_json::to_string(&fresh)?;
        if !is_falsy(&raw) {
            self.set(key, &raw, ttl_secs).await?;
        }
        Ok(fresh)
    }
}

/// TTL-bounded advisory lock on one order. Only the holder's token can release it.
#[derive(Debug)]
pub struct OrderLock {
    key: String,
    token: String,
}

impl OrderLock {
    /// Try once; `None` means another processor holds the lock.
    pub async fn acquire(
        cache: &dyn CoordinationCache,
        order_id: &Uuid,
        ttl_secs: u64,
    ) -> Result<Option<Self>> {
        let key = keys::lock(order_id);
        let token = Uuid::new_v4().to_string();

        if cache.set_if_absent(&key, &token, ttl_secs).await? {
            debug!(%order_id, "Order lock acquired");
            Ok(Some(Self { key, token }))
        } else {
            Ok(None)
        }
    }

    /// Returns false if the lock had already expired (and possibly been retaken).
    pub async fn release(self, cache: &dyn CoordinationCache) -> Result<bool> {
        let released = cache.del_if_equals(&self.key, &self.token).await?;
        if !released {
            warn!(key = %self.key, "Order lock expired before release");
        }
        Ok(released)
    }
}
