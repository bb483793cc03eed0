//! TTL cache layer over the reserved `cache` partition.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::entry::{CacheEntry, Ttl};
use crate::error::StoreResult;
use crate::store::LocalStore;

/// Partition holding every cache entry.
pub const CACHE_PARTITION: &str = "cache";

/// Expiring key/value cache built on the local store.
///
/// Expiry is checked lazily: an expired entry is deleted the first time it
/// is read. [`TtlCache::sweep_expired`] and [`TtlCache::spawn_sweeper`]
/// reclaim entries nobody reads.
#[derive(Clone)]
pub struct TtlCache {
  store: LocalStore,
  default_ttl: Ttl,
}

impl TtlCache {
  /// Open the cache partition on `store`.
  pub async fn open(store: LocalStore) -> StoreResult<Self> {
    store.open_partition(CACHE_PARTITION, "key", &[]).await?;
    Ok(Self {
      store,
      default_ttl: Ttl::DEFAULT,
    })
  }

  /// Set the lifetime used when `set_cache` gets no explicit TTL.
  pub fn with_default_ttl(mut self, ttl: Ttl) -> Self {
    self.default_ttl = ttl;
    self
  }

  /// Store `value` under `key`, replacing any previous entry.
  pub async fn set_cache<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Ttl>) -> StoreResult<()> {
    let entry = CacheEntry::new(key, serde_json::to_value(value)?, ttl.unwrap_or(self.default_ttl));
    self.store.put_as(CACHE_PARTITION, &entry).await?;
    Ok(())
  }

  /// Read `key`. Expired entries are deleted and reported as absent.
  pub async fn get_cache<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
    let Some(entry) = self.store.get_as::<CacheEntry>(CACHE_PARTITION, key).await? else {
      return Ok(None);
    };

    if entry.is_expired() {
      debug!(key, "cache entry expired");
      self.store.delete(CACHE_PARTITION, key).await?;
      return Ok(None);
    }

    Ok(Some(serde_json::from_value(entry.value)?))
  }

  pub async fn delete_cache(&self, key: &str) -> StoreResult<()> {
    self.store.delete(CACHE_PARTITION, key).await
  }

  /// Delete every expired entry. Returns how many were removed.
  pub async fn sweep_expired(&self) -> StoreResult<usize> {
    let now = Utc::now();
    let mut removed = 0;
    for raw in self.store.get_all(CACHE_PARTITION).await? {
      let entry: CacheEntry = match serde_json::from_value(raw) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(error = %e, "skipping unreadable cache entry");
          continue;
        }
      };
      if entry.is_expired_at(now) {
        self.store.delete(CACHE_PARTITION, &entry.key).await?;
        removed += 1;
      }
    }
    if removed > 0 {
      debug!(removed, "swept expired cache entries");
    }
    Ok(removed)
  }

  /// Run [`TtlCache::sweep_expired`] every `interval` until aborted.
  pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
    let cache = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      // The first tick completes immediately
      ticker.tick().await;
      loop {
        ticker.tick().await;
        if let Err(e) = cache.sweep_expired().await {
          warn!(error = %e, "cache sweep failed");
        }
      }
    })
  }
}
