//! Response snapshots stored in the local store, keyed by request.

use chrono::Utc;
use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use super::types::{CachedResponse, Request, Response};
use crate::error::StoreResult;
use crate::store::{LocalStore, PutManyReport};

/// Static application assets (stale-while-revalidate)
pub const STATIC_PARTITION: &str = "static";
/// Live API reads (network-first)
pub const DYNAMIC_PARTITION: &str = "dynamic";
/// Map tiles and other bulk read-only assets (cache-first)
pub const TILES_PARTITION: &str = "tiles";

pub const RESPONSE_PARTITIONS: [&str; 3] = [STATIC_PARTITION, DYNAMIC_PARTITION, TILES_PARTITION];

/// Canonical cache key for a request: method plus URL without fragment.
pub fn canonical_key(method: &Method, url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  let input = format!("{} {}", method, url);

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(input.as_bytes());
  hex::encode(hasher.finalize())
}

/// Reads and writes response snapshots in the response partitions.
#[derive(Clone)]
pub struct ResponseCache {
  store: LocalStore,
}

impl ResponseCache {
  /// Open the response partitions on `store`.
  pub async fn open(store: LocalStore) -> StoreResult<Self> {
    for partition in RESPONSE_PARTITIONS {
      store.open_partition(partition, "key", &["url"]).await?;
    }
    Ok(Self { store })
  }

  pub async fn lookup(&self, partition: &str, request: &Request) -> StoreResult<Option<CachedResponse>> {
    let key = canonical_key(&request.method, &request.url);
    self.store.get_as(partition, &key).await
  }

  /// Persist `response` for `request`, stamped with the current time.
  pub async fn save(
    &self,
    partition: &str,
    request: &Request,
    response: &Response,
  ) -> StoreResult<CachedResponse> {
    let cached = snapshot(request, response);
    self.store.put_as(partition, &cached).await?;
    Ok(cached)
  }

  /// Persist several snapshots; failures are reported per record.
  pub async fn save_many(
    &self,
    partition: &str,
    entries: &[(Request, Response)],
  ) -> StoreResult<PutManyReport> {
    let records = entries
      .iter()
      .map(|(request, response)| serde_json::to_value(snapshot(request, response)))
      .collect::<Result<Vec<Value>, _>>()?;
    self.store.put_many(partition, records).await
  }
}

fn snapshot(request: &Request, response: &Response) -> CachedResponse {
  CachedResponse {
    key: canonical_key(&request.method, &request.url),
    url: request.url.to_string(),
    response: response.clone(),
    captured_at: Utc::now(),
  }
}
