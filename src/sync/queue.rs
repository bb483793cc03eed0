//! Durable FIFO of writes waiting for the network.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{Ttl, TtlCache};
use crate::error::StoreResult;

/// Cache key holding the whole queue.
pub const SYNC_QUEUE_KEY: &str = "syncQueue";

/// A record write that has not been confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  /// Partition owning the record
  pub target_store: String,
  /// Primary key of the record
  pub record_id: String,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub enqueued_at: DateTime<Utc>,
}

/// Sync queue stored as a single never-expiring cache entry.
///
/// Appends are read-modify-write and assume a single writer; the event
/// loop in [`crate::event`] provides that.
#[derive(Clone)]
pub struct SyncQueue {
  cache: TtlCache,
}

impl SyncQueue {
  pub fn new(cache: TtlCache) -> Self {
    Self { cache }
  }

  /// Append an operation for `record_id` in `partition`.
  pub async fn mark_for_sync(&self, partition: &str, record_id: &str) -> StoreResult<()> {
    let mut queue = self.get_sync_queue().await?;
    queue.push(QueuedOperation {
      target_store: partition.to_string(),
      record_id: record_id.to_string(),
      enqueued_at: Utc::now(),
    });
    debug!(partition, record_id, pending = queue.len(), "marked for sync");
    self.write(&queue).await
  }

  /// Pending operations in enqueue order.
  pub async fn get_sync_queue(&self) -> StoreResult<Vec<QueuedOperation>> {
    Ok(
      self
        .cache
        .get_cache::<Vec<QueuedOperation>>(SYNC_QUEUE_KEY)
        .await?
        .unwrap_or_default(),
    )
  }

  pub async fn clear_sync_queue(&self) -> StoreResult<()> {
    self.cache.delete_cache(SYNC_QUEUE_KEY).await
  }

  /// Replace the queue wholesale; an empty list clears it.
  pub(crate) async fn replace(&self, operations: Vec<QueuedOperation>) -> StoreResult<()> {
    if operations.is_empty() {
      self.clear_sync_queue().await
    } else {
      self.write(&operations).await
    }
  }

  async fn write(&self, operations: &[QueuedOperation]) -> StoreResult<()> {
    self
      .cache
      .set_cache(SYNC_QUEUE_KEY, &operations, Some(Ttl::Forever))
      .await
  }
}
