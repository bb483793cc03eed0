//! Reacts to connectivity-restored triggers and push deliveries.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use super::queue::{QueuedOperation, SyncQueue};
use crate::error::{StoreError, StoreResult, TransportError};
use crate::network::{Request, Router};
use crate::store::LocalStore;

/// Trigger tag that drains the sync queue.
pub const DEFAULT_SYNC_TAG: &str = "sync-reports";

/// Counts from one drain of the sync queue.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
  /// Confirmed by the server and removed
  pub delivered: usize,
  /// Kept for the next trigger
  pub failed: usize,
  /// Removed because the record no longer exists locally
  pub dropped: usize,
}

#[derive(Debug, Error)]
enum DeliveryError {
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Transport(#[from] TransportError),
  #[error("server rejected record with status {0}")]
  Rejected(u16),
}

enum Delivery {
  Delivered,
  Missing,
}

/// A notification the host should surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub title: String,
  pub body: String,
  /// Opened when the notification is clicked
  pub url: String,
}

/// What a notification click resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  OpenWindow(String),
  Dismiss,
}

/// Host surface that displays notifications and opens windows.
pub trait NotificationHost: Send + Sync {
  fn show(&self, notification: &Notification);
  fn open_window(&self, url: &str);
}

/// Host that only logs; used when no UI is attached.
pub struct TracingNotifier;

impl NotificationHost for TracingNotifier {
  fn show(&self, notification: &Notification) {
    info!(title = %notification.title, body = %notification.body, url = %notification.url, "notification");
  }

  fn open_window(&self, url: &str) {
    info!(url, "open window");
  }
}

/// Drains the sync queue and relays push notifications.
#[derive(Clone)]
pub struct Coordinator {
  store: LocalStore,
  queue: SyncQueue,
  router: Router,
  notifier: Arc<dyn NotificationHost>,
  sync_tag: String,
  /// Partition name to API path receiving its records
  endpoints: HashMap<String, String>,
  default_title: String,
}

impl Coordinator {
  pub fn new(store: LocalStore, queue: SyncQueue, router: Router, notifier: Arc<dyn NotificationHost>) -> Self {
    Self {
      store,
      queue,
      router,
      notifier,
      sync_tag: DEFAULT_SYNC_TAG.to_string(),
      endpoints: HashMap::new(),
      default_title: "Notification".to_string(),
    }
  }

  pub fn with_sync_tag(mut self, tag: impl Into<String>) -> Self {
    self.sync_tag = tag.into();
    self
  }

  pub fn with_endpoints(mut self, endpoints: HashMap<String, String>) -> Self {
    self.endpoints = endpoints;
    self
  }

  pub fn with_default_title(mut self, title: impl Into<String>) -> Self {
    self.default_title = title.into();
    self
  }

  /// Handle a background-sync trigger. Unknown tags are ignored.
  pub async fn on_sync(&self, tag: &str) -> StoreResult<Option<DrainReport>> {
    if tag != self.sync_tag {
      debug!(tag, "ignoring unknown sync tag");
      return Ok(None);
    }
    self.drain().await.map(Some)
  }

  /// Deliver every queued operation in order.
  ///
  /// Failed operations stay queued, in order, ahead of anything enqueued
  /// while the drain was running. An error here means the queue itself
  /// could not be read or rewritten; the trigger should retry later.
  pub async fn drain(&self) -> StoreResult<DrainReport> {
    let snapshot = self.queue.get_sync_queue().await?;
    let mut report = DrainReport::default();
    if snapshot.is_empty() {
      return Ok(report);
    }

    info!(pending = snapshot.len(), "draining sync queue");
    let mut retained = Vec::new();
    for op in &snapshot {
      match self.deliver(op).await {
        Ok(Delivery::Delivered) => report.delivered += 1,
        Ok(Delivery::Missing) => {
          warn!(partition = %op.target_store, record = %op.record_id, "record vanished, dropping from queue");
          report.dropped += 1;
        }
        Err(e) => {
          warn!(partition = %op.target_store, record = %op.record_id, error = %e, "delivery failed, will retry");
          report.failed += 1;
          retained.push(op.clone());
        }
      }
    }

    let current = self.queue.get_sync_queue().await?;
    retained.extend(current.into_iter().skip(snapshot.len()));
    self.queue.replace(retained).await?;

    info!(
      delivered = report.delivered,
      failed = report.failed,
      dropped = report.dropped,
      "sync drain finished"
    );
    Ok(report)
  }

  /// Re-read the record from its owning partition and POST it.
  async fn deliver(&self, op: &QueuedOperation) -> Result<Delivery, DeliveryError> {
    let record = match self.store.get(&op.target_store, &op.record_id).await {
      Ok(Some(record)) => record,
      Ok(None) | Err(StoreError::PartitionNotFound { .. }) => return Ok(Delivery::Missing),
      Err(e) => return Err(e.into()),
    };

    let url = self.endpoint_url(&op.target_store)?;
    let response = self.router.fetch_network(&Request::post_json(url, &record)).await?;
    if response.is_success() {
      debug!(partition = %op.target_store, record = %op.record_id, status = response.status, "delivered");
      Ok(Delivery::Delivered)
    } else {
      Err(DeliveryError::Rejected(response.status))
    }
  }

  fn endpoint_url(&self, partition: &str) -> Result<Url, TransportError> {
    let path = self
      .endpoints
      .get(partition)
      .cloned()
      .unwrap_or_else(|| format!("/api/{partition}"));
    self
      .router
      .rules()
      .origin
      .join(&path)
      .map_err(|e| TransportError::InvalidUrl(format!("{path}: {e}")))
  }

  /// Parse a push payload and ask the host to show it. Malformed payloads
  /// fall back to defaults.
  pub fn on_push(&self, payload: &[u8]) -> Notification {
    let notification = self.parse_push(payload);
    self.notifier.show(&notification);
    notification
  }

  fn parse_push(&self, payload: &[u8]) -> Notification {
    let value: Value = serde_json::from_slice(payload).unwrap_or_else(|e| {
      debug!(error = %e, "push payload is not JSON");
      Value::Null
    });
    let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

    Notification {
      title: field("title").unwrap_or_else(|| self.default_title.clone()),
      body: field("body").unwrap_or_default(),
      url: field("url").unwrap_or_else(|| "/".to_string()),
    }
  }

  /// A click with no action opens the notification's URL; any named
  /// action just dismisses it.
  pub fn on_notification_click(&self, action: Option<&str>, notification: &Notification) -> ClickOutcome {
    match action {
      None | Some("") => {
        self.notifier.open_window(&notification.url);
        ClickOutcome::OpenWindow(notification.url.clone())
      }
      Some(_) => ClickOutcome::Dismiss,
    }
  }
}
