//! Offline write queue and the background coordinator that drains it.

pub mod coordinator;
pub mod queue;

pub use coordinator::{
  ClickOutcome, Coordinator, DrainReport, Notification, NotificationHost, TracingNotifier, DEFAULT_SYNC_TAG,
};
pub use queue::{QueuedOperation, SyncQueue, SYNC_QUEUE_KEY};
