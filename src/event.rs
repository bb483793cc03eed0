use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::engine::{ControlMessage, Engine, MessageOutcome};
use crate::error::{EngineError, RouteError};
use crate::network::{Request, Served};
use crate::sync::{ClickOutcome, DrainReport, Notification};

/// Engine events. Each carries a reply channel where the caller expects
/// an answer.
#[derive(Debug)]
pub enum EngineEvent {
  /// Outbound request to route
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<Served, RouteError>>,
  },
  /// Offline write: store the record and queue it for sync
  SaveForSync {
    partition: String,
    record: Value,
    reply: oneshot::Sender<Result<String, EngineError>>,
  },
  /// Control message from the application
  Message {
    message: ControlMessage,
    reply: oneshot::Sender<Result<MessageOutcome, EngineError>>,
  },
  /// Connectivity-restored trigger
  Sync {
    tag: String,
    reply: oneshot::Sender<Result<Option<DrainReport>, EngineError>>,
  },
  /// Push delivery
  Push {
    payload: Vec<u8>,
    reply: oneshot::Sender<Notification>,
  },
  /// Click on a shown notification
  NotificationClick {
    action: Option<String>,
    notification: Notification,
    reply: oneshot::Sender<ClickOutcome>,
  },
}

/// Background triggers from the host.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
  /// Connectivity restored; no tag means the configured sync tag
  Sync {
    #[serde(default)]
    tag: Option<String>,
  },
  /// Push delivery; the payload is handed over as-is
  Push {
    #[serde(default)]
    payload: Value,
  },
}

/// One line of host input: a control message or a trigger.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HostLine {
  Control(ControlMessage),
  Trigger(Trigger),
}

impl HostLine {
  pub fn parse(bytes: &[u8]) -> Result<Self, EngineError> {
    serde_json::from_slice(bytes).map_err(|e| EngineError::Message(e.to_string()))
  }
}

/// Cloneable sender side of the engine's event loop.
#[derive(Clone)]
pub struct EngineHandle {
  tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Move `engine` onto its own task and process events one at a time.
/// The loop ends once every handle is dropped.
pub fn spawn(mut engine: Engine) -> (EngineHandle, JoinHandle<()>) {
  let (tx, mut rx) = mpsc::unbounded_channel();

  let task = tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      dispatch(&mut engine, event).await;
    }
    debug!("engine event loop stopped");
  });

  (EngineHandle { tx }, task)
}

async fn dispatch(engine: &mut Engine, event: EngineEvent) {
  // A dropped receiver only means the caller stopped waiting
  match event {
    EngineEvent::Fetch { request, reply } => {
      let _ = reply.send(engine.fetch(request).await);
    }
    EngineEvent::SaveForSync {
      partition,
      record,
      reply,
    } => {
      let _ = reply.send(engine.save_for_sync(&partition, record).await);
    }
    EngineEvent::Message { message, reply } => {
      let _ = reply.send(engine.handle_message(message).await);
    }
    EngineEvent::Sync { tag, reply } => {
      let _ = reply.send(engine.on_sync(&tag).await);
    }
    EngineEvent::Push { payload, reply } => {
      let _ = reply.send(engine.on_push(&payload));
    }
    EngineEvent::NotificationClick {
      action,
      notification,
      reply,
    } => {
      let _ = reply.send(engine.on_notification_click(action.as_deref(), &notification));
    }
  }
}

impl EngineHandle {
  async fn send<T>(&self, event: EngineEvent, rx: oneshot::Receiver<T>) -> Result<T, EngineError> {
    self.tx.send(event).map_err(|_| EngineError::Closed)?;
    rx.await.map_err(|_| EngineError::Closed)
  }

  pub async fn fetch(&self, request: Request) -> Result<Served, EngineError> {
    let (reply, rx) = oneshot::channel();
    Ok(self.send(EngineEvent::Fetch { request, reply }, rx).await??)
  }

  pub async fn save_for_sync(&self, partition: &str, record: Value) -> Result<String, EngineError> {
    let (reply, rx) = oneshot::channel();
    let event = EngineEvent::SaveForSync {
      partition: partition.to_string(),
      record,
      reply,
    };
    self.send(event, rx).await?
  }

  pub async fn message(&self, message: ControlMessage) -> Result<MessageOutcome, EngineError> {
    let (reply, rx) = oneshot::channel();
    self.send(EngineEvent::Message { message, reply }, rx).await?
  }

  pub async fn sync(&self, tag: &str) -> Result<Option<DrainReport>, EngineError> {
    let (reply, rx) = oneshot::channel();
    let event = EngineEvent::Sync {
      tag: tag.to_string(),
      reply,
    };
    self.send(event, rx).await?
  }

  pub async fn push(&self, payload: Vec<u8>) -> Result<Notification, EngineError> {
    let (reply, rx) = oneshot::channel();
    self.send(EngineEvent::Push { payload, reply }, rx).await
  }

  pub async fn notification_click(
    &self,
    action: Option<String>,
    notification: Notification,
  ) -> Result<ClickOutcome, EngineError> {
    let (reply, rx) = oneshot::channel();
    let event = EngineEvent::NotificationClick {
      action,
      notification,
      reply,
    };
    self.send(event, rx).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;
  use crate::db::Database;
  use crate::network::testing::FakeTransport;
  use crate::network::{Response, ServedFrom};
  use crate::sync::TracingNotifier;
  use serde_json::json;
  use std::sync::Arc;
  use url::Url;

  async fn running() -> (EngineHandle, JoinHandle<()>, Arc<FakeTransport>) {
    let transport = Arc::new(FakeTransport::default());
    let config = Config {
      origin: "https://app.test/".into(),
      ..Config::default()
    };
    let mut engine = Engine::new(
      &config,
      Database::open_in_memory().unwrap(),
      transport.clone(),
      Arc::new(TracingNotifier),
    )
    .await
    .unwrap();
    engine.skip_install().await.unwrap();
    engine.activate().await.unwrap();
    let (handle, task) = spawn(engine);
    (handle, task, transport)
  }

  #[tokio::test]
  async fn fetch_goes_through_the_loop() {
    let (handle, _task, transport) = running().await;
    transport.set_offline(true);

    let served = handle
      .fetch(Request::get(Url::parse("https://app.test/api/prices").unwrap()))
      .await
      .unwrap();
    assert_eq!(served.source, ServedFrom::Offline);
  }

  #[tokio::test]
  async fn offline_write_then_sync() {
    let (handle, _task, transport) = running().await;
    transport.set_offline(true);
    handle
      .save_for_sync("reports", json!({"id": "r1", "storeId": "s1"}))
      .await
      .unwrap();

    let report = handle.sync("sync-reports").await.unwrap().unwrap();
    assert_eq!(report.failed, 1);

    transport.set_offline(false);
    transport.respond("https://app.test/api/reports", Response::new(201, ""));
    let report = handle.sync("sync-reports").await.unwrap().unwrap();
    assert_eq!(report.delivered, 1);
  }

  #[tokio::test]
  async fn push_and_click() {
    let (handle, _task, _) = running().await;
    let n = handle.push(b"garbage".to_vec()).await.unwrap();
    assert_eq!(n.url, "/");

    let outcome = handle.notification_click(None, n).await.unwrap();
    assert_eq!(outcome, ClickOutcome::OpenWindow("/".into()));
  }

  #[test]
  fn host_lines_cover_messages_and_triggers() {
    assert_eq!(
      HostLine::parse(br#"{"type":"CLEAR_CACHE"}"#).unwrap(),
      HostLine::Control(ControlMessage::ClearCache)
    );
    assert_eq!(
      HostLine::parse(br#"{"type":"SYNC"}"#).unwrap(),
      HostLine::Trigger(Trigger::Sync { tag: None })
    );
    assert_eq!(
      HostLine::parse(br#"{"type":"SYNC","tag":"sync-reports"}"#).unwrap(),
      HostLine::Trigger(Trigger::Sync {
        tag: Some("sync-reports".into())
      })
    );
    assert_eq!(
      HostLine::parse(br#"{"type":"PUSH","payload":{"title":"Price drop"}}"#).unwrap(),
      HostLine::Trigger(Trigger::Push {
        payload: json!({"title": "Price drop"})
      })
    );
    assert!(HostLine::parse(br#"{"type":"REBOOT"}"#).is_err());
  }

  #[tokio::test]
  async fn loop_stops_when_handles_drop() {
    let (handle, task, _) = running().await;
    drop(handle);
    tokio::time::timeout(std::time::Duration::from_secs(1), task)
      .await
      .unwrap()
      .unwrap();
  }
}
