pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{StoreError, StoreResult};

/// Shared handle to the SQLite file backing the local store.
///
/// Every call is dispatched onto the blocking pool so storage I/O never
/// stalls the async executor.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at `path`, creating parent directories.
  pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    info!(path = %path.display(), "opening local store");
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    Self::prepare(conn)
  }

  /// In-memory database, gone when the last handle drops.
  pub fn open_in_memory() -> StoreResult<Self> {
    debug!("opening in-memory local store");
    Self::prepare(Connection::open_in_memory()?)
  }

  fn prepare(conn: Connection) -> StoreResult<Self> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5_000_i32)?;
    conn.execute_batch(schema::SCHEMA)?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("offline-engine").join("store.db"))
  }

  /// Run `f` against the connection on the blocking pool.
  pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
  where
    F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let conn = conn
        .lock()
        .map_err(|e| StoreError::TaskJoin(format!("lock poisoned: {e}")))?;
      f(&conn)
    })
    .await?
  }

  /// Like [`Database::execute`], with a `&mut Connection` for transactions.
  pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
  where
    F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn
        .lock()
        .map_err(|e| StoreError::TaskJoin(format!("lock poisoned: {e}")))?;
      f(&mut conn)
    })
    .await?
  }
}
