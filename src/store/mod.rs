//! Persistent local store: named partitions of JSON records keyed by a
//! declared primary-key field, with equality secondary indexes.
//!
//! Each `put` rewrites a record and its index entries inside one SQLite
//! transaction, so a record and its indexes never diverge.
//!
//! Primary keys are stored as text: the number `1` and the string `"1"`
//! address the same record. Numbers with an integral value are normalized
//! before keying and indexing, so `1` and `1.0` also match.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// Declared shape of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSchema {
  pub name: String,
  pub primary_key: String,
  pub indexes: Vec<String>,
}

/// Outcome of [`LocalStore::put_many`].
#[derive(Debug, Default)]
pub struct PutManyReport {
  /// Number of records written
  pub succeeded: usize,
  /// Records that could not be written, by position in the input
  pub failures: Vec<PutFailure>,
}

/// One rejected record from a bulk upsert.
#[derive(Debug)]
pub struct PutFailure {
  pub index: usize,
  pub error: StoreError,
}

/// Handle to the durable store. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct LocalStore {
  db: Database,
}

impl LocalStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Create `name` on first use; later calls with the same primary key are
  /// no-ops. A different primary key fails with [`StoreError::Schema`].
  pub async fn open_partition(
    &self,
    name: &str,
    primary_key: &str,
    indexes: &[&str],
  ) -> StoreResult<()> {
    let schema = PartitionSchema {
      name: name.to_string(),
      primary_key: primary_key.to_string(),
      indexes: indexes.iter().map(|s| s.to_string()).collect(),
    };

    self
      .db
      .execute(move |conn| {
        match load_schema(conn, &schema.name).optional_partition()? {
          Some(existing) if existing.primary_key != schema.primary_key => Err(StoreError::Schema {
            partition: schema.name,
            expected: schema.primary_key,
            found: existing.primary_key,
          }),
          Some(existing) => {
            if existing.indexes != schema.indexes {
              debug!(partition = %schema.name, "partition already open; keeping original indexes");
            }
            Ok(())
          }
          None => {
            conn.execute(
              "INSERT INTO partitions (name, primary_key, indexes) VALUES (?, ?, ?)",
              params![
                schema.name,
                schema.primary_key,
                serde_json::to_string(&schema.indexes)?
              ],
            )?;
            info!(partition = %schema.name, key = %schema.primary_key, "created partition");
            Ok(())
          }
        }
      })
      .await
  }

  /// Schema of an opened partition.
  pub async fn schema(&self, partition: &str) -> StoreResult<PartitionSchema> {
    let partition = partition.to_string();
    self.db.execute(move |conn| load_schema(conn, &partition)).await
  }

  /// Names of every opened partition.
  pub async fn partition_names(&self) -> StoreResult<Vec<String>> {
    self
      .db
      .execute(|conn| {
        let mut stmt = conn.prepare("SELECT name FROM partitions ORDER BY name")?;
        let names = stmt
          .query_map([], |row| row.get(0))?
          .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
      })
      .await
  }

  /// Drop a partition with all of its records. Returns whether it existed.
  pub async fn delete_partition(&self, partition: &str) -> StoreResult<bool> {
    let partition = partition.to_string();
    self
      .db
      .execute_mut(move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM record_index WHERE partition = ?", params![partition])?;
        tx.execute("DELETE FROM records WHERE partition = ?", params![partition])?;
        let removed = tx.execute("DELETE FROM partitions WHERE name = ?", params![partition])?;
        tx.commit()?;
        if removed > 0 {
          info!(partition = %partition, "deleted partition");
        }
        Ok(removed > 0)
      })
      .await
  }

  /// Upsert `record` by its primary key. Returns the key.
  pub async fn put(&self, partition: &str, record: Value) -> StoreResult<String> {
    let partition = partition.to_string();
    self
      .db
      .execute_mut(move |conn| {
        let schema = load_schema(conn, &partition)?;
        put_record(conn, &schema, &record)
      })
      .await
  }

  /// Serialize `record` and upsert it.
  pub async fn put_as<T: Serialize>(&self, partition: &str, record: &T) -> StoreResult<String> {
    self.put(partition, serde_json::to_value(record)?).await
  }

  /// Best-effort bulk upsert. Each record is written in its own
  /// transaction; one bad record does not abort the rest.
  pub async fn put_many(&self, partition: &str, records: Vec<Value>) -> StoreResult<PutManyReport> {
    let partition = partition.to_string();
    self
      .db
      .execute_mut(move |conn| {
        let schema = load_schema(conn, &partition)?;
        let mut report = PutManyReport::default();
        for (index, record) in records.iter().enumerate() {
          match put_record(conn, &schema, record) {
            Ok(_) => report.succeeded += 1,
            Err(error) => {
              warn!(partition = %partition, index, error = %error, "bulk put rejected record");
              report.failures.push(PutFailure { index, error });
            }
          }
        }
        Ok(report)
      })
      .await
  }

  pub async fn get(&self, partition: &str, key: &str) -> StoreResult<Option<Value>> {
    let partition = partition.to_string();
    let key = key.to_string();
    self
      .db
      .execute(move |conn| {
        load_schema(conn, &partition)?;
        let data: Option<Vec<u8>> = conn
          .query_row(
            "SELECT data FROM records WHERE partition = ? AND record_key = ?",
            params![partition, key],
            |row| row.get(0),
          )
          .optional()?;
        data
          .map(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
          .transpose()
      })
      .await
  }

  /// Fetch and deserialize a record.
  pub async fn get_as<T: DeserializeOwned>(&self, partition: &str, key: &str) -> StoreResult<Option<T>> {
    match self.get(partition, key).await? {
      Some(value) => Ok(Some(serde_json::from_value(value)?)),
      None => Ok(None),
    }
  }

  /// All records in primary-key order.
  pub async fn get_all(&self, partition: &str) -> StoreResult<Vec<Value>> {
    let partition = partition.to_string();
    self
      .db
      .execute(move |conn| {
        load_schema(conn, &partition)?;
        let mut stmt =
          conn.prepare("SELECT data FROM records WHERE partition = ? ORDER BY record_key")?;
        let rows = stmt
          .query_map(params![partition], |row| row.get::<_, Vec<u8>>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        decode_all(rows)
      })
      .await
  }

  /// Records whose `index` field equals `value`.
  pub async fn get_by_index(
    &self,
    partition: &str,
    index: &str,
    value: &Value,
  ) -> StoreResult<Vec<Value>> {
    let partition = partition.to_string();
    let index = index.to_string();
    let encoded = index_text(value)?;
    self
      .db
      .execute(move |conn| {
        let schema = load_schema(conn, &partition)?;
        if !schema.indexes.contains(&index) {
          return Err(StoreError::IndexNotFound { partition, index });
        }
        let mut stmt = conn.prepare(
          "SELECT r.data FROM record_index i
           INNER JOIN records r ON r.partition = i.partition AND r.record_key = i.record_key
           WHERE i.partition = ? AND i.index_name = ? AND i.index_value = ?
           ORDER BY r.record_key",
        )?;
        let rows = stmt
          .query_map(params![partition, index, encoded], |row| row.get::<_, Vec<u8>>(0))?
          .collect::<Result<Vec<_>, _>>()?;
        decode_all(rows)
      })
      .await
  }

  /// Remove one record. Missing keys are not an error.
  pub async fn delete(&self, partition: &str, key: &str) -> StoreResult<()> {
    let partition = partition.to_string();
    let key = key.to_string();
    self
      .db
      .execute_mut(move |conn| {
        load_schema(conn, &partition)?;
        let tx = conn.transaction()?;
        tx.execute(
          "DELETE FROM record_index WHERE partition = ? AND record_key = ?",
          params![partition, key],
        )?;
        tx.execute(
          "DELETE FROM records WHERE partition = ? AND record_key = ?",
          params![partition, key],
        )?;
        tx.commit()?;
        Ok(())
      })
      .await
  }

  /// Remove every record, keeping the partition and its schema.
  pub async fn clear_partition(&self, partition: &str) -> StoreResult<()> {
    let partition = partition.to_string();
    self
      .db
      .execute_mut(move |conn| {
        load_schema(conn, &partition)?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM record_index WHERE partition = ?", params![partition])?;
        let removed = tx.execute("DELETE FROM records WHERE partition = ?", params![partition])?;
        tx.commit()?;
        debug!(partition = %partition, removed, "cleared partition");
        Ok(())
      })
      .await
  }
}

/// Read the schema row for `name`, or [`StoreError::PartitionNotFound`].
fn load_schema(conn: &Connection, name: &str) -> StoreResult<PartitionSchema> {
  let row: Option<(String, String)> = conn
    .query_row(
      "SELECT primary_key, indexes FROM partitions WHERE name = ?",
      params![name],
      |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()?;

  match row {
    Some((primary_key, indexes)) => Ok(PartitionSchema {
      name: name.to_string(),
      primary_key,
      indexes: serde_json::from_str(&indexes)?,
    }),
    None => Err(StoreError::PartitionNotFound {
      partition: name.to_string(),
    }),
  }
}

trait OptionalPartition<T> {
  fn optional_partition(self) -> StoreResult<Option<T>>;
}

impl<T> OptionalPartition<T> for StoreResult<T> {
  fn optional_partition(self) -> StoreResult<Option<T>> {
    match self {
      Ok(v) => Ok(Some(v)),
      Err(StoreError::PartitionNotFound { .. }) => Ok(None),
      Err(e) => Err(e),
    }
  }
}

/// Upsert one record and rebuild its index entries atomically.
fn put_record(conn: &mut Connection, schema: &PartitionSchema, record: &Value) -> StoreResult<String> {
  let key = record_key(schema, record)?;
  let data = serde_json::to_vec(record)?;

  let tx = conn.transaction()?;
  tx.execute(
    "DELETE FROM record_index WHERE partition = ? AND record_key = ?",
    params![schema.name, key],
  )?;
  tx.execute(
    "INSERT INTO records (partition, record_key, data) VALUES (?, ?, ?)
     ON CONFLICT(partition, record_key) DO UPDATE SET data = excluded.data",
    params![schema.name, key, data],
  )?;
  for index in &schema.indexes {
    // Records without the field are simply absent from the index
    if let Some(value) = record.get(index).filter(|v| !v.is_null()) {
      tx.execute(
        "INSERT INTO record_index (partition, index_name, index_value, record_key)
         VALUES (?, ?, ?, ?)",
        params![schema.name, index, index_text(value)?, key],
      )?;
    }
  }
  tx.commit()?;

  Ok(key)
}

/// Primary key of `record` as text. Strings (including the empty string)
/// and numbers are accepted.
fn record_key(schema: &PartitionSchema, record: &Value) -> StoreResult<String> {
  let object = record.as_object().ok_or_else(|| StoreError::InvalidRecord {
    reason: format!("records in {} must be JSON objects", schema.name),
  })?;

  match object.get(&schema.primary_key) {
    Some(Value::String(s)) => Ok(s.clone()),
    Some(Value::Number(n)) => Ok(number_text(n)),
    Some(other) => Err(StoreError::InvalidRecord {
      reason: format!("primary key {} has unsupported value {}", schema.primary_key, other),
    }),
    None => Err(StoreError::InvalidRecord {
      reason: format!("missing primary key field {}", schema.primary_key),
    }),
  }
}

/// Integral floats collapse onto their integer spelling.
fn number_text(n: &serde_json::Number) -> String {
  match n.as_f64() {
    Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => (f as i64).to_string(),
    _ => n.to_string(),
  }
}

/// Text stored in the index table for an indexed field value.
fn index_text(value: &Value) -> StoreResult<String> {
  match value {
    Value::Number(n) => Ok(number_text(n)),
    other => Ok(serde_json::to_string(other)?),
  }
}

fn decode_all(rows: Vec<Vec<u8>>) -> StoreResult<Vec<Value>> {
  rows
    .iter()
    .map(|bytes| serde_json::from_slice(bytes).map_err(StoreError::from))
    .collect()
}
