//! Cache entry and lifetime types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Lifetime of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
  /// Expires this long after it was written
  After(Duration),
  /// Never expires
  Forever,
}

impl Ttl {
  pub const DEFAULT: Ttl = Ttl::After(Duration::from_secs(60 * 60));

  /// Absolute expiry for an entry written at `now`.
  pub fn expires_at(self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match self {
      Ttl::After(d) => chrono::Duration::from_std(d)
        .ok()
        .and_then(|d| now.checked_add_signed(d)),
      Ttl::Forever => None,
    }
  }
}

impl Default for Ttl {
  fn default() -> Self {
    Self::DEFAULT
  }
}

/// A stored cache entry. `expires_at == None` means it never expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  #[serde(with = "chrono::serde::ts_milliseconds_option")]
  pub expires_at: Option<DateTime<Utc>>,
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub created_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(key: impl Into<String>, value: Value, ttl: Ttl) -> Self {
    let now = Utc::now();
    Self {
      key: key.into(),
      value,
      expires_at: ttl.expires_at(now),
      created_at: now,
    }
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.is_some_and(|at| now > at)
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }
}
