//! Partitioned response storage and its SQLite implementation.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::db::{parse_datetime, Store};
use crate::error::Result;

use super::traits::{CachedEntry, CachedResponse};

/// Trait for partitioned cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Store a response, replacing any entry under the same key.
  fn put_entry(
    &self,
    partition: &str,
    key: &str,
    response: &CachedResponse,
    survey_id: Option<&str>,
  ) -> Result<()>;

  fn get_entry(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>>;

  fn contains(&self, partition: &str, key: &str) -> Result<bool>;

  fn remove_entry(&self, partition: &str, key: &str) -> Result<bool>;

  /// Remove every entry of a partition tagged with `survey_id`.
  fn remove_survey_entries(&self, partition: &str, survey_id: &str) -> Result<usize>;

  /// Names of all partitions holding at least one entry.
  fn partitions(&self) -> Result<Vec<String>>;

  fn delete_partition(&self, partition: &str) -> Result<usize>;
}

impl CacheStorage for Store {
  fn put_entry(
    &self,
    partition: &str,
    key: &str,
    response: &CachedResponse,
    survey_id: Option<&str>,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)?;
    self.conn()?.execute(
      "INSERT OR REPLACE INTO cache_entries
         (partition, cache_key, survey_id, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        key,
        survey_id,
        response.status,
        headers,
        response.body,
        Utc::now().to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn get_entry(&self, partition: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.conn()?;
    let row: Option<(u16, String, Vec<u8>, Option<String>, String)> = conn
      .query_row(
        "SELECT status, headers, body, survey_id, cached_at FROM cache_entries
         WHERE partition = ? AND cache_key = ?",
        params![partition, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
      )
      .optional()?;

    let Some((status, headers, body, survey_id, cached_at)) = row else {
      return Ok(None);
    };
    Ok(Some(CachedEntry {
      response: CachedResponse {
        status,
        headers: serde_json::from_str(&headers)?,
        body,
      },
      survey_id,
      cached_at: parse_datetime(&cached_at)?,
    }))
  }

  fn contains(&self, partition: &str, key: &str) -> Result<bool> {
    let found = self
      .conn()?
      .query_row(
        "SELECT 1 FROM cache_entries WHERE partition = ? AND cache_key = ?",
        params![partition, key],
        |_| Ok(()),
      )
      .optional()?;
    Ok(found.is_some())
  }

  fn remove_entry(&self, partition: &str, key: &str) -> Result<bool> {
    let removed = self.conn()?.execute(
      "DELETE FROM cache_entries WHERE partition = ? AND cache_key = ?",
      params![partition, key],
    )?;
    Ok(removed > 0)
  }

  fn remove_survey_entries(&self, partition: &str, survey_id: &str) -> Result<usize> {
    Ok(self.conn()?.execute(
      "DELETE FROM cache_entries WHERE partition = ? AND survey_id = ?",
      params![partition, survey_id],
    )?)
  }

  fn partitions(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt =
      conn.prepare("SELECT DISTINCT partition FROM cache_entries ORDER BY partition")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<usize> {
    Ok(self.conn()?.execute(
      "DELETE FROM cache_entries WHERE partition = ?",
      params![partition],
    )?)
  }
}
