//! SQLite persistence for surveys, records and intercepted responses.

pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::records::{Attachment, Record};
use crate::survey::Survey;

/// How a record write treats an existing row with the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
  /// Fail if the id exists
  Insert,
  /// Fail if the id does not exist; creation order is kept
  Replace,
  /// Insert or replace; creation order is kept when replacing
  Upsert,
}

/// Which records a listing returns. Sentinel records are never listed.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFilter<'a> {
  pub survey_id: Option<&'a str>,
  pub draft: Option<bool>,
}

/// Durable per-record storage.
///
/// Every write is atomic for the record it touches; there are no
/// multi-record transactions beyond a record and its last-saved snapshot.
pub trait RecordStore: Send + Sync {
  /// Write a record and, optionally, a snapshot upserted in the same transaction.
  fn write_record(&self, mode: WriteMode, record: &Record, snapshot: Option<&Record>)
    -> Result<Record>;

  fn get_record(&self, record_id: &str) -> Result<Option<Record>>;

  /// Returns whether a record was removed.
  fn remove_record(&self, record_id: &str) -> Result<bool>;

  /// Non-sentinel records in creation order.
  fn list_records(&self, filter: RecordFilter<'_>) -> Result<Vec<Record>>;
}

/// Durable storage of cached survey definitions.
pub trait SurveyStore: Send + Sync {
  fn get_survey(&self, survey_id: &str) -> Result<Option<Survey>>;

  /// Replace any cached copy wholesale.
  fn put_survey(&self, survey: &Survey) -> Result<()>;

  fn remove_survey(&self, survey_id: &str) -> Result<bool>;

  fn list_surveys(&self) -> Result<Vec<Survey>>;
}

/// SQLite-backed store used by every component.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open or create the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Private in-memory database, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".into()))?;

    Ok(data_dir.join("formsync").join("formsync.db"))
  }

  /// Run database migrations.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run migrations: {}", e)))?;

    // Databases created before records pinned their server
    let has_server_url = conn
      .prepare("SELECT 1 FROM pragma_table_info('records') WHERE name = 'server_url'")?
      .exists([])?;
    if !has_server_url {
      conn
        .execute_batch("ALTER TABLE records ADD COLUMN server_url TEXT")
        .map_err(|e| Error::Storage(format!("Failed to run migrations: {}", e)))?;
    }
    Ok(())
  }

  pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

// ============================================================================
// Records
// ============================================================================

impl RecordStore for Store {
  fn write_record(
    &self,
    mode: WriteMode,
    record: &Record,
    snapshot: Option<&Record>,
  ) -> Result<Record> {
    let conn = self.conn()?;
    let tx = conn.unchecked_transaction()?;

    let written = write_one(&tx, mode, record)?;
    if let Some(snapshot) = snapshot {
      write_one(&tx, WriteMode::Upsert, snapshot)?;
    }

    tx.commit()?;
    Ok(written)
  }

  fn get_record(&self, record_id: &str) -> Result<Option<Record>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT record_id, survey_id, name, xml, draft, ordinal, updated_at, server_url
         FROM records WHERE record_id = ?",
        params![record_id],
        record_from_row,
      )
      .optional()?;

    match row {
      Some(row) => Ok(Some(hydrate(&conn, row)?)),
      None => Ok(None),
    }
  }

  fn remove_record(&self, record_id: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn.unchecked_transaction()?;
    tx.execute(
      "DELETE FROM record_files WHERE record_id = ?",
      params![record_id],
    )?;
    let removed = tx.execute("DELETE FROM records WHERE record_id = ?", params![record_id])?;
    tx.commit()?;
    Ok(removed > 0)
  }

  fn list_records(&self, filter: RecordFilter<'_>) -> Result<Vec<Record>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT record_id, survey_id, name, xml, draft, ordinal, updated_at, server_url
       FROM records
       WHERE substr(record_id, 1, 2) <> '__'
         AND (?1 IS NULL OR survey_id = ?1)
         AND (?2 IS NULL OR draft = ?2)
       ORDER BY ordinal",
    )?;

    let rows: Vec<RecordRow> = stmt
      .query_map(params![filter.survey_id, filter.draft], record_from_row)?
      .collect::<rusqlite::Result<_>>()?;

    rows.into_iter().map(|row| hydrate(&conn, row)).collect()
  }
}

/// Columns of the records table before attachments are loaded.
struct RecordRow {
  record_id: String,
  survey_id: String,
  name: String,
  xml: String,
  draft: bool,
  order: i64,
  updated_at: String,
  server_url: Option<String>,
}

fn record_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
  Ok(RecordRow {
    record_id: row.get(0)?,
    survey_id: row.get(1)?,
    name: row.get(2)?,
    xml: row.get(3)?,
    draft: row.get(4)?,
    order: row.get(5)?,
    updated_at: row.get(6)?,
    server_url: row.get(7)?,
  })
}

fn hydrate(conn: &Connection, row: RecordRow) -> Result<Record> {
  let mut stmt = conn.prepare(
    "SELECT name, content_type, data FROM record_files
     WHERE record_id = ? ORDER BY position",
  )?;
  let files = stmt
    .query_map(params![row.record_id], |r| {
      Ok(Attachment {
        name: r.get(0)?,
        content_type: r.get(1)?,
        data: r.get(2)?,
      })
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  Ok(Record {
    record_id: row.record_id,
    survey_id: row.survey_id,
    name: row.name,
    xml: row.xml,
    files,
    draft: row.draft,
    server_url: row.server_url,
    order: row.order,
    updated_at: parse_datetime(&row.updated_at)?,
  })
}

fn write_one(conn: &Connection, mode: WriteMode, record: &Record) -> Result<Record> {
  let existing: Option<i64> = conn
    .query_row(
      "SELECT ordinal FROM records WHERE record_id = ?",
      params![record.record_id],
      |row| row.get(0),
    )
    .optional()?;

  let order = match (mode, existing) {
    (WriteMode::Insert, Some(_)) => {
      return Err(Error::InvalidRecord(format!(
        "record {} already exists",
        record.record_id
      )))
    }
    (WriteMode::Replace, None) => {
      return Err(Error::NotFound(format!(
        "record {} does not exist",
        record.record_id
      )))
    }
    (_, Some(order)) => order,
    (_, None) => conn.query_row(
      "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM records",
      [],
      |row| row.get(0),
    )?,
  };

  let updated_at = Utc::now();
  conn.execute(
    "INSERT OR REPLACE INTO records
       (record_id, survey_id, name, xml, draft, ordinal, updated_at, server_url)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    params![
      record.record_id,
      record.survey_id,
      record.name,
      record.xml,
      record.draft,
      order,
      updated_at.to_rfc3339(),
      record.server_url
    ],
  )?;

  conn.execute(
    "DELETE FROM record_files WHERE record_id = ?",
    params![record.record_id],
  )?;
  for (position, file) in record.files.iter().enumerate() {
    conn.execute(
      "INSERT INTO record_files (record_id, position, name, content_type, data)
       VALUES (?, ?, ?, ?, ?)",
      params![
        record.record_id,
        position as i64,
        file.name,
        file.content_type,
        file.data
      ],
    )?;
  }

  Ok(Record {
    order,
    updated_at,
    ..record.clone()
  })
}

// ============================================================================
// Surveys
// ============================================================================

impl SurveyStore for Store {
  fn get_survey(&self, survey_id: &str) -> Result<Option<Survey>> {
    let conn = self.conn()?;
    let row = conn
      .query_row(
        "SELECT survey_id, server_url, form_id, hash, form, model, manifest, media, cached_at
         FROM surveys WHERE survey_id = ?",
        params![survey_id],
        survey_from_row,
      )
      .optional()?;
    row.map(SurveyRow::into_survey).transpose()
  }

  fn put_survey(&self, survey: &Survey) -> Result<()> {
    if survey.hash.is_empty() {
      return Err(Error::InvalidRecord(format!(
        "survey {} has no version hash",
        survey.survey_id
      )));
    }
    let manifest = serde_json::to_string(&survey.manifest)?;
    let media = serde_json::to_string(&survey.media)?;

    self.conn()?.execute(
      "INSERT OR REPLACE INTO surveys
         (survey_id, server_url, form_id, hash, form, model, manifest, media, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        survey.survey_id,
        survey.server_url,
        survey.form_id,
        survey.hash,
        survey.form,
        survey.model,
        manifest,
        media,
        survey.cached_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn remove_survey(&self, survey_id: &str) -> Result<bool> {
    let removed = self
      .conn()?
      .execute("DELETE FROM surveys WHERE survey_id = ?", params![survey_id])?;
    Ok(removed > 0)
  }

  fn list_surveys(&self) -> Result<Vec<Survey>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT survey_id, server_url, form_id, hash, form, model, manifest, media, cached_at
       FROM surveys ORDER BY survey_id",
    )?;
    let rows = stmt
      .query_map([], survey_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(SurveyRow::into_survey).collect()
  }
}

struct SurveyRow {
  survey_id: String,
  server_url: String,
  form_id: String,
  hash: String,
  form: String,
  model: String,
  manifest: String,
  media: String,
  cached_at: String,
}

fn survey_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SurveyRow> {
  Ok(SurveyRow {
    survey_id: row.get(0)?,
    server_url: row.get(1)?,
    form_id: row.get(2)?,
    hash: row.get(3)?,
    form: row.get(4)?,
    model: row.get(5)?,
    manifest: row.get(6)?,
    media: row.get(7)?,
    cached_at: row.get(8)?,
  })
}

impl SurveyRow {
  fn into_survey(self) -> Result<Survey> {
    Ok(Survey {
      survey_id: self.survey_id,
      server_url: self.server_url,
      form_id: self.form_id,
      hash: self.hash,
      form: self.form,
      model: self.model,
      manifest: serde_json::from_str(&self.manifest)?,
      media: serde_json::from_str(&self.media)?,
      cached_at: parse_datetime(&self.cached_at)?,
      last_saved: None,
    })
  }
}

/// Parse an RFC 3339 timestamp written by this module.
pub(crate) fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::Storage(format!("Failed to parse datetime '{}': {}", s, e)))
}
