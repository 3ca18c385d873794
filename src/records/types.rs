use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Prefix reserved for sentinel record ids.
pub const RESERVED_PREFIX: &str = "__";

const AUTO_SAVE_PREFIX: &str = "__autoSave_";
const LAST_SAVED_PREFIX: &str = "__lastSaved_";

/// A binary file attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
  pub name: String,
  pub content_type: Option<String>,
  pub data: Vec<u8>,
}

impl Attachment {
  pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
    Self {
      name: name.into(),
      content_type: None,
      data,
    }
  }

  pub fn size(&self) -> u64 {
    self.data.len() as u64
  }
}

/// One form-data instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
  /// Stable instance identifier (e.g. "uuid:...")
  pub record_id: String,
  pub survey_id: String,
  /// Display name shown in record listings
  pub name: String,
  pub xml: String,
  #[serde(default)]
  pub files: Vec<Attachment>,
  pub draft: bool,
  /// Server the record is submitted to, pinned when it is saved
  #[serde(default)]
  pub server_url: Option<String>,
  /// Creation order, assigned by the store on insert
  #[serde(default)]
  pub order: i64,
  #[serde(default = "Utc::now")]
  pub updated_at: DateTime<Utc>,
}

impl Record {
  pub fn new(
    record_id: impl Into<String>,
    survey_id: impl Into<String>,
    name: impl Into<String>,
    xml: impl Into<String>,
  ) -> Self {
    Self {
      record_id: record_id.into(),
      survey_id: survey_id.into(),
      name: name.into(),
      xml: xml.into(),
      files: Vec::new(),
      draft: false,
      server_url: None,
      order: 0,
      updated_at: Utc::now(),
    }
  }

  pub fn draft(mut self, draft: bool) -> Self {
    self.draft = draft;
    self
  }

  pub fn with_file(mut self, file: Attachment) -> Self {
    self.files.push(file);
    self
  }

  /// Whether the id belongs to a sentinel (autosave or last-saved) record.
  pub fn is_sentinel(&self) -> bool {
    is_reserved_id(&self.record_id)
  }
}

/// Whether `record_id` is in the sentinel namespace.
pub fn is_reserved_id(record_id: &str) -> bool {
  record_id.starts_with(RESERVED_PREFIX)
}

/// Deterministic id of a survey's autosave record.
pub fn auto_saved_key(survey_id: &str) -> String {
  format!("{}{}", AUTO_SAVE_PREFIX, survey_id)
}

/// Deterministic id of a survey's last-saved record.
pub fn last_saved_key(survey_id: &str) -> String {
  format!("{}{}", LAST_SAVED_PREFIX, survey_id)
}

/// How a record is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveMode {
  Create,
  Update,
}
