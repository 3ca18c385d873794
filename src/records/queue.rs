use std::sync::Arc;
use tracing::debug;

use crate::db::{RecordFilter, RecordStore, WriteMode};
use crate::error::{Error, Result};
use crate::survey::Survey;

use super::encryption::{EncryptionCapability, SubmissionKeyDetector};
use super::types::{auto_saved_key, is_reserved_id, last_saved_key, Record, SaveMode};

/// Record lifecycle on top of a [`RecordStore`].
///
/// Owns the autosave and last-saved policies; the store only knows rows.
pub struct RecordQueue<S: RecordStore> {
  store: Arc<S>,
  encryption: Arc<dyn EncryptionCapability>,
}

impl<S: RecordStore> RecordQueue<S> {
  pub fn new(store: Arc<S>) -> Self {
    Self {
      store,
      encryption: Arc::new(SubmissionKeyDetector),
    }
  }

  /// Use a different encryption capability.
  pub fn with_encryption(mut self, encryption: Arc<dyn EncryptionCapability>) -> Self {
    self.encryption = encryption;
    self
  }

  pub fn store(&self) -> &Arc<S> {
    &self.store
  }

  /// Id of the survey's autosave record, stable across sessions.
  pub fn get_auto_saved_key(&self, survey_id: &str) -> String {
    auto_saved_key(survey_id)
  }

  pub fn get_last_saved_key(&self, survey_id: &str) -> String {
    last_saved_key(survey_id)
  }

  /// Create or update a user record.
  ///
  /// Finalized records of plain surveys also become the survey's last-saved
  /// snapshot, in the same transaction. Finalized records of encrypted
  /// surveys are encrypted first and never snapshotted.
  pub fn save(&self, mode: SaveMode, survey: &Survey, record: Record) -> Result<Record> {
    validate(survey, &record)?;
    let record = Record {
      server_url: record
        .server_url
        .or_else(|| Some(survey.server_url.clone())),
      ..record
    };

    let write_mode = match mode {
      SaveMode::Create => WriteMode::Insert,
      SaveMode::Update => WriteMode::Replace,
    };

    let (record, snapshot) = if record.draft {
      (record, None)
    } else if self.encryption.is_encryption_enabled(survey) {
      debug!(survey = %survey.survey_id, "encrypted survey, skipping last-saved snapshot");
      (self.encryption.encrypt(survey, record)?, None)
    } else {
      let snapshot = Record {
        record_id: last_saved_key(&survey.survey_id),
        ..record.clone()
      };
      (record, Some(snapshot))
    };

    let saved = self
      .store
      .write_record(write_mode, &record, snapshot.as_ref())?;
    debug!(
      record = %saved.record_id,
      survey = %saved.survey_id,
      draft = saved.draft,
      ?mode,
      "record saved"
    );

    if !saved.draft {
      self
        .store
        .remove_record(&auto_saved_key(&survey.survey_id))?;
    }
    Ok(saved)
  }

  /// Overwrite the survey's single autosave record.
  pub fn update_auto_saved_record(&self, record: Record) -> Result<Record> {
    let record = Record {
      record_id: auto_saved_key(&record.survey_id),
      draft: true,
      ..record
    };
    self.store.write_record(WriteMode::Upsert, &record, None)
  }

  pub fn get_auto_saved_record(&self, survey_id: &str) -> Result<Option<Record>> {
    self.store.get_record(&auto_saved_key(survey_id))
  }

  pub fn remove_auto_saved_record(&self, survey_id: &str) -> Result<bool> {
    self.store.remove_record(&auto_saved_key(survey_id))
  }

  pub fn get_last_saved_record(&self, survey_id: &str) -> Result<Option<Record>> {
    self.store.get_record(&last_saved_key(survey_id))
  }

  pub fn get(&self, record_id: &str) -> Result<Option<Record>> {
    self.store.get_record(record_id)
  }

  /// Remove a user record. Sentinels are managed by their own operations.
  pub fn remove(&self, record_id: &str) -> Result<bool> {
    if is_reserved_id(record_id) {
      return Err(Error::InvalidRecord(format!(
        "{} is a reserved record id",
        record_id
      )));
    }
    self.store.remove_record(record_id)
  }

  /// Records to show for a survey, in creation order.
  ///
  /// Finalized records only, unless `include_drafts` is set.
  pub fn get_displayable_record_list(
    &self,
    survey_id: &str,
    include_drafts: bool,
  ) -> Result<Vec<Record>> {
    self.store.list_records(RecordFilter {
      survey_id: Some(survey_id),
      draft: if include_drafts { None } else { Some(false) },
    })
  }

  /// Draft records of a survey, in creation order.
  pub fn get_draft_list(&self, survey_id: &str) -> Result<Vec<Record>> {
    self.store.list_records(RecordFilter {
      survey_id: Some(survey_id),
      draft: Some(true),
    })
  }

  /// Finalized records awaiting upload, across all surveys, in queue order.
  pub fn queue(&self) -> Result<Vec<Record>> {
    self.store.list_records(RecordFilter {
      survey_id: None,
      draft: Some(false),
    })
  }
}

fn validate(survey: &Survey, record: &Record) -> Result<()> {
  if record.record_id.trim().is_empty() {
    return Err(Error::InvalidRecord("record id is empty".into()));
  }
  if is_reserved_id(&record.record_id) {
    return Err(Error::InvalidRecord(format!(
      "{} is a reserved record id",
      record.record_id
    )));
  }
  if record.survey_id != survey.survey_id {
    return Err(Error::InvalidRecord(format!(
      "record {} belongs to survey {}, not {}",
      record.record_id, record.survey_id, survey.survey_id
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Store;
  use crate::records::Attachment;
  use chrono::Utc;

  fn survey(id: &str, form: &str) -> Survey {
    Survey {
      survey_id: id.into(),
      server_url: "https://kc.example.org/alice".into(),
      form_id: "household".into(),
      hash: "abc123".into(),
      form: form.into(),
      model: "<model/>".into(),
      manifest: Vec::new(),
      media: Default::default(),
      cached_at: Utc::now(),
      last_saved: None,
    }
  }

  fn queue() -> RecordQueue<Store> {
    RecordQueue::new(Arc::new(Store::open_in_memory().unwrap()))
  }

  /// Fake capability that marks every survey encrypted.
  struct AlwaysEncrypt;

  impl EncryptionCapability for AlwaysEncrypt {
    fn is_encryption_enabled(&self, _survey: &Survey) -> bool {
      true
    }

    fn encrypt(&self, _survey: &Survey, record: Record) -> Result<Record> {
      Ok(Record {
        xml: "<data encrypted=\"yes\"/>".into(),
        files: vec![Attachment::new("submission.xml.enc", vec![9, 9, 9])],
        ..record
      })
    }
  }

  #[test]
  fn test_create_then_list_excludes_autosave() {
    let q = queue();
    let s = survey("s1", "<form/>");
    q.update_auto_saved_record(Record::new("ignored", "s1", "auto", "<auto/>"))
      .unwrap();
    q.save(SaveMode::Create, &s, Record::new("uuid:1", "s1", "One", "<one/>"))
      .unwrap();

    let list = q.get_displayable_record_list("s1", false).unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0].record_id, "uuid:1");
  }

  #[test]
  fn test_listing_preserves_insertion_order() {
    let q = queue();
    let s = survey("s1", "<form/>");
    for id in ["uuid:c", "uuid:a", "uuid:b"] {
      q.save(SaveMode::Create, &s, Record::new(id, "s1", id, "<x/>"))
        .unwrap();
    }
    let ids: Vec<String> = q
      .get_displayable_record_list("s1", false)
      .unwrap()
      .into_iter()
      .map(|r| r.record_id)
      .collect();
    assert_eq!(ids, vec!["uuid:c", "uuid:a", "uuid:b"]);
  }

  #[test]
  fn test_drafts_only_listed_on_request() {
    let q = queue();
    let s = survey("s1", "<form/>");
    q.save(
      SaveMode::Create,
      &s,
      Record::new("uuid:d", "s1", "Draft", "<d/>").draft(true),
    )
    .unwrap();
    q.save(SaveMode::Create, &s, Record::new("uuid:f", "s1", "Final", "<f/>"))
      .unwrap();

    assert_eq!(q.get_displayable_record_list("s1", false).unwrap().len(), 1);
    assert_eq!(q.get_displayable_record_list("s1", true).unwrap().len(), 2);
    assert_eq!(q.get_draft_list("s1").unwrap()[0].record_id, "uuid:d");
    assert_eq!(q.queue().unwrap().len(), 1);
  }

  #[test]
  fn test_update_missing_record_fails() {
    let q = queue();
    let s = survey("s1", "<form/>");
    let err = q
      .save(SaveMode::Update, &s, Record::new("uuid:x", "s1", "X", "<x/>"))
      .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
  }

  #[test]
  fn test_non_draft_save_writes_last_saved_snapshot() {
    let q = queue();
    let s = survey("s1", "<form/>");
    q.save(SaveMode::Create, &s, Record::new("uuid:1", "s1", "One", "<one>1</one>"))
      .unwrap();

    let last = q.get_last_saved_record("s1").unwrap().unwrap();
    assert_eq!(last.record_id, last_saved_key("s1"));
    assert_eq!(last.xml, "<one>1</one>");

    q.save(SaveMode::Update, &s, Record::new("uuid:1", "s1", "One", "<one>2</one>"))
      .unwrap();
    let last = q.get_last_saved_record("s1").unwrap().unwrap();
    assert_eq!(last.xml, "<one>2</one>");

    // snapshot is never queued
    let queued: Vec<String> = q.queue().unwrap().into_iter().map(|r| r.record_id).collect();
    assert_eq!(queued, vec!["uuid:1"]);
  }

  #[test]
  fn test_draft_save_does_not_touch_last_saved() {
    let q = queue();
    let s = survey("s1", "<form/>");
    q.save(
      SaveMode::Create,
      &s,
      Record::new("uuid:1", "s1", "One", "<one/>").draft(true),
    )
    .unwrap();
    assert!(q.get_last_saved_record("s1").unwrap().is_none());
  }

  #[test]
  fn test_encrypted_survey_gets_no_snapshot() {
    let q = queue().with_encryption(Arc::new(AlwaysEncrypt));
    let s = survey("s1", "<form/>");
    let saved = q
      .save(SaveMode::Create, &s, Record::new("uuid:1", "s1", "One", "<one/>"))
      .unwrap();

    assert_eq!(saved.xml, "<data encrypted=\"yes\"/>");
    assert!(q.get_last_saved_record("s1").unwrap().is_none());
  }

  #[test]
  fn test_detector_refuses_to_store_plaintext_of_encrypted_form() {
    let q = queue();
    let s = survey("s1", r#"<submission base64RsaPublicKey="MIIB"/>"#);
    let err = q
      .save(SaveMode::Create, &s, Record::new("uuid:1", "s1", "One", "<one/>"))
      .unwrap_err();
    assert!(matches!(err, Error::EncryptionUnavailable(_)));
    assert!(q.get("uuid:1").unwrap().is_none());

    // Drafts never need encrypting
    let draft = q
      .save(
        SaveMode::Create,
        &s,
        Record::new("uuid:1", "s1", "One", "<one/>").draft(true),
      )
      .unwrap();
    assert!(draft.draft);
    assert!(q.queue().unwrap().is_empty());
  }

  #[test]
  fn test_autosave_is_single_and_overwritten() {
    let q = queue();
    q.update_auto_saved_record(
      Record::new("a", "s1", "auto", "<first/>").with_file(Attachment::new("a.jpg", vec![1])),
    )
    .unwrap();
    q.update_auto_saved_record(Record::new("b", "s1", "auto", "<second/>"))
      .unwrap();

    let auto = q.get_auto_saved_record("s1").unwrap().unwrap();
    assert_eq!(auto.record_id, q.get_auto_saved_key("s1"));
    assert_eq!(auto.xml, "<second/>");
    assert!(auto.files.is_empty());
    assert!(q.get("a").unwrap().is_none());
    assert!(q.get("b").unwrap().is_none());
    assert!(q.queue().unwrap().is_empty());
  }

  #[test]
  fn test_final_save_clears_autosave() {
    let q = queue();
    let s = survey("s1", "<form/>");
    q.update_auto_saved_record(Record::new("x", "s1", "auto", "<wip/>"))
      .unwrap();
    q.save(SaveMode::Create, &s, Record::new("uuid:1", "s1", "One", "<one/>"))
      .unwrap();
    assert!(q.get_auto_saved_record("s1").unwrap().is_none());
  }

  #[test]
  fn test_reserved_ids_rejected() {
    let q = queue();
    let s = survey("s1", "<form/>");
    let err = q
      .save(
        SaveMode::Create,
        &s,
        Record::new(auto_saved_key("s1"), "s1", "sneaky", "<x/>"),
      )
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
    assert!(q.remove(&last_saved_key("s1")).is_err());
  }

  #[test]
  fn test_record_must_match_survey() {
    let q = queue();
    let s = survey("s1", "<form/>");
    let err = q
      .save(SaveMode::Create, &s, Record::new("uuid:1", "s2", "One", "<one/>"))
      .unwrap_err();
    assert!(matches!(err, Error::InvalidRecord(_)));
  }
}
