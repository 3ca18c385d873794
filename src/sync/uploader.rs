//! Drains the record queue to origin servers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::db::{RecordStore, SurveyStore};
use crate::error::{Error, Result};
use crate::openrosa::client::server_url;
use crate::openrosa::{Credentials, ProtocolClient, SubmissionAck};
use crate::records::{Record, RecordQueue};

/// Something that delivers records to a server.
#[async_trait]
pub trait Submitter: Send + Sync {
  async fn max_submission_size(&self, server: &str, credentials: &Credentials)
    -> Result<Option<u64>>;

  async fn submit(
    &self,
    record: &Record,
    endpoint: &str,
    credentials: &Credentials,
    max_size: Option<u64>,
  ) -> Result<SubmissionAck>;
}

#[async_trait]
impl Submitter for ProtocolClient {
  async fn max_submission_size(
    &self,
    server: &str,
    credentials: &Credentials,
  ) -> Result<Option<u64>> {
    self.probe_max_submission_size(server, credentials).await
  }

  async fn submit(
    &self,
    record: &Record,
    endpoint: &str,
    credentials: &Credentials,
    max_size: Option<u64>,
  ) -> Result<SubmissionAck> {
    self
      .submit_with_limit(record, endpoint, credentials, max_size)
      .await
  }
}

/// A record that stayed in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
  pub record_id: String,
  pub error: String,
}

/// Outcome of one queue drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
  /// Ids of records delivered and removed from the queue
  pub uploaded: Vec<String>,
  pub failed: Vec<UploadFailure>,
}

impl UploadReport {
  pub fn is_empty(&self) -> bool {
    self.uploaded.is_empty() && self.failed.is_empty()
  }
}

/// Uploads queued records one by one, keeping whatever fails.
pub struct SyncUploader<S: RecordStore + SurveyStore> {
  queue: Arc<RecordQueue<S>>,
  submitter: Arc<dyn Submitter>,
  /// Credentials per server URL
  credentials: Arc<HashMap<String, Credentials>>,
  running: Arc<AtomicBool>,
}

impl<S: RecordStore + SurveyStore + 'static> SyncUploader<S> {
  pub fn new(queue: Arc<RecordQueue<S>>, submitter: Arc<dyn Submitter>) -> Self {
    Self {
      queue,
      submitter,
      credentials: Arc::new(HashMap::new()),
      running: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn with_credentials(mut self, credentials: HashMap<String, Credentials>) -> Self {
    self.credentials = Arc::new(credentials);
    self
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  /// Submit every queued record in queue order.
  ///
  /// A record is removed only once the server acknowledged all of it; any
  /// failure leaves it queued and the drain moves on. While a drain is in
  /// progress, further calls return an empty report immediately.
  pub async fn upload_queue(&self) -> Result<UploadReport> {
    let Some(_guard) = RunGuard::acquire(&self.running) else {
      tracing::debug!("Upload already in progress");
      return Ok(UploadReport::default());
    };

    let records = self.queue.queue()?;
    if records.is_empty() {
      return Ok(UploadReport::default());
    }
    tracing::info!(queued = records.len(), "Uploading queued records");

    let mut limits: HashMap<String, Option<u64>> = HashMap::new();
    let mut report = UploadReport::default();

    for record in records {
      match self.upload_one(&record, &mut limits).await {
        Ok(ack) => {
          self.queue.remove(&record.record_id)?;
          tracing::info!(record = %record.record_id, status = ack.status, "Uploaded record");
          report.uploaded.push(record.record_id);
        }
        Err(e) => {
          tracing::warn!(record = %record.record_id, error = %e, "Upload failed; record stays queued");
          report.failed.push(UploadFailure {
            record_id: record.record_id,
            error: e.to_string(),
          });
        }
      }
    }

    tracing::info!(
      uploaded = report.uploaded.len(),
      failed = report.failed.len(),
      "Upload finished"
    );
    Ok(report)
  }

  async fn upload_one(
    &self,
    record: &Record,
    limits: &mut HashMap<String, Option<u64>>,
  ) -> Result<SubmissionAck> {
    let server = match &record.server_url {
      Some(server) => server.clone(),
      None => self
        .queue
        .store()
        .get_survey(&record.survey_id)?
        .map(|survey| survey.server_url)
        .ok_or_else(|| {
          Error::NotFound(format!(
            "survey {} is not cached; its server is unknown",
            record.survey_id
          ))
        })?,
    };
    let credentials = self.credentials.get(&server).cloned().unwrap_or_default();

    let max_size = match limits.get(&server) {
      Some(known) => *known,
      None => {
        let probed = self
          .submitter
          .max_submission_size(&server, &credentials)
          .await?;
        limits.insert(server.clone(), probed);
        probed
      }
    };

    let endpoint = server_url(&server, "submission")?;
    self
      .submitter
      .submit(record, endpoint.as_str(), &credentials, max_size)
      .await
  }

  /// Drain the queue after `initial_delay`, then every `interval`.
  pub fn schedule(&self, initial_delay: Duration, interval: Duration) -> UploadHandle {
    let uploader = self.clone();
    let task = tokio::spawn(async move {
      tokio::time::sleep(initial_delay).await;
      loop {
        if let Err(e) = uploader.upload_queue().await {
          tracing::warn!(error = %e, "Scheduled upload failed");
        }
        tokio::time::sleep(interval).await;
      }
    });
    UploadHandle { task }
  }
}

impl<S: RecordStore + SurveyStore> Clone for SyncUploader<S> {
  fn clone(&self) -> Self {
    Self {
      queue: Arc::clone(&self.queue),
      submitter: Arc::clone(&self.submitter),
      credentials: Arc::clone(&self.credentials),
      running: Arc::clone(&self.running),
    }
  }
}

/// Clears the running flag when a drain ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
  fn acquire(flag: &'a AtomicBool) -> Option<Self> {
    flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()
      .map(|_| Self(flag))
  }
}

impl Drop for RunGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

/// Owner of the periodic upload task. Stopping or dropping it ends the task.
pub struct UploadHandle {
  task: JoinHandle<()>,
}

impl UploadHandle {
  pub fn stop(self) {
    self.task.abort();
  }
}

impl Drop for UploadHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{Store, WriteMode};
  use crate::records::SaveMode;
  use crate::survey::Survey;
  use chrono::Utc;
  use std::collections::{BTreeMap, HashSet};
  use std::sync::Mutex;
  use tokio::sync::Semaphore;

  #[derive(Default)]
  struct MockSubmitter {
    failing: Mutex<HashSet<String>>,
    submitted: Mutex<Vec<String>>,
    endpoints: Mutex<Vec<String>>,
    probes: Mutex<usize>,
    gate: Option<Arc<Semaphore>>,
  }

  impl MockSubmitter {
    fn fail(&self, record_id: &str) {
      self.failing.lock().unwrap().insert(record_id.into());
    }

    fn heal(&self) {
      self.failing.lock().unwrap().clear();
    }

    fn submitted(&self) -> Vec<String> {
      self.submitted.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Submitter for MockSubmitter {
    async fn max_submission_size(
      &self,
      _server: &str,
      _credentials: &Credentials,
    ) -> Result<Option<u64>> {
      *self.probes.lock().unwrap() += 1;
      Ok(Some(10_000_000))
    }

    async fn submit(
      &self,
      record: &Record,
      endpoint: &str,
      _credentials: &Credentials,
      _max_size: Option<u64>,
    ) -> Result<SubmissionAck> {
      if let Some(gate) = &self.gate {
        let _permit = gate.acquire().await.unwrap();
      }
      self.submitted.lock().unwrap().push(record.record_id.clone());
      self.endpoints.lock().unwrap().push(endpoint.to_string());
      if self.failing.lock().unwrap().contains(&record.record_id) {
        return Err(Error::Upstream {
          status: 500,
          message: "boom".into(),
        });
      }
      Ok(SubmissionAck {
        status: 201,
        message: Some("thanks".into()),
      })
    }
  }

  fn survey() -> Survey {
    Survey {
      survey_id: "s1".into(),
      server_url: "https://odk.example.org/v1/projects/1".into(),
      form_id: "household".into(),
      hash: "abc123".into(),
      form: "<form/>".into(),
      model: "<model/>".into(),
      manifest: Vec::new(),
      media: BTreeMap::new(),
      cached_at: Utc::now(),
      last_saved: None,
    }
  }

  fn setup(submitter: Arc<MockSubmitter>) -> (SyncUploader<Store>, Arc<RecordQueue<Store>>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    store.put_survey(&survey()).unwrap();
    let queue = Arc::new(RecordQueue::new(store));
    let uploader = SyncUploader::new(queue.clone(), submitter);
    (uploader, queue)
  }

  fn enqueue(queue: &RecordQueue<Store>, ids: &[&str]) {
    for id in ids {
      queue
        .save(SaveMode::Create, &survey(), Record::new(*id, "s1", *id, "<data/>"))
        .unwrap();
    }
  }

  #[tokio::test]
  async fn test_failed_record_stays_and_others_are_removed() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    enqueue(&queue, &["r1", "r2", "r3"]);
    submitter.fail("r2");

    let report = uploader.upload_queue().await.unwrap();
    assert_eq!(report.uploaded, vec!["r1".to_string(), "r3".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].record_id, "r2");

    let left: Vec<String> = queue.queue().unwrap().into_iter().map(|r| r.record_id).collect();
    assert_eq!(left, vec!["r2".to_string()]);

    submitter.heal();
    let retry = uploader.upload_queue().await.unwrap();
    assert_eq!(retry.uploaded, vec!["r2".to_string()]);
    assert_eq!(submitter.submitted(), vec!["r1", "r2", "r3", "r2"]);
    assert!(queue.queue().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_probes_once_per_server_and_posts_to_submission() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    enqueue(&queue, &["r1", "r2"]);

    uploader.upload_queue().await.unwrap();
    assert_eq!(*submitter.probes.lock().unwrap(), 1);
    assert_eq!(
      submitter.endpoints.lock().unwrap()[0],
      "https://odk.example.org/v1/projects/1/submission"
    );
  }

  #[tokio::test]
  async fn test_drafts_and_sentinels_are_not_uploaded() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    queue
      .save(
        SaveMode::Create,
        &survey(),
        Record::new("d1", "s1", "draft", "<data/>").draft(true),
      )
      .unwrap();
    queue
      .update_auto_saved_record(Record::new("", "s1", "auto", "<data/>"))
      .unwrap();

    let report = uploader.upload_queue().await.unwrap();
    assert!(report.is_empty());
    assert!(submitter.submitted().is_empty());
  }

  #[tokio::test]
  async fn test_record_of_unknown_survey_fails_but_stays() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    // Written without a pinned server, for a survey that was never cached
    queue
      .store()
      .write_record(WriteMode::Insert, &Record::new("x1", "s2", "x", "<data/>"), None)
      .unwrap();

    let report = uploader.upload_queue().await.unwrap();
    assert_eq!(report.failed[0].record_id, "x1");
    assert!(report.failed[0].error.contains("not cached"));
    assert_eq!(queue.queue().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_queued_records_still_upload_after_survey_eviction() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    enqueue(&queue, &["r1"]);
    assert_eq!(
      queue.get("r1").unwrap().unwrap().server_url.as_deref(),
      Some("https://odk.example.org/v1/projects/1")
    );

    assert!(queue.store().remove_survey("s1").unwrap());

    let report = uploader.upload_queue().await.unwrap();
    assert_eq!(report.uploaded, vec!["r1".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(
      submitter.endpoints.lock().unwrap()[0],
      "https://odk.example.org/v1/projects/1/submission"
    );
    assert!(queue.queue().unwrap().is_empty());
  }


  #[tokio::test]
  async fn test_concurrent_drain_is_rejected() {
    let gate = Arc::new(Semaphore::new(0));
    let submitter = Arc::new(MockSubmitter {
      gate: Some(gate.clone()),
      ..Default::default()
    });
    let (uploader, queue) = setup(submitter.clone());
    enqueue(&queue, &["r1"]);

    let first = {
      let uploader = uploader.clone();
      tokio::spawn(async move { uploader.upload_queue().await })
    };
    while !uploader.is_running() {
      tokio::task::yield_now().await;
    }

    let second = uploader.upload_queue().await.unwrap();
    assert!(second.is_empty());

    gate.add_permits(1);
    let report = first.await.unwrap().unwrap();
    assert_eq!(report.uploaded, vec!["r1".to_string()]);
    assert!(!uploader.is_running());
  }

  #[tokio::test(start_paused = true)]
  async fn test_scheduled_uploads() {
    let submitter = Arc::new(MockSubmitter::default());
    let (uploader, queue) = setup(submitter.clone());
    enqueue(&queue, &["r1"]);

    let handle = uploader.schedule(Duration::from_secs(5), Duration::from_secs(60));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(submitter.submitted(), vec!["r1"]);

    enqueue(&queue, &["r2"]);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(submitter.submitted(), vec!["r1", "r2"]);

    handle.stop();
    enqueue(&queue, &["r3"]);
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(submitter.submitted().len(), 2);
  }
}
