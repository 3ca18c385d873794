//! Versioned cache of survey definitions and their media.

use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, ResourceRoutes, FORMS_PARTITION};
use crate::db::{RecordStore, SurveyStore};
use crate::error::{Error, Result};
use crate::openrosa::{Credentials, FormDescriptor, ManifestEntry, MediaPayload};
use crate::records::last_saved_key;

use super::source::SurveySource;
use super::types::Survey;

const EVENT_CAPACITY: usize = 32;

/// Change notifications for cached surveys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormEvent {
  /// The server version changed and the cache now holds it
  Updated { survey_id: String, hash: String },
  /// The server no longer offers the form; it was evicted
  Removed { survey_id: String },
}

/// Outcome of one freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  UpToDate,
  Updated,
  Removed,
  /// Nothing cached to compare against
  NotCached,
}

/// Timing and concurrency knobs.
#[derive(Debug, Clone)]
pub struct FormCacheSettings {
  pub initial_delay: Duration,
  pub interval: Duration,
  /// Concurrent media downloads per origin
  pub media_concurrency: usize,
}

impl Default for FormCacheSettings {
  fn default() -> Self {
    Self {
      initial_delay: Duration::from_secs(3),
      interval: Duration::from_secs(20 * 60),
      media_concurrency: 6,
    }
  }
}

/// Downloads a manifest's media, bounded per origin.
pub struct MediaFetcher {
  limit: usize,
  origins: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl MediaFetcher {
  pub fn new(limit: usize) -> Self {
    Self {
      limit: limit.max(1),
      origins: Mutex::new(HashMap::new()),
    }
  }

  fn semaphore_for(&self, url: &str) -> Result<Arc<Semaphore>> {
    let origin = Url::parse(url)?.origin().ascii_serialization();
    let mut origins = self
      .origins
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(Arc::clone(
      origins
        .entry(origin)
        .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
    ))
  }

  /// Fetch every entry. Files the server refuses are skipped with a warning;
  /// transient failures abort the whole batch so it can be retried.
  pub async fn fetch_all(
    &self,
    source: &dyn SurveySource,
    entries: &[ManifestEntry],
    credentials: &Credentials,
  ) -> Result<Vec<(ManifestEntry, MediaPayload)>> {
    let results = join_all(entries.iter().map(|entry| async move {
      let semaphore = self.semaphore_for(&entry.download_url)?;
      let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| Error::Http(format!("media fetcher closed: {}", e)))?;
      source.fetch_media(entry, credentials).await
    }))
    .await;

    let mut fetched = Vec::with_capacity(entries.len());
    for (entry, result) in entries.iter().zip(results) {
      match result {
        Ok(payload) => fetched.push((entry.clone(), payload)),
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => {
          tracing::warn!(file = %entry.filename, error = %e, "Skipping media file");
        }
      }
    }
    Ok(fetched)
  }
}

/// Cache-first store of survey definitions with background freshness checks.
pub struct FormCache<S> {
  store: Arc<S>,
  source: Arc<dyn SurveySource>,
  routes: ResourceRoutes,
  settings: FormCacheSettings,
  media: Arc<MediaFetcher>,
  events: broadcast::Sender<FormEvent>,
  /// Credentials last used per survey, for background checks
  credentials: Arc<Mutex<HashMap<String, Credentials>>>,
}

impl<S> FormCache<S>
where
  S: SurveyStore + RecordStore + CacheStorage + 'static,
{
  pub fn new(store: Arc<S>, source: Arc<dyn SurveySource>, routes: ResourceRoutes) -> Self {
    Self::with_settings(store, source, routes, FormCacheSettings::default())
  }

  pub fn with_settings(
    store: Arc<S>,
    source: Arc<dyn SurveySource>,
    routes: ResourceRoutes,
    settings: FormCacheSettings,
  ) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      store,
      source,
      routes,
      media: Arc::new(MediaFetcher::new(settings.media_concurrency)),
      settings,
      events,
      credentials: Arc::new(Mutex::new(HashMap::new())),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<FormEvent> {
    self.events.subscribe()
  }

  /// Cached survey if present, otherwise fetched, stored and returned.
  pub async fn ensure(&self, descriptor: &FormDescriptor) -> Result<Survey> {
    self.remember(descriptor)?;
    if let Some(survey) = self.store.get_survey(&descriptor.survey_id)? {
      tracing::debug!(survey_id = %descriptor.survey_id, "Survey cache hit");
      return Ok(survey);
    }
    tracing::debug!(survey_id = %descriptor.survey_id, "Survey cache miss");
    self.fetch_and_store(descriptor).await
  }

  /// Cached survey with its last-saved record attached.
  pub fn load(&self, survey_id: &str) -> Result<Option<Survey>> {
    let Some(mut survey) = self.store.get_survey(survey_id)? else {
      return Ok(None);
    };
    survey.last_saved = self.store.get_record(&last_saved_key(survey_id))?;
    Ok(Some(survey))
  }

  /// Drop the cached definition and media. Records are kept.
  pub fn evict(&self, survey_id: &str) -> Result<bool> {
    let removed = self.store.remove_survey(survey_id)?;
    let entries = self.store.remove_survey_entries(FORMS_PARTITION, survey_id)?;
    tracing::info!(survey_id, removed, entries, "Evicted survey");
    Ok(removed)
  }

  /// Stored media blob of a survey.
  pub fn media(&self, survey_id: &str, filename: &str) -> Result<Option<CachedResponse>> {
    let key = self
      .routes
      .cache_key(&self.routes.media_url(survey_id, filename)?);
    Ok(
      self
        .store
        .get_entry(FORMS_PARTITION, &key)?
        .map(|entry| entry.response),
    )
  }

  /// Compare the cached hash with the server's and act on the difference.
  pub async fn check_freshness(&self, survey_id: &str) -> Result<Freshness> {
    let Some(cached) = self.store.get_survey(survey_id)? else {
      return Ok(Freshness::NotCached);
    };
    let descriptor = self.descriptor_for(&cached)?;

    match self.source.fetch_hash(&descriptor).await {
      Ok(hash) if hash == cached.hash => {
        tracing::debug!(survey_id, "Survey is up to date");
        Ok(Freshness::UpToDate)
      }
      Ok(hash) => {
        tracing::info!(survey_id, old = %cached.hash, new = %hash, "Survey changed on server");
        let survey = self.fetch_and_store(&descriptor).await?;
        let _ = self.events.send(FormEvent::Updated {
          survey_id: survey_id.to_string(),
          hash: survey.hash,
        });
        Ok(Freshness::Updated)
      }
      Err(e) if e.is_not_found_or_unauthorized() => {
        tracing::info!(survey_id, error = %e, "Survey no longer available");
        self.evict(survey_id)?;
        let _ = self.events.send(FormEvent::Removed {
          survey_id: survey_id.to_string(),
        });
        Ok(Freshness::Removed)
      }
      Err(e) => Err(e),
    }
  }

  /// Check freshness after the initial delay, then every interval, until the
  /// survey is gone or the handle is stopped.
  pub fn schedule_freshness_checks(&self, survey_id: &str) -> FreshnessHandle {
    let cache = self.clone();
    let survey_id = survey_id.to_string();
    let task = tokio::spawn(async move {
      tokio::time::sleep(cache.settings.initial_delay).await;
      loop {
        match cache.check_freshness(&survey_id).await {
          Ok(Freshness::Removed) | Ok(Freshness::NotCached) => break,
          Ok(_) => {}
          Err(e) => {
            tracing::warn!(survey_id = %survey_id, error = %e, "Freshness check failed; retrying next interval");
          }
        }
        tokio::time::sleep(cache.settings.interval).await;
      }
      tracing::debug!(survey_id = %survey_id, "Freshness checks ended");
    });
    FreshnessHandle { task }
  }

  async fn fetch_and_store(&self, descriptor: &FormDescriptor) -> Result<Survey> {
    let mut survey = self.source.fetch_survey(descriptor).await?;
    let media = self
      .media
      .fetch_all(self.source.as_ref(), &survey.manifest, &descriptor.credentials)
      .await?;

    // Old media go before the new ones land.
    self
      .store
      .remove_survey_entries(FORMS_PARTITION, &survey.survey_id)?;

    let mut resolved = BTreeMap::new();
    for (entry, payload) in media {
      let url = self.routes.media_url(&survey.survey_id, &entry.filename)?;
      let mut response = CachedResponse::new(200, payload.data);
      if let Some(content_type) = payload.content_type {
        response = response.with_header("content-type", content_type);
      }
      self.store.put_entry(
        FORMS_PARTITION,
        &self.routes.cache_key(&url),
        &response,
        Some(&survey.survey_id),
      )?;
      resolved.insert(entry.filename, url.to_string());
    }

    survey.media = resolved;
    survey.cached_at = Utc::now();
    self.store.put_survey(&survey)?;
    tracing::info!(
      survey_id = %survey.survey_id,
      hash = %survey.hash,
      media = survey.media.len(),
      "Cached survey"
    );
    Ok(survey)
  }

  fn remember(&self, descriptor: &FormDescriptor) -> Result<()> {
    self
      .credentials
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?
      .insert(descriptor.survey_id.clone(), descriptor.credentials.clone());
    Ok(())
  }

  fn descriptor_for(&self, survey: &Survey) -> Result<FormDescriptor> {
    let credentials = self
      .credentials
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?
      .get(&survey.survey_id)
      .cloned()
      .unwrap_or_default();
    Ok(
      FormDescriptor::new(&survey.survey_id, &survey.server_url, &survey.form_id)
        .with_credentials(credentials),
    )
  }
}

impl<S> Clone for FormCache<S> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      source: Arc::clone(&self.source),
      routes: self.routes.clone(),
      settings: self.settings.clone(),
      media: Arc::clone(&self.media),
      events: self.events.clone(),
      credentials: Arc::clone(&self.credentials),
    }
  }
}

/// Owner of a background freshness task. Stopping or dropping it ends the task.
pub struct FreshnessHandle {
  task: JoinHandle<()>,
}

impl FreshnessHandle {
  pub fn stop(self) {
    self.task.abort();
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}

impl Drop for FreshnessHandle {
  fn drop(&mut self) {
    self.task.abort();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::{Store, WriteMode};
  use crate::records::{Record, RecordQueue, SaveMode};
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[derive(Clone)]
  enum HashAnswer {
    Hash(String),
    NotFound,
    Offline,
  }

  struct MockSource {
    hash: Mutex<HashAnswer>,
    manifest: Vec<ManifestEntry>,
    survey_fetches: AtomicUsize,
    hash_fetches: AtomicUsize,
  }

  impl MockSource {
    fn new(hash: &str) -> Self {
      Self {
        hash: Mutex::new(HashAnswer::Hash(hash.into())),
        manifest: Vec::new(),
        survey_fetches: AtomicUsize::new(0),
        hash_fetches: AtomicUsize::new(0),
      }
    }

    fn with_media(mut self, files: &[&str]) -> Self {
      self.manifest = files
        .iter()
        .map(|f| ManifestEntry {
          filename: f.to_string(),
          hash: None,
          download_url: format!("https://odk.example.org/media/{}", f),
        })
        .collect();
      self
    }

    fn answer(&self, answer: HashAnswer) {
      *self.hash.lock().unwrap() = answer;
    }

    fn current_hash(&self) -> String {
      match &*self.hash.lock().unwrap() {
        HashAnswer::Hash(h) => h.clone(),
        _ => "unavailable".into(),
      }
    }
  }

  #[async_trait]
  impl SurveySource for MockSource {
    async fn fetch_survey(&self, descriptor: &FormDescriptor) -> Result<Survey> {
      self.survey_fetches.fetch_add(1, Ordering::SeqCst);
      Ok(Survey {
        survey_id: descriptor.survey_id.clone(),
        server_url: descriptor.server_url.clone(),
        form_id: descriptor.form_id.clone(),
        hash: self.current_hash(),
        form: "<form/>".into(),
        model: "<model/>".into(),
        manifest: self.manifest.clone(),
        media: BTreeMap::new(),
        cached_at: Utc::now(),
        last_saved: None,
      })
    }

    async fn fetch_hash(&self, _descriptor: &FormDescriptor) -> Result<String> {
      self.hash_fetches.fetch_add(1, Ordering::SeqCst);
      match self.hash.lock().unwrap().clone() {
        HashAnswer::Hash(h) => Ok(h),
        HashAnswer::NotFound => Err(Error::NotFound("gone".into())),
        HashAnswer::Offline => Err(Error::Offline("no network".into())),
      }
    }

    async fn fetch_media(
      &self,
      entry: &ManifestEntry,
      _credentials: &Credentials,
    ) -> Result<MediaPayload> {
      if entry.filename.starts_with("missing") {
        return Err(Error::NotFound(entry.download_url.clone()));
      }
      Ok(MediaPayload {
        content_type: Some("image/png".into()),
        data: entry.filename.as_bytes().to_vec(),
      })
    }
  }

  fn setup(source: MockSource) -> (FormCache<Store>, Arc<Store>, Arc<MockSource>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let source = Arc::new(source);
    let routes = ResourceRoutes::new("https://forms.example.org", "/enketo").unwrap();
    let cache = FormCache::new(store.clone(), source.clone(), routes);
    (cache, store, source)
  }

  fn descriptor() -> FormDescriptor {
    FormDescriptor::new("abc", "https://odk.example.org", "household")
  }

  #[tokio::test]
  async fn test_ensure_fetches_once_while_hash_unchanged() {
    let (cache, _, source) = setup(MockSource::new("abc123"));

    let first = cache.ensure(&descriptor()).await.unwrap();
    let second = cache.ensure(&descriptor()).await.unwrap();
    assert_eq!(first.hash, "abc123");
    assert_eq!(second.hash, "abc123");

    assert_eq!(cache.check_freshness("abc").await.unwrap(), Freshness::UpToDate);
    assert_eq!(source.survey_fetches.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_media_stored_and_resolved() {
    let (cache, _, _) = setup(MockSource::new("h").with_media(&["logo.png", "missing.mp3"]));

    let survey = cache.ensure(&descriptor()).await.unwrap();
    assert_eq!(
      survey.media.get("logo.png").map(String::as_str),
      Some("https://forms.example.org/enketo/media/get/abc/logo.png")
    );
    assert!(!survey.media.contains_key("missing.mp3"));

    let blob = cache.media("abc", "logo.png").unwrap().unwrap();
    assert_eq!(blob.body, b"logo.png".to_vec());
    assert_eq!(blob.header("content-type"), Some("image/png"));
  }

  #[tokio::test]
  async fn test_load_attaches_last_saved() {
    let (cache, store, _) = setup(MockSource::new("h"));
    cache.ensure(&descriptor()).await.unwrap();
    assert!(cache.load("abc").unwrap().unwrap().last_saved.is_none());

    let snapshot = Record::new(last_saved_key("abc"), "abc", "last", "<data/>");
    store
      .write_record(WriteMode::Upsert, &snapshot, None)
      .unwrap();

    let loaded = cache.load("abc").unwrap().unwrap();
    assert_eq!(loaded.last_saved.unwrap().xml, "<data/>");
    assert!(cache.load("unknown").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_evict_keeps_records() {
    let (cache, store, _) = setup(MockSource::new("h").with_media(&["logo.png"]));
    cache.ensure(&descriptor()).await.unwrap();
    store
      .write_record(WriteMode::Insert, &Record::new("r1", "abc", "first", "<data/>"), None)
      .unwrap();

    assert!(cache.evict("abc").unwrap());
    assert!(cache.load("abc").unwrap().is_none());
    assert!(cache.media("abc", "logo.png").unwrap().is_none());
    assert!(store.get_record("r1").unwrap().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_scheduled_check_replaces_changed_survey() {
    let (cache, store, source) = setup(MockSource::new("abc123"));
    let survey = cache.ensure(&descriptor()).await.unwrap();
    let queue = RecordQueue::new(store.clone());
    queue
      .save(
        SaveMode::Create,
        &survey,
        Record::new("r1", "abc", "first", "<data/>"),
      )
      .unwrap();
    let draft = Record {
      draft: true,
      ..Record::new("r2", "abc", "second", "<data/>")
    };
    queue.save(SaveMode::Create, &survey, draft).unwrap();
    let mut events = cache.subscribe();

    source.answer(HashAnswer::Hash("def456".into()));
    let _handle = cache.schedule_freshness_checks("abc");

    let event = events.recv().await.unwrap();
    assert_eq!(
      event,
      FormEvent::Updated {
        survey_id: "abc".into(),
        hash: "def456".into()
      }
    );
    assert_eq!(store.get_survey("abc").unwrap().unwrap().hash, "def456");
    assert_eq!(source.survey_fetches.load(Ordering::SeqCst), 2);

    // Records made against the old version are still queued
    let queued: Vec<String> = queue
      .queue()
      .unwrap()
      .into_iter()
      .map(|r| r.record_id)
      .collect();
    assert_eq!(queued, vec!["r1"]);
    assert_eq!(queue.get("r1").unwrap().unwrap().xml, "<data/>");
    assert!(queue.get("r2").unwrap().unwrap().draft);
    assert!(queue.get_last_saved_record("abc").unwrap().is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn test_scheduled_check_evicts_missing_form() {
    let (cache, store, source) = setup(MockSource::new("abc123"));
    cache.ensure(&descriptor()).await.unwrap();
    let mut events = cache.subscribe();

    source.answer(HashAnswer::NotFound);
    let handle = cache.schedule_freshness_checks("abc");

    let event = events.recv().await.unwrap();
    assert_eq!(event, FormEvent::Removed { survey_id: "abc".into() });
    assert!(store.get_survey("abc").unwrap().is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(handle.is_finished());
  }

  #[tokio::test(start_paused = true)]
  async fn test_transient_failure_retries_next_interval() {
    let (cache, store, source) = setup(MockSource::new("abc123"));
    cache.ensure(&descriptor()).await.unwrap();
    source.answer(HashAnswer::Offline);

    let handle = cache.schedule_freshness_checks("abc");
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(source.hash_fetches.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(source.hash_fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    assert_eq!(source.hash_fetches.load(Ordering::SeqCst), 2);
    assert!(store.get_survey("abc").unwrap().is_some());

    handle.stop();
    tokio::time::sleep(Duration::from_secs(40 * 60)).await;
    assert_eq!(source.hash_fetches.load(Ordering::SeqCst), 2);
  }
}
