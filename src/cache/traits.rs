//! Core traits and types for the intercepting resource cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Result;

/// Snapshot of an HTTP response, as stored in a cache partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Only complete successful responses are worth keeping.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// A request seen by the intercepting layer.
#[derive(Debug, Clone)]
pub struct InterceptRequest {
  pub method: Method,
  pub url: Url,
}

impl InterceptRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
    }
  }
}

/// What the intercepting layer decided to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intercepted {
  /// Not ours; the host forwards the request untouched
  Bypass,
  /// Answered by the cache layer
  Respond {
    response: CachedResponse,
    source: CacheSource,
  },
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, considered fresh
  CacheFresh,
  /// Data from cache while a background refresh runs
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}

/// One stored cache entry with its metadata.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: CachedResponse,
  /// Survey the entry belongs to, for per-survey eviction
  pub survey_id: Option<String>,
  pub cached_at: DateTime<Utc>,
}

/// Where responses come from when the cache cannot answer.
#[async_trait]
pub trait Upstream: Send + Sync {
  /// GET `url`. Non-2xx answers are responses, not errors; only transport
  /// failures are errors.
  async fn fetch(&self, url: &Url) -> Result<CachedResponse>;
}

/// Outcome of the install step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub partition: String,
  pub cached: usize,
}

/// Outcome of the activate step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateReport {
  pub deleted_partitions: Vec<String>,
  /// Whether the layer took control of already-open pages
  pub claimed: bool,
}

/// Status of a form hash check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HashStatus {
  FormUpdated,
  FormUpToDate,
  FormUpdateUnknown,
}

/// Messages a page sends to the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CacheMessage {
  CheckFormHash {
    #[serde(rename = "surveyId")]
    survey_id: String,
    url: String,
  },
}

/// Replies of the cache layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheReply {
  #[serde(rename = "type")]
  pub status: HashStatus,
  #[serde(rename = "surveyId")]
  pub survey_id: String,
}

/// Lifecycle of an intercepting layer.
///
/// Implementable on top of any host able to intercept requests: a browser
/// worker, a reverse proxy or a sidecar.
#[async_trait]
pub trait InterceptLayer: Send + Sync {
  /// Precache what the layer needs to work offline.
  async fn on_install(&self) -> Result<InstallReport>;

  /// Drop leftovers from previous versions and take control.
  async fn on_activate(&self) -> Result<ActivateReport>;

  async fn on_intercept(&self, request: InterceptRequest) -> Result<Intercepted>;

  /// Answer a page message. Never fails; failures become replies.
  async fn on_message(&self, message: CacheMessage) -> CacheReply;
}
