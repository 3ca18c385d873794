//! Intercepting cache that keeps the application shell, static assets and
//! per-survey resources available offline.

use async_trait::async_trait;
use futures::future::try_join_all;
use std::sync::Arc;
use url::Url;

use crate::error::{Error, Result};
use crate::survey::HashResponse;

use super::routes::{sentinel_key, static_partition, ResourceKind, ResourceRoutes, FORMS_PARTITION};
use super::shell::sub_resources;
use super::storage::CacheStorage;
use super::traits::{
  ActivateReport, CacheMessage, CacheReply, CacheSource, CachedResponse, HashStatus,
  InstallReport, InterceptLayer, InterceptRequest, Intercepted, Upstream,
};

/// Resource cache sitting between pages and the network.
///
/// Strategies per resource kind:
/// - shell: served from cache only once its sub-resources are cached too
/// - static assets: cache-first
/// - form payloads and media: stale-while-revalidate
/// - everything else, non-GET and cross-origin requests: bypassed
pub struct ResourceCache<S: CacheStorage, U: Upstream> {
  storage: Arc<S>,
  upstream: Arc<U>,
  routes: ResourceRoutes,
  version: String,
  /// Paths below the base path precached on install
  static_assets: Arc<Vec<String>>,
}

impl<S: CacheStorage + 'static, U: Upstream + 'static> ResourceCache<S, U> {
  pub fn new(
    storage: Arc<S>,
    upstream: Arc<U>,
    routes: ResourceRoutes,
    version: impl Into<String>,
  ) -> Self {
    Self {
      storage,
      upstream,
      routes,
      version: version.into(),
      static_assets: Arc::new(Vec::new()),
    }
  }

  pub fn with_static_assets(mut self, assets: Vec<String>) -> Self {
    self.static_assets = Arc::new(assets);
    self
  }

  pub fn routes(&self) -> &ResourceRoutes {
    &self.routes
  }

  pub fn static_partition(&self) -> String {
    static_partition(&self.version)
  }

  fn partition_for(&self, kind: ResourceKind) -> String {
    match kind {
      ResourceKind::Static => self.static_partition(),
      _ => FORMS_PARTITION.to_string(),
    }
  }

  /// Fetch a shell page and store it under the shared shell key.
  ///
  /// Clears the completion sentinel: the new shell counts as cached only
  /// once [`Self::complete_shell`] has stored its sub-resources.
  pub async fn cache_shell(&self, url: &Url) -> Result<CachedResponse> {
    let response = self.upstream.fetch(url).await?;
    if !response.is_cacheable() {
      return Ok(response);
    }
    let key = self.routes.shell_key();
    self.storage.remove_entry(FORMS_PARTITION, &sentinel_key(&key))?;
    self.storage.put_entry(FORMS_PARTITION, &key, &response, None)?;
    Ok(response)
  }

  /// Cache every same-origin sub-resource of a shell, then mark the shell
  /// as fully cached. Returns the number of sub-resources.
  pub async fn complete_shell(&self, shell_url: &Url, html: &str) -> Result<usize> {
    let resources: Vec<Url> = sub_resources(html, shell_url)
      .into_iter()
      .filter(|u| {
        matches!(
          self.routes.classify(u),
          ResourceKind::Static | ResourceKind::FormPayload | ResourceKind::Media
        )
      })
      .collect();

    try_join_all(resources.iter().map(|u| self.cache_resource(u, false))).await?;

    let key = sentinel_key(&self.routes.shell_key());
    self
      .storage
      .put_entry(FORMS_PARTITION, &key, &CachedResponse::new(204, Vec::new()), None)?;
    tracing::debug!(resources = resources.len(), "Shell fully cached");
    Ok(resources.len())
  }

  /// Make sure one resource is in its partition; `refresh` refetches it
  /// even when present.
  async fn cache_resource(&self, url: &Url, refresh: bool) -> Result<()> {
    let partition = self.partition_for(self.routes.classify(url));
    let key = self.routes.cache_key(url);
    if !refresh && self.storage.contains(&partition, &key)? {
      return Ok(());
    }
    let response = self.upstream.fetch(url).await?;
    if !response.is_cacheable() {
      return Err(Error::from_status(response.status, url.as_str()));
    }
    let survey_id = self.routes.survey_id_of(url);
    self
      .storage
      .put_entry(&partition, &key, &response, survey_id.as_deref())
  }

  async fn serve_shell(&self, url: &Url) -> Result<Intercepted> {
    let key = self.routes.shell_key();
    let cached = self.storage.get_entry(FORMS_PARTITION, &key)?;
    let complete = self
      .storage
      .contains(FORMS_PARTITION, &sentinel_key(&key))?;

    if let (Some(entry), true) = (&cached, complete) {
      return Ok(Intercepted::Respond {
        response: entry.response.clone(),
        source: CacheSource::CacheFresh,
      });
    }

    match self.cache_shell(url).await {
      Ok(response) => {
        if response.is_cacheable() {
          let this = self.clone();
          let shell_url = url.clone();
          let html = response.text();
          tokio::spawn(async move {
            if let Err(e) = this.complete_shell(&shell_url, &html).await {
              tracing::warn!(error = %e, "Shell sub-resources not cached; shell stays incomplete");
            }
          });
        }
        Ok(Intercepted::Respond {
          response,
          source: CacheSource::Network,
        })
      }
      Err(e) if e.is_transient() => match cached {
        Some(entry) => {
          tracing::debug!(error = %e, "Serving incomplete cached shell while offline");
          Ok(Intercepted::Respond {
            response: entry.response,
            source: CacheSource::Offline,
          })
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  async fn cache_first(&self, kind: ResourceKind, url: &Url) -> Result<Intercepted> {
    let partition = self.partition_for(kind);
    let key = self.routes.cache_key(url);
    if let Some(entry) = self.storage.get_entry(&partition, &key)? {
      return Ok(Intercepted::Respond {
        response: entry.response,
        source: CacheSource::CacheFresh,
      });
    }

    let response = self.upstream.fetch(url).await?;
    if response.is_cacheable() {
      let survey_id = self.routes.survey_id_of(url);
      self
        .storage
        .put_entry(&partition, &key, &response, survey_id.as_deref())?;
    }
    Ok(Intercepted::Respond {
      response,
      source: CacheSource::Network,
    })
  }

  async fn stale_while_revalidate(&self, kind: ResourceKind, url: &Url) -> Result<Intercepted> {
    let key = self.routes.cache_key(url);
    let Some(entry) = self.storage.get_entry(FORMS_PARTITION, &key)? else {
      return self.cache_first(kind, url).await;
    };

    let this = self.clone();
    let url = url.clone();
    tokio::spawn(async move {
      if let Err(e) = this.cache_resource(&url, true).await {
        tracing::debug!(url = %url, error = %e, "Background refresh failed");
      }
    });

    Ok(Intercepted::Respond {
      response: entry.response,
      source: CacheSource::CacheStale,
    })
  }

  /// Compare the cached form payload's hash with the live hash endpoint.
  ///
  /// When the form changed, the survey's cached resources are evicted so
  /// the next load fetches the new version.
  pub async fn check_form_hash(&self, survey_id: &str, page_url: &str) -> Result<HashStatus> {
    let page = Url::parse(page_url)?;
    if !self.routes.is_same_origin(&page) {
      return Ok(HashStatus::FormUpdateUnknown);
    }

    let payload_key = self
      .routes
      .cache_key(&self.routes.form_payload_url(survey_id)?);
    let Some(cached) = self.storage.get_entry(FORMS_PARTITION, &payload_key)? else {
      return Ok(HashStatus::FormUpdateUnknown);
    };
    let cached: HashResponse = serde_json::from_slice(&cached.response.body)?;

    let fresh = self
      .upstream
      .fetch(&self.routes.hash_url(survey_id)?)
      .await?;
    if !fresh.is_cacheable() {
      return Ok(HashStatus::FormUpdateUnknown);
    }
    let fresh: HashResponse = serde_json::from_slice(&fresh.body)?;

    if fresh.hash == cached.hash {
      return Ok(HashStatus::FormUpToDate);
    }
    let evicted = self
      .storage
      .remove_survey_entries(FORMS_PARTITION, survey_id)?;
    tracing::info!(survey_id, evicted, "Form changed upstream");
    Ok(HashStatus::FormUpdated)
  }
}

#[async_trait]
impl<S: CacheStorage + 'static, U: Upstream + 'static> InterceptLayer for ResourceCache<S, U> {
  async fn on_install(&self) -> Result<InstallReport> {
    let partition = self.static_partition();
    let urls = self
      .static_assets
      .iter()
      .map(|path| self.routes.url(path))
      .collect::<Result<Vec<_>>>()?;

    let target = partition.as_str();
    try_join_all(urls.iter().map(|u| async move {
      let response = self.upstream.fetch(u).await?;
      if !response.is_cacheable() {
        return Err(Error::from_status(response.status, u.as_str()));
      }
      self
        .storage
        .put_entry(target, &self.routes.cache_key(u), &response, None)
    }))
    .await?;

    tracing::info!(partition = %partition, assets = urls.len(), "Installed static assets");
    Ok(InstallReport {
      partition,
      cached: urls.len(),
    })
  }

  async fn on_activate(&self) -> Result<ActivateReport> {
    let current = self.static_partition();
    let mut deleted_partitions = Vec::new();
    for partition in self.storage.partitions()? {
      if partition == current || partition == FORMS_PARTITION {
        continue;
      }
      let removed = self.storage.delete_partition(&partition)?;
      tracing::info!(partition = %partition, removed, "Deleted stale cache partition");
      deleted_partitions.push(partition);
    }
    Ok(ActivateReport {
      deleted_partitions,
      claimed: true,
    })
  }

  async fn on_intercept(&self, request: InterceptRequest) -> Result<Intercepted> {
    if request.method != reqwest::Method::GET {
      return Ok(Intercepted::Bypass);
    }
    let url = &request.url;
    match self.routes.classify(url) {
      ResourceKind::Shell => self.serve_shell(url).await,
      ResourceKind::Static => self.cache_first(ResourceKind::Static, url).await,
      kind @ (ResourceKind::FormPayload | ResourceKind::Media) => {
        self.stale_while_revalidate(kind, url).await
      }
      ResourceKind::Hash | ResourceKind::Other => Ok(Intercepted::Bypass),
    }
  }

  async fn on_message(&self, message: CacheMessage) -> CacheReply {
    match message {
      CacheMessage::CheckFormHash { survey_id, url } => {
        let status = match self.check_form_hash(&survey_id, &url).await {
          Ok(status) => status,
          Err(e) => {
            tracing::debug!(survey_id = %survey_id, error = %e, "Form hash check failed");
            HashStatus::FormUpdateUnknown
          }
        };
        CacheReply { status, survey_id }
      }
    }
  }
}

impl<S: CacheStorage, U: Upstream> Clone for ResourceCache<S, U> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      upstream: Arc::clone(&self.upstream),
      routes: self.routes.clone(),
      version: self.version.clone(),
      static_assets: Arc::clone(&self.static_assets),
    }
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::db::Store;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, Ordering};
  use std::sync::Mutex;

  /// Canned upstream that records what it was asked for.
  #[derive(Default)]
  pub(crate) struct MockUpstream {
    responses: Mutex<HashMap<String, CachedResponse>>,
    calls: Mutex<Vec<String>>,
    offline: AtomicBool,
  }

  impl MockUpstream {
    pub(crate) fn respond(&self, url: &str, response: CachedResponse) {
      self
        .responses
        .lock()
        .unwrap()
        .insert(url.to_string(), response);
    }

    pub(crate) fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
      self.calls.lock().unwrap().clone()
    }
  }

  #[async_trait]
  impl Upstream for MockUpstream {
    async fn fetch(&self, url: &Url) -> Result<CachedResponse> {
      self.calls.lock().unwrap().push(url.to_string());
      if self.offline.load(Ordering::SeqCst) {
        return Err(Error::Offline("mock offline".into()));
      }
      Ok(
        self
          .responses
          .lock()
          .unwrap()
          .get(url.as_str())
          .cloned()
          .unwrap_or_else(|| CachedResponse::new(404, "not found")),
      )
    }
  }

  const ORIGIN: &str = "https://forms.example.org";

  fn setup() -> (ResourceCache<Store, MockUpstream>, Arc<Store>, Arc<MockUpstream>) {
    let store = Arc::new(Store::open_in_memory().unwrap());
    let upstream = Arc::new(MockUpstream::default());
    let routes = ResourceRoutes::new(ORIGIN, "/enketo").unwrap();
    let cache = ResourceCache::new(store.clone(), upstream.clone(), routes, "2");
    (cache, store, upstream)
  }

  fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
  }

  const SHELL: &str = r#"<html><script src="/enketo/js/app.js"></script></html>"#;

  fn respond(upstream: &MockUpstream, path: &str, body: &str) {
    upstream.respond(&format!("{}{}", ORIGIN, path), CachedResponse::new(200, body));
  }

  #[tokio::test]
  async fn test_non_get_and_cross_origin_bypass() {
    let (cache, _, upstream) = setup();
    let post = InterceptRequest {
      method: reqwest::Method::POST,
      url: url("/enketo/js/app.js"),
    };
    assert_eq!(cache.on_intercept(post).await.unwrap(), Intercepted::Bypass);

    let foreign = InterceptRequest::get(Url::parse("https://cdn.example.org/enketo/js/app.js").unwrap());
    assert_eq!(cache.on_intercept(foreign).await.unwrap(), Intercepted::Bypass);

    let hash = InterceptRequest::get(url("/enketo/transform/xform/hash/abc"));
    assert_eq!(cache.on_intercept(hash).await.unwrap(), Intercepted::Bypass);
    assert!(upstream.calls().is_empty());
  }

  #[tokio::test]
  async fn test_static_asset_is_cache_first() {
    let (cache, _, upstream) = setup();
    respond(&upstream, "/enketo/js/app.js", "console.log(1)");

    let first = cache
      .on_intercept(InterceptRequest::get(url("/enketo/js/app.js")))
      .await
      .unwrap();
    assert!(matches!(first, Intercepted::Respond { source: CacheSource::Network, .. }));

    upstream.set_offline(true);
    let second = cache
      .on_intercept(InterceptRequest::get(url("/enketo/js/app.js")))
      .await
      .unwrap();
    match second {
      Intercepted::Respond { response, source } => {
        assert_eq!(source, CacheSource::CacheFresh);
        assert_eq!(response.text(), "console.log(1)");
      }
      other => panic!("unexpected {:?}", other),
    }
    assert_eq!(upstream.calls().len(), 1);
  }

  #[tokio::test]
  async fn test_shell_needs_sentinel_before_served_from_cache() {
    let (cache, store, upstream) = setup();
    respond(&upstream, "/enketo/x/abc", SHELL);
    respond(&upstream, "/enketo/js/app.js", "app");

    let shell_url = url("/enketo/x/abc");
    cache.cache_shell(&shell_url).await.unwrap();
    let shell_key = cache.routes().shell_key();
    assert!(!store.contains(FORMS_PARTITION, &sentinel_key(&shell_key)).unwrap());

    // Without the sentinel the shell is refetched.
    let again = cache
      .on_intercept(InterceptRequest::get(url("/enketo/x/def")))
      .await
      .unwrap();
    assert!(matches!(again, Intercepted::Respond { source: CacheSource::Network, .. }));

    assert_eq!(cache.complete_shell(&shell_url, SHELL).await.unwrap(), 1);
    assert!(store.contains(FORMS_PARTITION, &sentinel_key(&shell_key)).unwrap());
    assert!(store
      .contains(&cache.static_partition(), "GET https://forms.example.org/enketo/js/app.js")
      .unwrap());

    upstream.set_offline(true);
    let cached = cache
      .on_intercept(InterceptRequest::get(url("/enketo/x/xyz?instance_id=9")))
      .await
      .unwrap();
    assert!(matches!(cached, Intercepted::Respond { source: CacheSource::CacheFresh, .. }));
  }

  #[tokio::test]
  async fn test_incomplete_shell_served_only_when_offline() {
    let (cache, _, upstream) = setup();
    respond(&upstream, "/enketo/x/abc", SHELL);
    cache.cache_shell(&url("/enketo/x/abc")).await.unwrap();

    upstream.set_offline(true);
    let offline = cache
      .on_intercept(InterceptRequest::get(url("/enketo/x/abc")))
      .await
      .unwrap();
    assert!(matches!(offline, Intercepted::Respond { source: CacheSource::Offline, .. }));
  }

  #[tokio::test]
  async fn test_failed_sub_resource_leaves_shell_incomplete() {
    let (cache, store, upstream) = setup();
    respond(&upstream, "/enketo/x/abc", SHELL);
    let shell_url = url("/enketo/x/abc");
    cache.cache_shell(&shell_url).await.unwrap();

    // app.js answers 404
    assert!(cache.complete_shell(&shell_url, SHELL).await.is_err());
    let key = sentinel_key(&cache.routes().shell_key());
    assert!(!store.contains(FORMS_PARTITION, &key).unwrap());
  }

  #[tokio::test]
  async fn test_install_and_activate_partitions() {
    let (cache, store, upstream) = setup();
    respond(&upstream, "/enketo/js/app.js", "app");
    respond(&upstream, "/enketo/css/theme.css", "css");
    let cache = cache.with_static_assets(vec!["/js/app.js".into(), "/css/theme.css".into()]);

    store
      .put_entry("static-1", "GET old", &CachedResponse::new(200, "old"), None)
      .unwrap();
    store
      .put_entry(FORMS_PARTITION, "GET form", &CachedResponse::new(200, "f"), Some("abc"))
      .unwrap();

    let installed = cache.on_install().await.unwrap();
    assert_eq!(installed.partition, "static-2");
    assert_eq!(installed.cached, 2);

    let activated = cache.on_activate().await.unwrap();
    assert_eq!(activated.deleted_partitions, vec!["static-1".to_string()]);
    assert!(activated.claimed);
    assert_eq!(
      store.partitions().unwrap(),
      vec![FORMS_PARTITION.to_string(), "static-2".to_string()]
    );
  }

  #[tokio::test]
  async fn test_install_fails_on_missing_asset() {
    let (cache, _, _) = setup();
    let cache = cache.with_static_assets(vec!["/js/missing.js".into()]);
    assert!(matches!(cache.on_install().await, Err(Error::NotFound(_))));
  }

  async fn cache_payload(cache: &ResourceCache<Store, MockUpstream>, upstream: &MockUpstream, hash: &str) {
    respond(
      upstream,
      "/enketo/transform/xform/abc",
      &format!(r#"{{"form":"<form/>","model":"<model/>","hash":"{}"}}"#, hash),
    );
    cache
      .on_intercept(InterceptRequest::get(url("/enketo/transform/xform/abc")))
      .await
      .unwrap();
  }

  fn check(survey_id: &str) -> CacheMessage {
    CacheMessage::CheckFormHash {
      survey_id: survey_id.into(),
      url: format!("{}/enketo/x/{}", ORIGIN, survey_id),
    }
  }

  #[tokio::test]
  async fn test_check_form_hash_up_to_date() {
    let (cache, _, upstream) = setup();
    cache_payload(&cache, &upstream, "abc123").await;
    respond(&upstream, "/enketo/transform/xform/hash/abc", r#"{"hash":"abc123"}"#);

    let reply = cache.on_message(check("abc")).await;
    assert_eq!(reply.status, HashStatus::FormUpToDate);
    assert_eq!(reply.survey_id, "abc");
  }

  #[tokio::test]
  async fn test_check_form_hash_updated_evicts_survey() {
    let (cache, store, upstream) = setup();
    cache_payload(&cache, &upstream, "abc123").await;
    respond(&upstream, "/enketo/transform/xform/hash/abc", r#"{"hash":"def456"}"#);

    let reply = cache.on_message(check("abc")).await;
    assert_eq!(reply.status, HashStatus::FormUpdated);
    let key = cache
      .routes()
      .cache_key(&url("/enketo/transform/xform/abc"));
    assert!(!store.contains(FORMS_PARTITION, &key).unwrap());
  }

  #[tokio::test]
  async fn test_check_form_hash_unknown_cases() {
    let (cache, _, upstream) = setup();

    // Nothing cached yet
    assert_eq!(
      cache.on_message(check("abc")).await.status,
      HashStatus::FormUpdateUnknown
    );

    cache_payload(&cache, &upstream, "abc123").await;
    upstream.set_offline(true);
    assert_eq!(
      cache.on_message(check("abc")).await.status,
      HashStatus::FormUpdateUnknown
    );

    let foreign = CacheMessage::CheckFormHash {
      survey_id: "abc".into(),
      url: "https://elsewhere.example.org/x/abc".into(),
    };
    assert_eq!(
      cache.on_message(foreign).await.status,
      HashStatus::FormUpdateUnknown
    );
  }

  #[test]
  fn test_message_wire_format() {
    let message: CacheMessage = serde_json::from_str(
      r#"{"type":"CHECK_FORM_HASH","surveyId":"abc","url":"https://f/x/abc"}"#,
    )
    .unwrap();
    assert_eq!(
      message,
      CacheMessage::CheckFormHash {
        survey_id: "abc".into(),
        url: "https://f/x/abc".into()
      }
    );

    let reply = CacheReply {
      status: HashStatus::FormUpToDate,
      survey_id: "abc".into(),
    };
    assert_eq!(
      serde_json::to_string(&reply).unwrap(),
      r#"{"type":"FORM_UP_TO_DATE","surveyId":"abc"}"#
    );
  }
}
