//! URL conventions shared by the resource cache and the form cache.
//!
//! Which partition a URL lands in is decided by one declared rule table,
//! matched against the path below the base path.

use url::Url;

use crate::error::Result;

/// Partition holding per-survey payloads, media and shells.
pub const FORMS_PARTITION: &str = "forms";

const STATIC_PARTITION_PREFIX: &str = "static-";
const SENTINEL_SUFFIX: &str = "#fully-cached";

/// What kind of resource a URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
  /// Top-level page hosting a rendered form
  Shell,
  /// Scripts, styles, fonts, translations, the cache script itself
  Static,
  /// Per-survey transformed form payload
  FormPayload,
  /// Per-survey media
  Media,
  /// Hash-only freshness endpoint; always live
  Hash,
  /// Anything else; not cached
  Other,
}

#[derive(Debug, Clone, Copy)]
pub struct PartitionRule {
  pub prefix: &'static str,
  pub kind: ResourceKind,
}

const fn rule(prefix: &'static str, kind: ResourceKind) -> PartitionRule {
  PartitionRule { prefix, kind }
}

/// Ordered rule table; the first matching prefix wins.
pub const PARTITION_RULES: &[PartitionRule] = &[
  rule("/x/", ResourceKind::Shell),
  rule("/transform/xform/hash/", ResourceKind::Hash),
  rule("/transform/xform/", ResourceKind::FormPayload),
  rule("/media/get/", ResourceKind::Media),
  rule("/js/", ResourceKind::Static),
  rule("/css/", ResourceKind::Static),
  rule("/fonts/", ResourceKind::Static),
  rule("/locales/", ResourceKind::Static),
  rule("/images/", ResourceKind::Static),
  rule("/favicon.ico", ResourceKind::Static),
  rule("/offline-app-worker.js", ResourceKind::Static),
];

/// Name of the static partition for a cache version.
pub fn static_partition(version: &str) -> String {
  format!("{}{}", STATIC_PARTITION_PREFIX, version)
}

/// Key of the marker written once a shell and its sub-resources are cached.
pub fn sentinel_key(shell_key: &str) -> String {
  format!("{}{}", shell_key, SENTINEL_SUFFIX)
}

/// Origin and base path the cached application is served from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRoutes {
  origin: String,
  base_path: String,
}

impl ResourceRoutes {
  /// `origin` like "https://forms.example.org", `base_path` like "/enketo" or "".
  pub fn new(origin: &str, base_path: &str) -> Result<Self> {
    let origin = Url::parse(origin)?.origin().ascii_serialization();
    let trimmed = base_path.trim().trim_matches('/');
    let base_path = if trimmed.is_empty() {
      String::new()
    } else {
      format!("/{}", trimmed)
    };
    Ok(Self { origin, base_path })
  }

  pub fn origin(&self) -> &str {
    &self.origin
  }

  pub fn base_path(&self) -> &str {
    &self.base_path
  }

  pub fn is_same_origin(&self, url: &Url) -> bool {
    url.origin().ascii_serialization() == self.origin
  }

  /// Path below the base path, or None when outside the application.
  pub fn relative_path<'a>(&self, url: &'a Url) -> Option<&'a str> {
    let path = url.path();
    if self.base_path.is_empty() {
      return Some(path);
    }
    let rest = path.strip_prefix(&self.base_path)?;
    if rest.is_empty() || rest.starts_with('/') {
      Some(rest)
    } else {
      None
    }
  }

  pub fn classify(&self, url: &Url) -> ResourceKind {
    if !self.is_same_origin(url) {
      return ResourceKind::Other;
    }
    let Some(path) = self.relative_path(url) else {
      return ResourceKind::Other;
    };
    PARTITION_RULES
      .iter()
      .find(|r| path.starts_with(r.prefix))
      .map(|r| r.kind)
      .unwrap_or(ResourceKind::Other)
  }

  /// Cache key of a request. All shell URLs share one key, whatever the
  /// survey id, instance id or query.
  pub fn cache_key(&self, url: &Url) -> String {
    if self.classify(url) == ResourceKind::Shell {
      return self.shell_key();
    }
    let mut url = url.clone();
    url.set_fragment(None);
    format!("GET {}", url)
  }

  pub fn shell_key(&self) -> String {
    format!("GET {}{}/x/", self.origin, self.base_path)
  }

  /// Survey a per-survey URL belongs to.
  pub fn survey_id_of(&self, url: &Url) -> Option<String> {
    let path = self.relative_path(url)?;
    let rest = match self.classify(url) {
      ResourceKind::FormPayload => path.strip_prefix("/transform/xform/")?,
      ResourceKind::Hash => path.strip_prefix("/transform/xform/hash/")?,
      ResourceKind::Media => path.strip_prefix("/media/get/")?,
      _ => return None,
    };
    rest
      .split('/')
      .next()
      .filter(|s| !s.is_empty())
      .map(String::from)
  }

  pub fn url(&self, path: &str) -> Result<Url> {
    Ok(Url::parse(&format!("{}{}{}", self.origin, self.base_path, path))?)
  }

  pub fn shell_url(&self, survey_id: &str) -> Result<Url> {
    self.url(&format!("/x/{}", survey_id))
  }

  pub fn hash_url(&self, survey_id: &str) -> Result<Url> {
    self.url(&format!("/transform/xform/hash/{}", survey_id))
  }

  pub fn form_payload_url(&self, survey_id: &str) -> Result<Url> {
    self.url(&format!("/transform/xform/{}", survey_id))
  }

  pub fn media_url(&self, survey_id: &str, filename: &str) -> Result<Url> {
    let mut url = self.url(&format!("/media/get/{}/", survey_id))?;
    url
      .path_segments_mut()
      .map_err(|_| crate::Error::Config("origin cannot be a base URL".into()))?
      .pop_if_empty()
      .push(filename);
    Ok(url)
  }
}
