//! Where survey definitions come from.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::time::Duration;
use url::Url;

use crate::cache::ResourceRoutes;
use crate::error::{Error, Result};
use crate::openrosa::{Credentials, FormDescriptor, FormInfo, ManifestEntry, MediaPayload, ProtocolClient};

use super::types::{extract_model, version_hash, HashResponse, Survey};

/// Supplier of survey definitions, hashes and media.
#[async_trait]
pub trait SurveySource: Send + Sync {
  /// Full definition. The returned survey's media map is left empty; media
  /// are listed in its manifest.
  async fn fetch_survey(&self, descriptor: &FormDescriptor) -> Result<Survey>;

  /// Current version hash only, for cheap freshness checks.
  async fn fetch_hash(&self, descriptor: &FormDescriptor) -> Result<String>;

  async fn fetch_media(&self, entry: &ManifestEntry, credentials: &Credentials)
    -> Result<MediaPayload>;
}

// ============================================================================
// OpenRosa
// ============================================================================

/// Reads surveys straight from an OpenRosa server.
#[derive(Clone)]
pub struct OpenRosaSource {
  client: ProtocolClient,
}

impl OpenRosaSource {
  pub fn new(client: ProtocolClient) -> Self {
    Self { client }
  }

  async fn form_hash(&self, info: &FormInfo, credentials: &Credentials) -> Result<String> {
    match &info.hash {
      Some(hash) => Ok(hash.clone()),
      None => {
        let xform = self.client.fetch_form_definition(info, credentials).await?;
        Ok(content_hash(&xform))
      }
    }
  }
}

#[async_trait]
impl SurveySource for OpenRosaSource {
  async fn fetch_survey(&self, descriptor: &FormDescriptor) -> Result<Survey> {
    let credentials = &descriptor.credentials;
    let info = self.client.resolve_form_metadata(descriptor).await?;
    let xform = self.client.fetch_form_definition(&info, credentials).await?;
    let manifest = self.client.fetch_manifest(&info, credentials).await?;

    let form_hash = info.hash.clone().unwrap_or_else(|| content_hash(&xform));
    Ok(Survey {
      survey_id: descriptor.survey_id.clone(),
      server_url: descriptor.server_url.clone(),
      form_id: info.form_id,
      hash: version_hash(&form_hash, &manifest),
      model: extract_model(&xform),
      form: xform,
      manifest,
      media: BTreeMap::new(),
      cached_at: Utc::now(),
      last_saved: None,
    })
  }

  async fn fetch_hash(&self, descriptor: &FormDescriptor) -> Result<String> {
    let credentials = &descriptor.credentials;
    let info = self.client.resolve_form_metadata(descriptor).await?;
    let form_hash = self.form_hash(&info, credentials).await?;
    let manifest = self.client.fetch_manifest(&info, credentials).await?;
    Ok(version_hash(&form_hash, &manifest))
  }

  async fn fetch_media(
    &self,
    entry: &ManifestEntry,
    credentials: &Credentials,
  ) -> Result<MediaPayload> {
    self.client.fetch_media(&entry.download_url, credentials).await
  }
}

fn content_hash(xform: &str) -> String {
  format!("sha256:{}", hex::encode(Sha256::digest(xform.as_bytes())))
}

// ============================================================================
// Transform endpoints
// ============================================================================

/// Payload of the transform endpoint.
#[derive(Debug, Deserialize)]
struct TransformPayload {
  form: String,
  model: String,
  hash: String,
  #[serde(default)]
  media: BTreeMap<String, String>,
}

/// Reads pre-transformed surveys from the application's own endpoints.
#[derive(Clone)]
pub struct TransformSource {
  http: reqwest::Client,
  routes: ResourceRoutes,
}

impl TransformSource {
  pub fn new(routes: ResourceRoutes, timeout: Duration, user_agent: &str) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(user_agent)
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { http, routes })
  }

  async fn get(&self, url: Url) -> Result<reqwest::Response> {
    let response = self.http.get(url.clone()).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(Error::from_status(status.as_u16(), url.as_str()));
    }
    Ok(response)
  }
}

#[async_trait]
impl SurveySource for TransformSource {
  async fn fetch_survey(&self, descriptor: &FormDescriptor) -> Result<Survey> {
    let url = self.routes.form_payload_url(&descriptor.survey_id)?;
    let body = self.get(url).await?.bytes().await?;
    let payload: TransformPayload = serde_json::from_slice(&body)?;

    let mut manifest = Vec::with_capacity(payload.media.len());
    for (filename, href) in payload.media {
      let download_url = Url::parse(self.routes.origin())?.join(&href)?;
      manifest.push(ManifestEntry {
        filename,
        hash: None,
        download_url: download_url.to_string(),
      });
    }

    Ok(Survey {
      survey_id: descriptor.survey_id.clone(),
      server_url: descriptor.server_url.clone(),
      form_id: descriptor.form_id.clone(),
      hash: payload.hash,
      form: payload.form,
      model: payload.model,
      manifest,
      media: BTreeMap::new(),
      cached_at: Utc::now(),
      last_saved: None,
    })
  }

  async fn fetch_hash(&self, descriptor: &FormDescriptor) -> Result<String> {
    let url = self.routes.hash_url(&descriptor.survey_id)?;
    let body = self.get(url).await?.bytes().await?;
    let response: HashResponse = serde_json::from_slice(&body)?;
    Ok(response.hash)
  }

  async fn fetch_media(
    &self,
    entry: &ManifestEntry,
    _credentials: &Credentials,
  ) -> Result<MediaPayload> {
    let response = self.get(Url::parse(&entry.download_url)?).await?;
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let data = response.bytes().await?.to_vec();
    Ok(MediaPayload { content_type, data })
  }
}
