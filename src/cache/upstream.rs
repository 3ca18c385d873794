//! Network upstream for the resource cache.

use async_trait::async_trait;
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};

use super::traits::{CachedResponse, Upstream};

/// Fetches resources over HTTP with reqwest.
#[derive(Clone)]
pub struct HttpUpstream {
  http: reqwest::Client,
}

impl HttpUpstream {
  pub fn new(timeout: Duration, user_agent: &str) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(user_agent)
      .build()
      .map_err(|e| Error::Http(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { http })
  }
}

#[async_trait]
impl Upstream for HttpUpstream {
  async fn fetch(&self, url: &Url) -> Result<CachedResponse> {
    let response = self.http.get(url.clone()).send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await?.to_vec();

    tracing::debug!(url = %url, status, bytes = body.len(), "Fetched upstream resource");
    Ok(CachedResponse {
      status,
      headers,
      body,
    })
  }
}
