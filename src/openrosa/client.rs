use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, DATE, USER_AGENT, WWW_AUTHENTICATE};
use reqwest::multipart::{Form, Part};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::records::Record;

use super::api_types::{parse_form_list, parse_manifest, parse_response_message};
use super::auth::{basic_header, digest_header, parse_challenge, Challenge};
use super::profile::ServerProfiles;
use super::submission::{split_into_batches, INCOMPLETE_PART, XML_PART};
use super::types::{
  Credentials, FormDescriptor, FormInfo, ManifestEntry, MediaPayload, SubmissionAck,
};

pub const OPENROSA_VERSION_HEADER: &str = "X-OpenRosa-Version";
pub const OPENROSA_VERSION: &str = "1.0";
pub const INSTANCE_ID_HEADER: &str = "X-OpenRosa-Instance-Id";
pub const ACCEPT_CONTENT_LENGTH_HEADER: &str = "X-OpenRosa-Accept-Content-Length";

/// Connection settings for [`ProtocolClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
  pub timeout: Duration,
  /// Identity of this client, e.g. "formsync/0.1.0"
  pub product: String,
  /// User agent of the caller this client acts for, if any
  pub original_agent: Option<String>,
  pub profiles: ServerProfiles,
}

impl Default for ClientSettings {
  fn default() -> Self {
    Self {
      timeout: Duration::from_secs(60),
      product: format!("formsync/{}", env!("CARGO_PKG_VERSION")),
      original_agent: None,
      profiles: ServerProfiles::default(),
    }
  }
}

/// OpenRosa protocol client.
///
/// Speaks form discovery, download, manifest and submission. Errors are
/// surfaced uninterpreted; callers decide what a 404 or 401 means to them.
#[derive(Clone)]
pub struct ProtocolClient {
  http: reqwest::Client,
  user_agent: String,
  profiles: Arc<ServerProfiles>,
  /// Challenge and nonce use per origin, so only the first request fetches one
  challenges: Arc<Mutex<HashMap<String, OriginAuth>>>,
}

/// What an origin asked for, and how often its digest nonce was used.
#[derive(Debug, Clone)]
struct OriginAuth {
  /// None when the origin required no authentication
  challenge: Option<Challenge>,
  nonce_count: u32,
}

impl ProtocolClient {
  pub fn new(settings: ClientSettings) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(settings.timeout)
      .build()
      .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

    let user_agent = match &settings.original_agent {
      Some(agent) => format!("{} ({})", settings.product, agent),
      None => settings.product.clone(),
    };

    Ok(Self {
      http,
      user_agent,
      profiles: Arc::new(settings.profiles),
      challenges: Arc::new(Mutex::new(HashMap::new())),
    })
  }

  pub fn user_agent(&self) -> &str {
    &self.user_agent
  }

  /// Look up the single form list entry matching the descriptor's form id.
  pub async fn resolve_form_metadata(&self, descriptor: &FormDescriptor) -> Result<FormInfo> {
    let mut url = server_url(&descriptor.server_url, "formList")?;
    url
      .query_pairs_mut()
      .append_pair("formID", &descriptor.form_id);
    if let Some(param) = self.profiles.profile_for(&descriptor.server_url).custom_param {
      url.query_pairs_mut().append_pair(&param.name, &param.value);
    }

    let body = self
      .get_text(&url, &descriptor.credentials)
      .await?;
    let forms = parse_form_list(&body)?;

    let mut matching: Vec<FormInfo> = forms
      .into_iter()
      .filter(|f| f.form_id == descriptor.form_id)
      .collect();

    if matching.len() != 1 {
      return Err(Error::NotFound(format!(
        "form {} is not listed by {} ({} matches)",
        descriptor.form_id,
        descriptor.server_url,
        matching.len()
      )));
    }
    Ok(matching.remove(0))
  }

  /// Download the raw XForm definition.
  pub async fn fetch_form_definition(
    &self,
    info: &FormInfo,
    credentials: &Credentials,
  ) -> Result<String> {
    let url = Url::parse(&info.download_url)?;
    self.get_text(&url, credentials).await
  }

  /// Download the form's media manifest.
  ///
  /// Forms without a manifest URL and unparseable manifests yield an empty list.
  pub async fn fetch_manifest(
    &self,
    info: &FormInfo,
    credentials: &Credentials,
  ) -> Result<Vec<ManifestEntry>> {
    let Some(manifest_url) = &info.manifest_url else {
      return Ok(Vec::new());
    };
    let url = Url::parse(manifest_url)?;
    let body = self.get_text(&url, credentials).await?;
    Ok(parse_manifest(&body))
  }

  /// Download one media file.
  pub async fn fetch_media(&self, url: &str, credentials: &Credentials) -> Result<MediaPayload> {
    let url = Url::parse(url)?;
    let response = self
      .send(Method::GET, &url, credentials, Ok)
      .await?;
    let response = self.check(response, &url).await?;
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let data = response.bytes().await?.to_vec();
    Ok(MediaPayload { content_type, data })
  }

  /// Ask the server how large a single submission POST may be.
  ///
  /// `None` means the server does not advertise a limit.
  pub async fn probe_max_submission_size(
    &self,
    server: &str,
    credentials: &Credentials,
  ) -> Result<Option<u64>> {
    let url = server_url(server, "submission")?;
    let response = self
      .send(Method::HEAD, &url, credentials, Ok)
      .await?;
    let response = self.check(response, &url).await?;
    let max = response
      .headers()
      .get(ACCEPT_CONTENT_LENGTH_HEADER)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.trim().parse::<u64>().ok());
    debug!(server, ?max, "probed maximum submission size");
    Ok(max)
  }

  /// Check that the credentials are accepted by the server.
  pub async fn authenticate(&self, server: &str, credentials: &Credentials) -> Result<()> {
    let method = if self.profiles.profile_for(server).legacy_auth_probe {
      Method::GET
    } else {
      Method::HEAD
    };
    let url = server_url(server, "formList")?;
    let response = self.send(method, &url, credentials, Ok).await?;
    self.check(response, &url).await?;
    Ok(())
  }

  /// Build the Authorization header value for a request.
  ///
  /// Bearer tokens are used as-is. Passwords are answered according to the
  /// server's challenge, which is discovered with one HEAD request per origin.
  pub async fn derive_authorization_header(
    &self,
    method: &Method,
    url: &Url,
    credentials: &Credentials,
  ) -> Result<Option<String>> {
    Ok(self.authorization(method, url, credentials).await?.0)
  }

  /// Submit a record in a single POST, without a size limit.
  pub async fn submit(
    &self,
    record: &Record,
    endpoint: &str,
    credentials: &Credentials,
  ) -> Result<SubmissionAck> {
    self
      .submit_with_limit(record, endpoint, credentials, None)
      .await
  }

  /// Submit a record, splitting attachments into batches below `max_size`.
  ///
  /// The record counts as delivered only if every batch is accepted.
  pub async fn submit_with_limit(
    &self,
    record: &Record,
    endpoint: &str,
    credentials: &Credentials,
    max_size: Option<u64>,
  ) -> Result<SubmissionAck> {
    let url = Url::parse(endpoint)?;
    let batches = split_into_batches(record, max_size)?;
    let total = batches.len();
    let mut last_ack = None;

    for (i, batch) in batches.into_iter().enumerate() {
      let build = |request: RequestBuilder| -> Result<RequestBuilder> {
        let mut form = Form::new().part(
          XML_PART,
          Part::bytes(record.xml.as_bytes().to_vec())
            .file_name(XML_PART)
            .mime_str("text/xml")?,
        );
        for file in &batch.files {
          let part = Part::bytes(file.data.clone()).file_name(file.name.clone());
          let part = match &file.content_type {
            Some(ct) => part.mime_str(ct)?,
            None => part,
          };
          form = form.part(file.name.clone(), part);
        }
        if batch.incomplete {
          form = form.text(INCOMPLETE_PART, "yes");
        }
        Ok(
          request
            .header(INSTANCE_ID_HEADER, &record.record_id)
            .multipart(form),
        )
      };

      let response = self.send(Method::POST, &url, credentials, build).await?;
      let ack = self.read_ack(response, &url).await?;
      debug!(
        record = %record.record_id,
        batch = i + 1,
        total,
        status = ack.status,
        "submission batch accepted"
      );
      last_ack = Some(ack);
    }

    let ack = last_ack.ok_or_else(|| Error::InvalidRecord("nothing to submit".into()))?;
    info!(record = %record.record_id, status = ack.status, "record submitted");
    Ok(ack)
  }

  // -----------------------------------------------------------------------
  // Internal
  // -----------------------------------------------------------------------

  fn request(&self, method: Method, url: &Url) -> RequestBuilder {
    self
      .http
      .request(method, url.clone())
      .header(OPENROSA_VERSION_HEADER, OPENROSA_VERSION)
      .header(DATE, http_date())
      .header(USER_AGENT, &self.user_agent)
  }

  /// Authorization header for a request, and whether it answers a
  /// challenge remembered from an earlier request.
  async fn authorization(
    &self,
    method: &Method,
    url: &Url,
    credentials: &Credentials,
  ) -> Result<(Option<String>, bool)> {
    let (username, password) = match credentials {
      Credentials::Anonymous => return Ok((None, false)),
      Credentials::Bearer(token) => return Ok((Some(format!("Bearer {}", token)), false)),
      Credentials::Password { username, password } => (username, password),
    };

    let (known, remembered) = match self.next_use(url)? {
      Some(known) => (known, true),
      None => (self.fetch_challenge(url).await?, false),
    };

    let header = known.challenge.map(|c| match c {
      Challenge::Basic => basic_header(username, password),
      Challenge::Digest(d) => digest_header(
        &d,
        method.as_str(),
        url,
        username,
        password,
        known.nonce_count,
      ),
    });
    Ok((header, remembered))
  }

  /// Send an authorized request built by `build`.
  ///
  /// A 401 to a request that answered a remembered challenge is retried once
  /// against a freshly fetched challenge.
  async fn send<F>(
    &self,
    method: Method,
    url: &Url,
    credentials: &Credentials,
    build: F,
  ) -> Result<Response>
  where
    F: Fn(RequestBuilder) -> Result<RequestBuilder>,
  {
    let (header, remembered) = self.authorization(&method, url, credentials).await?;
    let response = build(self.with_authorization(method.clone(), url, header))?
      .send()
      .await?;
    if response.status() != StatusCode::UNAUTHORIZED || !remembered {
      return Ok(response);
    }

    debug!(%url, "remembered challenge rejected, fetching a new one");
    self.forget_challenge(url);
    let (header, _) = self.authorization(&method, url, credentials).await?;
    Ok(
      build(self.with_authorization(method, url, header))?
        .send()
        .await?,
    )
  }

  fn with_authorization(&self, method: Method, url: &Url, header: Option<String>) -> RequestBuilder {
    let request = self.request(method, url);
    match header {
      Some(value) => request.header(AUTHORIZATION, value),
      None => request,
    }
  }

  async fn get_text(&self, url: &Url, credentials: &Credentials) -> Result<String> {
    let response = self.send(Method::GET, url, credentials, Ok).await?;
    let response = self.check(response, url).await?;
    Ok(response.text().await?)
  }

  async fn check(&self, response: Response, url: &Url) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
      self.forget_challenge(url);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::from_status(
      status.as_u16(),
      format!("{} {}", url, summarize(&body)),
    ))
  }

  async fn read_ack(&self, response: Response, url: &Url) -> Result<SubmissionAck> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = parse_response_message(&body);

    match status.as_u16() {
      201 | 202 => Ok(SubmissionAck {
        status: status.as_u16(),
        message,
      }),
      code => {
        if status == StatusCode::UNAUTHORIZED {
          self.forget_challenge(url);
        }
        let detail = message.unwrap_or_else(|| summarize(&body));
        Err(Error::from_status(code, format!("{} {}", url, detail)))
      }
    }
  }

  async fn fetch_challenge(&self, url: &Url) -> Result<OriginAuth> {
    let response = self.request(Method::HEAD, url).send().await?;

    let challenge = if response.status() == StatusCode::UNAUTHORIZED {
      let parsed = response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v: &HeaderValue| v.to_str().ok())
        .filter_map(parse_challenge)
        .max_by_key(|c| matches!(c, Challenge::Digest(_)));
      if parsed.is_none() {
        warn!(%url, "server requires authentication but sent no usable challenge");
      }
      parsed
    } else {
      None
    };

    let known = OriginAuth {
      challenge,
      nonce_count: 1,
    };
    let mut challenges = self
      .challenges
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    challenges.insert(origin_of(url), known.clone());
    Ok(known)
  }

  /// The origin's remembered challenge, counting one more use of its nonce.
  fn next_use(&self, url: &Url) -> Result<Option<OriginAuth>> {
    let mut challenges = self
      .challenges
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    Ok(challenges.get_mut(&origin_of(url)).map(|known| {
      known.nonce_count += 1;
      known.clone()
    }))
  }

  fn forget_challenge(&self, url: &Url) {
    if let Ok(mut challenges) = self.challenges.lock() {
      challenges.remove(&origin_of(url));
    }
  }
}

/// `{server}/{path}` as a URL.
pub fn server_url(server: &str, path: &str) -> Result<Url> {
  Ok(Url::parse(&format!(
    "{}/{}",
    server.trim().trim_end_matches('/'),
    path
  ))?)
}

/// Current time as an RFC 7231 IMF-fixdate.
pub fn http_date() -> String {
  chrono::Utc::now()
    .format("%a, %d %b %Y %H:%M:%S GMT")
    .to_string()
}

fn origin_of(url: &Url) -> String {
  url.origin().ascii_serialization()
}

fn summarize(body: &str) -> String {
  let trimmed = body.trim();
  if trimmed.len() > 200 {
    let mut end = 200;
    while !trimmed.is_char_boundary(end) {
      end -= 1;
    }
    format!("{}...", &trimmed[..end])
  } else {
    trimmed.to_string()
  }
}
