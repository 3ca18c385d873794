use serde::{Deserialize, Serialize};

/// Credentials used against an OpenRosa server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
  #[default]
  Anonymous,
  /// Username and password, answered with Basic or Digest depending on the challenge
  Password { username: String, password: String },
  /// Pre-issued token, sent as-is without probing
  Bearer(String),
}

/// Everything needed to locate one form on one server.
#[derive(Debug, Clone)]
pub struct FormDescriptor {
  pub survey_id: String,
  pub server_url: String,
  pub form_id: String,
  pub credentials: Credentials,
}

impl FormDescriptor {
  pub fn new(
    survey_id: impl Into<String>,
    server_url: impl Into<String>,
    form_id: impl Into<String>,
  ) -> Self {
    Self {
      survey_id: survey_id.into(),
      server_url: server_url.into(),
      form_id: form_id.into(),
      credentials: Credentials::Anonymous,
    }
  }

  pub fn with_credentials(mut self, credentials: Credentials) -> Self {
    self.credentials = credentials;
    self
  }
}

/// One entry of the server's form list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormInfo {
  pub form_id: String,
  pub name: String,
  pub version: Option<String>,
  /// Hash of the form definition as reported by the server (e.g. "md5:...")
  pub hash: Option<String>,
  pub download_url: String,
  pub manifest_url: Option<String>,
}

/// One media file listed by a form manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  pub filename: String,
  pub hash: Option<String>,
  pub download_url: String,
}

/// Downloaded media payload.
#[derive(Debug, Clone)]
pub struct MediaPayload {
  pub content_type: Option<String>,
  pub data: Vec<u8>,
}

/// What the server said after accepting a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionAck {
  pub status: u16,
  /// Text of the OpenRosa response message, if the body carried one
  pub message: Option<String>,
}
