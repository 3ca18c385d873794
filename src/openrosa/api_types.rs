//! Serde-deserializable types matching OpenRosa XML responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;
use tracing::warn;

use super::types::{FormInfo, ManifestEntry};

// ============================================================================
// Form list (GET /formList)
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiXformsList {
  #[serde(rename = "xform", default)]
  pub xforms: Vec<ApiXform>,
}

#[derive(Debug, Deserialize)]
pub struct ApiXform {
  #[serde(rename = "formID", default)]
  pub form_id: String,
  #[serde(default)]
  pub name: String,
  #[serde(rename = "majorMinorVersion", default)]
  pub major_minor_version: Option<String>,
  #[serde(default)]
  pub version: Option<String>,
  #[serde(default)]
  pub hash: Option<String>,
  #[serde(rename = "downloadUrl", default)]
  pub download_url: String,
  #[serde(rename = "manifestUrl", default)]
  pub manifest_url: Option<String>,
}

// ============================================================================
// Manifest (GET manifestUrl)
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ApiManifest {
  #[serde(rename = "mediaFile", default)]
  pub media_files: Vec<ApiMediaFile>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMediaFile {
  #[serde(default)]
  pub filename: Option<String>,
  #[serde(default)]
  pub hash: Option<String>,
  #[serde(rename = "downloadUrl", default)]
  pub download_url: Option<String>,
}

// ============================================================================
// Submission response
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiOpenRosaResponse {
  #[serde(default)]
  pub message: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
pub struct ApiMessage {
  #[serde(rename = "@nature", default)]
  pub nature: Option<String>,
  #[serde(rename = "$text", default)]
  pub text: Option<String>,
}

// ============================================================================
// Conversions to domain types
// ============================================================================

impl From<ApiXform> for FormInfo {
  fn from(x: ApiXform) -> Self {
    FormInfo {
      form_id: x.form_id.trim().to_string(),
      name: x.name,
      version: non_empty(x.version).or_else(|| non_empty(x.major_minor_version)),
      hash: non_empty(x.hash),
      download_url: x.download_url.trim().to_string(),
      manifest_url: non_empty(x.manifest_url),
    }
  }
}

/// Parse a form list body into form infos.
pub fn parse_form_list(body: &str) -> crate::Result<Vec<FormInfo>> {
  let list: ApiXformsList = quick_xml::de::from_str(body)?;
  Ok(list.xforms.into_iter().map(FormInfo::from).collect())
}

/// Parse a manifest body, dropping entries that cannot be used.
///
/// Never fails: an unreadable manifest is treated as listing no media.
pub fn parse_manifest(body: &str) -> Vec<ManifestEntry> {
  let manifest: ApiManifest = match quick_xml::de::from_str(body) {
    Ok(m) => m,
    Err(e) => {
      warn!(error = %e, "ignoring malformed form manifest");
      return Vec::new();
    }
  };

  manifest
    .media_files
    .into_iter()
    .filter_map(|file| {
      let filename = non_empty(file.filename)?;
      let download_url = non_empty(file.download_url)?;
      Some(ManifestEntry {
        filename,
        hash: non_empty(file.hash),
        download_url,
      })
    })
    .collect()
}

/// Extract the human-readable message of an OpenRosa response, if any.
pub fn parse_response_message(body: &str) -> Option<String> {
  let response: ApiOpenRosaResponse = quick_xml::de::from_str(body).ok()?;
  response
    .message
    .and_then(|m| m.text)
    .map(|t| t.trim().to_string())
    .filter(|t| !t.is_empty())
}

fn non_empty(value: Option<String>) -> Option<String> {
  value
    .map(|v| v.trim().to_string())
    .filter(|v| !v.is_empty())
}
