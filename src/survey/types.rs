use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::openrosa::ManifestEntry;
use crate::records::Record;

/// A cached, versioned form definition plus its media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
  pub survey_id: String,
  pub server_url: String,
  pub form_id: String,
  /// Version hash over form, model and media; never empty for a cached survey
  pub hash: String,
  /// Form markup handed to the rendering engine
  pub form: String,
  /// Data model (primary instance) handed to the rendering engine
  pub model: String,
  #[serde(default)]
  pub manifest: Vec<ManifestEntry>,
  /// filename -> URL the media can be retrieved from
  #[serde(default)]
  pub media: BTreeMap<String, String>,
  #[serde(default = "Utc::now")]
  pub cached_at: DateTime<Utc>,
  /// Most recent finalized record, attached on load for prefill
  #[serde(skip)]
  pub last_saved: Option<Record>,
}

/// Result of a hash-only freshness request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HashResponse {
  pub hash: String,
}

/// Compute a survey version hash from the form hash and its manifest.
///
/// Any change to the form or to any listed media changes the result.
pub fn version_hash(form_hash: &str, manifest: &[ManifestEntry]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(form_hash.as_bytes());
  for entry in manifest {
    hasher.update(b"\n");
    hasher.update(entry.filename.as_bytes());
    hasher.update(b":");
    hasher.update(entry.hash.as_deref().unwrap_or("").as_bytes());
  }
  let digest = hex::encode(hasher.finalize());
  digest[..16].to_string()
}

/// Pull the `<model>` element out of an XForm.
///
/// Returns an empty string when the form has no model or is not well-formed,
/// leaving the rendering engine to report the problem.
pub fn extract_model(xform: &str) -> String {
  model_span(xform)
    .map(|(start, end)| xform[start..end].to_string())
    .unwrap_or_default()
}

/// Byte range of the first `model` element, matched to its own end tag.
fn model_span(xml: &str) -> Option<(usize, usize)> {
  const MODEL: &[u8] = b"model";

  let mut reader = Reader::from_str(xml);
  let mut start: Option<usize> = None;
  // Nested elements that are also named `model`, e.g. a data field
  let mut nested = 0usize;

  loop {
    let event = reader.read_event().ok()?;
    let pos = usize::try_from(reader.buffer_position()).ok()?;
    match event {
      Event::Start(e) if e.local_name().as_ref() == MODEL => match start {
        None => start = Some(xml[..pos].rfind('<')?),
        Some(_) => nested += 1,
      },
      Event::End(e) if e.local_name().as_ref() == MODEL => {
        if let Some(begin) = start {
          if nested == 0 {
            return Some((begin, pos));
          }
          nested -= 1;
        }
      }
      Event::Empty(e) if start.is_none() && e.local_name().as_ref() == MODEL => {
        return Some((xml[..pos].rfind('<')?, pos));
      }
      Event::Eof => return None,
      _ => {}
    }
  }
}
