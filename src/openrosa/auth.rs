//! WWW-Authenticate challenge parsing and Authorization header derivation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use url::Url;

/// Authentication challenge advertised by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
  Basic,
  Digest(DigestChallenge),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
  pub realm: String,
  pub nonce: String,
  pub opaque: Option<String>,
  pub algorithm: DigestAlgorithm,
  /// Whether the server offered `qop=auth`
  pub qop_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
  Md5,
  Sha256,
}

impl DigestAlgorithm {
  fn name(self) -> &'static str {
    match self {
      DigestAlgorithm::Md5 => "MD5",
      DigestAlgorithm::Sha256 => "SHA-256",
    }
  }

  fn hash(self, input: &str) -> String {
    match self {
      DigestAlgorithm::Md5 => hex::encode(Md5::digest(input.as_bytes())),
      DigestAlgorithm::Sha256 => hex::encode(Sha256::digest(input.as_bytes())),
    }
  }
}

/// Parse a `WWW-Authenticate` header value.
///
/// Digest is preferred when the server offers both schemes in one header.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
  let trimmed = header.trim();
  let lower = trimmed.to_lowercase();

  if let Some(idx) = lower.find("digest ") {
    let params = parse_params(&trimmed[idx + "digest ".len()..]);
    let realm = params.get("realm").cloned().unwrap_or_default();
    let nonce = params.get("nonce").cloned()?;
    let algorithm = match params.get("algorithm").map(|a| a.to_uppercase()) {
      Some(a) if a == "SHA-256" => DigestAlgorithm::Sha256,
      Some(a) if a == "MD5" => DigestAlgorithm::Md5,
      None => DigestAlgorithm::Md5,
      Some(_) => return None,
    };
    let qop_auth = params
      .get("qop")
      .map(|q| q.split(',').any(|v| v.trim().eq_ignore_ascii_case("auth")))
      .unwrap_or(false);
    return Some(Challenge::Digest(DigestChallenge {
      realm,
      nonce,
      opaque: params.get("opaque").cloned(),
      algorithm,
      qop_auth,
    }));
  }

  if lower.starts_with("basic") || lower.contains(", basic") {
    return Some(Challenge::Basic);
  }

  None
}

/// Split `k=v, k="v, w"` pairs, honoring quotes.
fn parse_params(input: &str) -> HashMap<String, String> {
  let mut params = HashMap::new();
  let mut rest = input.trim();

  while !rest.is_empty() {
    let Some(eq) = rest.find('=') else { break };
    let key = rest[..eq].trim().trim_start_matches(',').trim().to_lowercase();
    rest = rest[eq + 1..].trim_start();

    let value;
    if let Some(stripped) = rest.strip_prefix('"') {
      let end = stripped.find('"').unwrap_or(stripped.len());
      value = stripped[..end].to_string();
      rest = stripped.get(end + 1..).unwrap_or("");
    } else {
      let end = rest.find(',').unwrap_or(rest.len());
      value = rest[..end].trim().to_string();
      rest = &rest[end..];
    }
    rest = rest.trim_start().trim_start_matches(',').trim_start();
    params.insert(key, value);
  }

  params
}

/// `Basic base64(user:pass)`.
pub fn basic_header(username: &str, password: &str) -> String {
  format!(
    "Basic {}",
    STANDARD.encode(format!("{}:{}", username, password))
  )
}

/// Answer a digest challenge for one request.
///
/// `nonce_count` is the number of requests sent with this nonce so far,
/// this one included; servers reject a repeated count as a replay.
pub fn digest_header(
  challenge: &DigestChallenge,
  method: &str,
  url: &Url,
  username: &str,
  password: &str,
  nonce_count: u32,
) -> String {
  let mut cnonce_bytes = [0u8; 8];
  rand::thread_rng().fill_bytes(&mut cnonce_bytes);
  digest_header_with_cnonce(
    challenge,
    method,
    url,
    username,
    password,
    nonce_count,
    &hex::encode(cnonce_bytes),
  )
}

pub(crate) fn digest_header_with_cnonce(
  challenge: &DigestChallenge,
  method: &str,
  url: &Url,
  username: &str,
  password: &str,
  nonce_count: u32,
  cnonce: &str,
) -> String {
  let uri = match url.query() {
    Some(q) => format!("{}?{}", url.path(), q),
    None => url.path().to_string(),
  };
  let algo = challenge.algorithm;
  let ha1 = algo.hash(&format!("{}:{}:{}", username, challenge.realm, password));
  let ha2 = algo.hash(&format!("{}:{}", method, uri));
  let nc = format!("{:08x}", nonce_count);

  let response = if challenge.qop_auth {
    algo.hash(&format!(
      "{}:{}:{}:{}:auth:{}",
      ha1, challenge.nonce, nc, cnonce, ha2
    ))
  } else {
    algo.hash(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
  };

  let mut header = format!(
    r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", algorithm={}, response="{}""#,
    username,
    challenge.realm,
    challenge.nonce,
    uri,
    algo.name(),
    response
  );
  if challenge.qop_auth {
    header.push_str(&format!(r#", qop=auth, nc={}, cnonce="{}""#, nc, cnonce));
  }
  if let Some(opaque) = &challenge.opaque {
    header.push_str(&format!(r#", opaque="{}""#, opaque));
  }
  header
}
