//! Per-server capability profiles.
//!
//! Server quirks are declared once per server URL and looked up by the
//! client, instead of being sprinkled through request code.

use serde::Deserialize;

/// Declared capabilities of one OpenRosa server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerProfile {
  /// Probe credentials with GET instead of HEAD (older formhub-style servers)
  #[serde(default)]
  pub legacy_auth_probe: bool,
  /// Extra query parameter appended to form list requests
  #[serde(default)]
  pub custom_param: Option<CustomParam>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CustomParam {
  pub name: String,
  pub value: String,
}

/// Registry of profiles keyed by server URL prefix.
#[derive(Debug, Clone, Default)]
pub struct ServerProfiles {
  entries: Vec<(String, ServerProfile)>,
}

impl ServerProfiles {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a profile for every URL under `server_url`.
  pub fn insert(&mut self, server_url: &str, profile: ServerProfile) {
    let key = normalize(server_url);
    self.entries.retain(|(k, _)| *k != key);
    self.entries.push((key, profile));
  }

  /// Profile of the most specific server prefix matching `url`.
  ///
  /// Unknown servers get the default profile.
  pub fn profile_for(&self, url: &str) -> ServerProfile {
    let url = normalize(url);
    self
      .entries
      .iter()
      .filter(|(prefix, _)| url == *prefix || url.starts_with(&format!("{}/", prefix)))
      .max_by_key(|(prefix, _)| prefix.len())
      .map(|(_, profile)| profile.clone())
      .unwrap_or_default()
  }
}

fn normalize(url: &str) -> String {
  url.trim().trim_end_matches('/').to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_longest_prefix_wins() {
    let mut profiles = ServerProfiles::new();
    profiles.insert("https://kc.example.org", ServerProfile::default());
    profiles.insert(
      "https://kc.example.org/legacy/",
      ServerProfile {
        legacy_auth_probe: true,
        custom_param: None,
      },
    );

    assert!(profiles
      .profile_for("https://kc.example.org/legacy/formList")
      .legacy_auth_probe);
    assert!(!profiles
      .profile_for("https://kc.example.org/alice/formList")
      .legacy_auth_probe);
    // prefix must end on a path boundary
    assert!(!profiles
      .profile_for("https://kc.example.org/legacyish")
      .legacy_auth_probe);
  }

  #[test]
  fn test_unknown_server_gets_default() {
    let profiles = ServerProfiles::new();
    assert_eq!(
      profiles.profile_for("https://other.example.org"),
      ServerProfile::default()
    );
  }
}
