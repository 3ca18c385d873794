use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use formsync::cache::ResourceRoutes;
use formsync::openrosa::{
  ClientSettings, Credentials, CustomParam, FormDescriptor, ServerProfile, ServerProfiles,
};
use formsync::survey::FormCacheSettings;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub servers: Vec<ServerConfig>,
  #[serde(default)]
  pub surveys: Vec<SurveyConfig>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
  /// Password if a username is set, else a token if one is in the environment
  #[default]
  Auto,
  /// Username + FORMSYNC_PASSWORD, answered with Basic or Digest
  Password,
  /// FORMSYNC_TOKEN sent as a bearer token
  Token,
  None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
  pub url: String,
  pub username: Option<String>,
  #[serde(default)]
  pub auth_type: AuthType,
  /// Server only answers auth probes on GET
  #[serde(default)]
  pub legacy_auth_probe: bool,
  /// Extra query parameter sent with form list requests
  pub custom_param: Option<CustomParam>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SurveyConfig {
  pub id: String,
  /// URL of the server the form lives on
  pub server: String,
  pub form_id: String,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  /// Read forms straight from the OpenRosa server
  #[default]
  OpenRosa,
  /// Read transformed forms from the application's transform endpoints
  Transform,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Origin the cached application is served from
  pub origin: String,
  pub base_path: String,
  /// Static partition version; defaults to the crate version
  pub version: Option<String>,
  /// Paths below base_path precached on install
  pub static_assets: Vec<String>,
  pub source: SourceKind,
  pub freshness_initial_secs: u64,
  pub freshness_interval_secs: u64,
  pub media_concurrency: usize,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8005".into(),
      base_path: String::new(),
      version: None,
      static_assets: Vec::new(),
      source: SourceKind::default(),
      freshness_initial_secs: 3,
      freshness_interval_secs: 20 * 60,
      media_concurrency: 6,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub request_timeout_secs: u64,
  pub upload_initial_secs: u64,
  pub upload_interval_secs: u64,
  /// Agent of the caller formsync acts for, appended to its own user agent
  pub user_agent: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      request_timeout_secs: 60,
      upload_initial_secs: 10,
      upload_interval_secs: 5 * 60,
      user_agent: None,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatabaseConfig {
  /// Database file (default: $XDG_DATA_HOME/formsync/formsync.db)
  pub path: Option<PathBuf>,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./formsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/formsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/formsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("formsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("formsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  pub fn server(&self, url: &str) -> Option<&ServerConfig> {
    let url = url.trim_end_matches('/');
    self
      .servers
      .iter()
      .find(|s| s.url.trim_end_matches('/') == url)
  }

  pub fn survey(&self, survey_id: &str) -> Result<&SurveyConfig> {
    self
      .surveys
      .iter()
      .find(|s| s.id == survey_id)
      .ok_or_else(|| eyre!("Survey {} is not configured", survey_id))
  }

  /// Credentials for a server, with secrets taken from the environment.
  pub fn credentials_for(&self, server_url: &str) -> Result<Credentials> {
    let Some(server) = self.server(server_url) else {
      return Ok(Credentials::Anonymous);
    };
    let password = |username: &str| -> Result<Credentials> {
      Ok(Credentials::Password {
        username: username.to_string(),
        password: Self::get_password()?,
      })
    };

    match (server.auth_type, server.username.as_deref()) {
      (AuthType::None, _) => Ok(Credentials::Anonymous),
      (AuthType::Token, _) => Ok(Credentials::Bearer(Self::get_token()?)),
      (AuthType::Password, Some(username)) => password(username),
      (AuthType::Password, None) => Err(eyre!(
        "Server {} uses password auth but has no username",
        server.url
      )),
      (AuthType::Auto, Some(username)) => password(username),
      (AuthType::Auto, None) => Ok(
        Self::get_token()
          .map(Credentials::Bearer)
          .unwrap_or(Credentials::Anonymous),
      ),
    }
  }

  pub fn descriptor(&self, survey_id: &str) -> Result<FormDescriptor> {
    let survey = self.survey(survey_id)?;
    Ok(
      FormDescriptor::new(&survey.id, &survey.server, &survey.form_id)
        .with_credentials(self.credentials_for(&survey.server)?),
    )
  }

  pub fn server_profiles(&self) -> ServerProfiles {
    let mut profiles = ServerProfiles::new();
    for server in &self.servers {
      profiles.insert(
        &server.url,
        ServerProfile {
          legacy_auth_probe: server.legacy_auth_probe,
          custom_param: server.custom_param.clone(),
        },
      );
    }
    profiles
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.sync.request_timeout_secs)
  }

  pub fn client_settings(&self) -> ClientSettings {
    ClientSettings {
      timeout: self.request_timeout(),
      original_agent: self.sync.user_agent.clone(),
      profiles: self.server_profiles(),
      ..ClientSettings::default()
    }
  }

  pub fn routes(&self) -> Result<ResourceRoutes> {
    ResourceRoutes::new(&self.cache.origin, &self.cache.base_path)
      .map_err(|e| eyre!("Invalid cache origin {}: {}", self.cache.origin, e))
  }

  pub fn cache_version(&self) -> String {
    self
      .cache
      .version
      .clone()
      .unwrap_or_else(|| format!("v{}", env!("CARGO_PKG_VERSION")))
  }

  pub fn form_cache_settings(&self) -> FormCacheSettings {
    FormCacheSettings {
      initial_delay: Duration::from_secs(self.cache.freshness_initial_secs),
      interval: Duration::from_secs(self.cache.freshness_interval_secs),
      media_concurrency: self.cache.media_concurrency,
    }
  }

  /// Get the bearer token from environment variables.
  ///
  /// Checks FORMSYNC_TOKEN.
  pub fn get_token() -> Result<String> {
    std::env::var("FORMSYNC_TOKEN")
      .map_err(|_| eyre!("Token not found. Set FORMSYNC_TOKEN environment variable."))
  }

  /// Get the server password from environment variables.
  ///
  /// Checks FORMSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("FORMSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set FORMSYNC_PASSWORD environment variable."))
  }
}
