use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Tables mirrored in the local store
  #[serde(default = "default_tables")]
  pub tables: Vec<String>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub connectivity: ConnectivityConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the hosted backend, e.g. https://project.supabase.co
  pub url: String,
  /// Object storage bucket for files attached to writes
  #[serde(default = "default_bucket")]
  pub storage_bucket: String,
  #[serde(default = "default_request_timeout")]
  pub request_timeout_secs: u64,
}

impl RemoteConfig {
  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long a remote read is served from memory
  pub ttl_secs: u64,
  /// How often expired entries are purged
  pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      ttl_secs: 30,
      sweep_interval_secs: 300,
    }
  }
}

impl CacheConfig {
  pub fn ttl(&self) -> Duration {
    Duration::from_secs(self.ttl_secs)
  }

  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Independent external endpoints probed with HEAD requests
  pub probe_urls: Vec<String>,
  pub probe_timeout_secs: u64,
  /// Probes never run more often than this, however many callers ask
  pub min_check_interval_secs: u64,
  pub online_poll_secs: u64,
  pub offline_poll_secs: u64,
  /// A view hidden for less than this does not trigger a re-check when shown
  pub hidden_threshold_secs: u64,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_urls: vec![
        "https://www.google.com/generate_204".to_string(),
        "https://cloudflare.com/cdn-cgi/trace".to_string(),
      ],
      probe_timeout_secs: 5,
      min_check_interval_secs: 3,
      online_poll_secs: 30,
      offline_poll_secs: 10,
      hidden_threshold_secs: 5,
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }

  pub fn min_check_interval(&self) -> Duration {
    Duration::from_secs(self.min_check_interval_secs)
  }

  pub fn online_poll(&self) -> Duration {
    Duration::from_secs(self.online_poll_secs.max(1))
  }

  pub fn offline_poll(&self) -> Duration {
    Duration::from_secs(self.offline_poll_secs.max(1))
  }

  pub fn hidden_threshold(&self) -> Duration {
    Duration::from_secs(self.hidden_threshold_secs)
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Upper bound for a single mutation replay
  pub mutation_timeout_secs: Option<u64>,
  /// Regular drains skip mutations that failed this many times
  pub max_attempts: Option<u32>,
  /// Delay before retrying mutations queued while online
  pub retry_interval_secs: Option<u64>,
}

impl SyncConfig {
  pub fn mutation_timeout(&self) -> Duration {
    Duration::from_secs(self.mutation_timeout_secs.unwrap_or(30))
  }

  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.retry_interval_secs.unwrap_or(30))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// SQLite file for the local store (default: $XDG_DATA_HOME/schoolsync/store.db)
  pub path: Option<PathBuf>,
}

fn default_tables() -> Vec<String> {
  [
    "students",
    "workers",
    "meals",
    "schools",
    "roles",
    "profiles",
    "form_schemas",
  ]
  .into_iter()
  .map(String::from)
  .collect()
}

fn default_bucket() -> String {
  "uploads".to_string()
}

fn default_request_timeout() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./schoolsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/schoolsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/schoolsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("schoolsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("schoolsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    url::Url::parse(&self.remote.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", self.remote.url, e))?;
    if self.connectivity.probe_urls.len() < 2 {
      return Err(eyre!(
        "At least two connectivity probe urls are required, got {}",
        self.connectivity.probe_urls.len()
      ));
    }
    Ok(())
  }

  /// Location of the local store file.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => crate::db::default_path(),
    }
  }

  /// Get the API key from environment variables.
  ///
  /// Checks SCHOOLSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("SCHOOLSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("API key not found. Set SCHOOLSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Get the signed-in user's access token, if any.
  pub fn get_access_token() -> Option<String> {
    std::env::var("SCHOOLSYNC_ACCESS_TOKEN")
      .ok()
      .filter(|t| !t.trim().is_empty())
  }
}
