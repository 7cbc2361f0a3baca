use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

/// A single reachability check against one external endpoint.
#[async_trait]
pub trait Probe: Send + Sync {
  /// Succeeds only if `target` answered with a 2xx status.
  async fn probe(&self, target: &str) -> Result<(), String>;
}

/// Probe issuing HTTP HEAD requests.
pub struct HttpProbe {
  http: reqwest::Client,
}

impl HttpProbe {
  pub fn new(timeout: Duration) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create probe client: {}", e))?;
    Ok(Self { http })
  }
}

#[async_trait]
impl Probe for HttpProbe {
  async fn probe(&self, target: &str) -> Result<(), String> {
    let response = self
      .http
      .head(target)
      .header("cache-control", "no-cache")
      .send()
      .await
      .map_err(|e| e.to_string())?;

    if response.status().is_success() {
      Ok(())
    } else {
      Err(format!("HTTP {}", response.status()))
    }
  }
}
