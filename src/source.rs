//! Named input resolution against the `images/` namespace.

use crate::error::RunnerError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

pub const IMAGES_NAMESPACE: &str = "images";

/// Where the bytes of a submission's input come from.
#[derive(Debug, Clone)]
pub enum InputSource {
    /// Resolved through the configured [`ImageSource`] unless already staged.
    Named(String),
    /// Bytes already in memory (an uploaded or locally read file).
    Supplied { name: String, data: Bytes },
}

impl InputSource {
    pub fn name(&self) -> &str {
        match self {
            InputSource::Named(name) | InputSource::Supplied { name, .. } => name,
        }
    }
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Bytes, RunnerError>;
}

/// Fetches `<base_url>/images/<name>` over HTTP.
pub struct HttpImageSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpImageSource {
    pub fn new(base_url: &str, timeout: Duration, user_agent: &str) -> Result<Self, RunnerError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| RunnerError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn url_for(&self, name: &str) -> String {
        format!("{}/{IMAGES_NAMESPACE}/{name}", self.base_url)
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(&self, name: &str) -> Result<Bytes, RunnerError> {
        let url = self.url_for(name);
        tracing::info!(%url, "downloading input");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| RunnerError::Transport(format!("GET {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(RunnerError::Transport(format!(
                "GET {url}: HTTP {}",
                resp.status()
            )));
        }
        resp.bytes()
            .await
            .map_err(|e| RunnerError::Transport(format!("GET {url}: {e}")))
    }
}

/// Reads `<root>/images/<name>` from the local filesystem.
pub struct DirImageSource {
    root: PathBuf,
}

impl DirImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageSource for DirImageSource {
    async fn fetch(&self, name: &str) -> Result<Bytes, RunnerError> {
        let path = self.root.join(IMAGES_NAMESPACE).join(name);
        tracing::info!(path = %path.display(), "reading input");
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| RunnerError::Transport(format!("{}: {e}", path.display())))
    }
}
