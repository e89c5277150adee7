//! Fetching tool artifacts over HTTP.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Progress callback: (bytes so far, total if announced).
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Seam between the updater and the network.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    /// A body shorter than the announced length is an error.
    async fn fetch(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<u64>;

    /// Fetch a small JSON document (update manifest).
    async fn fetch_manifest(&self, url: &str) -> Result<UpdateManifest>;
}

/// Update manifest entry for a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifestEntry {
    pub tool: String,
    pub version: String,
    pub download_url: String,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

/// Update manifest containing latest tool versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub manifest_version: u32,
    #[serde(default)]
    pub updated_at: Option<String>,
    pub tools: Vec<ToolManifestEntry>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// `timeout` bounds each whole request, body included.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("vod-downloader/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<u64> {
        log::info!("Downloading {} to {}", url, dest.display());

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()?;
        let total = response.content_length();

        let mut file = fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;

        let mut written: u64 = 0;
        let mut last_reported: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("read body of {url}"))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            // Report roughly every 4 MiB.
            if written - last_reported >= 4 * 1024 * 1024 {
                last_reported = written;
                progress(written, total);
            }
        }
        file.flush().await?;
        progress(written, total);

        if let Some(total) = total {
            if written < total {
                return Err(anyhow!(
                    "incomplete download from {url}: {written} of {total} bytes"
                ));
            }
        }

        Ok(written)
    }

    async fn fetch_manifest(&self, url: &str) -> Result<UpdateManifest> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let manifest: UpdateManifest = response
            .json()
            .await
            .with_context(|| format!("parse update manifest from {url}"))?;
        Ok(manifest)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    use super::*;

    /// Serves canned bodies by URL; any other URL fails like a dead mirror.
    #[derive(Default)]
    pub struct MemoryFetcher {
        pub bodies: HashMap<String, Vec<u8>>,
        pub manifest: Option<UpdateManifest>,
        pub requests: Mutex<Vec<String>>,
    }

    impl MemoryFetcher {
        pub fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
            self.bodies.insert(url.to_string(), body.into());
            self
        }
    }

    #[async_trait]
    impl ArtifactFetcher for MemoryFetcher {
        async fn fetch(&self, url: &str, dest: &Path, progress: ProgressFn<'_>) -> Result<u64> {
            self.requests.lock().unwrap().push(url.to_string());
            let body = self
                .bodies
                .get(url)
                .ok_or_else(|| anyhow!("connection refused: {url}"))?;
            fs::write(dest, body).await?;
            progress(body.len() as u64, Some(body.len() as u64));
            Ok(body.len() as u64)
        }

        async fn fetch_manifest(&self, url: &str) -> Result<UpdateManifest> {
            self.manifest
                .clone()
                .ok_or_else(|| anyhow!("no manifest at {url}"))
        }
    }

    /// What the local server sends back for a path.
    pub enum Reply {
        Body(Vec<u8>),
        /// Announces `announced` bytes, sends `body`, then hangs up.
        Truncated { announced: usize, body: Vec<u8> },
        /// Sends headers and a few bytes, then goes silent.
        Stall,
    }

    /// Bare HTTP/1.1 server on 127.0.0.1. `route` gets the base URL and the
    /// request path. Returns the base URL.
    pub async fn serve<F>(route: F) -> String
    where
        F: Fn(&str, &str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let route = Arc::new(route);
        let server_base = base.clone();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let route = route.clone();
                let base = server_base.clone();
                tokio::spawn(async move {
                    let path = request_path(&mut socket).await;
                    let (announced, body, stall) = match (*route)(&base, &path) {
                        Reply::Body(body) => (body.len(), body, false),
                        Reply::Truncated { announced, body } => (announced, body, false),
                        Reply::Stall => (1024, b"partial".to_vec(), true),
                    };
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {announced}\r\nConnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.flush().await;
                    if stall {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        base
    }

    async fn request_path(socket: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&head)
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string()
    }
}
