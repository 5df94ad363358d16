//! Inbound attachment storage.
//!
//! Attachment URLs on Meta's CDN expire quickly, so media is fetched at
//! dispatch time and persisted locally before the pipeline sees the event.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::config::MediaConfig;

pub struct MediaStore {
    dir: PathBuf,
    max_bytes: u64,
    client: reqwest::Client,
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or("").trim() {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        _ => "bin",
    }
}

impl MediaStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            client: reqwest::Client::new(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        let dir = PathBuf::from(shellexpand::tilde(&config.dir).into_owned());
        Self::new(dir, config.max_bytes)
    }

    /// Download `url` into the media directory and return the stored path.
    /// Downloads larger than the configured cap are aborted.
    pub async fn fetch(&self, url: &str) -> Result<PathBuf> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("media request failed for {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("media request for {url} returned {}", response.status());
        }

        if let Some(declared) = response.content_length() {
            if declared > self.max_bytes {
                anyhow::bail!(
                    "media at {url} declares {declared} bytes, exceeds cap of {}",
                    self.max_bytes
                );
            }
        }

        let extension = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(extension_for)
            .unwrap_or("bin");

        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create media dir {}", self.dir.display()))?;

        let path = self.dir.join(format!("{}.{extension}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;

        // The Content-Length header is advisory; enforce the cap on the
        // actual stream too.
        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("media download failed for {url}"))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(&path).await;
                anyhow::bail!(
                    "media at {url} exceeded cap of {} bytes",
                    self.max_bytes
                );
            }
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        file.flush().await?;
        tracing::debug!(path = %path.display(), bytes = written, "stored inbound media");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn extension_mapping() {
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("image/png; charset=binary"), "png");
        assert_eq!(extension_for("application/octet-stream"), "bin");
    }

    #[tokio::test]
    async fn fetch_stores_file_with_content_type_extension() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Content-Type", "image/jpeg")
                    .set_body_bytes(vec![0xFF, 0xD8, 0xFF]),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), 1024);
        let stored = store.fetch(&format!("{}/img", server.uri())).await.unwrap();

        assert_eq!(stored.extension().and_then(|e| e.to_str()), Some("jpg"));
        assert_eq!(std::fs::read(&stored).unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }

    #[tokio::test]
    async fn fetch_rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), 16);
        let err = store
            .fetch(&format!("{}/big", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceed"), "{err}");

        // The partial file was cleaned up.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn fetch_rejects_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), 1024);
        assert!(store
            .fetch(&format!("{}/gone", server.uri()))
            .await
            .is_err());
    }
}
