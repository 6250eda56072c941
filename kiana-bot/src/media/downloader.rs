use std::{
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use reqwest::{Client, header::HeaderMap};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

const PARTIAL_SUFFIX: &str = "part";

static NEXT_PARTIAL: AtomicU64 = AtomicU64::new(0);

/// Downloads remote media into a cache directory.
#[derive(Clone)]
pub struct MediaDownloader {
    client: Client,
    base_dir: PathBuf,
    max_bytes: u64,
}

impl MediaDownloader {
    pub fn new(client: Client, base_dir: PathBuf, max_bytes: u64) -> Self {
        Self {
            client,
            base_dir,
            max_bytes,
        }
    }

    /// A scratch path no other download uses.
    fn partial_path(&self, name: &str) -> PathBuf {
        let n = NEXT_PARTIAL.fetch_add(1, Ordering::Relaxed);
        self.base_dir
            .join(format!("{name}.{}-{n}.{PARTIAL_SUFFIX}", process::id()))
    }

    /// Streams `url` into memory and into `base_dir/<filename>`, returning
    /// the body. The file is written under a private name and renamed into
    /// place once complete. Aborts once the body grows past the size limit.
    pub async fn fetch_bytes(&self, url: &str, headers: HeaderMap, filename: &str) -> Result<Vec<u8>> {
        fs::create_dir_all(&self.base_dir)
            .await
            .context("Failed to create download directory")?;

        let name = sanitize_filename(filename);
        let path = self.base_dir.join(&name);
        let partial = self.partial_path(&name);
        debug!("Downloading {url} to {path:?}");

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .context("HTTP request failed")?
            .error_for_status()
            .context("HTTP error response")?;

        if let Some(length) = response.content_length() {
            if length > self.max_bytes {
                bail!("{url} is {length} bytes, over the {} byte limit", self.max_bytes);
            }
        }

        let mut file = fs::File::create(&partial)
            .await
            .context("Failed to create file")?;
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(&partial).await;
                    return Err(e).context("Failed to read response chunk");
                }
            };
            if (body.len() + chunk.len()) as u64 > self.max_bytes {
                drop(file);
                let _ = fs::remove_file(&partial).await;
                bail!("{url} exceeded the {} byte limit", self.max_bytes);
            }
            body.extend_from_slice(&chunk);
            file.write_all(&chunk)
                .await
                .context("Failed to write to file")?;
        }
        file.flush().await.context("Failed to flush file")?;
        drop(file);

        if let Err(e) = fs::rename(&partial, &path).await {
            warn!("Could not move {partial:?} into the cache: {e}");
            let _ = fs::remove_file(&partial).await;
        }

        info!("Downloaded {url} ({} bytes) to {path:?}", body.len());
        Ok(body)
    }
}

/// Keeps names to a single path component.
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "download".to_owned()
    } else {
        cleaned.to_owned()
    }
}

/// Removes every regular file directly inside `dir`; returns how many went.
pub async fn clean_dir(dir: &Path) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to list {dir:?}")),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            fs::remove_file(entry.path())
                .await
                .with_context(|| format!("Failed to remove {:?}", entry.path()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;

    use super::*;

    fn downloader(dir: &Path, max_bytes: u64) -> MediaDownloader {
        MediaDownloader::new(Client::new(), dir.to_owned(), max_bytes)
    }

    async fn file_names(dir: &Path) -> Vec<String> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        names
    }

    #[tokio::test]
    async fn concurrent_downloads_of_one_video_each_get_the_whole_body() {
        let server = MockServer::start_async().await;
        let video = "0123456789".repeat(4096);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/video.mp4");
                then.status(200).body(video.as_str());
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let media = downloader(dir.path(), 1024 * 1024);
        let url = server.url("/video.mp4");

        let (a, b) = tokio::join!(
            media.fetch_bytes(&url, HeaderMap::new(), "BV1xx411c7mD.mp4"),
            media.fetch_bytes(&url, HeaderMap::new(), "BV1xx411c7mD.mp4"),
        );
        assert_eq!(a.unwrap(), video.as_bytes());
        assert_eq!(b.unwrap(), video.as_bytes());

        assert_eq!(file_names(dir.path()).await, vec!["BV1xx411c7mD.mp4"]);
        let cached = fs::read(dir.path().join("BV1xx411c7mD.mp4")).await.unwrap();
        assert_eq!(cached, video.as_bytes());
    }

    #[tokio::test]
    async fn oversized_bodies_leave_nothing_behind() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/big.mp4");
                then.status(200).body("x".repeat(64));
            })
            .await;

        let dir = tempfile::tempdir().unwrap();
        let result = downloader(dir.path(), 16)
            .fetch_bytes(&server.url("/big.mp4"), HeaderMap::new(), "big.mp4")
            .await;
        assert!(result.is_err());
        assert!(file_names(dir.path()).await.is_empty());
    }

    #[test]
    fn filenames_cannot_escape_the_cache() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename("BV1xx411c7mD.mp4"), "BV1xx411c7mD.mp4");
        assert_eq!(sanitize_filename("..."), "download");
    }

    #[tokio::test]
    async fn clean_dir_removes_only_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join("b.mp4"), b"b").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();

        assert_eq!(clean_dir(dir.path()).await.unwrap(), 2);
        assert!(dir.path().join("keep").is_dir());
        assert_eq!(clean_dir(&dir.path().join("missing")).await.unwrap(), 0);
    }
}
