//! Cover image fetch into the on-disk cache.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use md5::{Digest, Md5};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Classify, ErrorKind};

const ACCEPT_IMAGES: &str = "image/avif,image/webp,image/apng,image/*,*/*;q=0.8";

#[derive(Debug, Error)]
pub enum CoverError {
    #[error("Cancelled")]
    Cancelled,

    #[error("Server answered {0}")]
    Status(reqwest::StatusCode),

    #[error("Not an image: {0}")]
    NotImage(String),

    #[error("Unrecognized image data")]
    Undecodable,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Classify for CoverError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

/// Cache file for a thumbnail locator: `<covers_dir>/<md5-hex>.jpg`.
pub fn cache_path(covers_dir: &Path, locator: &str) -> PathBuf {
    covers_dir.join(format!("{:x}.jpg", Md5::digest(locator.as_bytes())))
}

/// Download `url` into `dest`. The body goes to a unique `.part` file
/// that is renamed on success and removed on any failure, including a
/// cancellation that arrives after the last byte was written.
pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    token: &CancellationToken,
) -> Result<PathBuf, CoverError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let part = dest.with_extension(format!("{:08x}.part", rand::random::<u32>()));

    let result = download(client, url, &part, token).await.and_then(|()| {
        if token.is_cancelled() {
            Err(CoverError::Cancelled)
        } else {
            Ok(())
        }
    });

    match result {
        Ok(()) => {
            if let Err(e) = tokio::fs::rename(&part, dest).await {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e.into());
            }
            tracing::info!("Cached cover {} as {}", url, dest.display());
            Ok(dest.to_path_buf())
        }
        Err(e) => {
            if let Err(remove) = tokio::fs::remove_file(&part).await {
                if remove.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {}: {}", part.display(), remove);
                }
            }
            match &e {
                CoverError::Cancelled => tracing::debug!("Cover fetch {} cancelled", url),
                _ => tracing::warn!("Cover fetch {} failed: {}", url, e),
            }
            Err(e)
        }
    }
}

async fn download(
    client: &reqwest::Client,
    url: &str,
    part: &Path,
    token: &CancellationToken,
) -> Result<(), CoverError> {
    let request = client
        .get(url)
        .header(reqwest::header::ACCEPT, ACCEPT_IMAGES)
        .send();
    let response = tokio::select! {
        biased;
        _ = token.cancelled() => return Err(CoverError::Cancelled),
        response = request => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(CoverError::Status(status));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with("image/") {
        return Err(CoverError::NotImage(content_type));
    }

    let mut file = tokio::fs::File::create(part).await?;
    let mut stream = response.bytes_stream();
    let mut checked = false;
    loop {
        let chunk = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(CoverError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        let chunk = chunk?;
        if !checked && !chunk.is_empty() {
            image::guess_format(&chunk).map_err(|_| CoverError::Undecodable)?;
            checked = true;
        }
        file.write_all(&chunk).await?;
    }
    if !checked {
        return Err(CoverError::Undecodable);
    }
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use super::*;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    /// Serve one HTTP response on a local port and return its URL.
    async fn serve_once(content_type: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let mut read = 0;
            while !request[..read].windows(4).any(|w| w == b"\r\n\r\n".as_slice()) {
                let n = socket.read(&mut request[read..]).await.unwrap();
                if n == 0 {
                    break;
                }
                read += n;
            }
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                content_type,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.flush().await.unwrap();
        });
        format!("http://{addr}/cover")
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .unwrap()
    }

    fn leftovers(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_cache_path_is_md5_of_locator() {
        let path = cache_path(Path::new("/covers"), "abc");
        assert_eq!(
            path,
            Path::new("/covers/900150983cd24fb0d6963f7d28e17f72.jpg")
        );
    }

    #[tokio::test]
    async fn test_image_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("image/png", PNG_MAGIC).await;
        let dest = cache_path(dir.path(), &url);

        let path = fetch(&client(), &url, &dest, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), PNG_MAGIC);
        assert_eq!(leftovers(dir.path()), vec![dest]);
    }

    #[tokio::test]
    async fn test_non_image_content_type_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("text/html", b"<html></html>").await;
        let dest = cache_path(dir.path(), &url);

        let result = fetch(&client(), &url, &dest, &CancellationToken::new()).await;

        assert!(matches!(result, Err(CoverError::NotImage(_))));
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_body_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("image/jpeg", b"this is not a jpeg").await;
        let dest = cache_path(dir.path(), &url);

        let result = fetch(&client(), &url, &dest, &CancellationToken::new()).await;

        assert!(matches!(result, Err(CoverError::Undecodable)));
        assert!(leftovers(dir.path()).is_empty());
    }

    /// Send `body` with no length and keep the connection open, so the
    /// transfer never completes on its own.
    async fn serve_and_hold(body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let _ = socket.read(&mut request).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\n\r\n")
                .await
                .unwrap();
            socket.write_all(body).await.unwrap();
            socket.flush().await.unwrap();
            tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        });
        format!("http://{addr}/cover")
    }

    #[tokio::test]
    async fn test_cancel_after_body_written_removes_part_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_and_hold(PNG_MAGIC).await;
        let dest = cache_path(dir.path(), &url);
        let token = CancellationToken::new();

        let fetching = {
            let (client, url, dest, token) = (client(), url.clone(), dest.clone(), token.clone());
            tokio::spawn(async move { fetch(&client, &url, &dest, &token).await })
        };

        // Wait until the whole body sits in the part file
        let written = async {
            loop {
                let full = leftovers(dir.path()).iter().any(|p| {
                    p.extension().is_some_and(|e| e == "part")
                        && std::fs::metadata(p).is_ok_and(|m| m.len() == PNG_MAGIC.len() as u64)
                });
                if full {
                    return;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), written)
            .await
            .expect("body never reached the part file");

        token.cancel();
        let result = fetching.await.unwrap();

        assert!(matches!(result, Err(CoverError::Cancelled)));
        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let url = serve_once("image/png", PNG_MAGIC).await;
        let dest = cache_path(dir.path(), &url);
        let token = CancellationToken::new();
        token.cancel();

        let result = fetch(&client(), &url, &dest, &token).await;

        assert!(matches!(result, Err(CoverError::Cancelled)));
        assert!(leftovers(dir.path()).is_empty());
    }
}
