use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, trace};
use url::Url;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("Request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Download of {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("Download of {0} timed out")]
    Timeout(String),
    #[error("Failed to read local file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported locator scheme: {0}")]
    UnsupportedScheme(String),
}

/// Retrieves raw payload bytes for a source locator.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError>;
}

const USER_AGENT: &str = concat!("modeldepot/", env!("CARGO_PKG_VERSION"));

/// Fetches `http(s)://` locators with reqwest and `file://` locators from local disk.
#[derive(Debug)]
pub struct HttpFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        Self::with_user_agent(timeout, USER_AGENT)
    }

    fn with_user_agent(timeout: Duration, user_agent: &str) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self { client, timeout })
    }

    async fn fetch_remote(&self, url: &Url) -> Result<Bytes, FetchError> {
        let request_error = |source: reqwest::Error| {
            if source.is_timeout() {
                FetchError::Timeout(url.to_string())
            } else {
                FetchError::Request {
                    url: url.to_string(),
                    source,
                }
            }
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(request_error)?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        // Content-Length is whatever the server claims; grow with what actually arrives.
        let mut body = BytesMut::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.map_err(request_error)?);
            trace!("Received {} bytes from {}", body.len(), url);
        }

        Ok(body.freeze())
    }

    async fn fetch_local(&self, url: &Url) -> Result<Bytes, FetchError> {
        let path = url
            .to_file_path()
            .map_err(|_| FetchError::UnsupportedScheme(url.to_string()))?;

        let read = tokio::fs::read(&path);
        match tokio::time::timeout(self.timeout, read).await {
            Ok(Ok(content)) => Ok(Bytes::from(content)),
            Ok(Err(source)) => Err(FetchError::Io {
                path: path.display().to_string(),
                source,
            }),
            Err(_) => Err(FetchError::Timeout(url.to_string())),
        }
    }
}

#[async_trait]
impl PackageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        debug!("Fetching {}", url);
        match url.scheme() {
            "http" | "https" => self.fetch_remote(url).await,
            "file" => self.fetch_local(url).await,
            other => Err(FetchError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn one_shot_server(resp: &'static [u8], delay: Duration) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(delay).await;
            let _ = socket.write_all(resp).await;
        });
        Url::parse(&format!("http://{}/model.onnx", addr)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_local_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"onnx-bytes").unwrap();
        let url = Url::from_file_path(file.path()).unwrap();

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let content = fetcher.fetch(&url).await.unwrap();
        assert_eq!(&content[..], b"onnx-bytes");
    }

    #[tokio::test]
    async fn test_missing_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = Url::from_file_path(dir.path().join("absent.onnx")).unwrap();

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let result = fetcher.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Io { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_scheme() {
        let url = Url::parse("ftp://example.com/model.onnx").unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let result = fetcher.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[tokio::test]
    async fn test_truncated_body_with_huge_content_length() {
        let url = one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 4611686018427387904\r\n\r\nabc",
            Duration::ZERO,
        )
        .await;

        let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
        let result = fetcher.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Request { .. })), "{:?}", result);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let url = one_shot_server(b"", Duration::from_secs(5)).await;

        let fetcher = HttpFetcher::new(Duration::from_secs(1)).unwrap();
        let result = fetcher.fetch(&url).await;
        assert!(matches!(result, Err(FetchError::Timeout(u)) if u == url.to_string()));
    }

    #[test]
    fn test_client_build_failure() {
        let err = HttpFetcher::with_user_agent(Duration::from_secs(5), "bad\nagent").unwrap_err();
        assert!(matches!(err, FetchError::Client(_)));
        assert!(err.to_string().starts_with("Failed to build HTTP client"));
    }
}
