use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use naragaiden_core::{format_updated_label, peek_generated_at};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Longest wait for the next chunk of the response once connected.
pub const READ_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Transport(String),
}

/// A successful response: the raw body and the label derived from its `generatedAt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResult {
    pub body: String,
    pub generated_at_ms: i64,
    pub updated_label: String,
}

impl FetchResult {
    pub fn from_body(body: String) -> Self {
        let generated_at_ms = peek_generated_at(&body);
        Self {
            updated_label: format_updated_label(generated_at_ms),
            generated_at_ms,
            body,
        }
    }
}

pub trait Fetcher: Send + Sync {
    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult, FetchError>>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    url: Url,
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(server_url: &str) -> Result<Self, FetchError> {
        Self::with_timeouts(server_url, CONNECT_TIMEOUT, READ_TIMEOUT)
    }

    pub fn with_timeouts(
        server_url: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let url = Url::parse(server_url).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .build()
            .map_err(|err| FetchError::Transport(error_chain(&err)))?;

        Ok(Self {
            client,
            url,
            read_timeout,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn fetch_once(&self) -> Result<FetchResult, FetchError> {
        let started = Instant::now();
        debug!(server_url = %self.url, "fetching payload");

        let response = self
            .client
            .get(self.url.clone())
            .header(ACCEPT, "application/json")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await.map_err(|err| self.classify(err))?;
        let result = FetchResult::from_body(body);
        info!(
            server_url = %self.url,
            bytes = result.body.len(),
            generated_at_ms = result.generated_at_ms,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "payload fetched"
        );
        Ok(result)
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.read_timeout)
        } else {
            FetchError::Transport(error_chain(&err))
        }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult, FetchError>> {
        Box::pin(self.fetch_once())
    }
}

/// `err` followed by each of its sources, so "error sending request" carries the cause.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
