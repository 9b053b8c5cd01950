use std::io::Read;
use std::time::Duration;

use log::debug;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT_LANGUAGE, USER_AGENT};
use thiserror::Error;
use url::Url;

/// Network failure, timeout and non-success status all land here; the batch
/// treats them the same way.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Request to {url} failed: {source}")]
    Network {
        url: String,
        source: reqwest::Error,
    },

    #[error("Invalid user agent {0:?}")]
    UserAgent(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(reqwest::Error),
}

impl FetchError {
    fn from_reqwest(url: &Url, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Network {
                url: url.to_string(),
                source: e,
            }
        }
    }
}

/// Retrieves source pages and media bodies. No retries happen here.
pub trait Fetch: Sync {
    fn fetch_page(&self, url: &Url) -> Result<String, FetchError>;

    fn fetch_binary(&self, url: &Url) -> Result<Box<dyn Read + Send>, FetchError>;
}

pub struct HttpFetcher {
    client: Client,
    page_timeout: Duration,
    binary_timeout: Duration,
}

impl HttpFetcher {
    pub fn new(
        user_agent: &str,
        page_timeout: Duration,
        binary_timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ko-KR,ko;q=0.9,en;q=0.8"));
        let ua = HeaderValue::from_str(user_agent)
            .map_err(|_| FetchError::UserAgent(user_agent.to_string()))?;
        headers.insert(USER_AGENT, ua);

        // Per-request timeouts below override this one.
        let client = Client::builder()
            .default_headers(headers)
            .timeout(binary_timeout.max(page_timeout))
            .build()
            .map_err(FetchError::Client)?;

        Ok(HttpFetcher {
            client,
            page_timeout,
            binary_timeout,
        })
    }

    fn get(&self, url: &Url, timeout: Duration) -> Result<reqwest::blocking::Response, FetchError> {
        debug!("GET {} (timeout {}s)", url, timeout.as_secs());
        let resp = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .map_err(|e| FetchError::from_reqwest(url, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp)
    }
}

impl Fetch for HttpFetcher {
    fn fetch_page(&self, url: &Url) -> Result<String, FetchError> {
        self.get(url, self.page_timeout)?
            .text()
            .map_err(|e| FetchError::from_reqwest(url, e))
    }

    fn fetch_binary(&self, url: &Url) -> Result<Box<dyn Read + Send>, FetchError> {
        let resp = self.get(url, self.binary_timeout)?;
        Ok(Box::new(resp))
    }
}
