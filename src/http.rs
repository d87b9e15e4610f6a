//! Blocking HTTP GET seam shared by the sensor source and the region reference loader.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("HTTP client build error: {0}")]
    ClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    Request { url: String, message: String },
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, HttpError>;
}

// Must be constructed and dropped outside of an async runtime.
pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, HttpError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| HttpError::ClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, HttpError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| HttpError::Request {
                url: redact_url(url),
                message: err.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Request {
                url: redact_url(url),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| HttpError::Request {
                url: redact_url(url),
                message: err.without_url().to_string(),
            })
    }
}

/// Drops the query string so API keys never reach logs or error messages.
pub fn redact_url(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
