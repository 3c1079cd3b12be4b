//! HTTP fetch contract.
//!
//! The engine only needs synchronous GET and HEAD with basic auth carried
//! in the URL, so the transport is a small trait; [`HttpClient`] is the
//! reqwest-backed implementation and the cache transport wraps any
//! [`Fetcher`] transparently. Tests plug in directory-backed fakes.

use std::io::{self, Read};
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported URL scheme {0:?}")]
    UnsupportedScheme(String),
}

/// A fetched response: status, the headers the engine cares about, and the
/// body as a plain reader.
pub struct HttpResponse {
    pub status: u16,
    pub etag: Option<String>,
    pub content_length: Option<u64>,
    pub body: Box<dyn Read + Send>,
}

impl HttpResponse {
    /// An in-memory 200 response, used when serving from cache.
    pub fn ok(body: impl Read + Send + 'static, content_length: Option<u64>) -> Self {
        Self {
            status: 200,
            etag: None,
            content_length,
            body: Box::new(body),
        }
    }

    /// The etag with surrounding quotes stripped, if one was sent and is
    /// non-empty.
    pub fn clean_etag(&self) -> Option<&str> {
        let etag = self.etag.as_deref()?.trim_matches('"');
        (!etag.is_empty()).then_some(etag)
    }
}

/// Synchronous transport: `get` and `head` against a URL.
pub trait Fetcher: Send + Sync {
    fn get(&self, url: &Url) -> Result<HttpResponse, FetchError>;
    fn head(&self, url: &Url) -> Result<HttpResponse, FetchError>;
}

/// reqwest-backed [`Fetcher`].
pub struct HttpClient {
    client: reqwest::blocking::Client,
}

impl HttpClient {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn request(
        &self,
        method: reqwest::Method,
        url: &Url,
    ) -> Result<HttpResponse, FetchError> {
        // Credentials ride in the URL; strip them before sending.
        let mut clean = url.clone();
        let auth = if url.username().is_empty() {
            None
        } else {
            let user = url.username().to_string();
            let pass = url.password().map(str::to_string);
            clean.set_username("").ok();
            clean.set_password(None).ok();
            Some((user, pass))
        };

        let mut req = self.client.request(method, clean);
        if let Some((user, pass)) = auth {
            req = req.basic_auth(user, pass);
        }
        let resp = req.send()?;

        let status = resp.status().as_u16();
        let etag = resp
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let content_length = resp.content_length();
        Ok(HttpResponse {
            status,
            etag,
            content_length,
            body: Box::new(resp),
        })
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetcher for HttpClient {
    fn get(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        self.request(reqwest::Method::GET, url)
    }

    fn head(&self, url: &Url) -> Result<HttpResponse, FetchError> {
        self.request(reqwest::Method::HEAD, url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_clean_etag() {
        let with = |etag: Option<&str>| HttpResponse {
            status: 200,
            etag: etag.map(str::to_string),
            content_length: None,
            body: Box::new(Cursor::new(Vec::new())),
        };
        assert_eq!(with(Some("\"abc123\"")).clean_etag(), Some("abc123"));
        assert_eq!(with(Some("abc123")).clean_etag(), Some("abc123"));
        assert_eq!(with(Some("\"\"")).clean_etag(), None);
        assert_eq!(with(None).clean_etag(), None);
    }
}
