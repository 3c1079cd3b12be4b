//! On-disk cache in front of the fetch transport.
//!
//! Cached files are addressed either by URL (packages) or by server etag
//! (indexes). The layout mirrors the URL: the repository part is
//! percent-encoded into a single directory, the architecture directory and
//! basename are kept as-is:
//!
//! ```text
//! <root>/<urlencoded repo>/<arch>/<basename>              URL-addressed
//! <root>/<urlencoded repo>/<arch>/<etag>.etag             etag-addressed
//! <root>/<urlencoded repo>/<arch>/APKINDEX/<etag>.tar.gz  index etags
//! ```
//!
//! Writers stage to a `*.tmp` file in the final directory and publish with
//! an atomic rename, so readers never observe partial files and concurrent
//! fetches of the same URL at worst waste work.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use thiserror::Error;
use url::Url;

use crate::fetch::{FetchError, Fetcher, HttpResponse};
use crate::INDEX_FILENAME;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("cache file {path} is not within root {root}")]
    PathEscape { path: String, root: String },

    #[error("no cached copy of {0} in offline mode")]
    OfflineMiss(String),

    #[error("GET response did not contain an etag, but HEAD returned {0:?}")]
    MissingEtag(String),
}

/// A [`Fetcher`] that serves and populates an on-disk cache.
pub struct CacheTransport {
    wrapped: Arc<dyn Fetcher>,
    root: PathBuf,
    offline: bool,
    etag_required: bool,
}

impl CacheTransport {
    pub fn new(wrapped: Arc<dyn Fetcher>, root: impl Into<PathBuf>) -> Self {
        Self {
            wrapped,
            root: root.into(),
            offline: false,
            etag_required: false,
        }
    }

    /// Key index fetches by server etag instead of URL.
    pub fn etag_required(mut self, yes: bool) -> Self {
        self.etag_required = yes;
        self
    }

    /// Never touch the network; serve only what is already cached.
    pub fn offline(mut self, yes: bool) -> Self {
        self.offline = yes;
        self
    }

    pub fn fetch(&self, url: &Url) -> Result<HttpResponse, CacheError> {
        let cache_file = cache_path_from_url(&self.root, url)?;

        if !self.etag_required {
            return self.fetch_url_addressed(url, &cache_file);
        }
        self.fetch_etag_addressed(url, &cache_file)
    }

    fn fetch_url_addressed(
        &self,
        url: &Url,
        cache_file: &Path,
    ) -> Result<HttpResponse, CacheError> {
        if let Ok(file) = fs::File::open(cache_file) {
            tracing::debug!(url = %url, "cache hit");
            let len = file.metadata().ok().map(|m| m.len());
            return Ok(HttpResponse::ok(file, len));
        }
        if self.offline {
            return Err(CacheError::OfflineMiss(url.to_string()));
        }

        tracing::debug!(url = %url, "cache miss, fetching");
        let resp = self.wrapped.get(url)?;
        if resp.status != 200 {
            return Ok(resp);
        }
        let final_path = cache_file.to_path_buf();
        self.store_and_open(resp, move |_| Ok(final_path))
    }

    fn fetch_etag_addressed(
        &self,
        url: &Url,
        cache_file: &Path,
    ) -> Result<HttpResponse, CacheError> {
        if self.offline {
            return self.serve_newest(url, cache_file);
        }

        let head = self.wrapped.head(url)?;
        if head.status != 200 {
            return Ok(head);
        }
        let Some(initial_etag) = head.clean_etag().map(str::to_string) else {
            // Server without etags: nothing stable to key on, bypass.
            tracing::debug!(url = %url, "no etag from HEAD, bypassing cache");
            return Ok(self.wrapped.get(url)?);
        };

        let etag_file = cache_file_from_etag(cache_file, &initial_etag);
        if let Ok(file) = fs::File::open(&etag_file) {
            tracing::debug!(url = %url, etag = %initial_etag, "cache hit");
            let len = file.metadata().ok().map(|m| m.len());
            return Ok(HttpResponse::ok(file, len));
        }

        let resp = self.wrapped.get(url)?;
        if resp.status != 200 {
            return Ok(resp);
        }
        let base = cache_file.to_path_buf();
        // The GET's etag wins over the HEAD's when they disagree.
        self.store_and_open(resp, move |resp| match resp.clean_etag() {
            Some(etag) => Ok(cache_file_from_etag(&base, etag)),
            None => Err(CacheError::MissingEtag(initial_etag.clone())),
        })
    }

    /// Offline etag mode: serve the newest cached entry by mtime.
    fn serve_newest(&self, url: &Url, cache_file: &Path) -> Result<HttpResponse, CacheError> {
        let dir = etag_dir_for(cache_file);
        let mut newest: Option<(std::time::SystemTime, PathBuf, u64)> = None;
        let entries = fs::read_dir(&dir)
            .map_err(|_| CacheError::OfflineMiss(url.to_string()))?;
        for entry in entries.flatten() {
            let meta = entry.metadata()?;
            if !meta.is_file() {
                continue;
            }
            let mtime = meta.modified()?;
            if newest.as_ref().is_none_or(|(t, _, _)| mtime > *t) {
                newest = Some((mtime, entry.path(), meta.len()));
            }
        }
        let Some((_, path, len)) = newest else {
            return Err(CacheError::OfflineMiss(url.to_string()));
        };
        tracing::debug!(url = %url, path = %path.display(), "serving offline cache");
        Ok(HttpResponse::ok(fs::File::open(path)?, Some(len)))
    }

    /// Stream a 200 response into a same-directory temp file, publish it
    /// under the name `place` computes, and return a handle to the
    /// published file.
    fn store_and_open(
        &self,
        mut resp: HttpResponse,
        place: impl FnOnce(&HttpResponse) -> Result<PathBuf, CacheError>,
    ) -> Result<HttpResponse, CacheError> {
        let final_path = place(&resp)?;
        let dir = final_path.parent().expect("cache file has a parent");
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new().suffix(".tmp").tempfile_in(dir)?;
        io::copy(&mut resp.body, &mut tmp)?;
        tmp.flush()?;
        tmp.persist(&final_path).map_err(|e| e.error)?;

        let file = fs::File::open(&final_path)?;
        let len = file.metadata().ok().map(|m| m.len());
        Ok(HttpResponse {
            status: 200,
            etag: resp.etag,
            content_length: len,
            body: Box::new(file),
        })
    }
}

/// Map a URL onto its cache path. The last two path segments (arch dir and
/// basename) are kept; everything before them, including the host, is
/// percent-encoded into a single directory name.
pub fn cache_path_from_url(root: &Path, url: &Url) -> Result<PathBuf, CacheError> {
    let mut trimmed = url.clone();
    trimmed.set_query(None);
    trimmed.set_fragment(None);

    let path = trimmed.path().trim_end_matches('/');
    let (repo_path, arch, filename) = match path.rsplitn(3, '/').collect::<Vec<_>>()[..] {
        [filename, arch, repo] => (repo.to_string(), arch.to_string(), filename.to_string()),
        [filename, arch] => (String::new(), arch.to_string(), filename.to_string()),
        _ => (String::new(), String::new(), path.to_string()),
    };

    trimmed.set_path(&repo_path);
    let repo_dir = utf8_percent_encode(trimmed.as_str(), NON_ALPHANUMERIC).to_string();

    let cache_file = root.join(&repo_dir).join(&arch).join(&filename);
    for part in [&arch, &filename] {
        if part == ".." || part.contains('\\') {
            return Err(CacheError::PathEscape {
                path: cache_file.display().to_string(),
                root: root.display().to_string(),
            });
        }
    }
    if !cache_file.starts_with(root) {
        return Err(CacheError::PathEscape {
            path: cache_file.display().to_string(),
            root: root.display().to_string(),
        });
    }
    Ok(cache_file)
}

/// Directory scanned for etag-addressed entries of `cache_file`.
fn etag_dir_for(cache_file: &Path) -> PathBuf {
    let dir = cache_file.parent().unwrap_or(Path::new("."));
    if cache_file
        .file_name()
        .is_some_and(|n| n == INDEX_FILENAME)
    {
        return dir.join("APKINDEX");
    }
    dir.to_path_buf()
}

/// Final path of an etag-addressed entry. Index files live together under
/// `APKINDEX/` with their natural extension; everything else gets `.etag`.
fn cache_file_from_etag(cache_file: &Path, etag: &str) -> PathBuf {
    let is_index = cache_file
        .file_name()
        .is_some_and(|n| n == INDEX_FILENAME);
    if is_index {
        etag_dir_for(cache_file).join(format!("{etag}.tar.gz"))
    } else {
        etag_dir_for(cache_file).join(format!("{etag}.etag"))
    }
}
