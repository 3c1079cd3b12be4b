//! Crate-level error type aggregating the per-module error kinds.

use thiserror::Error;

use crate::cache::CacheError;
use crate::expand::ExpandError;
use crate::fetch::FetchError;
use crate::index::IndexError;
use crate::install::InstallError;
use crate::resolver::ResolveError;
use crate::sign::SignError;
use crate::version::ParseError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Sign(#[from] SignError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error is a resolver diagnostic (unsatisfiable atom,
    /// conflict, pin violation) rather than an environment failure.
    pub fn is_resolution_failure(&self) -> bool {
        matches!(self, Error::Resolve(_))
    }
}
