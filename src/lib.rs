//! alpk - Alpine package engine
//!
//! A library for fetching, inspecting, verifying and installing Alpine-style
//! `.apk` packages into a target root filesystem. The crate covers the whole
//! pipeline: repository index loading with signature verification, an
//! on-disk content cache, dependency resolution over provides/pins, and
//! payload application with conflict detection.
//!
//! Front-ends assemble an [`engine::Apk`] from an [`engine::ApkConfig`] and
//! drive it; everything below the facade is usable on its own.

pub mod cache;
pub mod db;
pub mod engine;
pub mod error;
pub mod expand;
pub mod fetch;
pub mod fs;
pub mod index;
pub mod install;
pub mod resolver;
pub mod sign;
pub mod tarfs;
pub mod version;

pub use engine::{Apk, ApkConfig, CancelToken};
pub use error::Error;
pub use index::{NamedIndex, Package};
pub use version::{Atom, Constraint, Version};

/// User agent sent on outbound HTTP requests.
pub const USER_AGENT: &str = concat!("alpk/", env!("CARGO_PKG_VERSION"));

/// Location of the installed-package database under the target root.
pub const INSTALLED_DB_PATH: &str = "lib/apk/db/installed";

/// Location of the recorded install scripts under the target root.
pub const SCRIPTS_TAR_PATH: &str = "lib/apk/db/scripts.tar";

/// Location of the trigger records under the target root.
pub const TRIGGERS_PATH: &str = "lib/apk/db/triggers";

/// Location of the world file under the target root.
pub const WORLD_PATH: &str = "etc/apk/world";

/// Basename of the repository index archive.
pub const INDEX_FILENAME: &str = "APKINDEX.tar.gz";

/// Architecture constants
pub mod arch {
    /// 64-bit ARM (aarch64)
    pub const AARCH64: &str = "aarch64";
    /// 64-bit x86
    pub const X86_64: &str = "x86_64";

    /// Get the current architecture string
    pub fn current() -> &'static str {
        if cfg!(target_arch = "aarch64") {
            AARCH64
        } else {
            X86_64
        }
    }
}
