//! # BorgStore
//!
//! A namespaced key/value store, the storage primitive of a deduplicating
//! backup tool. Callers write opaque binary values under ASCII keys
//! grouped by namespace; persistence goes through one of several
//! pluggable backends:
//!
//! - local filesystem (`file:///absolute/path`)
//! - SFTP (`sftp://user@host:port/path`, `sftp` cargo feature)
//! - S3-compatible object services (`s3:`/`b2:` URLs, `s3` cargo feature)
//! - anything rclone can reach (`rclone:remote:path`)
//!
//! On top of the narrow file-like [`Backend`] contract, [`Store`] adds
//! hash-sharded directory nesting for scalable flat namespaces, a
//! reversible soft-delete convention (`.del` tombstones), partial reads,
//! a prefix-based permission overlay and per-operation statistics with
//! optional latency/bandwidth emulation.
//!
//! ```no_run
//! use borgstore::{LevelsConfig, Store};
//!
//! # fn main() -> borgstore::Result<()> {
//! let levels = LevelsConfig::new().level("config/", &[0]).level("data/", &[2]);
//! let mut store = Store::new("file:///tmp/storage", levels)?;
//! store.create()?;
//! store.open()?;
//! store.store("config/settings", b"value = 42")?;
//! let value = store.load("config/settings")?;
//! assert_eq!(&value[..], b"value = 42");
//! store.close()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod constants;
pub mod error;
pub mod nesting;
pub mod permissions;
pub mod stats;
pub mod store;
pub mod url;

pub use backend::posixfs::PosixFs;
pub use backend::rclone::Rclone;
#[cfg(feature = "s3")]
pub use backend::s3::S3;
pub use backend::s3::S3Config;
#[cfg(feature = "sftp")]
pub use backend::sftp::Sftp;
pub use backend::sftp::SftpConfig;
pub use backend::{Backend, ItemInfo};
pub use error::{Error, Result};
pub use permissions::{PermissionedBackend, Permissions};
pub use stats::{OpStats, Stats};
pub use store::{LevelsConfig, List, ObjectInfo, Store};
pub use url::backend_from_url;
