//! Backend trait and the drivers implementing it.
//!
//! A backend offers a small set of operations over **flat backend names**:
//! the store has already applied namespace nesting and the `.del` suffix
//! before a name reaches a backend. Backends signal failure via the
//! canonical [`Error`](crate::Error) kinds only.

pub mod posixfs;
pub mod rclone;
pub mod s3;
pub mod sftp;

use bytes::Bytes;

use crate::constants::MAX_NAME_LENGTH;
use crate::error::{Error, Result};

/// Information about one backend item (object or directory).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    /// Leaf name of the item (no path components).
    pub name: String,
    /// Whether the item exists at all.
    pub exists: bool,
    /// Size in bytes; 0 for directories and missing items.
    pub size: u64,
    /// Whether the item is a directory/container.
    pub directory: bool,
}

impl ItemInfo {
    /// Info for a missing item.
    pub(crate) fn missing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exists: false,
            size: 0,
            directory: false,
        }
    }
}

/// Validates a backend name.
///
/// Names are relative `/`-separated paths: `foo` or `foo/bar/baz`, never
/// `/foo` or `../foo`. They must be plain lowercase ASCII without
/// backslashes or whitespace: lowercase so a key `config` can never
/// address a different item than `CONFIG` on a case-insensitive backend.
pub fn validate_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAME_LENGTH {
        return Err(Error::InvalidKey(format!(
            "name is too long (max: {MAX_NAME_LENGTH}): {name}"
        )));
    }
    if !name.is_ascii() {
        return Err(Error::InvalidKey(format!(
            "name must be plain ascii: {name}"
        )));
    }
    if name.starts_with('/') || name.ends_with('/') || name.split('/').any(|p| p == "..") {
        return Err(Error::InvalidKey(format!(
            "name must be relative and not contain '..': {name}"
        )));
    }
    if name.contains('\\') || name.contains(char::is_whitespace) {
        return Err(Error::InvalidKey(format!(
            "name must not contain backslashes or whitespace: {name}"
        )));
    }
    if name.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(Error::InvalidKey(format!(
            "name must be lowercase: {name}"
        )));
    }
    Ok(())
}

/// Minimal flat-name object operations every storage driver implements.
///
/// A backend value has the lifecycle `unopened -> open -> closed`:
/// `create`/`destroy` operate on a closed backend, everything else
/// requires [`open`](Backend::open) first. All calls are synchronous and
/// blocking; there is no event loop and no background thread.
pub trait Backend: Send {
    /// Initializes the backend storage.
    ///
    /// Fails with [`Error::BackendAlreadyExists`] if the target exists and
    /// is non-empty; an empty existing location is acceptable.
    fn create(&mut self) -> Result<()>;

    /// Completely removes the backend storage and its contents.
    fn destroy(&mut self) -> Result<()>;

    /// Starts using the backend storage: acquires connections, sessions,
    /// subprocesses.
    fn open(&mut self) -> Result<()>;

    /// Stops using the backend storage and releases its resources.
    ///
    /// Closing an already closed backend is a no-op.
    fn close(&mut self) -> Result<()>;

    /// Ensures the directory/namespace `name` exists (parents included).
    fn mkdir(&self, name: &str) -> Result<()>;

    /// Removes the directory/namespace `name`; succeeds only when empty.
    fn rmdir(&self, name: &str) -> Result<()>;

    /// Cheap metadata probe for `name`.
    ///
    /// A missing item is reported via [`ItemInfo::exists`], not an error.
    fn info(&self, name: &str) -> Result<ItemInfo>;

    /// Loads the value stored at `name`, or the part of it selected by
    /// `offset`/`size`.
    ///
    /// Reading beyond EOF returns fewer bytes without error.
    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes>;

    /// Atomically stores `value` at `name`, overwriting an existing object.
    ///
    /// Concurrent stores to the same name are not serialized; the last
    /// writer wins.
    fn store(&self, name: &str, value: &[u8]) -> Result<()>;

    /// Hard-removes the object at `name`.
    fn delete(&self, name: &str) -> Result<()>;

    /// Renames `src` to `dst` within the backend.
    ///
    /// Fails with [`Error::ObjectNotFound`] if `src` is missing and with
    /// [`Error::ObjectAlreadyExists`] if `dst` exists: backends never
    /// overwrite on rename.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Non-recursive listing of the direct children of `name`, sorted by
    /// name.
    ///
    /// Items with the [`TMP_SUFFIX`](crate::constants::TMP_SUFFIX) are not
    /// listed: they are unfinished or aborted uploads.
    fn list(&self, name: &str) -> Result<Vec<ItemInfo>>;

    /// Whether the store should pre-create all sharding directories at
    /// [`create`](Backend::create) time.
    ///
    /// For some backends this speeds up `store`/`rename` considerably
    /// because they never have to handle ad-hoc directory creation; for
    /// others `mkdir` is a no-op and pre-creation is pointless.
    fn precreate_dirs(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["", "foo", "foo/bar/baz", "data/12/34/12345678.del"] {
            assert!(validate_name(name).is_ok(), "{name:?} should be valid");
        }
    }

    #[test]
    fn invalid_names() {
        for name in [
            "/etc/passwd",
            "../etc/passwd",
            "foo/../etc/passwd",
            "foo/",
            "foo\\bar",
            "has space",
            "has\ttab",
            "CONFIG",
            "über",
        ] {
            assert!(
                matches!(validate_name(name), Err(Error::InvalidKey(_))),
                "{name:?} should be invalid"
            );
        }
    }

    #[test]
    fn overlong_name() {
        let name = "x".repeat(MAX_NAME_LENGTH + 1);
        assert!(validate_name(&name).is_err());
    }
}
