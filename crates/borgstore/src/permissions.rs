//! Prefix-based access control, evaluated before each backend call.
//!
//! A [`Permissions`] map grants permission letters to name prefixes; a
//! [`PermissionedBackend`] wraps any [`Backend`] and consults the map
//! before forwarding each operation. The overlay is a generic capability,
//! not a feature of a particular driver.

use std::collections::HashMap;

use bytes::Bytes;

use crate::backend::{Backend, ItemInfo};
use crate::error::{Error, Result};

/// Permission letters:
///
/// | letter | grants |
/// |---|---|
/// | `l` | listing object names |
/// | `r` | reading object contents |
/// | `w` | creating new objects (must not already exist) |
/// | `W` | writing objects, including overwriting existing ones |
/// | `D` | deleting objects |
///
/// Permissions granted for a prefix like `foo` also apply to everything
/// below it, like `foo/bar`. The entry **nearest** to the operand decides;
/// an empty map allows all operations.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    grants: HashMap<String, String>,
}

impl Permissions {
    /// An empty map, allowing all operations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants the permission `letters` to `prefix` (and everything below).
    #[must_use]
    pub fn grant(mut self, prefix: impl Into<String>, letters: impl Into<String>) -> Self {
        self.grants.insert(prefix.into(), letters.into());
        self
    }

    /// Checks whether one of the `required` letters is granted for `name`.
    ///
    /// Walks from the full name up through its ancestors to the root `""`;
    /// the nearest configured entry decides.
    pub fn check(&self, name: &str, required: &str) -> Result<()> {
        debug_assert!(required.chars().all(|c| "lrwWD".contains(c)));
        if self.grants.is_empty() {
            return Ok(());
        }
        let mut path = name;
        loop {
            if let Some(granted) = self.grants.get(path) {
                if required.chars().any(|c| granted.contains(c)) {
                    return Ok(());
                }
                break;
            }
            match path.rsplit_once('/') {
                Some((parent, _)) => path = parent,
                None if !path.is_empty() => path = "",
                None => break,
            }
        }
        Err(Error::PermissionDenied {
            name: name.to_string(),
            required: required.to_string(),
        })
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Permissions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            grants: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A backend decorated with a [`Permissions`] overlay.
///
/// Every operation checks the overlay first and forwards to the inner
/// backend only when granted. Violations fail
/// [`Error::PermissionDenied`].
pub struct PermissionedBackend<B> {
    inner: B,
    permissions: Permissions,
}

impl<B: Backend> PermissionedBackend<B> {
    /// Wraps `inner` with the given permission map.
    pub fn new(inner: B, permissions: Permissions) -> Self {
        Self { inner, permissions }
    }

    /// Replaces the permission map, e.g. to drop privileges after setup.
    pub fn set_permissions(&mut self, permissions: Permissions) {
        self.permissions = permissions;
    }

    /// Consumes the wrapper, returning the inner backend.
    pub fn into_inner(self) -> B {
        self.inner
    }
}

impl<B: Backend> Backend for PermissionedBackend<B> {
    fn create(&mut self) -> Result<()> {
        self.permissions.check("", "wW")?;
        self.inner.create()
    }

    fn destroy(&mut self) -> Result<()> {
        self.permissions.check("", "D")?;
        self.inner.destroy()
    }

    fn open(&mut self) -> Result<()> {
        self.inner.open()
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        // spamming a store with lots of random empty dirs == DoS,
        // so require a write permission.
        self.permissions.check(name, "wW")?;
        self.inner.mkdir(name)
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        // rmdir only removes empty directories, no data can be lost,
        // so a granted "w" is already good enough, "D" is also ok.
        self.permissions.check(name, "wD")?;
        self.inner.rmdir(name)
    }

    fn info(&self, name: &str) -> Result<ItemInfo> {
        // no object content is revealed, so "l" is enough, "r" is also ok.
        self.permissions.check(name, "lr")?;
        self.inner.info(name)
    }

    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        self.permissions.check(name, "r")?;
        self.inner.load(name, offset, size)
    }

    fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        let required = if self.inner.info(name)?.exists { "W" } else { "wW" };
        self.permissions.check(name, required)?;
        self.inner.store(name, value)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.permissions.check(name, "D")?;
        self.inner.delete(name)
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        // the source vanishes under its original name (similar to deleting
        // it) and the store uses rename for soft-deletion, hence "D".
        self.permissions.check(src, "D")?;
        self.permissions.check(dst, "wW")?;
        self.inner.rename(src, dst)
    }

    fn list(&self, name: &str) -> Result<Vec<ItemInfo>> {
        self.permissions.check(name, "l")?;
        self.inner.list(name)
    }

    fn precreate_dirs(&self) -> bool {
        self.inner.precreate_dirs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_allows_all() {
        let perms = Permissions::new();
        assert!(perms.check("anything/at/all", "D").is_ok());
    }

    #[test]
    fn nearest_entry_decides() {
        let perms = Permissions::new()
            .grant("", "l")
            .grant("dir", "lrw")
            .grant("dir/file", "r");
        // "not-allowed" falls back to "" which only grants l.
        assert!(perms.check("not-allowed", "wW").is_err());
        // "dir/file2" falls back to "dir" which grants w.
        assert!(perms.check("dir/file2", "wW").is_ok());
        // "dir/file" is configured directly and grants only r.
        assert!(perms.check("dir/file", "W").is_err());
        assert!(perms.check("dir/file", "r").is_ok());
        // the nearest entry decides: no fallback past "dir/file".
        assert!(perms.check("dir/file", "w").is_err());
    }

    #[test]
    fn any_required_letter_suffices() {
        let perms = Permissions::new().grant("", "D");
        assert!(perms.check("x", "wD").is_ok());
        assert!(perms.check("x", "w").is_err());
    }
}
