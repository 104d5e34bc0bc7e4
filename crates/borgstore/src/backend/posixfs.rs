//! Filesystem backend: files in directories below a base path.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;

use super::{validate_name, Backend, ItemInfo};
use crate::constants::TMP_SUFFIX;
use crate::error::{Error, Result};

/// Local POSIX filesystem backend.
///
/// Values are plain files; writes go to a temp file in the target
/// directory first and are renamed into place, so a reader never sees
/// partially written data.
pub struct PosixFs {
    base_path: PathBuf,
    opened: bool,
    do_fsync: bool,
    precreate: bool,
}

impl PosixFs {
    /// Creates a backend rooted at the absolute path `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        if !base_path.is_absolute() {
            return Err(Error::Backend(format!(
                "posixfs path must be absolute: {}",
                base_path.display()
            )));
        }
        Ok(Self {
            base_path,
            opened: false,
            do_fsync: false,
            precreate: false,
        })
    }

    /// Enables fsync before rename on every store.
    ///
    /// Off by default; syncing is roughly an order of magnitude slower on
    /// common filesystems.
    #[must_use]
    pub fn with_fsync(mut self, do_fsync: bool) -> Self {
        self.do_fsync = do_fsync;
        self
    }

    /// Requests pre-creation of all sharding directories at create time.
    #[must_use]
    pub fn with_precreate_dirs(mut self, precreate: bool) -> Self {
        self.precreate = precreate;
        self
    }

    /// The absolute base path this backend stores under.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.opened {
            Ok(())
        } else {
            Err(Error::BackendMustBeOpen)
        }
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.opened {
            Err(Error::BackendMustNotBeOpen)
        } else {
            Ok(())
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(self.base_path.join(name))
    }

    fn write_tmpfile(&self, dir: &Path, value: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
        let mut tmp = tempfile::Builder::new().suffix(TMP_SUFFIX).tempfile_in(dir)?;
        tmp.write_all(value)?;
        if self.do_fsync {
            tmp.as_file().sync_all()?;
        }
        Ok(tmp)
    }
}

impl Backend for PosixFs {
    fn create(&mut self) -> Result<()> {
        self.ensure_closed()?;
        // An already existing empty directory is accepted and missing
        // parent dirs are created: repository hosters often only offer
        // limited access to their storage, without a way to mkdir -p.
        fs::create_dir_all(&self.base_path)?;
        if fs::read_dir(&self.base_path)?.next().is_some() {
            return Err(Error::BackendAlreadyExists(format!(
                "posixfs storage base path is not empty: {}",
                self.base_path.display()
            )));
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        self.ensure_closed()?;
        fs::remove_dir_all(&self.base_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::BackendDoesNotExist(format!(
                    "posixfs storage base path does not exist: {}",
                    self.base_path.display()
                ))
            } else {
                err.into()
            }
        })
    }

    fn open(&mut self) -> Result<()> {
        self.ensure_closed()?;
        if !self.base_path.is_dir() {
            return Err(Error::BackendDoesNotExist(format!(
                "posixfs storage base path does not exist or is not a directory: {}",
                self.base_path.display()
            )));
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        // remove_dir only removes empty directories, no data can be lost.
        fs::remove_dir(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound(name.to_string())
            } else {
                err.into()
            }
        })
    }

    fn info(&self, name: &str) -> Result<ItemInfo> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        let leaf = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match fs::metadata(&path) {
            Ok(meta) => Ok(ItemInfo {
                name: leaf,
                exists: true,
                size: if meta.is_dir() { 0 } else { meta.len() },
                directory: meta.is_dir(),
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(ItemInfo::missing(leaf))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        let mut file = fs::File::open(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound(name.to_string())
            } else {
                Error::from(err)
            }
        })?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))?;
        }
        let mut buf = Vec::new();
        match size {
            Some(size) => {
                file.take(size).read_to_end(&mut buf)?;
            }
            None => {
                file.read_to_end(&mut buf)?;
            }
        }
        Ok(Bytes::from(buf))
    }

    fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        let dir = path.parent().unwrap_or(&self.base_path);
        // Try the quick path first: the directory is usually already
        // there. On NotFound, create missing dirs and retry: covers both
        // non-precreated sharding dirs and dirs lost to fs mishaps.
        let tmp = match self.write_tmpfile(dir, value) {
            Ok(tmp) => tmp,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                self.write_tmpfile(dir, value)?
            }
            Err(err) => return Err(err.into()),
        };
        // All written (and synced if requested): rename to the final name.
        tmp.persist(&path)
            .map_err(|persist_err| Error::from(persist_err.error))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        fs::remove_file(path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound(name.to_string())
            } else {
                err.into()
            }
        })
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        let src_path = self.path_for(src)?;
        let dst_path = self.path_for(dst)?;
        if dst_path.exists() {
            return Err(Error::ObjectAlreadyExists(dst.to_string()));
        }
        match fs::rename(&src_path, &dst_path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Either src is missing or the dst directory is; create
                // the latter and retry before concluding the former.
                if let Some(parent) = dst_path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&src_path, &dst_path)
                    .map_err(|_| Error::ObjectNotFound(src.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, name: &str) -> Result<Vec<ItemInfo>> {
        self.ensure_open()?;
        let path = self.path_for(name)?;
        let entries = fs::read_dir(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::ObjectNotFound(name.to_string())
            } else {
                Error::from(err)
            }
        })?;
        let mut items = Vec::new();
        for entry in entries {
            let entry = entry?;
            let leaf = entry.file_name().to_string_lossy().into_owned();
            if leaf.ends_with(TMP_SUFFIX) {
                continue;
            }
            // An entry may vanish between readdir and stat; skip it then.
            let Ok(meta) = entry.metadata() else { continue };
            items.push(ItemInfo {
                name: leaf,
                exists: true,
                size: if meta.is_dir() { 0 } else { meta.len() },
                directory: meta.is_dir(),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn precreate_dirs(&self) -> bool {
        self.precreate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_backend(dir: &tempfile::TempDir) -> PosixFs {
        let mut be = PosixFs::new(dir.path().join("store")).unwrap();
        be.create().unwrap();
        be.open().unwrap();
        be
    }

    #[test]
    fn relative_path_is_rejected() {
        assert!(PosixFs::new("relative/path").is_err());
    }

    #[test]
    fn store_creates_missing_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let be = created_backend(&dir);
        be.store("ns/ab/cd/abcd1234", b"v").unwrap();
        assert_eq!(be.load("ns/ab/cd/abcd1234", 0, None).unwrap(), &b"v"[..]);
    }

    #[test]
    fn create_accepts_missing_parent_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut be =
            PosixFs::new(dir.path().join("missing1").join("missing2").join("store")).unwrap();
        be.create().unwrap();
        be.open().unwrap();
        be.store("key", b"value").unwrap();
        be.close().unwrap();
    }

    #[test]
    fn rename_rejects_existing_destination() {
        let dir = tempfile::TempDir::new().unwrap();
        let be = created_backend(&dir);
        be.store("a", b"1").unwrap();
        be.store("b", b"2").unwrap();
        assert!(matches!(
            be.rename("a", "b"),
            Err(Error::ObjectAlreadyExists(_))
        ));
    }
}
