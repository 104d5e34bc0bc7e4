//! High-level key/value store on top of a [`Backend`].
//!
//! The store adds, over the flat names a backend understands:
//!
//! - backend selection/construction from a URL
//! - configurable per-namespace nesting
//! - a recursive, streaming [`list`](Store::list)
//! - soft deletion (`.del` tombstones) with undelete
//! - statistics and optional latency/bandwidth emulation

use std::time::Instant;

use bytes::Bytes;

use crate::backend::{Backend, ItemInfo};
use crate::constants::DEL_SUFFIX;
use crate::error::{Error, Result};
use crate::nesting::{nest, split_key};
use crate::stats::{Op, Stats, StatsRecorder};
use crate::url::backend_from_url;

/// Per-namespace nesting configuration.
///
/// Each entry maps a namespace prefix (with trailing slash, e.g. `data/`;
/// `""` matches everything) to the list of nesting depths in use. The
/// **last** depth is the current one: new objects are written there and
/// [`Store::change_level`] re-nests to it. Earlier entries are historical
/// depths that resolution falls back to, so a store can change its layout
/// without migrating existing objects.
///
/// The configuration must cover every namespace the store will use; there
/// is no implicit default.
#[derive(Debug, Clone, Default)]
pub struct LevelsConfig {
    entries: Vec<(String, Vec<usize>)>,
}

impl LevelsConfig {
    /// An empty configuration; add namespaces with [`level`](Self::level).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the known nesting `depths` for `namespace`, the last one
    /// being current.
    #[must_use]
    pub fn level(mut self, namespace: impl Into<String>, depths: &[usize]) -> Self {
        self.entries.push((namespace.into(), depths.to_vec()));
        self
    }

    /// Longest namespace first, so the most specific prefix wins.
    fn finalize(mut self) -> Result<Vec<(String, Vec<usize>)>> {
        if self.entries.is_empty() || self.entries.iter().any(|(_, d)| d.is_empty()) {
            return Err(Error::InvalidKey(
                "no or invalid levels configuration given".into(),
            ));
        }
        self.entries
            .sort_by(|(a, _), (b, _)| b.len().cmp(&a.len()));
        Ok(self.entries)
    }
}

/// What the store knows about one logical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Whether any form (live or tombstone) exists.
    pub exists: bool,
    /// Size of the value in bytes.
    pub size: u64,
    /// True iff only the soft-deleted form exists.
    pub deleted: bool,
}

/// A namespaced key/value store over a pluggable [`Backend`].
pub struct Store {
    url: Option<String>,
    backend: Box<dyn Backend>,
    levels: Vec<(String, Vec<usize>)>,
    stats: StatsRecorder,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("url", &self.url)
            .field("levels", &self.levels)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Builds a store from a backend URL (see the crate docs for the
    /// accepted schemes) and a levels configuration.
    pub fn new(url: &str, levels: LevelsConfig) -> Result<Self> {
        let backend = backend_from_url(url)?;
        Ok(Self {
            url: Some(url.to_string()),
            backend,
            levels: levels.finalize()?,
            stats: StatsRecorder::from_env(),
        })
    }

    /// Builds a store around an already constructed backend.
    pub fn with_backend(backend: Box<dyn Backend>, levels: LevelsConfig) -> Result<Self> {
        Ok(Self {
            url: None,
            backend,
            levels: levels.finalize()?,
            stats: StatsRecorder::from_env(),
        })
    }

    /// The backend this store operates on, e.g. for low-level inspection
    /// in tests.
    pub fn backend(&self) -> &dyn Backend {
        self.backend.as_ref()
    }

    /// Initializes the backend storage.
    ///
    /// If the backend requests it, all sharding directories of all
    /// configured namespaces are pre-created, which saves a lot of ad-hoc
    /// mkdir calls later: important for backends where mkdir has a
    /// noticeable cost. Expect `16^(2·depth)` directories per namespace.
    pub fn create(&mut self) -> Result<()> {
        self.backend.create()?;
        if self.backend.precreate_dirs() {
            self.create_levels()?;
        }
        Ok(())
    }

    /// Removes the backend storage and everything in it.
    pub fn destroy(&mut self) -> Result<()> {
        self.backend.destroy()
    }

    /// Opens the backend (connections, sessions, subprocesses).
    pub fn open(&mut self) -> Result<()> {
        self.backend.open()?;
        self.stats.count_open();
        Ok(())
    }

    /// Closes the backend. Closing a closed store is a no-op.
    pub fn close(&mut self) -> Result<()> {
        self.backend.close()
    }

    fn create_levels(&mut self) -> Result<()> {
        self.backend.open()?;
        let result = self.create_levels_inner();
        let closed = self.backend.close();
        result.and(closed)
    }

    fn create_levels_inner(&self) -> Result<()> {
        for (namespace, depths) in &self.levels {
            let namespace = namespace.trim_end_matches('/');
            let level = *depths.iter().max().expect("validated non-empty");
            if level == 0 {
                // flat: just the namespace directory itself
                self.backend.mkdir(namespace)?;
            } else {
                // nested: create the deepest layer only, mkdir fills in
                // missing parents
                for i in 0..256usize.pow(level as u32) {
                    let dir = format!("{i:0width$x}", width = 2 * level);
                    let name = if namespace.is_empty() {
                        dir.clone()
                    } else {
                        format!("{namespace}/{dir}")
                    };
                    let nested = nest(&name, level, None)?;
                    self.backend.mkdir(&nested[..nested.len() - dir.len() - 1])?;
                }
            }
        }
        Ok(())
    }

    /// The known depths for the namespace of `name`, most specific
    /// configured prefix first.
    fn depths(&self, name: &str) -> Result<&[usize]> {
        self.levels
            .iter()
            .find(|(namespace, _)| name.starts_with(namespace.as_str()))
            .map(|(_, depths)| depths.as_slice())
            .ok_or_else(|| {
                Error::InvalidKey(format!("no nesting level configured for: {name}"))
            })
    }

    fn find_with_info(&self, name: &str, deleted: bool) -> Result<(String, ItemInfo)> {
        let depths = self.depths(name)?;
        let suffix = deleted.then_some(DEL_SUFFIX);
        let current = *depths.last().expect("validated non-empty");
        // Probe the current depth first, then the historical ones; an
        // existing object wins wherever it sits.
        let mut candidate = None;
        for depth in std::iter::once(current).chain(depths[..depths.len() - 1].iter().copied()) {
            let nested = nest(name, depth, suffix)?;
            let info = self.backend.info(&nested)?;
            if info.exists {
                return Ok((nested, info));
            }
            if candidate.is_none() {
                candidate = Some((nested, info));
            }
        }
        Ok(candidate.expect("probed at least the current depth"))
    }

    /// Finds an item, checking all known nesting depths of its namespace,
    /// and returns its backend name.
    ///
    /// For an item not in the store yet, this is the name it would be
    /// stored under (at the current depth). With `deleted`, the `.del`
    /// form is searched instead.
    pub fn find(&self, name: &str, deleted: bool) -> Result<String> {
        self.find_with_info(name, deleted).map(|(nested, _)| nested)
    }

    /// Live form first, then the tombstone; errors if neither exists.
    fn resolve_existing(&self, name: &str) -> Result<(String, ItemInfo, bool)> {
        let (nested, info) = self.find_with_info(name, false)?;
        if info.exists {
            return Ok((nested, info, false));
        }
        let (nested, info) = self.find_with_info(name, true)?;
        if info.exists {
            return Ok((nested, info, true));
        }
        Err(Error::ObjectNotFound(name.to_string()))
    }

    /// Stores `value` under the logical `name`.
    ///
    /// An existing object is overwritten in place (keeping its nesting
    /// depth); a new object is written at the namespace's current depth.
    pub fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        self.stats.measure(Op::Store, name, || {
            let (nested, _) = self.find_with_info(name, false)?;
            self.backend.store(&nested, value)?;
            Ok(((), value.len() as u64))
        })
    }

    /// Loads the value stored under `name`.
    ///
    /// Live and soft-deleted objects are both readable: the live form is
    /// tried first, then the tombstone.
    pub fn load(&self, name: &str) -> Result<Bytes> {
        self.load_range(name, 0, None)
    }

    /// Like [`load`](Self::load), but returns only the bytes in
    /// `[offset, offset+size)` intersected with the value. Reading beyond
    /// EOF returns fewer bytes without error.
    pub fn load_range(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        self.stats.measure(Op::Load, name, || {
            let (nested, _, _) = self.resolve_existing(name)?;
            let data = self.backend.load(&nested, offset, size)?;
            let volume = data.len() as u64;
            Ok((data, volume))
        })
    }

    /// Returns what is known about `name`; `deleted` is true iff only the
    /// tombstone exists. A missing object is reported via
    /// [`ObjectInfo::exists`], not an error.
    pub fn info(&self, name: &str) -> Result<ObjectInfo> {
        self.stats.measure(Op::Info, name, || {
            let (_, info) = self.find_with_info(name, false)?;
            let object_info = if info.exists {
                ObjectInfo {
                    exists: true,
                    size: info.size,
                    deleted: false,
                }
            } else {
                let (_, del_info) = self.find_with_info(name, true)?;
                ObjectInfo {
                    exists: del_info.exists,
                    size: del_info.size,
                    deleted: del_info.exists,
                }
            };
            Ok((object_info, 0))
        })
    }

    /// Really and immediately deletes `name` (live form first, then the
    /// tombstone).
    ///
    /// See [`soft_delete`](Self::soft_delete) for reversible deletion.
    pub fn delete(&self, name: &str) -> Result<()> {
        self.stats.measure(Op::Delete, name, || {
            let (nested, _, _) = self.resolve_existing(name)?;
            self.backend.delete(&nested)?;
            Ok(((), 0))
        })
    }

    /// Renames `src` to `dst` (both logical names in the same namespace).
    pub fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let (src_namespace, _) = split_key(src);
        let (dst_namespace, _) = split_key(dst);
        if src_namespace != dst_namespace {
            return Err(Error::InvalidKey(format!(
                "rename source and destination must share a namespace: {src} -> {dst}"
            )));
        }
        self.stats.measure(Op::Move, src, || {
            let (nested_src, info) = self.find_with_info(src, false)?;
            if !info.exists {
                return Err(Error::ObjectNotFound(src.to_string()));
            }
            let (nested_dst, _) = self.find_with_info(dst, false)?;
            self.backend.rename(&nested_src, &nested_dst)?;
            Ok(((), 0))
        })
    }

    /// Soft-deletes `name`: the object is renamed to its `.del` form,
    /// keeping its logical name. Fails with [`Error::ObjectNotFound`] if
    /// no live form exists (e.g. it is already soft-deleted).
    pub fn soft_delete(&self, name: &str) -> Result<()> {
        self.stats.measure(Op::Move, name, || {
            let (nested, info) = self.find_with_info(name, false)?;
            if !info.exists {
                return Err(Error::ObjectNotFound(name.to_string()));
            }
            let target = format!("{nested}{DEL_SUFFIX}");
            self.backend.rename(&nested, &target)?;
            Ok(((), 0))
        })
    }

    /// Reverses a [`soft_delete`](Self::soft_delete). Fails with
    /// [`Error::ObjectNotFound`] if no tombstone exists (e.g. the object
    /// is live).
    pub fn undelete(&self, name: &str) -> Result<()> {
        self.stats.measure(Op::Move, name, || {
            let (nested, info) = self.find_with_info(name, true)?;
            if !info.exists {
                return Err(Error::ObjectNotFound(name.to_string()));
            }
            let target = nested
                .strip_suffix(DEL_SUFFIX)
                .expect("deleted form carries the suffix")
                .to_string();
            self.backend.rename(&nested, &target)?;
            Ok(((), 0))
        })
    }

    /// Re-nests `name` (live or tombstoned) to its namespace's current
    /// depth; used after the levels configuration changed.
    pub fn change_level(&self, name: &str) -> Result<()> {
        self.stats.measure(Op::Move, name, || {
            let (nested, _, deleted) = self.resolve_existing(name)?;
            let current = *self.depths(name)?.last().expect("validated non-empty");
            let suffix = deleted.then_some(DEL_SUFFIX);
            let target = nest(name, current, suffix)?;
            if target != nested {
                self.backend.rename(&nested, &target)?;
            }
            Ok(((), 0))
        })
    }

    /// Lists the logical names in the namespace `name`, lazily descending
    /// the sharding directories.
    ///
    /// With `deleted`, only soft-deleted objects are yielded (with the
    /// `.del` suffix stripped); otherwise only live objects. Sharding
    /// directory components are never exposed. If all items of a
    /// namespace sit on the same nesting depth, the stream is sorted.
    pub fn list(&self, name: &str, deleted: bool) -> List<'_> {
        self.stats.count_call(Op::List);
        List {
            backend: self.backend.as_ref(),
            stats: &self.stats,
            deleted,
            root: Some(name.to_string()),
            stack: Vec::new(),
        }
    }

    /// A snapshot of the statistics counters.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }
}

struct ListFrame {
    dir: String,
    items: std::vec::IntoIter<ItemInfo>,
}

/// Streaming iterator over the objects of one namespace, returned by
/// [`Store::list`].
pub struct List<'a> {
    backend: &'a dyn Backend,
    stats: &'a StatsRecorder,
    deleted: bool,
    /// Namespace still to be entered on the first `next()` call.
    root: Option<String>,
    stack: Vec<ListFrame>,
}

impl List<'_> {
    fn fetch(&self, dir: &str) -> Result<ListFrame> {
        let start = Instant::now();
        let result = self.backend.list(dir);
        self.stats.add_fetch_time(Op::List, dir, start);
        Ok(ListFrame {
            dir: dir.to_string(),
            items: result?.into_iter(),
        })
    }
}

impl Iterator for List<'_> {
    type Item = Result<ItemInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(root) = self.root.take() {
            match self.fetch(&root) {
                Ok(frame) => self.stack.push(frame),
                Err(err) => return Some(Err(err)),
            }
        }
        loop {
            let top = self.stack.last_mut()?;
            let Some(item) = top.items.next() else {
                self.stack.pop();
                continue;
            };
            if item.directory {
                // only sharding directories are expected here: namespaces
                // are never nested into each other
                let subdir = if top.dir.is_empty() {
                    item.name
                } else {
                    format!("{}/{}", top.dir, item.name)
                };
                match self.fetch(&subdir) {
                    Ok(frame) => self.stack.push(frame),
                    Err(err) => {
                        self.stack.clear();
                        return Some(Err(err));
                    }
                }
                continue;
            }
            let is_deleted = item.name.ends_with(DEL_SUFFIX);
            if is_deleted == self.deleted {
                let mut item = item;
                if is_deleted {
                    item.name.truncate(item.name.len() - DEL_SUFFIX.len());
                }
                return Some(Ok(item));
            }
        }
    }
}
