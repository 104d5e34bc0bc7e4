//! Shared helpers for the integration tests.

// not every test binary uses every helper
#![allow(dead_code)]

use borgstore::{Backend, PosixFs, Store};
use tempfile::TempDir;

/// Convenient way to generate hex test keys; uses 4 bytes for
/// readability.
pub fn key(index: u32) -> String {
    format!("{index:08x}")
}

/// A created (not yet opened) posixfs backend below a fresh temp dir.
pub fn posixfs_created(dir: &TempDir) -> PosixFs {
    let mut backend = PosixFs::new(dir.path().join("store")).unwrap();
    backend.create().unwrap();
    backend
}

/// Names yielded by `store.list`, in yield order.
pub fn store_names(store: &Store, namespace: &str, deleted: bool) -> Vec<String> {
    store
        .list(namespace, deleted)
        .map(|item| item.map(|item| item.name))
        .collect::<borgstore::Result<Vec<_>>>()
        .unwrap()
}

/// Names yielded by `store.list`, sorted.
pub fn store_names_sorted(store: &Store, namespace: &str, deleted: bool) -> Vec<String> {
    let mut names = store_names(store, namespace, deleted);
    names.sort();
    names
}

/// Names yielded by `backend.list`, sorted.
pub fn backend_names(backend: &dyn Backend, name: &str) -> Vec<String> {
    let mut names: Vec<String> = backend
        .list(name)
        .unwrap()
        .into_iter()
        .map(|item| item.name)
        .collect();
    names.sort();
    names
}
