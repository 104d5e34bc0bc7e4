//! Permission overlay tests: the wrapper can emulate read-only stores,
//! stores that disallow deletion, and fine-grained per-prefix setups, to
//! check that software using the store behaves well under restricted
//! permissions.

use borgstore::{Backend, Error, LevelsConfig, PermissionedBackend, Permissions, PosixFs, Store};
use tempfile::TempDir;

const DATA1: &[u8] = b"data1";
const DATA2: &[u8] = b"data2";

fn wrapped(dir: &TempDir, permissions: Permissions) -> PermissionedBackend<PosixFs> {
    let inner = PosixFs::new(dir.path().join("store")).unwrap();
    PermissionedBackend::new(inner, permissions)
}

fn denied(result: Result<(), Error>) -> bool {
    matches!(result, Err(Error::PermissionDenied { .. }))
}

#[test]
fn full_permissions() {
    let dir = TempDir::new().unwrap();
    // all permissions granted, recursively
    let mut fs = wrapped(&dir, Permissions::new().grant("", "lrwWD"));
    fs.create().unwrap(); // w
    fs.open().unwrap();
    fs.mkdir("dir").unwrap(); // w
    fs.store("dir/file", DATA1).unwrap(); // w
    fs.store("dir/file", DATA2).unwrap(); // W
    assert_eq!(fs.load("dir/file", 0, None).unwrap(), DATA2); // r
    fs.list("").unwrap(); // l
    fs.list("dir").unwrap(); // l
    fs.rename("dir/file", "dir/moved_file").unwrap(); // D + w
    fs.delete("dir/moved_file").unwrap(); // D
    fs.close().unwrap();
    fs.destroy().unwrap(); // D
}

#[test]
fn readonly_permissions() {
    let dir = TempDir::new().unwrap();
    let mut fs = wrapped(&dir, Permissions::new().grant("", "w")); // setup needs w
    fs.create().unwrap();
    fs.open().unwrap();
    fs.mkdir("dir").unwrap();
    fs.store("dir/file", DATA1).unwrap();

    // drop to read-only permissions, recursively
    fs.set_permissions(Permissions::new().grant("", "lr"));
    assert!(denied(fs.store("dir/file2", DATA2))); // w denied
    assert!(denied(fs.store("dir/file", DATA2))); // W denied
    assert_eq!(fs.load("dir/file", 0, None).unwrap(), DATA1); // r
    fs.list("").unwrap(); // l
    fs.list("dir").unwrap(); // l
    assert!(denied(fs.delete("dir/file"))); // D denied
    assert!(denied(fs.rename("dir/file", "dir/moved_file"))); // D denied
    fs.close().unwrap();
    assert!(denied(fs.destroy())); // D denied
}

#[test]
fn nodelete_permissions() {
    let dir = TempDir::new().unwrap();
    let mut fs = wrapped(&dir, Permissions::new().grant("", "w"));
    fs.create().unwrap();
    fs.open().unwrap();
    fs.mkdir("dir").unwrap();
    fs.store("dir/file", DATA1).unwrap();

    // no overwrite, no delete
    fs.set_permissions(Permissions::new().grant("", "lrw"));
    fs.store("dir/file2", DATA2).unwrap(); // w
    assert!(denied(fs.store("dir/file", DATA2))); // W denied
    assert_eq!(fs.load("dir/file", 0, None).unwrap(), DATA1); // r
    fs.list("").unwrap(); // l
    assert!(denied(fs.delete("dir/file"))); // D denied
    // rename needs D (src) and w (dst); D is denied
    assert!(denied(fs.rename("dir/file", "dir/moved_file")));
    fs.close().unwrap();
    assert!(denied(fs.destroy())); // D denied
}

#[test]
fn permission_lookup_uses_the_nearest_prefix() {
    let dir = TempDir::new().unwrap();
    let mut fs = wrapped(&dir, Permissions::new().grant("", "w"));
    fs.create().unwrap();
    fs.open().unwrap();
    fs.mkdir("dir").unwrap();
    fs.store("dir/file", DATA1).unwrap();

    fs.set_permissions(
        Permissions::new()
            .grant("", "l") // only listing at the top level
            .grant("dir", "lrw") // adding new stuff in dir is allowed
            .grant("dir/file", "r"), // this one file is read-only
    );
    // "not-allowed" is unknown, "" grants only l; mkdir wants w
    assert!(denied(fs.mkdir("not-allowed")));
    // "dir/file2" is unknown, "dir" grants w; store wants w
    fs.store("dir/file2", DATA2).unwrap();
    // "dir/file" grants only r; store wants W
    assert!(denied(fs.store("dir/file", DATA2)));
    fs.close().unwrap();
    // "" grants only l; destroy wants D
    assert!(denied(fs.destroy()));
}

#[test]
fn store_overwrite_rules_through_the_store_api() {
    // with "lrw" a key can be written once but not overwritten
    let dir = TempDir::new().unwrap();
    let mut backend = wrapped(&dir, Permissions::new().grant("", "lrw"));
    backend.create().unwrap();
    let mut store =
        Store::with_backend(Box::new(backend), LevelsConfig::new().level("x/", &[0])).unwrap();
    store.open().unwrap();
    store.store("x/k", b"1").unwrap();
    assert!(matches!(
        store.store("x/k", b"2"),
        Err(Error::PermissionDenied { .. })
    ));
    assert_eq!(store.load("x/k").unwrap(), &b"1"[..]);
    store.close().unwrap();

    // with "lrwW" the second write goes through
    let dir = TempDir::new().unwrap();
    let mut backend = wrapped(&dir, Permissions::new().grant("", "lrwW"));
    backend.create().unwrap();
    let mut store =
        Store::with_backend(Box::new(backend), LevelsConfig::new().level("x/", &[0])).unwrap();
    store.open().unwrap();
    store.store("x/k", b"1").unwrap();
    store.store("x/k", b"2").unwrap();
    assert_eq!(store.load("x/k").unwrap(), &b"2"[..]);
    store.close().unwrap();
}
