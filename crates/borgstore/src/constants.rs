//! Constants shared by the store and all backends.

/// Namespace to pass to `list()` for the storage root.
pub const ROOTNS: &str = "";

/// Suffix of a temporary object that is still being uploaded/written.
/// Such objects are hidden from `list()`.
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of a soft-deleted object; it can be undeleted.
pub const DEL_SUFFIX: &str = ".del";

/// Maximum backend name length (not precise; suffixes might be added).
/// Rather conservative to stay portable between backends and platforms.
pub const MAX_NAME_LENGTH: usize = 100;
