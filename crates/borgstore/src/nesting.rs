//! Nest / un-nest names to address directory scalability and the suffix
//! of soft-deleted items.
//!
//! Many directory implementations cannot cope with gazillions of entries,
//! so intermediate directories are inserted to lower the amount of entries
//! per directory. The name is expected to have the key as its last element:
//!
//! ```text
//! name        = "namespace/0123456789abcdef"   // often hex(hash(content))
//! nest(name, 2) == "namespace/01/23/0123456789abcdef"
//! ```
//!
//! The final element is the **full** key: easier to deal with after fs
//! mishaps (stuff pushed to lost+found), directory listings directly give
//! keys, and a sorted directory list is in key order.

use crate::error::{Error, Result};

/// Splits a logical name into its namespace and key parts.
///
/// A name without a `/` has no namespace.
pub fn split_key(name: &str) -> (Option<&str>, &str) {
    match name.rsplit_once('/') {
        Some((namespace, key)) => (Some(namespace), key),
        None => (None, name),
    }
}

/// Transforms `namespace/12345678` into e.g. `namespace/12/34/12345678`
/// (two levels), optionally appending a suffix like `.del`.
///
/// With `levels > 0` the key must be all hex and long enough to donate one
/// two-character directory component per level.
pub fn nest(name: &str, levels: usize, suffix: Option<&str>) -> Result<String> {
    let mut nested = if levels > 0 {
        let (namespace, key) = split_key(name);
        if key.len() < 2 * levels {
            return Err(Error::InvalidKey(format!(
                "key {key:?} is too short for nesting level {levels}"
            )));
        }
        if !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidKey(format!(
                "key {key:?} must be hex for a nested namespace"
            )));
        }
        let mut parts = Vec::with_capacity(levels + 2);
        if let Some(namespace) = namespace {
            parts.push(namespace);
        }
        for level in 0..levels {
            parts.push(&key[2 * level..2 * level + 2]);
        }
        parts.push(key);
        parts.join("/")
    } else {
        name.to_string()
    };
    if let Some(suffix) = suffix {
        nested.push_str(suffix);
    }
    Ok(nested)
}

/// Inverse of [`nest`]: maps `namespace/12/34/12345678` back to
/// `namespace/12345678`, ignoring the sharding components and optionally
/// stripping a suffix from the key.
pub fn unnest(nested: &str, namespace: &str, strip_suffix: Option<&str>) -> Result<String> {
    let mut prefix = String::new();
    let rest = if namespace.is_empty() {
        nested
    } else {
        prefix = format!("{}/", namespace.trim_end_matches('/'));
        nested.strip_prefix(&prefix).ok_or_else(|| {
            Error::InvalidKey(format!(
                "name {nested:?} does not start with namespace {namespace:?}"
            ))
        })?
    };
    let mut key = rest.rsplit('/').next().unwrap_or(rest);
    if let Some(suffix) = strip_suffix {
        key = key.strip_suffix(suffix).unwrap_or(key);
    }
    Ok(format!("{prefix}{key}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{DEL_SUFFIX, ROOTNS};

    #[test]
    fn split_key_with_and_without_namespace() {
        assert_eq!(split_key("12345678"), (None, "12345678"));
        assert_eq!(split_key("data/12345678"), (Some("data"), "12345678"));
    }

    #[test]
    fn nest_levels() {
        let cases = [
            ("12345678", 0, false, "12345678"),
            ("12345678", 1, false, "12/12345678"),
            ("12345678", 2, false, "12/34/12345678"),
            ("12345678", 3, false, "12/34/56/12345678"),
            ("12345678", 3, true, "12/34/56/12345678.del"),
            ("data/12345678", 0, false, "data/12345678"),
            ("data/12345678", 1, false, "data/12/12345678"),
            ("data/12345678", 2, false, "data/12/34/12345678"),
            ("data/12345678", 3, false, "data/12/34/56/12345678"),
            ("data/12345678", 3, true, "data/12/34/56/12345678.del"),
        ];
        for (name, levels, deleted, expected) in cases {
            let suffix = deleted.then_some(DEL_SUFFIX);
            assert_eq!(nest(name, levels, suffix).unwrap(), expected);
        }
    }

    #[test]
    fn nest_rejects_non_hex_keys() {
        assert!(matches!(
            nest("data/nothex!!", 2, None),
            Err(Error::InvalidKey(_))
        ));
        // flat namespaces accept arbitrary keys
        assert_eq!(nest("data/nothex!!", 0, None).unwrap(), "data/nothex!!");
    }

    #[test]
    fn nest_rejects_short_keys() {
        assert!(matches!(nest("data/ab", 2, None), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn unnest_levels() {
        let cases = [
            ("12345678", ROOTNS, false, "12345678"),
            ("12345678", ROOTNS, false, "12/12345678"),
            ("12345678", ROOTNS, false, "12/34/12345678"),
            ("12345678", ROOTNS, false, "12/34/56/12345678"),
            ("12345678", ROOTNS, true, "12/34/56/12345678.del"),
            ("data/12345678", "data", false, "data/12345678"),
            ("data/12345678", "data", false, "data/12/12345678"),
            ("data/12345678", "data", false, "data/12/34/12345678"),
            ("data/12345678", "data", true, "data/12/34/12345678.del"),
        ];
        for (expected, namespace, deleted, nested) in cases {
            let suffix = deleted.then_some(DEL_SUFFIX);
            assert_eq!(unnest(nested, namespace, suffix).unwrap(), expected);
        }
    }

    #[test]
    fn unnest_rejects_foreign_namespace() {
        assert!(unnest("data_xxx/12/12345678", "data", None).is_err());
        assert!(unnest("dat/12/34/12345678", "data", None).is_err());
    }
}
