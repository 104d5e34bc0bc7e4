//! Backend URL dispatcher.
//!
//! Parses a store URL and constructs the matching (unopened) backend.
//! Dispatch is pure string processing: no filesystem, network or
//! subprocess I/O happens here.
//!
//! Accepted schemes:
//!
//! - `file:///absolute/path`: local filesystem
//! - `sftp://user@host:port/rel/path` (server-relative, recommended) or
//!   `sftp://user@host:port//abs/path` (server-absolute)
//! - `rclone:remote:path`: any remote rclone supports
//! - `(s3|b2):[profile|access_key:secret@][scheme://host[:port]/]bucket/path`

use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::posixfs::PosixFs;
use crate::backend::rclone::Rclone;
use crate::backend::s3::S3Config;
use crate::backend::sftp::SftpConfig;
use crate::backend::Backend;
use crate::error::{Error, Result};

/// Parses `url` and returns a configured, unopened backend.
///
/// Unknown schemes fail with [`Error::InvalidUrl`].
pub fn backend_from_url(url: &str) -> Result<Box<dyn Backend>> {
    if let Some(path) = parse_file_url(url) {
        return Ok(Box::new(PosixFs::new(path)?));
    }
    if let Some(config) = parse_sftp_url(url) {
        return sftp_backend(config);
    }
    if let Some(remote) = parse_rclone_url(url) {
        return Ok(Box::new(Rclone::new(remote)));
    }
    if let Some(config) = parse_s3_url(url) {
        return s3_backend(config?);
    }
    Err(Error::InvalidUrl(url.to_string()))
}

// file:///absolute/path
//
// The general URL syntax is proto://host/path: the first two slashes
// introduce the (empty) host part, the third slash starts the absolute
// path AND separates it from the host. Only local absolute paths are
// supported; there is no such thing as a relative-path file: URL, and
// file://hostname/share (remote fs) is not recognised either.
static FILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^file://(?P<path>/.*)$").unwrap());

// file:///C:/... or file://C:/... (drive letter form)
#[cfg(windows)]
static WINDOWS_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^file:///?(?P<drive>[a-zA-Z]:)(?P<path>/.*)$").unwrap());

pub(crate) fn parse_file_url(url: &str) -> Option<PathBuf> {
    #[cfg(windows)]
    {
        let url = url.replace('\\', "/");
        if let Some(caps) = WINDOWS_FILE_RE.captures(&url) {
            return Some(PathBuf::from(format!("{}{}", &caps["drive"], &caps["path"])));
        }
    }
    FILE_RE
        .captures(url)
        .map(|caps| PathBuf::from(&caps["path"]))
}

// sftp://username@hostname:port/rel/path ('//abs/path' for server-absolute)
static SFTP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^sftp://(?:(?P<username>[^@]+)@)?(?P<hostname>[^:/]+)(?::(?P<port>\d+))?/(?P<path>.+)$")
        .unwrap()
});

pub(crate) fn parse_sftp_url(url: &str) -> Option<SftpConfig> {
    let caps = SFTP_RE.captures(url)?;
    Some(SftpConfig {
        username: caps.name("username").map(|m| m.as_str().to_string()),
        hostname: caps["hostname"].to_string(),
        // 0 means "not given": the ssh config or the default port 22 apply
        port: caps
            .name("port")
            .map_or(0, |m| m.as_str().parse().unwrap_or(0)),
        path: caps["path"].to_string(),
    })
}

// rclone:remote: or rclone:remote:path
static RCLONE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^rclone:(?P<path>.+)$").unwrap());

pub(crate) fn parse_rclone_url(url: &str) -> Option<String> {
    RCLONE_RE
        .captures(url)
        .map(|caps| caps["path"].to_string())
}

// (s3|b2):[profile|(access_key_id:access_key_secret)@][scheme://host[:port]/]bucket/path
static S3_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^(?P<kind>s3|b2):",
        r"(?:(?:(?P<access_key_id>[^:@/]+):(?P<access_key_secret>[^@/]+)|(?P<profile>[^@:/]+))@)?",
        r"(?:(?P<scheme>https?)://(?P<hostname>[^:/]+)(?::(?P<port>\d+))?/)?",
        r"(?P<bucket>[^/]+)/(?P<path>.+)$",
    ))
    .unwrap()
});

pub(crate) fn parse_s3_url(url: &str) -> Option<Result<S3Config>> {
    let caps = S3_RE.captures(url)?;
    let profile = caps.name("profile").map(|m| m.as_str().to_string());
    let access_key_id = caps
        .name("access_key_id")
        .map(|m| urlencoding::decode(m.as_str()).map_or_else(|_| m.as_str().into(), String::from));
    let access_key_secret = caps
        .name("access_key_secret")
        .map(|m| urlencoding::decode(m.as_str()).map_or_else(|_| m.as_str().into(), String::from));
    let endpoint_url = caps.name("hostname").map(|host| {
        let scheme = &caps["scheme"];
        match caps.name("port") {
            Some(port) => format!("{scheme}://{}:{}", host.as_str(), port.as_str()),
            None => format!("{scheme}://{}", host.as_str()),
        }
    });
    Some(Ok(S3Config {
        bucket: caps["bucket"].to_string(),
        path: caps["path"].to_string(),
        is_b2: &caps["kind"] == "b2",
        profile,
        access_key_id,
        access_key_secret,
        endpoint_url,
    }))
}

#[cfg(feature = "sftp")]
fn sftp_backend(config: SftpConfig) -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::backend::sftp::Sftp::new(config)))
}

#[cfg(not(feature = "sftp"))]
fn sftp_backend(_config: SftpConfig) -> Result<Box<dyn Backend>> {
    Err(Error::InvalidUrl(
        "sftp:// support not enabled; rebuild with the 'sftp' feature".into(),
    ))
}

#[cfg(feature = "s3")]
fn s3_backend(config: S3Config) -> Result<Box<dyn Backend>> {
    Ok(Box::new(crate::backend::s3::S3::new(config)?))
}

#[cfg(not(feature = "s3"))]
fn s3_backend(_config: S3Config) -> Result<Box<dyn Backend>> {
    Err(Error::InvalidUrl(
        "s3:/b2: support not enabled; rebuild with the 's3' feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url() {
        assert_eq!(
            parse_file_url("file:///absolute/path").unwrap(),
            PathBuf::from("/absolute/path")
        );
    }

    #[test]
    fn file_url_rejects_relative_and_remote() {
        // "relative" would be a hostname here, and remote filesystems are
        // not supported by the posixfs backend.
        assert!(parse_file_url("file://relative/path").is_none());
        assert!(parse_file_url("file://hostname/share").is_none());
        assert!(matches!(
            backend_from_url("file://relative/path"),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn sftp_urls() {
        let cases = [
            ("sftp://username@hostname:2222/rel/path", Some("username"), "hostname", 2222, "rel/path"),
            ("sftp://username@hostname/rel/path", Some("username"), "hostname", 0, "rel/path"),
            ("sftp://hostname/rel/path", None, "hostname", 0, "rel/path"),
            ("sftp://username@hostname:2222//abs/path", Some("username"), "hostname", 2222, "/abs/path"),
            ("sftp://username@hostname//abs/path", Some("username"), "hostname", 0, "/abs/path"),
            ("sftp://hostname//abs/path", None, "hostname", 0, "/abs/path"),
        ];
        for (url, username, hostname, port, path) in cases {
            let config = parse_sftp_url(url).unwrap_or_else(|| panic!("no match: {url}"));
            assert_eq!(config.username.as_deref(), username);
            assert_eq!(config.hostname, hostname);
            assert_eq!(config.port, port);
            assert_eq!(config.path, path);
        }
    }

    #[test]
    fn rclone_urls() {
        assert_eq!(parse_rclone_url("rclone:remote:").unwrap(), "remote:");
        assert_eq!(
            parse_rclone_url("rclone:remote:path/to/store").unwrap(),
            "remote:path/to/store"
        );
        assert!(parse_rclone_url("rclone:").is_none());
    }

    #[test]
    fn s3_url_with_endpoint_and_keys() {
        let config = parse_s3_url("s3:key:secret@https://minio.local:9000/bucket/some/path")
            .unwrap()
            .unwrap();
        assert_eq!(config.access_key_id.as_deref(), Some("key"));
        assert_eq!(config.access_key_secret.as_deref(), Some("secret"));
        assert_eq!(
            config.endpoint_url.as_deref(),
            Some("https://minio.local:9000")
        );
        assert_eq!(config.bucket, "bucket");
        assert_eq!(config.path, "some/path");
        assert!(!config.is_b2);
        assert!(config.profile.is_none());
    }

    #[test]
    fn s3_url_with_profile_and_default_endpoint() {
        let config = parse_s3_url("s3:backup@bucket/path").unwrap().unwrap();
        assert_eq!(config.profile.as_deref(), Some("backup"));
        assert!(config.endpoint_url.is_none());
        assert_eq!(config.bucket, "bucket");
        assert_eq!(config.path, "path");
    }

    #[test]
    fn b2_url_selects_the_quirk_path() {
        let config = parse_s3_url("b2:key:secret@https://s3.us-east-005.backblazeb2.com/bucket/path")
            .unwrap()
            .unwrap();
        assert!(config.is_b2);
    }

    #[test]
    fn s3_key_and_secret_are_percent_decoded() {
        let config = parse_s3_url("s3:key%2Fid:se%40cret@bucket/path").unwrap().unwrap();
        assert_eq!(config.access_key_id.as_deref(), Some("key/id"));
        assert_eq!(config.access_key_secret.as_deref(), Some("se@cret"));
    }

    #[test]
    fn unknown_scheme_is_invalid() {
        assert!(matches!(
            backend_from_url("ftp://host/path"),
            Err(Error::InvalidUrl(_))
        ));
    }
}
