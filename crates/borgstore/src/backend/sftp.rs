//! SFTP backend: files in directories below a base path on an SFTP
//! server (`sftp` cargo feature).

#[cfg(feature = "sftp")]
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
#[cfg(feature = "sftp")]
use std::net::TcpStream;
#[cfg(feature = "sftp")]
use std::path::{Path, PathBuf};

#[cfg(feature = "sftp")]
use bytes::Bytes;
#[cfg(feature = "sftp")]
use rand::distributions::Alphanumeric;
#[cfg(feature = "sftp")]
use rand::Rng;
#[cfg(feature = "sftp")]
use ssh2::{CheckResult, ErrorCode, KnownHostFileKind, RenameFlags, Session};
#[cfg(feature = "sftp")]
use ssh2_config::{ParseRule, SshConfig};

#[cfg(feature = "sftp")]
use super::{validate_name, Backend, ItemInfo};
#[cfg(feature = "sftp")]
use crate::constants::TMP_SUFFIX;
#[cfg(feature = "sftp")]
use crate::error::{Error, Result};

/// Connection parameters for the SFTP backend, as parsed from an
/// `sftp://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SftpConfig {
    /// Login name; resolved via the ssh config or the current user when
    /// absent.
    pub username: Option<String>,
    /// Host name (possibly an alias defined in the ssh config).
    pub hostname: String,
    /// TCP port; 0 means "not given" (ssh config or 22 apply).
    pub port: u16,
    /// Base path on the server; server-relative unless it starts with
    /// `/`.
    pub path: String,
}

/// libssh2 SFTP status code for a missing file.
#[cfg(feature = "sftp")]
const FX_NO_SUCH_FILE: i32 = 2;

/// Backend for `sftp://` URLs.
///
/// Host keys are trusted via the user's `known_hosts` only: there is no
/// auto-accept; make first contact to a new host with the ssh/sftp CLI
/// and verify its fingerprint interactively. Key and host name resolution
/// honors `/etc/ssh/ssh_config` and `~/.ssh/config`.
#[cfg(feature = "sftp")]
pub struct Sftp {
    config: SftpConfig,
    conn: Option<Conn>,
}

#[cfg(feature = "sftp")]
struct Conn {
    sftp: ssh2::Sftp,
    // field order keeps the sftp channel dropping before its session
    _session: Session,
    base: PathBuf,
}

#[cfg(feature = "sftp")]
#[derive(Default)]
struct HostConfig {
    hostname: Option<String>,
    username: Option<String>,
    port: Option<u16>,
    identity_files: Vec<PathBuf>,
}

#[cfg(feature = "sftp")]
impl HostConfig {
    fn merge_file(&mut self, path: &Path, host: &str) {
        let Ok(file) = std::fs::File::open(path) else {
            return;
        };
        let mut reader = BufReader::new(file);
        let Ok(config) = SshConfig::default().parse(&mut reader, ParseRule::ALLOW_UNKNOWN_FIELDS)
        else {
            return;
        };
        let params = config.query(host);
        if let Some(host_name) = params.host_name {
            self.hostname = Some(host_name);
        }
        if let Some(user) = params.user {
            self.username = Some(user);
        }
        if let Some(port) = params.port {
            self.port = Some(port);
        }
        if let Some(identity_files) = params.identity_file {
            self.identity_files = identity_files;
        }
    }
}

#[cfg(feature = "sftp")]
fn backend_err(err: ssh2::Error) -> Error {
    Error::Backend(format!("sftp error: {err}"))
}

#[cfg(feature = "sftp")]
fn is_not_found(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::SFTP(FX_NO_SUCH_FILE))
}

#[cfg(feature = "sftp")]
impl Sftp {
    /// Creates a backend for the given connection parameters.
    pub fn new(config: SftpConfig) -> Self {
        Self { config, conn: None }
    }

    fn conn(&self) -> Result<&Conn> {
        self.conn.as_ref().ok_or(Error::BackendMustBeOpen)
    }

    /// Assembles the effective host configuration: system ssh config,
    /// then user ssh config, then the values given in the URL.
    fn host_config(&self) -> HostConfig {
        let mut resolved = HostConfig::default();
        resolved.merge_file(Path::new("/etc/ssh/ssh_config"), &self.config.hostname);
        if let Some(home) = dirs::home_dir() {
            resolved.merge_file(&home.join(".ssh").join("config"), &self.config.hostname);
        }
        if let Some(username) = &self.config.username {
            resolved.username = Some(username.clone());
        }
        if self.config.port != 0 {
            resolved.port = Some(self.config.port);
        }
        resolved
    }

    fn check_known_hosts(session: &Session, hostname: &str, port: u16) -> Result<()> {
        let mut known_hosts = session.known_hosts().map_err(backend_err)?;
        let file = dirs::home_dir()
            .map(|home| home.join(".ssh").join("known_hosts"))
            .ok_or_else(|| Error::Backend("cannot determine the home directory".into()))?;
        known_hosts
            .read_file(&file, KnownHostFileKind::OpenSSH)
            .map_err(|err| Error::Backend(format!("cannot read {}: {err}", file.display())))?;
        let (key, _) = session
            .host_key()
            .ok_or_else(|| Error::Backend("sftp server sent no host key".into()))?;
        match known_hosts.check_port(hostname, port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(Error::Backend(format!(
                "unknown host key for {hostname}: make first contact with the ssh/sftp CLI \
                 and verify the fingerprint interactively"
            ))),
            CheckResult::Mismatch => Err(Error::Backend(format!(
                "host key mismatch for {hostname}"
            ))),
            CheckResult::Failure => Err(Error::Backend(format!(
                "host key check failed for {hostname}"
            ))),
        }
    }

    fn connect(&self) -> Result<Conn> {
        let host = self.host_config();
        let hostname = host.hostname.as_deref().unwrap_or(&self.config.hostname);
        let port = host.port.unwrap_or(22);
        let username = host
            .username
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("USERNAME").ok())
            .ok_or_else(|| Error::Backend("no sftp username given or configured".into()))?;
        let tcp = TcpStream::connect((hostname, port))
            .map_err(|err| Error::Backend(format!("cannot connect to {hostname}:{port}: {err}")))?;
        let mut session = Session::new().map_err(backend_err)?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(backend_err)?;
        Self::check_known_hosts(&session, hostname, port)?;
        // prefer the agent like the ssh CLI, then the configured keys
        if session.userauth_agent(&username).is_err() {
            let authenticated = host.identity_files.iter().any(|identity| {
                session
                    .userauth_pubkey_file(&username, None, identity, None)
                    .is_ok()
            });
            if !authenticated {
                return Err(Error::Backend(format!(
                    "sftp authentication failed for {username}@{hostname}"
                )));
            }
        }
        let sftp = session.sftp().map_err(backend_err)?;
        Ok(Conn {
            sftp,
            _session: session,
            base: PathBuf::from(&self.config.path),
        })
    }

    fn full_path(conn: &Conn, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        Ok(if name.is_empty() {
            conn.base.clone()
        } else {
            conn.base.join(name)
        })
    }

    /// `mkdir -p`, ignoring already existing directories.
    fn mkdir_parents(conn: &Conn, path: &Path) {
        let mut parents: Vec<&Path> = path.ancestors().skip(1).collect();
        parents.reverse();
        for parent in parents {
            if !parent.as_os_str().is_empty() {
                let _ = conn.sftp.mkdir(parent, 0o700);
            }
        }
        let _ = conn.sftp.mkdir(path, 0o700);
    }

    fn delete_recursive(conn: &Conn, path: &Path) -> Result<()> {
        for (child, stat) in conn.sftp.readdir(path).map_err(backend_err)? {
            if stat.is_dir() {
                Self::delete_recursive(conn, &child)?;
            } else {
                conn.sftp.unlink(&child).map_err(backend_err)?;
            }
        }
        conn.sftp.rmdir(path).map_err(backend_err)
    }
}

#[cfg(feature = "sftp")]
impl Backend for Sftp {
    fn create(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        let conn = self.connect()?;
        // an already existing directory is accepted, but parent dirs are
        // not created here
        if let Err(err) = conn.sftp.mkdir(&conn.base, 0o700) {
            match conn.sftp.stat(&conn.base) {
                Ok(stat) if stat.is_dir() => {}
                _ => {
                    return Err(Error::Backend(format!(
                        "sftp storage base path cannot be created (missing parent?): {}: {err}",
                        conn.base.display()
                    )))
                }
            }
        }
        let contents = conn.sftp.readdir(&conn.base).map_err(backend_err)?;
        if !contents.is_empty() {
            return Err(Error::BackendAlreadyExists(format!(
                "sftp storage base path is not empty: {}",
                conn.base.display()
            )));
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        let conn = self.connect()?;
        match conn.sftp.stat(&conn.base) {
            Ok(_) => Self::delete_recursive(&conn, &conn.base),
            Err(err) if is_not_found(&err) => Err(Error::BackendDoesNotExist(format!(
                "sftp storage base path does not exist: {}",
                conn.base.display()
            ))),
            Err(err) => Err(backend_err(err)),
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        let conn = self.connect()?;
        match conn.sftp.stat(&conn.base) {
            Ok(stat) if stat.is_dir() => {}
            Ok(_) | Err(_) => {
                return Err(Error::BackendDoesNotExist(format!(
                    "sftp storage base path does not exist or is not a directory: {}",
                    conn.base.display()
                )))
            }
        }
        self.conn = Some(conn);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // dropping the connection closes the sftp channel and session
        self.conn = None;
        Ok(())
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        Self::mkdir_parents(conn, &path);
        Ok(())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        conn.sftp.rmdir(&path).map_err(|err| {
            if is_not_found(&err) {
                Error::ObjectNotFound(name.to_string())
            } else {
                backend_err(err)
            }
        })
    }

    fn info(&self, name: &str) -> Result<ItemInfo> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        let leaf = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match conn.sftp.stat(&path) {
            Ok(stat) => Ok(ItemInfo {
                name: leaf,
                exists: true,
                size: if stat.is_dir() {
                    0
                } else {
                    stat.size.unwrap_or(0)
                },
                directory: stat.is_dir(),
            }),
            Err(err) if is_not_found(&err) => Ok(ItemInfo::missing(leaf)),
            Err(err) => Err(backend_err(err)),
        }
    }

    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        let mut file = conn.sftp.open(&path).map_err(|err| {
            if is_not_found(&err) {
                Error::ObjectNotFound(name.to_string())
            } else {
                backend_err(err)
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
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        let dir = path.parent().unwrap_or(&conn.base).to_path_buf();
        Self::mkdir_parents(conn, &dir);
        // write to a differently named temp file in the same directory
        // first, so the store never sees partially written data
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect::<String>()
            .to_lowercase();
        let tmp_path = dir.join(format!("{token}{TMP_SUFFIX}"));
        {
            let mut tmp = conn.sftp.create(&tmp_path).map_err(backend_err)?;
            if let Err(err) = tmp.write_all(value) {
                drop(tmp);
                let _ = conn.sftp.unlink(&tmp_path);
                return Err(err.into());
            }
        }
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        if let Err(err) = conn.sftp.rename(&tmp_path, &path, Some(flags)) {
            let _ = conn.sftp.unlink(&tmp_path);
            return Err(backend_err(err));
        }
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        conn.sftp.unlink(&path).map_err(|err| {
            if is_not_found(&err) {
                Error::ObjectNotFound(name.to_string())
            } else {
                backend_err(err)
            }
        })
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let conn = self.conn()?;
        let src_path = Self::full_path(conn, src)?;
        let dst_path = Self::full_path(conn, dst)?;
        if conn.sftp.stat(&dst_path).is_ok() {
            return Err(Error::ObjectAlreadyExists(dst.to_string()));
        }
        if let Some(parent) = dst_path.parent() {
            Self::mkdir_parents(conn, parent);
        }
        let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
        conn.sftp
            .rename(&src_path, &dst_path, Some(flags))
            .map_err(|err| {
                if is_not_found(&err) {
                    Error::ObjectNotFound(src.to_string())
                } else {
                    backend_err(err)
                }
            })
    }

    fn list(&self, name: &str) -> Result<Vec<ItemInfo>> {
        let conn = self.conn()?;
        let path = Self::full_path(conn, name)?;
        let entries = conn.sftp.readdir(&path).map_err(|err| {
            if is_not_found(&err) {
                Error::ObjectNotFound(name.to_string())
            } else {
                backend_err(err)
            }
        })?;
        let mut items = Vec::new();
        for (child, stat) in entries {
            let Some(leaf) = child.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if leaf.ends_with(TMP_SUFFIX) {
                continue;
            }
            items.push(ItemInfo {
                name: leaf,
                exists: true,
                size: if stat.is_dir() {
                    0
                } else {
                    stat.size.unwrap_or(0)
                },
                directory: stat.is_dir(),
            });
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}
