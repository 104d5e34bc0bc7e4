//! rclone backend: drives an `rclone rcd` subprocess over its rc API,
//! reaching any remote rclone supports.

use std::net::{TcpListener, TcpStream};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use bytes::Bytes;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};

use super::{validate_name, Backend, ItemInfo};
use crate::constants::TMP_SUFFIX;
use crate::error::{Error, Result};

const HOST: &str = "127.0.0.1";

/// Try failed load/store operations this many times. rclone retries all
/// operations internally except those which stream data.
const TRIES: usize = 3;

/// Minimum rclone version offering the rc commands used here.
const MIN_VERSION: [u64; 3] = [1, 57, 0];

/// Backend for `rclone:remote:path` URLs.
///
/// [`open`](Backend::open) starts a private `rclone rcd` on a random
/// loopback port with one-shot credentials; all operations go through its
/// HTTP rc API. The binary is taken from `RCLONE_BINARY` (default
/// `rclone`).
pub struct Rclone {
    fs: String,
    binary: String,
    user: String,
    password: String,
    server: Option<Server>,
}

struct Server {
    process: Child,
    url: String,
    client: reqwest::blocking::Client,
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

impl Rclone {
    /// Creates a backend for the rclone filesystem string `remote`
    /// (`remote:` or `remote:path`).
    pub fn new(remote: impl Into<String>) -> Self {
        let mut fs = remote.into();
        if !fs.ends_with(':') && !fs.ends_with('/') {
            fs.push('/');
        }
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(32)
            .map(char::from)
            .collect();
        Self {
            fs,
            binary: std::env::var("RCLONE_BINARY").unwrap_or_else(|_| "rclone".to_string()),
            user: "borg".to_string(),
            password,
            server: None,
        }
    }

    fn server(&self) -> Result<&Server> {
        self.server.as_ref().ok_or(Error::BackendMustBeOpen)
    }

    /// Checks the binary exists and is recent enough to offer the rc
    /// commands used here.
    fn check_version(&self) -> Result<()> {
        let output = Command::new(&self.binary)
            .args(["rc", "--loopback", "core/version"])
            .stdin(Stdio::null())
            .output()
            .map_err(|_| {
                Error::BackendDoesNotExist(
                    "rclone binary not found on the path or not working properly".into(),
                )
            })?;
        let info: Value = serde_json::from_slice(&output.stdout).map_err(|_| {
            Error::BackendDoesNotExist(
                "rclone binary not found on the path or not working properly".into(),
            )
        })?;
        let decomposed: Vec<u64> = info["decomposed"]
            .as_array()
            .map(|parts| parts.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default();
        if decomposed.as_slice() < MIN_VERSION.as_slice() {
            return Err(Error::BackendDoesNotExist(format!(
                "rclone version must be at least v{}.{}.{} - found {}",
                MIN_VERSION[0], MIN_VERSION[1], MIN_VERSION[2], info["version"]
            )));
        }
        Ok(())
    }

    fn find_available_port() -> Result<u16> {
        let listener = TcpListener::bind((HOST, 0))?;
        Ok(listener.local_addr()?.port())
    }

    fn port_is_up(port: u16) -> bool {
        TcpStream::connect((HOST, port)).is_ok()
    }

    fn spawn_server(&self) -> Result<Server> {
        loop {
            let port = Self::find_available_port()?;
            let mut process = Command::new(&self.binary)
                .args([
                    "rcd",
                    "--rc-user",
                    &self.user,
                    "--rc-addr",
                    &format!("{HOST}:{port}"),
                    "--rc-serve",
                    "--use-server-modtime",
                ])
                // the password goes via the environment so it does not
                // show up in the process list
                .env("RCLONE_RC_PASS", &self.password)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|err| Error::Backend(format!("failed to start rclone rcd: {err}")))?;
            while process.try_wait()?.is_none() && !Self::port_is_up(port) {
                std::thread::sleep(Duration::from_millis(10));
            }
            if process.try_wait()?.is_none() {
                let client = reqwest::blocking::Client::builder()
                    .timeout(None::<Duration>)
                    .build()
                    .map_err(|err| Error::Backend(format!("failed to build HTTP client: {err}")))?;
                return Ok(Server {
                    process,
                    url: format!("http://{HOST}:{port}/"),
                    client,
                });
            }
            // rcd exited, most likely a port collision: pick another one
        }
    }

    /// One rc API round-trip. Retrying on transport errors is only done
    /// for the data-streaming load/store paths, which rclone does not
    /// retry internally.
    fn rpc(&self, command: &str, params: Value) -> Result<Value> {
        let server = self.server()?;
        let response = server
            .client
            .post(format!("{}{command}", server.url))
            .basic_auth(&self.user, Some(&self.password))
            .json(&params)
            .send()
            .map_err(|err| Error::Backend(format!("rclone rc request failed: {err}")))?;
        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .map_err(|err| Error::Backend(format!("rclone rc bad response: {err}")));
        }
        let text = response.text().unwrap_or_default();
        if status.as_u16() == 404 {
            return Err(Error::ObjectNotFound(format!(
                "not found: error {status}: {text}"
            )));
        }
        Err(Error::Backend(format!(
            "rclone rc command failed: error {status}: {text}"
        )))
    }

    fn stat_options() -> Value {
        json!({"recurse": false, "noModTime": true, "noMimeType": true})
    }

    fn item_info(name: &str, item: &Value) -> ItemInfo {
        if item.is_null() {
            let leaf = name.rsplit('/').next().unwrap_or(name);
            return ItemInfo::missing(leaf);
        }
        ItemInfo {
            name: item["Name"].as_str().unwrap_or_default().to_string(),
            exists: true,
            size: item["Size"].as_u64().unwrap_or(0),
            directory: item["IsDir"].as_bool().unwrap_or(false),
        }
    }
}

impl Backend for Rclone {
    fn create(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        self.open()?;
        let result = (|| {
            match self.list("") {
                Ok(items) if !items.is_empty() => {
                    return Err(Error::BackendAlreadyExists(format!(
                        "rclone storage base path exists and isn't empty: {}",
                        self.fs
                    )))
                }
                Ok(_) | Err(Error::ObjectNotFound(_)) => {}
                Err(err) => return Err(err),
            }
            self.mkdir("")
        })();
        let closed = self.close();
        result.and(closed)
    }

    fn destroy(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        self.open()?;
        let result = (|| {
            if !self.info("")?.exists {
                return Err(Error::BackendDoesNotExist(format!(
                    "rclone storage base path does not exist: {}",
                    self.fs
                )));
            }
            self.rpc("operations/purge", json!({"fs": self.fs, "remote": ""}))
                .map(|_| ())
        })();
        let closed = self.close();
        result.and(closed)
    }

    fn open(&mut self) -> Result<()> {
        if self.server.is_some() {
            return Err(Error::BackendMustNotBeOpen);
        }
        self.check_version()?;
        self.server = Some(self.spawn_server()?);
        // one round-trip to verify the server and our credentials work
        self.rpc("rc/noop", json!({"value": "ping"}))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        // dropping the server terminates the rcd subprocess
        self.server = None;
        Ok(())
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.rpc("operations/mkdir", json!({"fs": self.fs, "remote": name}))
            .map(|_| ())
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        self.rpc("operations/rmdir", json!({"fs": self.fs, "remote": name}))
            .map(|_| ())
    }

    fn info(&self, name: &str) -> Result<ItemInfo> {
        validate_name(name)?;
        let result = self.rpc(
            "operations/stat",
            json!({"fs": self.fs, "remote": name, "opt": Self::stat_options()}),
        );
        match result {
            Ok(value) => Ok(Self::item_info(name, &value["item"])),
            Err(Error::ObjectNotFound(_)) => Ok(Self::item_info(name, &Value::Null)),
            Err(err) => Err(err),
        }
    }

    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        validate_name(name)?;
        if size == Some(0) {
            return Ok(Bytes::new());
        }
        let server = self.server()?;
        let range = if offset > 0 || size.is_some() {
            Some(match size {
                Some(size) => format!("bytes={offset}-{}", offset + size - 1),
                None => format!("bytes={offset}-"),
            })
        } else {
            None
        };
        let mut last_err = Error::Backend("rclone load failed".into());
        for _ in 0..TRIES {
            let mut request = server
                .client
                .get(format!("{}[{}]/{name}", server.url, self.fs))
                .basic_auth(&self.user, Some(&self.password));
            if let Some(range) = &range {
                request = request.header(reqwest::header::RANGE, range);
            }
            let response = request
                .send()
                .map_err(|err| Error::Backend(format!("rclone rc request failed: {err}")))?;
            let status = response.status();
            if status.is_success() {
                let data = response
                    .bytes()
                    .map_err(|err| Error::Backend(format!("rclone rc bad response: {err}")))?;
                return Ok(data);
            }
            if status.as_u16() == 404 {
                return Err(Error::ObjectNotFound(name.to_string()));
            }
            last_err = Error::Backend(format!("rclone load failed: error {status}"));
            if status.as_u16() != 500 {
                break;
            }
        }
        Err(last_err)
    }

    fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        validate_name(name)?;
        let server = self.server()?;
        let (dir, leaf) = name.rsplit_once('/').unwrap_or(("", name));
        let mut last_err = Error::Backend("rclone store failed".into());
        for _ in 0..TRIES {
            let part = reqwest::blocking::multipart::Part::bytes(value.to_vec())
                .file_name(leaf.to_string())
                .mime_str("application/octet-stream")
                .map_err(|err| Error::Backend(format!("rclone upload failed: {err}")))?;
            let form = reqwest::blocking::multipart::Form::new().part("file", part);
            let response = server
                .client
                .post(format!("{}operations/uploadfile", server.url))
                .query(&[("fs", self.fs.as_str()), ("remote", dir)])
                .basic_auth(&self.user, Some(&self.password))
                .multipart(form)
                .send()
                .map_err(|err| Error::Backend(format!("rclone rc request failed: {err}")))?;
            let status = response.status();
            if status.is_success() {
                return Ok(());
            }
            let text = response.text().unwrap_or_default();
            last_err = Error::Backend(format!("rclone store failed: error {status}: {text}"));
            if status.as_u16() != 500 {
                break;
            }
        }
        Err(last_err)
    }

    fn delete(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        match self.rpc(
            "operations/deletefile",
            json!({"fs": self.fs, "remote": name}),
        ) {
            Ok(_) => Ok(()),
            Err(Error::ObjectNotFound(_)) => Err(Error::ObjectNotFound(name.to_string())),
            Err(err) => Err(err),
        }
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        validate_name(src)?;
        validate_name(dst)?;
        if self.info(dst)?.exists {
            return Err(Error::ObjectAlreadyExists(dst.to_string()));
        }
        match self.rpc(
            "operations/movefile",
            json!({"srcFs": self.fs, "srcRemote": src, "dstFs": self.fs, "dstRemote": dst}),
        ) {
            Ok(_) => Ok(()),
            Err(Error::ObjectNotFound(_)) => Err(Error::ObjectNotFound(src.to_string())),
            Err(err) => Err(err),
        }
    }

    fn list(&self, name: &str) -> Result<Vec<ItemInfo>> {
        validate_name(name)?;
        let result = self.rpc(
            "operations/list",
            json!({"fs": self.fs, "remote": name, "opt": Self::stat_options()}),
        )?;
        let mut items: Vec<ItemInfo> = result["list"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .map(|item| Self::item_info(name, item))
                    .filter(|item| !item.name.ends_with(TMP_SUFFIX))
                    .collect()
            })
            .unwrap_or_default();
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_gets_a_trailing_separator() {
        assert_eq!(Rclone::new("remote:").fs, "remote:");
        assert_eq!(Rclone::new("remote:path").fs, "remote:path/");
        assert_eq!(Rclone::new("remote:path/").fs, "remote:path/");
    }

    #[test]
    fn operations_require_open() {
        let be = Rclone::new("remote:path");
        assert!(matches!(be.list(""), Err(Error::BackendMustBeOpen)));
        assert!(matches!(
            be.load("key", 0, None),
            Err(Error::BackendMustBeOpen)
        ));
    }
}
