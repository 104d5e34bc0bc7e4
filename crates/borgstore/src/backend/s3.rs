//! S3 backend: objects under a bucket/prefix on AWS S3 or an
//! S3-compatible service, including Backblaze B2 (`s3` cargo feature).
//!
//! The async AWS SDK is confined behind a private current-thread runtime,
//! so the backend presents the same blocking surface as all others.

#[cfg(feature = "s3")]
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata};
#[cfg(feature = "s3")]
use aws_sdk_s3::primitives::ByteStream;
#[cfg(feature = "s3")]
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
#[cfg(feature = "s3")]
use aws_sdk_s3::Client;
#[cfg(feature = "s3")]
use bytes::Bytes;

#[cfg(feature = "s3")]
use super::{validate_name, Backend, ItemInfo};
#[cfg(feature = "s3")]
use crate::constants::TMP_SUFFIX;
#[cfg(feature = "s3")]
use crate::error::{Error, Result};

/// Connection parameters for the S3 backend, as parsed from an `s3:` or
/// `b2:` URL.
///
/// Credentials resolve explicit key/secret first, then the named profile,
/// then the SDK default chain (environment, shared config, IAM).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Bucket name.
    pub bucket: String,
    /// Key prefix below the bucket.
    pub path: String,
    /// Enables the B2 compatibility quirks (no CRC request checksums).
    pub is_b2: bool,
    /// Shared-config profile to use.
    pub profile: Option<String>,
    /// Explicit access key id (with [`access_key_secret`](Self::access_key_secret)).
    pub access_key_id: Option<String>,
    /// Explicit secret access key.
    pub access_key_secret: Option<String>,
    /// Custom endpoint, e.g. for MinIO or B2; `None` means AWS.
    pub endpoint_url: Option<String>,
}

/// Backend for `s3:`/`b2:` URLs.
#[cfg(feature = "s3")]
pub struct S3 {
    base_path: String,
    bucket: String,
    runtime: tokio::runtime::Runtime,
    client: Client,
    opened: bool,
}

#[cfg(feature = "s3")]
impl S3 {
    /// Creates a backend and its SDK client for the given parameters.
    pub fn new(config: S3Config) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::Backend(format!("cannot build s3 runtime: {err}")))?;
        let client = runtime.block_on(Self::build_client(&config));
        Ok(Self {
            base_path: format!("{}/", config.path.trim_end_matches('/')),
            bucket: config.bucket,
            runtime,
            client,
            opened: false,
        })
    }

    async fn build_client(config: &S3Config) -> Client {
        let region = aws_config::meta::region::RegionProviderChain::default_provider()
            .or_else(aws_config::Region::new("us-east-1"));
        let mut loader =
            aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);
        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }
        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.access_key_secret) {
            loader = loader.credentials_provider(aws_sdk_s3::config::Credentials::new(
                key_id, secret, None, None, "borgstore-url",
            ));
        }
        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint_url {
            // path-style addressing: custom endpoints rarely offer
            // per-bucket virtual hosts
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        if config.is_b2 {
            // B2 rejects the CRC request checksums newer SDKs send by
            // default
            builder = builder
                .request_checksum_calculation(
                    aws_sdk_s3::config::RequestChecksumCalculation::WhenRequired,
                )
                .response_checksum_validation(
                    aws_sdk_s3::config::ResponseChecksumValidation::WhenRequired,
                );
        }
        Client::from_conf(builder.build())
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

    fn key_for(&self, name: &str) -> String {
        format!("{}{name}", self.base_path)
    }

    fn dir_key_for(&self, name: &str) -> String {
        let key = self.key_for(name);
        format!("{}/", key.trim_end_matches('/'))
    }

    fn put_marker(&self, name: &str) -> Result<()> {
        let key = self.dir_key_for(name);
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .body(ByteStream::from_static(b""))
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    /// Non-recursive listing of one "directory" prefix, following
    /// continuation tokens.
    fn list_dir(&self, name: &str) -> Result<Vec<ItemInfo>> {
        let prefix = self.dir_key_for(name);
        let mut items = Vec::new();
        let mut continuation: Option<String> = None;
        let mut first_page = true;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter("/")
                .max_keys(1000);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = self.runtime.block_on(request.send()).map_err(|err| {
                Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err)))
            })?;
            if first_page && response.key_count().unwrap_or(0) == 0 {
                return Err(Error::ObjectNotFound(name.to_string()));
            }
            first_page = false;
            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                let leaf = &key[prefix.len().min(key.len())..];
                if leaf.is_empty() || leaf.ends_with(TMP_SUFFIX) {
                    continue;
                }
                items.push(ItemInfo {
                    name: leaf.to_string(),
                    exists: true,
                    size: object.size().unwrap_or(0).max(0) as u64,
                    directory: false,
                });
            }
            for common in response.common_prefixes() {
                let Some(dir_prefix) = common.prefix() else {
                    continue;
                };
                let leaf = dir_prefix
                    .get(prefix.len()..)
                    .unwrap_or("")
                    .trim_end_matches('/');
                if !leaf.is_empty() {
                    items.push(ItemInfo {
                        name: leaf.to_string(),
                        exists: true,
                        size: 0,
                        directory: true,
                    });
                }
            }
            if response.is_truncated().unwrap_or(false) {
                continuation = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    fn head(&self, key: &str) -> Result<Option<u64>> {
        match self.runtime.block_on(
            self.client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send(),
        ) {
            Ok(response) => Ok(Some(response.content_length().unwrap_or(0).max(0) as u64)),
            Err(err) => {
                let not_found = err
                    .as_service_error()
                    .map_or(false, |service| service.is_not_found());
                if not_found {
                    Ok(None)
                } else {
                    Err(Error::Backend(format!(
                        "s3 error: {}",
                        DisplayErrorContext(&err)
                    )))
                }
            }
        }
    }
}

#[cfg(feature = "s3")]
impl Backend for S3 {
    fn create(&mut self) -> Result<()> {
        self.ensure_closed()?;
        let response = self.runtime.block_on(
            self.client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.base_path)
                .delimiter("/")
                .max_keys(1)
                .send(),
        );
        match response {
            Ok(response) => {
                if response.key_count().unwrap_or(0) > 0 {
                    return Err(Error::BackendAlreadyExists(format!(
                        "s3 storage base path is not empty: {}",
                        self.base_path
                    )));
                }
            }
            Err(err) => {
                let no_bucket = err
                    .as_service_error()
                    .map_or(false, |service| service.is_no_such_bucket());
                if no_bucket {
                    return Err(Error::BackendDoesNotExist(format!(
                        "s3 bucket does not exist: {}",
                        self.bucket
                    )));
                }
                return Err(Error::Backend(format!(
                    "s3 error: {}",
                    DisplayErrorContext(&err)
                )));
            }
        }
        self.put_marker("")
    }

    fn destroy(&mut self) -> Result<()> {
        self.ensure_closed()?;
        let mut first_page = true;
        loop {
            let response = self
                .runtime
                .block_on(
                    self.client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(&self.base_path)
                        .max_keys(1000)
                        .send(),
                )
                .map_err(|err| {
                    Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err)))
                })?;
            if first_page && response.key_count().unwrap_or(0) == 0 {
                return Err(Error::BackendDoesNotExist(format!(
                    "s3 storage base path does not exist: {}",
                    self.base_path
                )));
            }
            first_page = false;
            let keys: Vec<ObjectIdentifier> = response
                .contents()
                .iter()
                .filter_map(|object| object.key())
                .filter_map(|key| ObjectIdentifier::builder().key(key).build().ok())
                .collect();
            if keys.is_empty() {
                return Ok(());
            }
            let delete = Delete::builder()
                .set_objects(Some(keys))
                .build()
                .map_err(|err| Error::Backend(format!("s3 error: {err}")))?;
            self.runtime
                .block_on(
                    self.client
                        .delete_objects()
                        .bucket(&self.bucket)
                        .delete(delete)
                        .send(),
                )
                .map_err(|err| {
                    Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err)))
                })?;
            if !response.is_truncated().unwrap_or(false) {
                return Ok(());
            }
        }
    }

    fn open(&mut self) -> Result<()> {
        self.ensure_closed()?;
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        Ok(())
    }

    fn mkdir(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;
        self.put_marker(name)
    }

    fn rmdir(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;
        let prefix = self.dir_key_for(name);
        let response = self
            .runtime
            .block_on(
                self.client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(&prefix)
                    .delimiter("/")
                    .max_keys(2)
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        let children = response
            .contents()
            .iter()
            .filter(|object| object.key() != Some(prefix.as_str()))
            .count();
        if children > 0 || !response.common_prefixes().is_empty() {
            return Err(Error::Backend(format!("directory not empty: {name}")));
        }
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&prefix)
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    fn info(&self, name: &str) -> Result<ItemInfo> {
        self.ensure_open()?;
        validate_name(name)?;
        let leaf = name.rsplit('/').next().unwrap_or(name);
        if let Some(size) = self.head(&self.key_for(name))? {
            return Ok(ItemInfo {
                name: leaf.to_string(),
                exists: true,
                size,
                directory: false,
            });
        }
        if self.head(&self.dir_key_for(name))?.is_some() {
            return Ok(ItemInfo {
                name: leaf.to_string(),
                exists: true,
                size: 0,
                directory: true,
            });
        }
        Ok(ItemInfo::missing(leaf))
    }

    fn load(&self, name: &str, offset: u64, size: Option<u64>) -> Result<Bytes> {
        self.ensure_open()?;
        validate_name(name)?;
        if size == Some(0) {
            return Ok(Bytes::new());
        }
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(name));
        if offset > 0 || size.is_some() {
            request = request.range(match size {
                Some(size) => format!("bytes={offset}-{}", offset + size - 1),
                None => format!("bytes={offset}-"),
            });
        }
        let response = match self.runtime.block_on(request.send()) {
            Ok(response) => response,
            Err(err) => {
                if err
                    .as_service_error()
                    .map_or(false, |service| service.is_no_such_key())
                {
                    return Err(Error::ObjectNotFound(name.to_string()));
                }
                // a range fully past EOF yields no bytes, not an error
                if err.as_service_error().and_then(|service| service.code())
                    == Some("InvalidRange")
                {
                    return Ok(Bytes::new());
                }
                return Err(Error::Backend(format!(
                    "s3 error: {}",
                    DisplayErrorContext(&err)
                )));
            }
        };
        let data = self
            .runtime
            .block_on(response.body.collect())
            .map_err(|err| Error::Backend(format!("s3 read error: {err}")))?;
        Ok(data.into_bytes())
    }

    fn store(&self, name: &str, value: &[u8]) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;
        self.runtime
            .block_on(
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(self.key_for(name))
                    .body(ByteStream::from(value.to_vec()))
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        validate_name(name)?;
        let key = self.key_for(name);
        if self.head(&key)?.is_none() {
            return Err(Error::ObjectNotFound(name.to_string()));
        }
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        self.ensure_open()?;
        validate_name(src)?;
        validate_name(dst)?;
        let src_key = self.key_for(src);
        let dst_key = self.key_for(dst);
        if self.head(&dst_key)?.is_some() {
            return Err(Error::ObjectAlreadyExists(dst.to_string()));
        }
        // copy + delete: S3 has no native rename, so this pair is NOT
        // atomic
        let copied = self.runtime.block_on(
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(format!("{}/{src_key}", self.bucket))
                .key(&dst_key)
                .send(),
        );
        if let Err(err) = copied {
            let missing = err.as_service_error().map_or(false, |service| {
                service.code() == Some("NoSuchKey") || service.code() == Some("404")
            });
            if missing {
                return Err(Error::ObjectNotFound(src.to_string()));
            }
            return Err(Error::Backend(format!(
                "s3 error: {}",
                DisplayErrorContext(&err)
            )));
        }
        self.runtime
            .block_on(
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&src_key)
                    .send(),
            )
            .map_err(|err| Error::Backend(format!("s3 error: {}", DisplayErrorContext(&err))))?;
        Ok(())
    }

    fn list(&self, name: &str) -> Result<Vec<ItemInfo>> {
        self.ensure_open()?;
        validate_name(name)?;
        self.list_dir(name)
    }
}
