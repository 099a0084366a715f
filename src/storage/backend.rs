//! Abstract storage backend trait.
//!
//! Every provider adapter must implement [`StorageBackend`].  The trait
//! speaks only in the neutral types defined here ([`ObjectMeta`],
//! [`ObjectInfo`], [`WriteCondition`]) and the neutral
//! [`StoreError`](crate::errors::StoreError) taxonomy, so no provider
//! type ever leaks to callers.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::config::BackendType;
use crate::errors::{Result, StoreError};

/// Boxed future returned by backend operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Version-identifying metadata of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectMeta {
    /// Opaque version token. Empty means the write was unversioned and
    /// cannot be used to build a precondition.
    pub etag: String,
    /// Native object generation; 0 when the backend has none (S3, Azure).
    pub generation: i64,
    /// Size in bytes.
    pub size: u64,
    /// Last-modified timestamp as reported by the provider.
    pub last_modified: Option<String>,
    /// Stored content type, if the provider reports one.
    pub content_type: Option<String>,
}

impl ObjectMeta {
    /// Whether this metadata carries any token a precondition can be built from.
    pub fn has_version(&self) -> bool {
        !self.etag.is_empty() || self.generation > 0
    }

    /// Whether two metadata values name the same stored version.
    pub fn same_version(&self, other: &ObjectMeta) -> bool {
        self.etag == other.etag && self.generation == other.generation
    }
}

/// A stored object's data plus its version metadata, read atomically.
#[derive(Debug, Clone)]
pub struct StoredObject {
    /// Raw bytes of the object.
    pub data: Bytes,
    /// Metadata describing the version `data` was read from.
    pub meta: ObjectMeta,
}

/// A listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Key relative to the target prefix.
    pub key: String,
    pub size: u64,
    pub etag: String,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectInfo>,
    /// Continuation token for the next page; `None` on the last page.
    pub next_token: Option<String>,
}

/// Non-conditional write hints. Carries no concurrency semantics.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Content type to store with the object.
    pub content_type: Option<String>,
    /// User metadata key/value pairs.
    pub metadata: BTreeMap<String, String>,
    /// Overrides the target's configured KMS key for this write.
    pub kms_key: Option<String>,
}

impl PutOptions {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Content type to send, defaulting to `application/octet-stream`.
    pub fn content_type_or_default(&self) -> &str {
        self.content_type
            .as_deref()
            .unwrap_or("application/octet-stream")
    }
}

/// A backend-neutral precondition for a conditional write.
///
/// Exactly one kind of token is carried per condition; the condition
/// translator maps it onto the provider's native primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// The object's current ETag must equal this value.
    ByETag(String),
    /// The object's current generation must equal this value. The reserved
    /// sentinel `0` means "the object must not exist yet".
    ByGeneration(i64),
    /// The caller must hold this lease on the object.
    ByLease(String),
}

impl WriteCondition {
    /// Create-only condition: succeeds only if the key does not exist.
    pub fn must_not_exist() -> Self {
        WriteCondition::ByGeneration(0)
    }

    /// Whether this is the create-only sentinel.
    pub fn is_create_only(&self) -> bool {
        matches!(self, WriteCondition::ByGeneration(0))
    }

    /// Build the natural "still at this version" condition for `backend`
    /// from metadata returned by an earlier read or write.
    ///
    /// GCS-like backends compare generations; every other backend compares
    /// ETags. Fails with [`StoreError::PreconditionUnavailable`] if the
    /// metadata carries no usable token.
    pub fn from_meta(key: &str, meta: &ObjectMeta, backend: BackendType) -> Result<Self> {
        match backend {
            BackendType::Gcs if meta.generation > 0 => {
                Ok(WriteCondition::ByGeneration(meta.generation))
            }
            BackendType::Memory if meta.generation > 0 => {
                Ok(WriteCondition::ByGeneration(meta.generation))
            }
            BackendType::S3 | BackendType::Azure if !meta.etag.is_empty() => {
                Ok(WriteCondition::ByETag(meta.etag.clone()))
            }
            _ => Err(StoreError::PreconditionUnavailable {
                key: key.to_string(),
            }),
        }
    }
}

impl fmt::Display for WriteCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteCondition::ByETag(etag) => write!(f, "if-match {etag}"),
            WriteCondition::ByGeneration(0) => write!(f, "must-not-exist"),
            WriteCondition::ByGeneration(generation) => write!(f, "if-generation {generation}"),
            WriteCondition::ByLease(_) => write!(f, "lease"),
        }
    }
}

/// Async object storage contract with conditional writes.
pub trait StorageBackend: Send + Sync + 'static {
    /// Which provider family this adapter talks to.
    fn backend_type(&self) -> BackendType;

    /// Unconditionally write `data` to `key`.
    fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta>;

    /// Read the object at `key` together with the version it was read at.
    fn get(&self, key: &str) -> StoreFuture<'_, StoredObject>;

    /// Read only the metadata of the object at `key`.
    fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta>;

    /// Delete the object at `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> StoreFuture<'_, ()>;

    /// List one page of objects under `prefix`, starting at `token`
    /// (`None` for the first page). Each page is a single provider request.
    fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage>;

    /// Write `data` only if `condition` holds, evaluated atomically by the
    /// provider.
    fn conditional_put(
        &self,
        key: &str,
        data: Bytes,
        condition: &WriteCondition,
        opts: &PutOptions,
    ) -> StoreFuture<'_, ObjectMeta>;

    /// Lease operations, for backends that offer them.
    fn leases(&self) -> Option<&dyn LeaseManager> {
        None
    }
}

/// Pessimistic exclusive-write windows (Azure blob leases).
pub trait LeaseManager: Send + Sync {
    /// Acquire a lease on an existing object. `duration` of `None` requests
    /// an infinite lease. Returns the lease ID.
    fn acquire_lease(
        &self,
        key: &str,
        duration: Option<Duration>,
        proposed_id: Option<String>,
    ) -> StoreFuture<'_, String>;

    fn renew_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()>;

    fn release_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()>;

    /// Break whatever lease is held, immediately.
    fn break_lease(&self, key: &str) -> StoreFuture<'_, ()>;

    /// Delete the object only while `lease_id` is the lease held on it.
    /// Deleting a missing key succeeds.
    fn delete_with_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()>;
}

/// Provider-side listing prefix for a `prefix` relative to the target
/// prefix. An empty `prefix` lists everything under the target prefix.
pub fn list_prefix(target_prefix: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        let base = target_prefix.trim_end_matches('/');
        if base.is_empty() {
            String::new()
        } else {
            format!("{base}/")
        }
    } else {
        object_name(target_prefix, prefix)
    }
}

/// Join a target prefix and a relative key into the provider object name.
///
/// The prefix is normalised to end with exactly one `/`; an empty prefix
/// leaves the key unchanged.
pub fn object_name(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let key = key.trim_start_matches('/');
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}/{key}")
    }
}

/// Strip a target prefix from a provider object name. Returns `None` for
/// names outside the prefix.
pub fn relative_key<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return Some(name);
    }
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
}

/// Ensure an ETag is wrapped in double quotes, the form providers return
/// in response headers and accept in `If-Match`.
pub fn quote_etag(etag: &str) -> String {
    if etag.is_empty() || (etag.starts_with('"') && etag.ends_with('"') && etag.len() >= 2) {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}
