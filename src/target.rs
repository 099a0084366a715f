//! Target facade.
//!
//! A [`Target`] is a named, immutable handle to one storage backend.  It
//! validates its configuration before any client is built, owns the
//! adapter, and routes every operation through the target's
//! [`RetryExecutor`] so retries, deadlines, admission and cancellation
//! apply uniformly.  `Target` is `Send + Sync`; share it with `Arc`.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cancel::CancelToken;
use crate::config::{BackendType, TargetConfig};
use crate::errors::{Result, StoreError};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::storage::aws::S3Backend;
use crate::storage::azure::AzureBackend;
use crate::storage::backend::{
    LeaseManager, ObjectInfo, ObjectMeta, PutOptions, StorageBackend, StoredObject,
    WriteCondition,
};
use crate::storage::gcp::GcsBackend;
use crate::storage::memory::MemoryBackend;

/// Named handle to one backend.
pub struct Target {
    name: String,
    backend: Arc<dyn StorageBackend>,
    executor: RetryExecutor,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("backend_type", &self.backend.backend_type())
            .field("policy", self.executor.policy())
            .finish()
    }
}

impl Target {
    /// Validate `config` and build the adapter it names.
    ///
    /// Fails with [`StoreError::Config`] before constructing any client if
    /// the configuration is invalid.
    pub async fn new(config: TargetConfig) -> Result<Self> {
        let backend_type = config.validate()?;
        let backend: Arc<dyn StorageBackend> = match backend_type {
            BackendType::S3 => Arc::new(S3Backend::new(&config).await?),
            BackendType::Azure => Arc::new(AzureBackend::new(&config)?),
            BackendType::Gcs => Arc::new(GcsBackend::new(&config)?),
            BackendType::Memory => Arc::new(MemoryBackend::new(&config.name, &config.prefix)),
        };
        info!(
            "Target '{}' ready: type={} max_concurrency={} max_retries={} timeout={}s",
            config.name,
            backend_type,
            config.max_concurrency,
            config.max_retries,
            config.timeout_seconds
        );
        Ok(Self::from_backend(
            config.name.clone(),
            backend,
            RetryPolicy::from_config(&config),
        ))
    }

    /// Wrap an already-constructed adapter.
    pub fn from_backend(
        name: impl Into<String>,
        backend: Arc<dyn StorageBackend>,
        policy: RetryPolicy,
    ) -> Self {
        let name = name.into();
        let executor = RetryExecutor::new(name.clone(), policy);
        Self {
            name,
            backend,
            executor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend.backend_type()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.executor.policy()
    }

    /// Unconditionally write `data` to `key`.
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        opts: &PutOptions,
        cancel: &CancelToken,
    ) -> Result<ObjectMeta> {
        self.executor
            .run("put", key, cancel, || self.backend.put(key, data.clone(), opts))
            .await
    }

    /// Read `key` and the version it was read at.
    pub async fn get(&self, key: &str, cancel: &CancelToken) -> Result<StoredObject> {
        self.executor
            .run("get", key, cancel, || self.backend.get(key))
            .await
    }

    pub async fn head(&self, key: &str, cancel: &CancelToken) -> Result<ObjectMeta> {
        self.executor
            .run("head", key, cancel, || self.backend.head(key))
            .await
    }

    /// Delete `key`. Deleting a missing key succeeds.
    pub async fn delete(&self, key: &str, cancel: &CancelToken) -> Result<()> {
        self.executor
            .run("delete", key, cancel, || self.backend.delete(key))
            .await
    }

    /// List every object under `prefix` (relative to the target prefix).
    ///
    /// Pages are fetched one request at a time; retries and the deadline
    /// apply to each page, so a retried page resumes from its own token.
    pub async fn list(&self, prefix: &str, cancel: &CancelToken) -> Result<Vec<ObjectInfo>> {
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .executor
                .run("list", prefix, cancel, || {
                    self.backend.list_page(prefix, token.as_deref())
                })
                .await?;
            entries.extend(page.entries);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(entries)
    }

    /// Write `data` only if `condition` holds at the backend.
    pub async fn conditional_put(
        &self,
        key: &str,
        data: Bytes,
        condition: &WriteCondition,
        opts: &PutOptions,
        cancel: &CancelToken,
    ) -> Result<ObjectMeta> {
        self.executor
            .run("conditional_put", key, cancel, || {
                self.backend.conditional_put(key, data.clone(), condition, opts)
            })
            .await
    }

    /// Whether the backend offers blob leases.
    pub fn supports_leases(&self) -> bool {
        self.backend.leases().is_some()
    }

    fn lease_manager(&self) -> Result<&dyn LeaseManager> {
        self.backend
            .leases()
            .ok_or_else(|| StoreError::UnsupportedCondition {
                backend: self.backend_type(),
                condition: WriteCondition::ByLease(String::new()).to_string(),
            })
    }

    /// Acquire a lease on an existing object. `duration` of `None` requests
    /// an infinite lease. Returns the lease ID.
    pub async fn acquire_lease(
        &self,
        key: &str,
        duration: Option<Duration>,
        proposed_id: Option<String>,
        cancel: &CancelToken,
    ) -> Result<String> {
        let leases = self.lease_manager()?;
        // Fix the ID up front so a retried acquire re-acquires our own lease.
        let proposed = proposed_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        self.executor
            .run("acquire_lease", key, cancel, || {
                leases.acquire_lease(key, duration, Some(proposed.clone()))
            })
            .await
    }

    pub async fn renew_lease(
        &self,
        key: &str,
        lease_id: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let leases = self.lease_manager()?;
        self.executor
            .run("renew_lease", key, cancel, || leases.renew_lease(key, lease_id))
            .await
    }

    pub async fn release_lease(
        &self,
        key: &str,
        lease_id: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let leases = self.lease_manager()?;
        self.executor
            .run("release_lease", key, cancel, || leases.release_lease(key, lease_id))
            .await
    }

    /// Delete `key` only while `lease_id` is the lease held on it.
    pub async fn delete_with_lease(
        &self,
        key: &str,
        lease_id: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let leases = self.lease_manager()?;
        self.executor
            .run("delete", key, cancel, || leases.delete_with_lease(key, lease_id))
            .await
    }

    /// Break whatever lease is held on `key`, immediately.
    pub async fn break_lease(&self, key: &str, cancel: &CancelToken) -> Result<()> {
        let leases = self.lease_manager()?;
        self.executor
            .run("break_lease", key, cancel, || leases.break_lease(key))
            .await
    }
}
