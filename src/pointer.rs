//! ACTIVE pointer manager.
//!
//! The pointer is a single small object whose payload names the currently
//! active state.  Writers move it `Absent -> Present(v1) -> Present(v2)`
//! using conditional writes only: a claim succeeds only if no pointer
//! exists, and an update succeeds only if the pointer is still at the
//! version the writer last saw.  Losers learn about it through an error,
//! never through a silent overwrite.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{ConflictPolicy, PointerConfig};
use crate::errors::{Result, StoreError};
use crate::metrics;
use crate::storage::backend::{ObjectMeta, PutOptions, WriteCondition};
use crate::target::Target;

/// The pointer's payload together with the version it was read at.
#[derive(Debug, Clone)]
pub struct Pointer {
    pub payload: Bytes,
    pub meta: ObjectMeta,
}

/// Observed state of the pointer.
#[derive(Debug, Clone)]
pub enum PointerState {
    Absent,
    Present(Pointer),
}

impl PointerState {
    pub fn is_present(&self) -> bool {
        matches!(self, PointerState::Present(_))
    }

    pub fn pointer(&self) -> Option<&Pointer> {
        match self {
            PointerState::Present(p) => Some(p),
            PointerState::Absent => None,
        }
    }
}

/// Result of a successful [`ActivePointer::claim`].
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller created the pointer.
    Claimed(ObjectMeta),
    /// Another writer got there first; its pointer is returned.
    Adopted(Pointer),
}

/// Manages the ACTIVE pointer object on one target.
#[derive(Debug, Clone)]
pub struct ActivePointer {
    target: Arc<Target>,
    key: String,
    policy: ConflictPolicy,
    lease_id: Option<String>,
    put_options: PutOptions,
}

impl ActivePointer {
    pub fn new(target: Arc<Target>, config: &PointerConfig) -> Self {
        Self {
            target,
            key: config.key.clone(),
            policy: config.conflict_policy,
            lease_id: None,
            put_options: PutOptions::default(),
        }
    }

    /// Condition updates on a lease held on the pointer object instead of
    /// its version token.
    pub fn with_lease(mut self, lease_id: impl Into<String>) -> Self {
        self.lease_id = Some(lease_id.into());
        self
    }

    pub fn with_put_options(mut self, opts: PutOptions) -> Self {
        self.put_options = opts;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn lease_id(&self) -> Option<&str> {
        self.lease_id.as_deref()
    }

    /// Create the pointer. Succeeds only if no pointer exists.
    ///
    /// If another writer already created it, the winner is re-read.  Under
    /// [`ConflictPolicy::Report`] the caller gets
    /// [`StoreError::PreconditionFailed`]; under
    /// [`ConflictPolicy::ReadCurrent`] the winner's pointer is returned as
    /// [`ClaimOutcome::Adopted`].
    pub async fn claim(&self, payload: Bytes, cancel: &CancelToken) -> Result<ClaimOutcome> {
        let result = self
            .target
            .conditional_put(
                &self.key,
                payload,
                &WriteCondition::must_not_exist(),
                &self.put_options,
                cancel,
            )
            .await;

        let lost = match result {
            Ok(meta) => {
                info!(
                    "Claimed pointer {} on target {}: etag={} generation={}",
                    self.key,
                    self.target.name(),
                    meta.etag,
                    meta.generation
                );
                return Ok(ClaimOutcome::Claimed(meta));
            }
            Err(err @ StoreError::PreconditionFailed { .. }) => err,
            // The pointer exists and is leased by its owner: still a lost race.
            Err(StoreError::LeaseConflict { target, key, .. }) => {
                StoreError::PreconditionFailed { target, key }
            }
            Err(err) => return Err(err),
        };

        metrics::record_pointer_conflict(self.target.name(), "claim");
        let winner = self.read(cancel).await?;
        match (self.policy, winner) {
            (ConflictPolicy::ReadCurrent, PointerState::Present(pointer)) => {
                info!(
                    "Claim of pointer {} lost; adopting winner etag={} generation={}",
                    self.key, pointer.meta.etag, pointer.meta.generation
                );
                Ok(ClaimOutcome::Adopted(pointer))
            }
            (_, PointerState::Present(pointer)) => {
                warn!(
                    "Claim of pointer {} lost to etag={} generation={}",
                    self.key, pointer.meta.etag, pointer.meta.generation
                );
                Err(lost)
            }
            (_, PointerState::Absent) => {
                // The winner was deleted between our write and the re-read.
                warn!("Claim of pointer {} lost; pointer is gone again", self.key);
                Err(lost)
            }
        }
    }

    /// Move the pointer to `payload`, provided it is still at `expected`.
    ///
    /// Losing the race yields [`StoreError::ConcurrentModification`] carrying
    /// the current version when it could be re-read.  Never retried here: the
    /// caller must decide against the new state.
    ///
    /// On S3 the version token is the content MD5, so a pointer rewritten
    /// with identical bytes keeps its ETag.  An update against that ETag
    /// succeeds even if other writes happened in between (A-B-A).  Include
    /// something unique (a sequence number or writer ID) in the payload when
    /// that matters.
    pub async fn update(
        &self,
        payload: Bytes,
        expected: &ObjectMeta,
        cancel: &CancelToken,
    ) -> Result<ObjectMeta> {
        let condition = match &self.lease_id {
            Some(id) => WriteCondition::ByLease(id.clone()),
            None => WriteCondition::from_meta(&self.key, expected, self.target.backend_type())?,
        };
        debug!("Updating pointer {} with condition {}", self.key, condition);

        let err = match self
            .target
            .conditional_put(&self.key, payload, &condition, &self.put_options, cancel)
            .await
        {
            Ok(meta) => {
                info!(
                    "Updated pointer {}: etag={} generation={}",
                    self.key, meta.etag, meta.generation
                );
                return Ok(meta);
            }
            Err(
                err @ (StoreError::PreconditionFailed { .. } | StoreError::LeaseConflict { .. }),
            ) => err,
            Err(err) => return Err(err),
        };

        metrics::record_pointer_conflict(self.target.name(), "update");
        // Best effort: the conflict is reported whether or not this succeeds.
        let current = match self.target.head(&self.key, cancel).await {
            Ok(meta) => Some(meta),
            Err(head_err) => {
                debug!("Could not re-read pointer {} after conflict: {}", self.key, head_err);
                None
            }
        };
        warn!(
            "Update of pointer {} from etag={} generation={} lost: {}",
            self.key, expected.etag, expected.generation, err
        );
        Err(StoreError::ConcurrentModification {
            key: self.key.clone(),
            message: err.to_string(),
            current,
        })
    }

    /// Read the pointer's payload and version.
    pub async fn read(&self, cancel: &CancelToken) -> Result<PointerState> {
        match self.target.get(&self.key, cancel).await {
            Ok(obj) => Ok(PointerState::Present(Pointer {
                payload: obj.data,
                meta: obj.meta,
            })),
            Err(err) if err.is_not_found() => Ok(PointerState::Absent),
            Err(err) => Err(err),
        }
    }

    /// The pointer's current version, without its payload.
    pub async fn head(&self, cancel: &CancelToken) -> Result<Option<ObjectMeta>> {
        match self.target.head(&self.key, cancel).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Tear the pointer down. In lease mode the delete is conditioned on the
    /// held lease, so it fails with [`StoreError::LeaseConflict`] if the
    /// lease was broken or taken over.
    pub async fn delete(&self, cancel: &CancelToken) -> Result<()> {
        match &self.lease_id {
            Some(id) => self.target.delete_with_lease(&self.key, id, cancel).await?,
            None => self.target.delete(&self.key, cancel).await?,
        }
        info!("Deleted pointer {} on target {}", self.key, self.target.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendType;
    use crate::retry::RetryPolicy;
    use crate::storage::backend::{ListPage, StorageBackend, StoreFuture, StoredObject};
    use crate::storage::memory::MemoryBackend;
    use std::time::Duration;

    fn memory_target() -> Arc<Target> {
        Arc::new(Target::from_backend(
            "primary",
            Arc::new(MemoryBackend::new("primary", "state")),
            RetryPolicy::default(),
        ))
    }

    fn pointer(target: &Arc<Target>) -> ActivePointer {
        ActivePointer::new(Arc::clone(target), &PointerConfig::default())
    }

    async fn read_present(p: &ActivePointer) -> Pointer {
        match p.read(&CancelToken::new()).await.unwrap() {
            PointerState::Present(pointer) => pointer,
            PointerState::Absent => panic!("pointer should be present"),
        }
    }

    #[tokio::test]
    async fn test_claim_claim_update_scenario() {
        let target = memory_target();
        let a = pointer(&target);
        let b = pointer(&target);
        let cancel = CancelToken::new();

        // A claims v1.
        let claimed = a.claim(Bytes::from_static(b"v1"), &cancel).await.unwrap();
        assert!(matches!(claimed, ClaimOutcome::Claimed(_)));
        let first = read_present(&a).await;
        assert_eq!(first.payload, Bytes::from_static(b"v1"));

        // B's claim loses.
        let err = b.claim(Bytes::from_static(b"v2"), &cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        // B updates from the version it read.
        let seen = read_present(&b).await;
        let updated = b
            .update(Bytes::from_static(b"v2"), &seen.meta, &cancel)
            .await
            .unwrap();
        assert!(!updated.same_version(&first.meta));

        let second = read_present(&a).await;
        assert_eq!(second.payload, Bytes::from_static(b"v2"));
        assert!(second.meta.same_version(&updated));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_and_leaves_object_unchanged() {
        let target = memory_target();
        let p = pointer(&target);
        let cancel = CancelToken::new();

        let ClaimOutcome::Claimed(v1) = p
            .claim(Bytes::from_static(b"v1"), &cancel)
            .await
            .unwrap()
        else {
            panic!("expected to claim");
        };
        let v2 = p.update(Bytes::from_static(b"v2"), &v1, &cancel).await.unwrap();

        let err = p
            .update(Bytes::from_static(b"stale"), &v1, &cancel)
            .await
            .unwrap_err();
        match err {
            StoreError::ConcurrentModification { key, current, .. } => {
                assert_eq!(key, "ACTIVE");
                assert!(current.unwrap().same_version(&v2));
            }
            other => panic!("unexpected error: {other}"),
        }

        let now = read_present(&p).await;
        assert_eq!(now.payload, Bytes::from_static(b"v2"));
        assert!(now.meta.same_version(&v2));
    }

    #[tokio::test]
    async fn test_update_of_absent_pointer_is_a_conflict() {
        let target = memory_target();
        let p = pointer(&target);
        let stale = ObjectMeta {
            generation: 7,
            ..ObjectMeta::default()
        };
        let err = p
            .update(Bytes::from_static(b"v"), &stale, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::ConcurrentModification { current: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_without_version_token() {
        let target = memory_target();
        let p = pointer(&target);
        let err = p
            .update(Bytes::from_static(b"v"), &ObjectMeta::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_read_current_policy_adopts_winner() {
        let target = memory_target();
        let cancel = CancelToken::new();
        let config = PointerConfig {
            conflict_policy: ConflictPolicy::ReadCurrent,
            ..PointerConfig::default()
        };
        let a = ActivePointer::new(Arc::clone(&target), &config);
        let b = ActivePointer::new(Arc::clone(&target), &config);

        let ClaimOutcome::Claimed(won) = a
            .claim(Bytes::from_static(b"a"), &cancel)
            .await
            .unwrap()
        else {
            panic!("expected to claim");
        };
        match b.claim(Bytes::from_static(b"b"), &cancel).await.unwrap() {
            ClaimOutcome::Adopted(winner) => {
                assert_eq!(winner.payload, Bytes::from_static(b"a"));
                assert!(winner.meta.same_version(&won));
            }
            ClaimOutcome::Claimed(_) => panic!("second claim must not win"),
        }
    }

    #[tokio::test]
    async fn test_delete_then_claim_again() {
        let target = memory_target();
        let p = pointer(&target);
        let cancel = CancelToken::new();

        assert!(matches!(p.read(&cancel).await.unwrap(), PointerState::Absent));
        assert!(p.head(&cancel).await.unwrap().is_none());

        p.claim(Bytes::from_static(b"v1"), &cancel).await.unwrap();
        assert!(p.head(&cancel).await.unwrap().is_some());

        p.delete(&cancel).await.unwrap();
        assert!(!p.read(&cancel).await.unwrap().is_present());

        let outcome = p.claim(Bytes::from_static(b"v2"), &cancel).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn test_lease_mode_updates() {
        let target = memory_target();
        let cancel = CancelToken::new();
        let plain = pointer(&target);
        let ClaimOutcome::Claimed(v1) = plain
            .claim(Bytes::from_static(b"v1"), &cancel)
            .await
            .unwrap()
        else {
            panic!("expected to claim");
        };

        let lease = target
            .acquire_lease("ACTIVE", Some(Duration::from_secs(60)), None, &cancel)
            .await
            .unwrap();
        let holder = pointer(&target).with_lease(lease.clone());
        assert_eq!(holder.lease_id(), Some(lease.as_str()));

        // The version token is ignored in lease mode.
        holder
            .update(Bytes::from_static(b"v2"), &ObjectMeta::default(), &cancel)
            .await
            .unwrap();

        // A writer without the lease loses even with a fresh version.
        let fresh = plain.head(&cancel).await.unwrap().unwrap();
        assert!(!fresh.same_version(&v1));
        let err = plain
            .update(Bytes::from_static(b"v3"), &fresh, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentModification { .. }));

        holder.delete(&cancel).await.unwrap();
        assert!(!holder.read(&cancel).await.unwrap().is_present());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_one_winner() {
        let target = memory_target();
        let mut handles = Vec::new();
        for i in 0..16 {
            let p = pointer(&target);
            handles.push(tokio::spawn(async move {
                p.claim(Bytes::from(format!("writer-{i}")), &CancelToken::new()).await
            }));
        }

        let mut claimed = 0;
        let mut lost = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(ClaimOutcome::Claimed(_)) => claimed += 1,
                Err(StoreError::PreconditionFailed { .. }) => lost += 1,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }
        assert_eq!(claimed, 1);
        assert_eq!(lost, 15);
    }

    #[tokio::test]
    async fn test_claim_on_leased_pointer_is_a_lost_race() {
        let target = memory_target();
        let cancel = CancelToken::new();
        let owner = pointer(&target);
        let ClaimOutcome::Claimed(won) = owner
            .claim(Bytes::from_static(b"v1"), &cancel)
            .await
            .unwrap()
        else {
            panic!("expected to claim");
        };
        target
            .acquire_lease("ACTIVE", None, None, &cancel)
            .await
            .unwrap();

        let err = pointer(&target)
            .claim(Bytes::from_static(b"v2"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        let config = PointerConfig {
            conflict_policy: ConflictPolicy::ReadCurrent,
            ..PointerConfig::default()
        };
        match ActivePointer::new(Arc::clone(&target), &config)
            .claim(Bytes::from_static(b"v2"), &cancel)
            .await
            .unwrap()
        {
            ClaimOutcome::Adopted(winner) => {
                assert_eq!(winner.payload, Bytes::from_static(b"v1"));
                assert!(winner.meta.same_version(&won));
            }
            ClaimOutcome::Claimed(_) => panic!("claim must not overwrite a leased pointer"),
        }
    }

    #[tokio::test]
    async fn test_leased_delete_fails_after_lease_is_broken() {
        let target = memory_target();
        let cancel = CancelToken::new();
        pointer(&target)
            .claim(Bytes::from_static(b"v1"), &cancel)
            .await
            .unwrap();
        let lease = target
            .acquire_lease("ACTIVE", Some(Duration::from_secs(30)), None, &cancel)
            .await
            .unwrap();
        let holder = pointer(&target).with_lease(lease);

        // Someone breaks the lease and moves the pointer on.
        target.break_lease("ACTIVE", &cancel).await.unwrap();
        let plain = pointer(&target);
        let current = plain.head(&cancel).await.unwrap().unwrap();
        plain
            .update(Bytes::from_static(b"v2"), &current, &cancel)
            .await
            .unwrap();

        let err = holder.delete(&cancel).await.unwrap_err();
        assert!(matches!(err, StoreError::LeaseConflict { .. }));
        let now = read_present(&plain).await;
        assert_eq!(now.payload, Bytes::from_static(b"v2"));
    }

    /// Answers create-only writes on a leased object the way Azure does
    /// (`LeaseIdMissing`), delegating everything else to memory.
    struct LeaseMissingBackend {
        inner: MemoryBackend,
    }

    impl StorageBackend for LeaseMissingBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::Memory
        }

        fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta> {
            self.inner.put(key, data, opts)
        }

        fn get(&self, key: &str) -> StoreFuture<'_, StoredObject> {
            self.inner.get(key)
        }

        fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta> {
            self.inner.head(key)
        }

        fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
            self.inner.delete(key)
        }

        fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage> {
            self.inner.list_page(prefix, token)
        }

        fn conditional_put(
            &self,
            key: &str,
            data: Bytes,
            condition: &WriteCondition,
            opts: &PutOptions,
        ) -> StoreFuture<'_, ObjectMeta> {
            if condition.is_create_only() {
                let key = key.to_string();
                return Box::pin(async move {
                    Err(StoreError::LeaseConflict {
                        target: "primary".to_string(),
                        key,
                        message: "HTTP 412 LeaseIdMissing".to_string(),
                    })
                });
            }
            self.inner.conditional_put(key, data, condition, opts)
        }
    }

    #[tokio::test]
    async fn test_claim_treats_lease_error_as_lost_race() {
        let backend = LeaseMissingBackend {
            inner: MemoryBackend::new("primary", "state"),
        };
        let target = Arc::new(Target::from_backend(
            "primary",
            Arc::new(backend),
            RetryPolicy::default(),
        ));
        let cancel = CancelToken::new();
        target
            .put("ACTIVE", Bytes::from_static(b"v1"), &PutOptions::default(), &cancel)
            .await
            .unwrap();

        let err = pointer(&target)
            .claim(Bytes::from_static(b"v2"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PreconditionFailed { .. }));

        let config = PointerConfig {
            conflict_policy: ConflictPolicy::ReadCurrent,
            ..PointerConfig::default()
        };
        let adopted = ActivePointer::new(Arc::clone(&target), &config)
            .claim(Bytes::from_static(b"v2"), &cancel)
            .await
            .unwrap();
        assert!(matches!(
            adopted,
            ClaimOutcome::Adopted(ref p) if p.payload == Bytes::from_static(b"v1")
        ));
    }
}
