//! In-memory storage backend.
//!
//! Objects live in a `tokio::sync::Mutex<HashMap<...>>`; every operation,
//! including the precondition check of a conditional write, runs under
//! the lock, so writes are atomic exactly as on a real provider.  The
//! backend accepts every condition kind (ETag, generation and lease) and
//! assigns each successful write a fresh generation and a unique ETag.

use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::backend::{
    object_name, relative_key, LeaseManager, ListPage, ObjectInfo, ObjectMeta, PutOptions,
    StorageBackend, StoreFuture, StoredObject, WriteCondition,
};
use super::condition::{translate, NativePrecondition};
use crate::config::BackendType;
use crate::errors::{Result, StoreError};

/// Default number of entries per listing page.
const DEFAULT_PAGE_SIZE: usize = 1000;

/// A held lease on one object.
#[derive(Debug, Clone)]
struct Lease {
    id: String,
    /// `None` for an infinite lease.
    duration: Option<Duration>,
    expires: Option<Instant>,
}

impl Lease {
    fn is_active(&self) -> bool {
        self.expires.map_or(true, |at| at > Instant::now())
    }
}

#[derive(Debug, Clone)]
struct MemObject {
    data: Bytes,
    etag: String,
    generation: i64,
    content_type: String,
    lease: Option<Lease>,
}

impl MemObject {
    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            etag: self.etag.clone(),
            generation: self.generation,
            size: self.data.len() as u64,
            last_modified: None,
            content_type: Some(self.content_type.clone()),
        }
    }

    fn active_lease(&self) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.is_active())
    }
}

struct MemState {
    objects: HashMap<String, MemObject>,
    /// Next generation to hand out; never reused, even across deletes.
    next_generation: i64,
}

/// In-memory backend with provider-equivalent conditional-write semantics.
pub struct MemoryBackend {
    target: String,
    prefix: String,
    page_size: usize,
    state: Mutex<MemState>,
}

impl MemoryBackend {
    /// Create an empty backend. `target` names it in errors.
    pub fn new(target: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            prefix: prefix.into(),
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(MemState {
                objects: HashMap::new(),
                next_generation: 1,
            }),
        }
    }

    /// Limit listing pages to `page_size` entries.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// ETag derived from the content and the generation, so rewriting the
    /// same bytes still yields a new token.
    fn compute_etag(data: &[u8], generation: i64) -> String {
        let mut hasher = Md5::new();
        hasher.update(generation.to_be_bytes());
        hasher.update(data);
        format!("\"{}\"", hex::encode(hasher.finalize()))
    }

    fn not_found(&self, key: &str) -> StoreError {
        StoreError::NotFound {
            target: self.target.clone(),
            key: key.to_string(),
        }
    }

    fn precondition_failed(&self, key: &str) -> StoreError {
        StoreError::PreconditionFailed {
            target: self.target.clone(),
            key: key.to_string(),
        }
    }

    fn lease_conflict(&self, key: &str, message: &str) -> StoreError {
        StoreError::LeaseConflict {
            target: self.target.clone(),
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    /// Check `precondition` against the current object under the lock.
    fn check(
        &self,
        key: &str,
        current: Option<&MemObject>,
        precondition: Option<&NativePrecondition>,
    ) -> Result<()> {
        let held = current.and_then(|o| o.active_lease());

        // A create-only write loses to any existing object, leased or not.
        let create_only = matches!(
            precondition,
            Some(NativePrecondition::IfGenerationMatch(0) | NativePrecondition::IfNoneMatchAny)
        );
        if create_only && current.is_some() {
            return Err(self.precondition_failed(key));
        }

        if let Some(NativePrecondition::LeaseId(id)) = precondition {
            return match held {
                Some(lease) if &lease.id == id => Ok(()),
                Some(_) => Err(self.lease_conflict(key, "lease ID does not match the held lease")),
                None => Err(self.lease_conflict(key, "no lease is held on the object")),
            };
        }
        if held.is_some() {
            return Err(self.lease_conflict(key, "object is leased and no lease ID was given"));
        }

        match (precondition, current) {
            (None, _) => Ok(()),
            (Some(NativePrecondition::IfGenerationMatch(0)), None) => Ok(()),
            (Some(NativePrecondition::IfNoneMatchAny), None) => Ok(()),
            (Some(NativePrecondition::IfGenerationMatch(g)), Some(obj)) if obj.generation == *g => {
                Ok(())
            }
            (Some(NativePrecondition::IfMatch(etag)), Some(obj)) if &obj.etag == etag => Ok(()),
            _ => Err(self.precondition_failed(key)),
        }
    }

    async fn write(
        &self,
        key: &str,
        data: Bytes,
        precondition: Option<NativePrecondition>,
        opts: &PutOptions,
    ) -> Result<ObjectMeta> {
        let name = object_name(&self.prefix, key);
        let mut state = self.state.lock().await;

        let current = state.objects.get(&name);
        self.check(key, current, precondition.as_ref())?;
        // A leased object keeps its lease across writes made under it.
        let lease = current.and_then(|o| o.active_lease().cloned());

        let generation = state.next_generation;
        state.next_generation += 1;

        let obj = MemObject {
            etag: Self::compute_etag(&data, generation),
            generation,
            content_type: opts.content_type_or_default().to_string(),
            data,
            lease,
        };
        let meta = obj.meta();
        state.objects.insert(name, obj);

        debug!(
            "Memory write: target={} key={} generation={}",
            self.target, key, generation
        );
        Ok(meta)
    }
}

impl StorageBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    fn put(&self, key: &str, data: Bytes, opts: &PutOptions) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let opts = opts.clone();
        Box::pin(async move { self.write(&key, data, None, &opts).await })
    }

    fn get(&self, key: &str) -> StoreFuture<'_, StoredObject> {
        let key = key.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let state = self.state.lock().await;
            let obj = state.objects.get(&name).ok_or_else(|| self.not_found(&key))?;
            Ok(StoredObject {
                data: obj.data.clone(),
                meta: obj.meta(),
            })
        })
    }

    fn head(&self, key: &str) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let state = self.state.lock().await;
            state
                .objects
                .get(&name)
                .map(MemObject::meta)
                .ok_or_else(|| self.not_found(&key))
        })
    }

    fn delete(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            if let Some(obj) = state.objects.get(&name) {
                if obj.active_lease().is_some() {
                    return Err(
                        self.lease_conflict(&key, "object is leased; release the lease first")
                    );
                }
            }
            state.objects.remove(&name);
            Ok(())
        })
    }

    fn list_page(&self, prefix: &str, token: Option<&str>) -> StoreFuture<'_, ListPage> {
        let prefix = prefix.to_string();
        // The token is the last key of the previous page.
        let after = token.map(str::to_string);
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut entries: Vec<ObjectInfo> = state
                .objects
                .iter()
                .filter_map(|(name, obj)| {
                    let key = relative_key(&self.prefix, name)?;
                    let in_page = key.starts_with(&prefix)
                        && after.as_deref().map_or(true, |after| key > after);
                    in_page.then(|| ObjectInfo {
                        key: key.to_string(),
                        size: obj.data.len() as u64,
                        etag: obj.etag.clone(),
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.key.cmp(&b.key));

            let next_token = if entries.len() > self.page_size {
                entries.truncate(self.page_size);
                entries.last().map(|e| e.key.clone())
            } else {
                None
            };
            Ok(ListPage {
                entries,
                next_token,
            })
        })
    }

    fn conditional_put(
        &self,
        key: &str,
        data: Bytes,
        condition: &WriteCondition,
        opts: &PutOptions,
    ) -> StoreFuture<'_, ObjectMeta> {
        let key = key.to_string();
        let condition = condition.clone();
        let opts = opts.clone();
        Box::pin(async move {
            let native = translate(&condition, BackendType::Memory)?;
            self.write(&key, data, Some(native), &opts).await
        })
    }

    fn leases(&self) -> Option<&dyn LeaseManager> {
        Some(self)
    }
}

impl LeaseManager for MemoryBackend {
    fn acquire_lease(
        &self,
        key: &str,
        duration: Option<Duration>,
        proposed_id: Option<String>,
    ) -> StoreFuture<'_, String> {
        let key = key.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            let obj = state.objects.get_mut(&name).ok_or_else(|| self.not_found(&key))?;
            let id = proposed_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            if let Some(held) = obj.active_lease() {
                // Re-acquiring with the same ID extends the lease, as on Azure.
                if held.id != id {
                    return Err(self.lease_conflict(&key, "there is already a lease present"));
                }
            }
            obj.lease = Some(Lease {
                id: id.clone(),
                duration,
                expires: duration.map(|d| Instant::now() + d),
            });
            Ok(id)
        })
    }

    fn renew_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            let obj = state.objects.get_mut(&name).ok_or_else(|| self.not_found(&key))?;
            match obj.lease.as_mut() {
                // An expired lease may still be renewed if nobody took it over.
                Some(lease) if lease.id == lease_id => {
                    lease.expires = lease.duration.map(|d| Instant::now() + d);
                    Ok(())
                }
                _ => Err(self.lease_conflict(&key, "lease ID does not match the held lease")),
            }
        })
    }

    fn release_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            let obj = state.objects.get_mut(&name).ok_or_else(|| self.not_found(&key))?;
            match &obj.lease {
                Some(lease) if lease.id == lease_id => {
                    obj.lease = None;
                    Ok(())
                }
                None => Ok(()),
                Some(_) => Err(self.lease_conflict(&key, "lease ID does not match the held lease")),
            }
        })
    }

    fn break_lease(&self, key: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            let obj = state.objects.get_mut(&name).ok_or_else(|| self.not_found(&key))?;
            obj.lease = None;
            Ok(())
        })
    }

    fn delete_with_lease(&self, key: &str, lease_id: &str) -> StoreFuture<'_, ()> {
        let key = key.to_string();
        let lease_id = lease_id.to_string();
        Box::pin(async move {
            let name = object_name(&self.prefix, &key);
            let mut state = self.state.lock().await;
            let held = state
                .objects
                .get(&name)
                .map(|obj| obj.active_lease().map(|lease| lease.id == lease_id));
            match held {
                None => Ok(()),
                Some(Some(true)) => {
                    state.objects.remove(&name);
                    Ok(())
                }
                Some(Some(false)) => {
                    Err(self.lease_conflict(&key, "lease ID does not match the held lease"))
                }
                Some(None) => Err(self.lease_conflict(&key, "no lease is held on the object")),
            }
        })
    }
}
