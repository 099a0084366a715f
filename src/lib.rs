//! activestore library -- conditional-write object storage.
//!
//! This crate provides a backend-agnostic object store over AWS S3, Azure
//! Blob Storage, Google Cloud Storage and an in-memory store, with
//! optimistic-concurrency writes, bounded retries, and an ACTIVE pointer
//! manager built on top of them.

pub mod cancel;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod pointer;
pub mod retry;
pub mod storage;
pub mod target;

pub use cancel::CancelToken;
pub use errors::{Result, StoreError};
pub use pointer::{ActivePointer, ClaimOutcome, Pointer, PointerState};
pub use storage::backend::{ObjectMeta, PutOptions, WriteCondition};
pub use target::Target;
