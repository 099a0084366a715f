//! Object storage adapters.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations talk to AWS S3, Azure Blob Storage
//! and Google Cloud Storage, plus an in-memory store with the same
//! conditional-write semantics.  [`condition`] translates neutral write
//! conditions into each provider's native precondition.

pub mod aws;
pub mod azure;
pub mod backend;
pub mod condition;
pub mod gcp;
pub mod memory;
