//! Durable storage contract: a region-scoped string dictionary with atomic
//! multi-field commits.

mod backend;

pub use backend::{
    apply_mutations, BackendError, InMemoryBackend, Mutation, StorageBackend, StoredValue,
};
