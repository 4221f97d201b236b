//! Local state: the entity cache, optimistic mutations and persisted credentials

pub mod cache;
pub mod credentials;
pub mod optimistic;
pub mod traits;

// Re-export main components
pub use cache::{ApplyOutcome, CacheEvent, CacheTarget, CollectionKey, EntityCache, SharedCache};
pub use credentials::{Credentials, FileCredentialStore, MemoryCredentialStore};
pub use optimistic::{Mutation, MutationEngine, MutationId, MutationPhase, SharedMutationEngine};
pub use traits::CredentialStore;
