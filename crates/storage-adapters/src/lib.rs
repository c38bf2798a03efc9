//! # storage-adapters
//!
//! Concrete implementations of the persistence-side ports: an in-memory storage engine,
//! the response cache, the filesystem avatar store, an inverted search index and the
//! configured admin list.

pub mod admin;
pub mod avatar;
pub mod cache;
pub mod memory;
pub mod search;

pub use admin::StaticAdminStore;
pub use avatar::FsAvatarStore;
pub use cache::{CacheLimits, CacheStats, LoadingCache};
pub use memory::MemoryEngine;
pub use search::MemoryIndex;
