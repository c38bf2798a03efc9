//! # domains
//!
//! The central entities and interface definitions of the comment engine.
//! Nothing in here performs I/O; adapters implement the ports.

pub mod cache;
pub mod errors;
pub mod models;
pub mod ports;
pub mod search;

// Re-exporting for easier access in other crates
pub use cache::*;
pub use errors::*;
pub use models::*;
pub use ports::*;
pub use search::*;
