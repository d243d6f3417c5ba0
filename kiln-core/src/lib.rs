//! kiln core library
//!
//! Dependency-aware container image building with content-addressed
//! caching: each image's fingerprint covers its own tracked files plus the
//! fingerprints of all its transitive ancestors, and an existing cache tag
//! in the external store turns a rebuild into a re-tag.

pub mod builder;
pub mod config;
pub mod error;

// Re-export commonly used items
pub use builder::{build_image, BuildOutcome, BuildRequest, DockerStore, ImageStore, MemoryStore};
pub use config::Config;
pub use error::{KilnError, Result};
