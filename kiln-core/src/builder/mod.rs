//! Image build system for kiln.
//!
//! This module provides build-file parsing, ignore-rule handling, content
//! hashing, the external store boundary and the memoized build-graph
//! resolver that ties them together.

pub mod build;
pub mod hash;
pub mod ignore;
pub mod parser;
pub mod resolver;
pub mod store;

pub use build::{build_image, BuildOutcome, BuildRequest};
pub use hash::{hash_sources, ContentHash, FileHashEntry};
pub use ignore::IgnoreFilter;
pub use parser::{parse_manifest, parse_manifest_file, Manifest, ManifestError, ParentImage};
pub use resolver::{PlanAction, PlanEntry, ResolveMode, ResolveOptions, Resolved, Resolver};
pub use store::{BuildInvocation, DockerStore, ImageStore, MemoryStore};
