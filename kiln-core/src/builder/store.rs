//! External image store boundary.
//!
//! Everything durable (digests, tags) lives in the external image store;
//! kiln reaches it exclusively through the [`ImageStore`] trait. One adapter
//! shells out to the real container tooling, one keeps everything in memory
//! for tests.

use crate::error::{KilnError, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Base delay for cache probe retries; doubles per attempt.
const PROBE_BASE_DELAY: Duration = Duration::from_millis(200);

/// One external build invocation.
#[derive(Debug, Clone)]
pub struct BuildInvocation {
    /// Logical image name, for error reporting.
    pub image: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Build file path.
    pub buildfile: PathBuf,
    /// Build arguments passed through to the external builder.
    pub build_args: BTreeMap<String, String>,
    /// Full reference to tag the result with.
    pub tag: String,
}

/// Narrow capability interface over the external image store.
///
/// `push` must refuse to move a reference that already points at a
/// different digest by returning [`KilnError::TagConflict`]; local `tag`
/// aliasing is always permitted and idempotent.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Whether a reference exists in the store.
    async fn exists(&self, reference: &str) -> Result<bool>;

    /// Content digest a reference points at.
    async fn digest_of(&self, reference: &str) -> Result<String>;

    /// Run the external builder, tagging the result as `invocation.tag`.
    async fn build(&self, invocation: &BuildInvocation) -> Result<()>;

    /// Alias `source` as `target` locally.
    async fn tag(&self, source: &str, target: &str) -> Result<()>;

    /// Publish a reference to the store.
    async fn push(&self, reference: &str) -> Result<()>;
}

/// Adapter that shells out to the `docker` CLI.
pub struct DockerStore {
    binary: PathBuf,
    probe_attempts: u32,
}

impl DockerStore {
    pub fn new(probe_attempts: u32) -> Self {
        Self { binary: PathBuf::from("docker"), probe_attempts: probe_attempts.max(1) }
    }

    /// Use a specific binary instead of `docker` from PATH.
    pub fn with_binary(binary: PathBuf, probe_attempts: u32) -> Self {
        Self { binary, probe_attempts: probe_attempts.max(1) }
    }

    /// Run a silent probe command, retrying transient failures with
    /// exponential backoff. Returns the raw stdout on success, `Ok(None)`
    /// when the reference does not exist.
    async fn probe(&self, reference: &str) -> Result<Option<Vec<u8>>> {
        let mut delay = PROBE_BASE_DELAY;
        let mut last_error = String::new();

        for attempt in 1..=self.probe_attempts {
            let output = Command::new(&self.binary)
                .args(["manifest", "inspect", reference])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output()
                .await
                .map_err(|e| KilnError::CacheCheckFailed {
                    reference: reference.to_string(),
                    reason: format!("failed to spawn {}: {}", self.binary.display(), e),
                })?;

            if output.status.success() {
                return Ok(Some(output.stdout));
            }

            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Ok(None);
            }

            last_error = stderr.trim().to_string();
            warn!(reference, attempt, error = %last_error, "cache probe failed, retrying");
            if attempt < self.probe_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        Err(KilnError::CacheCheckFailed {
            reference: reference.to_string(),
            reason: format!("store unreachable after {} attempts: {}", self.probe_attempts, last_error),
        })
    }

    async fn run_checked(&self, args: &[&str], image: &str) -> Result<()> {
        debug!(binary = %self.binary.display(), ?args, "running store command");
        let status = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| KilnError::BuildFailed {
                image: image.to_string(),
                reason: format!("failed to spawn {}: {}", self.binary.display(), e),
            })?;

        if !status.success() {
            return Err(KilnError::BuildFailed {
                image: image.to_string(),
                reason: format!("`{} {}` exited with {}", self.binary.display(), args.join(" "), status),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageStore for DockerStore {
    async fn exists(&self, reference: &str) -> Result<bool> {
        Ok(self.probe(reference).await?.is_some())
    }

    async fn digest_of(&self, reference: &str) -> Result<String> {
        // The registry digest is the hash of the manifest body; deriving it
        // from the inspected manifest keeps this adapter to tag/inspect
        // operations only.
        let manifest = self.probe(reference).await?.ok_or_else(|| KilnError::CacheCheckFailed {
            reference: reference.to_string(),
            reason: "reference does not exist".to_string(),
        })?;
        Ok(format!("sha256:{:x}", Sha256::digest(&manifest)))
    }

    async fn build(&self, invocation: &BuildInvocation) -> Result<()> {
        info!(image = %invocation.image, tag = %invocation.tag, "invoking external builder");

        let context = invocation.context.to_string_lossy().into_owned();
        let buildfile = invocation.buildfile.to_string_lossy().into_owned();
        let mut args: Vec<String> =
            vec!["build".into(), context, "-f".into(), buildfile, "-t".into(), invocation.tag.clone()];
        for (key, value) in &invocation.build_args {
            args.push("--build-arg".into());
            args.push(format!("{key}={value}"));
        }

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked(&arg_refs, &invocation.image).await
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run_checked(&["tag", source, target], target).await
    }

    async fn push(&self, reference: &str) -> Result<()> {
        self.run_checked(&["push", reference], reference).await
    }
}

/// In-memory store fake for tests: no external processes, full operation
/// log.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    /// Pushed references visible to `exists`.
    pushed: HashMap<String, String>,
    /// Locally built/tagged references.
    local: HashMap<String, String>,
    builds: Vec<String>,
    pushes: Vec<String>,
    tag_ops: Vec<(String, String)>,
    build_count: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a pushed reference, as if built by an earlier run.
    pub fn seed(&self, reference: &str, digest: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.pushed.insert(reference.to_string(), digest.to_string());
    }

    /// References built, in order.
    pub fn builds(&self) -> Vec<String> {
        self.inner.lock().unwrap().builds.clone()
    }

    /// References pushed, in order.
    pub fn pushes(&self) -> Vec<String> {
        self.inner.lock().unwrap().pushes.clone()
    }

    /// Local tag aliases applied, in order.
    pub fn tag_ops(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().tag_ops.clone()
    }

    /// Digest a pushed reference points at, if any.
    pub fn pushed_digest(&self, reference: &str) -> Option<String> {
        self.inner.lock().unwrap().pushed.get(reference).cloned()
    }
}

#[async_trait]
impl ImageStore for MemoryStore {
    async fn exists(&self, reference: &str) -> Result<bool> {
        Ok(self.inner.lock().unwrap().pushed.contains_key(reference))
    }

    async fn digest_of(&self, reference: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .pushed
            .get(reference)
            .or_else(|| inner.local.get(reference))
            .cloned()
            .ok_or_else(|| KilnError::CacheCheckFailed {
                reference: reference.to_string(),
                reason: "reference does not exist".to_string(),
            })
    }

    async fn build(&self, invocation: &BuildInvocation) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.build_count += 1;
        let digest = format!(
            "sha256:{:x}",
            Sha256::digest(format!("{}#{}", invocation.tag, inner.build_count).as_bytes())
        );
        inner.local.insert(invocation.tag.clone(), digest);
        inner.builds.push(invocation.tag.clone());
        Ok(())
    }

    async fn tag(&self, source: &str, target: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let digest = inner
            .local
            .get(source)
            .or_else(|| inner.pushed.get(source))
            .cloned()
            .ok_or_else(|| KilnError::Internal(format!("tag source {source} does not exist")))?;
        inner.local.insert(target.to_string(), digest);
        inner.tag_ops.push((source.to_string(), target.to_string()));
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let digest = inner
            .local
            .get(reference)
            .cloned()
            .ok_or_else(|| KilnError::Internal(format!("push of unknown reference {reference}")))?;
        if let Some(existing) = inner.pushed.get(reference) {
            if existing != &digest {
                return Err(KilnError::TagConflict { reference: reference.to_string() });
            }
        }
        inner.pushed.insert(reference.to_string(), digest);
        inner.pushes.push(reference.to_string());
        Ok(())
    }
}

/// Classify a probe failure as "reference absent" rather than "store
/// unreachable".
fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    ["no such manifest", "manifest unknown", "not found", "name unknown"]
        .iter()
        .any(|needle| stderr.contains(needle))
}
