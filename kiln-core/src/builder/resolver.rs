//! Recursive, memoized build-graph resolution.
//!
//! `resolve(image)` walks the ancestor graph bottom-up: every ancestor's
//! fingerprint is known before a dependent combines its own. The combined
//! fingerprint covers the ordered ancestor fingerprints, the image's own
//! tracked files and the sorted user build arguments; a `hash-*` tag already
//! present in the store means the same inputs were built before and the
//! image is re-tagged instead of rebuilt.
//!
//! A per-invocation memo map keyed by (image, commit) guarantees a diamond
//! ancestor resolves exactly once even under concurrent fan-out; tag writes
//! for an image happen only inside that single resolution.

use crate::builder::hash::{hash_sources, ContentHash, FileHashEntry};
use crate::builder::ignore::IgnoreFilter;
use crate::builder::parser::{parse_manifest_file, ManifestError, ParentImage};
use crate::builder::store::{BuildInvocation, ImageStore};
use crate::config::Config;
use crate::error::{KilnError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::{OnceCell, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument};

/// Whether store side effects (build, tag, push) actually run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    Execute,
    DryRun,
}

/// Decision taken for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanAction {
    /// Cache miss; the image is (or would be) built.
    Build,
    /// Cache tag hit; the existing image is re-tagged.
    Reuse,
    /// The commit tag already exists; nothing to do.
    UpToDate,
}

/// One entry of the ordered (ancestors-first) resolution plan.
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub image: String,
    pub fingerprint: String,
    pub action: PlanAction,
}

/// Outcome of resolving one image.
#[derive(Debug, Clone)]
pub struct Resolved {
    /// Combined fingerprint; for a commit-tag fast path (where no
    /// fingerprint is computed) this is the resolved digest.
    pub fingerprint: String,
    /// Digest of the image in the store.
    pub digest: String,
}

/// Per-invocation resolution parameters.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Commit identifier being built.
    pub commit: String,
    /// Default build context directory.
    pub context: PathBuf,
    /// User-supplied build arguments. These participate in the fingerprint;
    /// the injected `GIT_SHA` / `IMAGE_TAG` values do not, so an unchanged
    /// tree keeps its fingerprint across commits.
    pub build_args: BTreeMap<String, String>,
    /// Extra tags applied to every resolved image.
    pub extra_tags: Vec<String>,
    /// Extra full `name:tag` aliases applied to every resolved image.
    pub extra_names: Vec<String>,
    pub mode: ResolveMode,
}

type ResolveFuture = Pin<Box<dyn Future<Output = Result<Resolved>> + Send + 'static>>;

/// Build-graph resolver for one invocation. Cheap to clone; clones share
/// the memo map and plan.
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

struct ResolverInner {
    config: Config,
    store: Arc<dyn ImageStore>,
    opts: ResolveOptions,
    /// Rendered commit tag.
    commit_tag: String,
    /// Arguments substituted into build files and passed to the builder.
    builder_args: BTreeMap<String, String>,
    /// Memo map: (image, commit) resolves at most once per invocation.
    memo: Mutex<HashMap<(String, String), Arc<OnceCell<Resolved>>>>,
    /// Bounds concurrent hash/build work, not recursive descent, so a node
    /// waiting on its ancestors never holds a worker slot.
    limiter: Semaphore,
    plan: Mutex<Vec<PlanEntry>>,
    trace: Mutex<Vec<FileHashEntry>>,
}

impl Resolver {
    pub fn new(config: Config, store: Arc<dyn ImageStore>, opts: ResolveOptions) -> Self {
        let commit_tag = config.commit_tag(&opts.commit);

        let mut builder_args = opts.build_args.clone();
        builder_args.insert("GIT_SHA".to_string(), opts.commit.clone());
        builder_args.insert("IMAGE_TAG".to_string(), commit_tag.clone());
        builder_args.insert("REGISTRY".to_string(), config.registry.clone());

        Self {
            inner: Arc::new(ResolverInner {
                limiter: Semaphore::new(config.max_workers),
                config,
                store,
                commit_tag,
                builder_args,
                opts,
                memo: Mutex::new(HashMap::new()),
                plan: Mutex::new(Vec::new()),
                trace: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Resolve an image and all its ancestors, bottom-up.
    pub async fn resolve(&self, image: &str) -> Result<Resolved> {
        self.clone().resolve_image(image.to_string()).await
    }

    /// The ordered plan accumulated so far (ancestors precede dependents).
    pub fn plan(&self) -> Vec<PlanEntry> {
        self.inner.plan.lock().unwrap().clone()
    }

    /// Per-file hash trace across every hashed image, in fold order.
    pub fn trace(&self) -> Vec<FileHashEntry> {
        self.inner.trace.lock().unwrap().clone()
    }

    fn resolve_image(self, image: String) -> ResolveFuture {
        Box::pin(async move {
            let cell = {
                let mut memo = self.inner.memo.lock().unwrap();
                Arc::clone(
                    memo.entry((image.clone(), self.inner.opts.commit.clone())).or_default(),
                )
            };
            let this = self.clone();
            cell.get_or_try_init(|| async move { this.resolve_fresh(&image).await })
                .await
                .cloned()
        })
    }

    #[instrument(skip(self), fields(commit = %self.inner.opts.commit))]
    async fn resolve_fresh(&self, image: &str) -> Result<Resolved> {
        let inner = &*self.inner;
        let base = format!("{}/{}", inner.config.registry, image);
        let commit_ref = format!("{}:{}", base, inner.commit_tag);

        // Fast path: the commit tag already exists, no need to descend into
        // ancestors at all.
        if inner.store.exists(&commit_ref).await? {
            let digest = inner.store.digest_of(&commit_ref).await?;
            info!(image, %commit_ref, %digest, "commit tag already exists");
            if inner.opts.mode == ResolveMode::Execute {
                self.apply_extra_tags(&base, &commit_ref).await?;
            }
            self.record(image, &digest, PlanAction::UpToDate);
            return Ok(Resolved { fingerprint: digest.clone(), digest });
        }

        let context =
            inner.config.context_for(image).unwrap_or(&inner.opts.context).to_path_buf();
        let buildfile = inner.config.buildfile_for(image);
        let buildfile_abs =
            if buildfile.is_absolute() { buildfile.clone() } else { context.join(&buildfile) };

        let manifest =
            parse_manifest_file(&buildfile_abs, &inner.builder_args).map_err(|e| match e {
                ManifestError::Parse(e) => KilnError::InvalidBuildFile {
                    path: buildfile_abs.clone(),
                    reason: e.to_string(),
                },
                ManifestError::Unresolvable { reference, .. } => {
                    KilnError::UnresolvableReference { image: image.to_string(), reference }
                }
            })?;

        let ancestors = self.resolve_ancestors(image, &manifest.parents).await?;

        // Heavy per-image work starts here; bounded by the worker limit.
        let _permit = inner
            .limiter
            .acquire()
            .await
            .map_err(|_| KilnError::Internal("worker limiter closed".to_string()))?;

        let own = self.hash_own_files(image, &context, &buildfile, &manifest.copy_sources)?;
        let fingerprint = combine_fingerprint(&ancestors, &own, &inner.opts.build_args);
        debug!(image, %fingerprint, "combined fingerprint");

        let cache_ref = format!("{}:{}", base, inner.config.cache_tag(&fingerprint));

        if inner.store.exists(&cache_ref).await? {
            let digest = inner.store.digest_of(&cache_ref).await?;
            info!(image, %cache_ref, "inputs unchanged, reusing cached image");
            self.record(image, &fingerprint, PlanAction::Reuse);
            if inner.opts.mode == ResolveMode::Execute {
                self.apply_commit_tags(&base, &cache_ref, &commit_ref).await?;
            }
            return Ok(Resolved { fingerprint, digest });
        }

        self.record(image, &fingerprint, PlanAction::Build);

        if inner.opts.mode == ResolveMode::DryRun {
            info!(image, %cache_ref, "dry run: would build");
            let digest = format!("dry-run-{}", &fingerprint[..16]);
            return Ok(Resolved { fingerprint, digest });
        }

        info!(image, %cache_ref, "cache miss, building");
        inner
            .store
            .build(&BuildInvocation {
                image: image.to_string(),
                context,
                buildfile: buildfile_abs,
                build_args: inner.builder_args.clone(),
                tag: cache_ref.clone(),
            })
            .await?;
        inner.store.push(&cache_ref).await?;

        let digest = inner.store.digest_of(&cache_ref).await?;
        self.apply_commit_tags(&base, &cache_ref, &commit_ref).await?;
        info!(image, %commit_ref, %digest, "built and tagged");

        Ok(Resolved { fingerprint, digest })
    }

    /// Resolve ancestors concurrently, preserving declaration order in the
    /// returned fingerprints. The first failure aborts outstanding sibling
    /// tasks.
    async fn resolve_ancestors(
        &self,
        image: &str,
        parents: &[ParentImage],
    ) -> Result<Vec<String>> {
        let mut slots: Vec<Option<String>> = vec![None; parents.len()];
        let mut set: JoinSet<(usize, String, Result<Resolved>)> = JoinSet::new();

        for (idx, parent) in parents.iter().enumerate() {
            if parent.registry.as_deref() == Some(self.inner.config.registry.as_str()) {
                let this = self.clone();
                let name = parent.name.clone();
                set.spawn(async move {
                    let resolved = this.resolve_image(name.clone()).await;
                    (idx, name, resolved)
                });
            } else {
                // Externally prebuilt ancestor: an opaque leaf whose
                // fingerprint is its reference as written (digest-pinned
                // when present).
                let contribution =
                    parent.digest.clone().unwrap_or_else(|| parent.reference());
                debug!(image, parent = %parent.reference(), "external ancestor");
                slots[idx] = Some(contribution);
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, _, Ok(resolved))) => slots[idx] = Some(resolved.fingerprint),
                Ok((_, ancestor, Err(e))) => {
                    set.abort_all();
                    return Err(KilnError::AncestorFailed {
                        image: image.to_string(),
                        ancestor,
                        source: Box::new(e),
                    });
                }
                Err(e) if e.is_cancelled() => continue,
                Err(e) => return Err(KilnError::Internal(format!("ancestor task failed: {e}"))),
            }
        }

        Ok(slots.into_iter().map(|slot| slot.expect("every ancestor slot filled")).collect())
    }

    /// Hash the build file plus every copy source, recording the per-file
    /// trace.
    fn hash_own_files(
        &self,
        image: &str,
        context: &Path,
        buildfile: &Path,
        copy_sources: &[String],
    ) -> Result<ContentHash> {
        let filter = IgnoreFilter::load(context).map_err(|e| KilnError::IoError {
            path: context.to_path_buf(),
            source: e,
        })?;

        let mut patterns = vec![buildfile.to_string_lossy().into_owned()];
        patterns.extend_from_slice(copy_sources);

        let own = hash_sources(
            image,
            context,
            &patterns,
            &filter,
            self.inner.config.fail_on_missing,
        )?;
        self.inner.trace.lock().unwrap().extend(own.entries.iter().cloned());
        Ok(own)
    }

    /// Apply the commit tag (pushed) plus any extra tags to a cached or
    /// freshly built image. Repeatable without error.
    async fn apply_commit_tags(&self, base: &str, source: &str, commit_ref: &str) -> Result<()> {
        self.inner.store.tag(source, commit_ref).await?;
        self.inner.store.push(commit_ref).await?;
        self.apply_extra_tags(base, commit_ref).await
    }

    async fn apply_extra_tags(&self, base: &str, source: &str) -> Result<()> {
        for tag in &self.inner.opts.extra_tags {
            self.inner.store.tag(source, &format!("{base}:{tag}")).await?;
        }
        for name in &self.inner.opts.extra_names {
            self.inner.store.tag(source, name).await?;
        }
        Ok(())
    }

    fn record(&self, image: &str, fingerprint: &str, action: PlanAction) {
        self.inner.plan.lock().unwrap().push(PlanEntry {
            image: image.to_string(),
            fingerprint: fingerprint.to_string(),
            action,
        });
    }
}

/// Combined fingerprint: ordered ancestor fingerprints, then the own-files
/// digest, then the sorted build arguments. A pure function of its inputs.
fn combine_fingerprint(
    ancestors: &[String],
    own: &ContentHash,
    build_args: &BTreeMap<String, String>,
) -> String {
    let mut hasher = Sha256::new();
    for fingerprint in ancestors {
        hasher.update(fingerprint.as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(own.digest.as_bytes());
    hasher.update([0u8]);
    for (key, value) in build_args {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}
