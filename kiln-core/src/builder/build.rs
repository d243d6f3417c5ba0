//! Top-level build orchestration.
//!
//! One [`BuildRequest`] in, one [`BuildOutcome`] out. The cached path hands
//! the request to the resolver; raw mode bypasses all resolver machinery and
//! always invokes the external builder directly.

use crate::builder::hash::FileHashEntry;
use crate::builder::resolver::{
    PlanAction, PlanEntry, ResolveMode, ResolveOptions, Resolver,
};
use crate::builder::store::{BuildInvocation, ImageStore};
use crate::config::Config;
use crate::error::{KilnError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, instrument};

/// One build request, as assembled by the CLI.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Image to build.
    pub image: String,
    /// Default build context directory.
    pub context: PathBuf,
    /// Commit identifier, passed through as the `GIT_SHA` build argument.
    pub commit: String,
    /// Build file override for the root image.
    pub buildfile: Option<PathBuf>,
    /// User-supplied build arguments.
    pub build_args: BTreeMap<String, String>,
    /// Extra tags applied to every resolved image.
    pub extra_tags: Vec<String>,
    /// Extra full `name:tag` aliases.
    pub extra_names: Vec<String>,
    /// Bypass the resolver and always build.
    pub raw: bool,
    /// Plan only; no build or tag side effects.
    pub dry_run: bool,
    /// Where to write the per-file `path -> digest` trace.
    pub trace_path: Option<PathBuf>,
}

/// Result of one build request.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutcome {
    pub image: String,
    /// Combined fingerprint of the root image (absent in raw mode).
    pub fingerprint: Option<String>,
    /// Resolved digest of the root image (absent in dry runs).
    pub digest: Option<String>,
    /// Ordered per-image decisions, ancestors first.
    pub plan: Vec<PlanEntry>,
}

/// Execute one build request against the given store.
#[instrument(skip(request, config, store), fields(image = %request.image, commit = %request.commit))]
pub async fn build_image(
    request: BuildRequest,
    mut config: Config,
    store: Arc<dyn ImageStore>,
) -> Result<BuildOutcome> {
    if let Some(buildfile) = &request.buildfile {
        config.buildfile_overrides.insert(request.image.clone(), buildfile.clone());
    }

    if request.raw {
        return build_raw(&request, &config, store).await;
    }

    let resolver = Resolver::new(
        config,
        store,
        ResolveOptions {
            commit: request.commit.clone(),
            context: request.context.clone(),
            build_args: request.build_args.clone(),
            extra_tags: request.extra_tags.clone(),
            extra_names: request.extra_names.clone(),
            mode: if request.dry_run { ResolveMode::DryRun } else { ResolveMode::Execute },
        },
    );

    let resolved = resolver.resolve(&request.image).await;

    // The trace is written even when resolution fails: partial hashes are
    // exactly what the debugging flag is for.
    if let Some(path) = &request.trace_path {
        write_trace(path, &resolver.trace())?;
    }

    let resolved = resolved?;
    Ok(BuildOutcome {
        image: request.image.clone(),
        digest: if request.dry_run { None } else { Some(resolved.digest) },
        fingerprint: Some(resolved.fingerprint),
        plan: resolver.plan(),
    })
}

/// Raw mode: one unconditional external build of the requested image, no
/// ancestor resolution, no cache probing.
async fn build_raw(
    request: &BuildRequest,
    config: &Config,
    store: Arc<dyn ImageStore>,
) -> Result<BuildOutcome> {
    let commit_tag = config.commit_tag(&request.commit);
    let base = format!("{}/{}", config.registry, request.image);
    let reference = format!("{}:{}", base, commit_tag);

    let plan = vec![PlanEntry {
        image: request.image.clone(),
        fingerprint: String::new(),
        action: PlanAction::Build,
    }];

    if request.dry_run {
        info!(image = %request.image, %reference, "dry run: would build (raw)");
        return Ok(BuildOutcome {
            image: request.image.clone(),
            fingerprint: None,
            digest: None,
            plan,
        });
    }

    let buildfile = config.buildfile_for(&request.image);
    let buildfile = if buildfile.is_absolute() {
        buildfile
    } else {
        request.context.join(buildfile)
    };

    let mut build_args = request.build_args.clone();
    build_args.insert("GIT_SHA".to_string(), request.commit.clone());
    build_args.insert("IMAGE_TAG".to_string(), commit_tag.clone());
    build_args.insert("TIMESTAMP".to_string(), unix_timestamp());

    store
        .build(&BuildInvocation {
            image: request.image.clone(),
            context: request.context.clone(),
            buildfile,
            build_args,
            tag: reference.clone(),
        })
        .await?;
    store.push(&reference).await?;

    for tag in &request.extra_tags {
        store.tag(&reference, &format!("{base}:{tag}")).await?;
    }
    for name in &request.extra_names {
        store.tag(&reference, name).await?;
    }

    let digest = store.digest_of(&reference).await?;
    info!(image = %request.image, %reference, %digest, "raw build complete");

    Ok(BuildOutcome {
        image: request.image.clone(),
        fingerprint: None,
        digest: Some(digest),
        plan,
    })
}

/// Line-oriented `path -> digest` listing, in the same order the aggregate
/// hash was folded.
fn write_trace(path: &std::path::Path, entries: &[FileHashEntry]) -> Result<()> {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.path);
        out.push_str(" -> ");
        out.push_str(&entry.digest);
        out.push('\n');
    }
    std::fs::write(path, out)
        .map_err(|e| KilnError::IoError { path: path.to_path_buf(), source: e })
}

fn unix_timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::store::MemoryStore;
    use std::fs;

    const REGISTRY: &str = "registry.test:5000";

    fn test_config() -> Config {
        Config { registry: REGISTRY.to_string(), ..Config::default() }
    }

    fn write_tree(root: &std::path::Path) {
        fs::create_dir_all(root.join("images/base")).unwrap();
        fs::create_dir_all(root.join("images/app")).unwrap();
        fs::write(
            root.join("images/base/Dockerfile"),
            "FROM alpine:3.19\nCOPY base.txt /base.txt\n",
        )
        .unwrap();
        fs::write(
            root.join("images/app/Dockerfile"),
            "FROM ${REGISTRY}/base:${IMAGE_TAG}\nCOPY app.txt /app.txt\n",
        )
        .unwrap();
        fs::write(root.join("base.txt"), "base").unwrap();
        fs::write(root.join("app.txt"), "app").unwrap();
    }

    fn request(root: &std::path::Path) -> BuildRequest {
        BuildRequest {
            image: "app".to_string(),
            context: root.to_path_buf(),
            commit: "abc123".to_string(),
            buildfile: None,
            build_args: BTreeMap::new(),
            extra_tags: Vec::new(),
            extra_names: Vec::new(),
            raw: false,
            dry_run: false,
            trace_path: None,
        }
    }

    #[tokio::test]
    async fn test_cached_build_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());

        let outcome =
            build_image(request(dir.path()), test_config(), store.clone()).await.unwrap();

        assert!(outcome.fingerprint.is_some());
        assert!(outcome.digest.is_some());
        assert_eq!(outcome.plan.len(), 2);
        assert_eq!(store.builds().len(), 2);
    }

    #[tokio::test]
    async fn test_raw_mode_bypasses_resolver() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());

        let outcome = build_image(
            BuildRequest { raw: true, ..request(dir.path()) },
            test_config(),
            store.clone(),
        )
        .await
        .unwrap();

        // Only the requested image builds; the parent is never touched.
        assert_eq!(store.builds(), vec![format!("{REGISTRY}/app:abc123")]);
        assert!(outcome.fingerprint.is_none());
        assert!(outcome.digest.is_some());
    }

    #[tokio::test]
    async fn test_raw_dry_run_is_side_effect_free() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let store = Arc::new(MemoryStore::new());

        let outcome = build_image(
            BuildRequest { raw: true, dry_run: true, ..request(dir.path()) },
            test_config(),
            store.clone(),
        )
        .await
        .unwrap();

        assert!(store.builds().is_empty());
        assert!(outcome.digest.is_none());
        assert_eq!(outcome.plan.len(), 1);
    }

    #[tokio::test]
    async fn test_buildfile_override_for_root_image() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        fs::write(
            dir.path().join("Dockerfile.alt"),
            "FROM alpine:3.19\nCOPY base.txt /other.txt\n",
        )
        .unwrap();
        let store = Arc::new(MemoryStore::new());

        let outcome = build_image(
            BuildRequest {
                buildfile: Some(PathBuf::from("Dockerfile.alt")),
                ..request(dir.path())
            },
            test_config(),
            store.clone(),
        )
        .await
        .unwrap();

        // The override has no internal parent, so only app builds.
        assert_eq!(store.builds().len(), 1);
        assert!(outcome.digest.is_some());
    }

    #[tokio::test]
    async fn test_trace_file_written() {
        let dir = tempfile::tempdir().unwrap();
        write_tree(dir.path());
        let trace_path = dir.path().join("hashes.txt");
        let store = Arc::new(MemoryStore::new());

        build_image(
            BuildRequest {
                dry_run: true,
                trace_path: Some(trace_path.clone()),
                ..request(dir.path())
            },
            test_config(),
            store,
        )
        .await
        .unwrap();

        let trace = fs::read_to_string(&trace_path).unwrap();
        assert!(trace.contains("base.txt -> "));
        assert!(trace.contains("app.txt -> "));
        for line in trace.lines() {
            assert!(line.contains(" -> "));
        }
    }
}
