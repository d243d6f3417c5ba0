//! Configuration management.
//!
//! All configuration comes from the environment (prefix `KILN_`) and is
//! resolved once at startup into an immutable value that gets threaded
//! through every component. Nothing below this layer reads the process
//! environment.

use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Environment variable prefix for every kiln setting.
pub const ENV_PREFIX: &str = "KILN_";

/// Placeholder expanded to the commit identifier in tag patterns.
pub const COMMIT_PLACEHOLDER: &str = "{commit}";

/// Placeholder expanded to the combined fingerprint in cache tag patterns.
pub const FINGERPRINT_PLACEHOLDER: &str = "{fingerprint}";

/// Immutable, environment-derived configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Registry that identifies images buildable from this tree.
    pub registry: String,
    /// Pattern locating an image's build file, with a `{name}` placeholder.
    pub buildfile_pattern: String,
    /// Tag pattern marking a previously built input state.
    pub cache_tag_pattern: String,
    /// Tag pattern for the commit identifier tag.
    pub tag_pattern: String,
    /// Upper bound on concurrently resolving images.
    pub max_workers: usize,
    /// Whether a copy source matching zero files aborts the build.
    pub fail_on_missing: bool,
    /// Attempts for a cache probe before surfacing a cache-check failure.
    pub probe_attempts: u32,
    /// Per-image build file overrides (`KILN_BUILDFILE_<image>`).
    pub buildfile_overrides: HashMap<String, PathBuf>,
    /// Per-image build context overrides (`KILN_CONTEXT_<image>`).
    pub context_overrides: HashMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: String::new(),
            buildfile_pattern: "images/{name}/Dockerfile".to_string(),
            cache_tag_pattern: "hash-{fingerprint}".to_string(),
            tag_pattern: "{commit}".to_string(),
            max_workers: 4,
            fail_on_missing: false,
            probe_attempts: 3,
            buildfile_overrides: HashMap::new(),
            context_overrides: HashMap::new(),
        }
    }
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// The environment is read exactly once, here; per-image overrides are
    /// collected from `KILN_BUILDFILE_<image>` / `KILN_CONTEXT_<image>`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in std::env::vars() {
            let Some(key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match key {
                "REGISTRY" => config.registry = value,
                "BUILDFILE_PATTERN" => config.buildfile_pattern = value,
                "CACHE_TAG_PATTERN" => config.cache_tag_pattern = value,
                "TAG_PATTERN" => config.tag_pattern = value,
                "MAX_WORKERS" => {
                    config.max_workers =
                        value.parse().map_err(|_| KilnError::InvalidConfig {
                            reason: format!("KILN_MAX_WORKERS must be a positive integer, got `{value}`"),
                        })?;
                }
                "FAIL_ON_MISSING" => {
                    config.fail_on_missing = !matches!(value.as_str(), "" | "0" | "false");
                }
                "PROBE_ATTEMPTS" => {
                    config.probe_attempts =
                        value.parse().map_err(|_| KilnError::InvalidConfig {
                            reason: format!("KILN_PROBE_ATTEMPTS must be an integer, got `{value}`"),
                        })?;
                }
                _ => {
                    if let Some(image) = key.strip_prefix("BUILDFILE_") {
                        config.buildfile_overrides.insert(image.to_string(), PathBuf::from(value));
                    } else if let Some(image) = key.strip_prefix("CONTEXT_") {
                        config.context_overrides.insert(image.to_string(), PathBuf::from(value));
                    }
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check pattern placeholders and worker bounds.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(KilnError::InvalidConfig {
                reason: "max_workers must be at least 1".to_string(),
            });
        }
        if self.tag_pattern.matches(COMMIT_PLACEHOLDER).count() != 1 {
            return Err(KilnError::InvalidConfig {
                reason: format!(
                    "tag pattern `{}` must contain exactly one `{COMMIT_PLACEHOLDER}` placeholder",
                    self.tag_pattern
                ),
            });
        }
        if !self.cache_tag_pattern.contains(FINGERPRINT_PLACEHOLDER) {
            return Err(KilnError::InvalidConfig {
                reason: format!(
                    "cache tag pattern `{}` must contain `{FINGERPRINT_PLACEHOLDER}`",
                    self.cache_tag_pattern
                ),
            });
        }
        Ok(())
    }

    /// Path to an image's build file: per-image override, or the pattern.
    pub fn buildfile_for(&self, image: &str) -> PathBuf {
        match self.buildfile_overrides.get(image) {
            Some(path) => path.clone(),
            None => PathBuf::from(self.buildfile_pattern.replace("{name}", image)),
        }
    }

    /// Per-image build context override, if one is configured.
    pub fn context_for(&self, image: &str) -> Option<&Path> {
        self.context_overrides.get(image).map(PathBuf::as_path)
    }

    /// Render the cache tag for a combined fingerprint.
    pub fn cache_tag(&self, fingerprint: &str) -> String {
        self.cache_tag_pattern.replace(FINGERPRINT_PLACEHOLDER, fingerprint)
    }

    /// Render the commit identifier tag.
    pub fn commit_tag(&self, commit: &str) -> String {
        self.tag_pattern.replace(COMMIT_PLACEHOLDER, commit)
    }
}
