//! Ignore-file handling for build contexts.
//!
//! Loads `.dockerignore` from the context root and answers whether a
//! context-relative path is part of the build inputs. Patterns compile into
//! an ordered rule list (pattern segments, negate flag, directory-only flag)
//! evaluated last-match-wins, so `!` re-includes win over earlier excludes
//! and vice versa.

use std::path::Path;
use tracing::debug;

/// Conventional ignore file name at the context root.
pub const IGNORE_FILE: &str = ".dockerignore";

/// A compiled ignore rule.
#[derive(Debug, Clone)]
struct Rule {
    /// Pattern split on `/`; `**` is a whole-segment wildcard.
    segments: Vec<String>,
    /// Rule re-includes instead of excluding.
    negate: bool,
    /// Pattern had a trailing `/` and only matches directories.
    dir_only: bool,
}

/// Ignore-rule-aware file inclusion for one build context.
#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
    rules: Vec<Rule>,
}

impl IgnoreFilter {
    /// Load the ignore file from a context root. A missing file means
    /// everything is included.
    pub fn load(context: &Path) -> std::io::Result<Self> {
        let path = context.join(IGNORE_FILE);
        if !path.is_file() {
            debug!("no {} in {}, including everything", IGNORE_FILE, context.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Self::from_patterns(content.lines()))
    }

    /// Compile an ordered list of ignore patterns.
    pub fn from_patterns<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Self {
        let rules = patterns
            .into_iter()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                let (negate, pattern) = match line.strip_prefix('!') {
                    Some(rest) => (true, rest),
                    None => (false, line),
                };
                // Patterns are anchored at the context root; a leading slash
                // or ./ is redundant.
                let pattern = pattern.trim_start_matches("./").trim_start_matches('/');
                let (dir_only, pattern) = match pattern.strip_suffix('/') {
                    Some(rest) => (true, rest),
                    None => (false, pattern),
                };
                if pattern.is_empty() {
                    return None;
                }
                Some(Rule {
                    segments: pattern.split('/').map(str::to_string).collect(),
                    negate,
                    dir_only,
                })
            })
            .collect();
        Self { rules }
    }

    /// Whether a context-relative path is part of the build inputs.
    ///
    /// A rule matching the path itself or any ancestor directory applies;
    /// the last matching rule decides.
    pub fn included(&self, relative_path: &str) -> bool {
        let path: Vec<&str> = relative_path.split('/').filter(|s| !s.is_empty()).collect();
        let mut included = true;
        for rule in &self.rules {
            if rule.matches(&path) {
                included = rule.negate;
            }
        }
        included
    }

    /// True when no rules were loaded.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Rule {
    fn matches(&self, path: &[&str]) -> bool {
        // Ancestor directories of the path are always eligible; the full
        // path only when the rule is not directory-only.
        for len in 1..path.len() {
            if match_segments(&self.segments, &path[..len]) {
                return true;
            }
        }
        !self.dir_only && match_segments(&self.segments, path)
    }
}

/// Match pattern segments against path segments. `**` spans any number of
/// segments; `*` and `?` stay within one segment.
fn match_segments(pattern: &[String], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => path.is_empty(),
        Some((first, rest)) if first == "**" => {
            (0..=path.len()).any(|skip| match_segments(rest, &path[skip..]))
        }
        Some((first, rest)) => match path.split_first() {
            Some((seg, path_rest)) => match_segment(first, seg) && match_segments(rest, path_rest),
            None => false,
        },
    }
}

/// Single-segment wildcard match supporting `*` and `?`.
fn match_segment(pattern: &str, segment: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let seg: Vec<char> = segment.chars().collect();
    match_chars(&pat, &seg)
}

fn match_chars(pattern: &[char], segment: &[char]) -> bool {
    match pattern.split_first() {
        None => segment.is_empty(),
        Some(('*', rest)) => {
            (0..=segment.len()).any(|skip| match_chars(rest, &segment[skip..]))
        }
        Some(('?', rest)) => match segment.split_first() {
            Some((_, seg_rest)) => match_chars(rest, seg_rest),
            None => false,
        },
        Some((c, rest)) => match segment.split_first() {
            Some((s, seg_rest)) => c == s && match_chars(rest, seg_rest),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_includes_everything() {
        let filter = IgnoreFilter::default();
        assert!(filter.included("anything/at/all.txt"));
        assert!(filter.is_empty());
    }

    #[test]
    fn test_simple_exclude() {
        let filter = IgnoreFilter::from_patterns(["target", "*.log"]);
        assert!(!filter.included("target"));
        assert!(!filter.included("target/debug/app"));
        assert!(!filter.included("build.log"));
        assert!(filter.included("src/main.rs"));
    }

    #[test]
    fn test_patterns_are_anchored() {
        let filter = IgnoreFilter::from_patterns(["docs/internal"]);
        assert!(!filter.included("docs/internal/notes.md"));
        assert!(filter.included("vendored/docs/internal/notes.md"));
    }

    #[test]
    fn test_negation_last_match_wins() {
        let filter = IgnoreFilter::from_patterns(["*.md", "!README.md"]);
        assert!(!filter.included("CHANGELOG.md"));
        assert!(filter.included("README.md"));

        // A later exclude overrides an earlier re-include.
        let filter = IgnoreFilter::from_patterns(["*.md", "!README.md", "README.md"]);
        assert!(!filter.included("README.md"));
    }

    #[test]
    fn test_reinclude_inside_excluded_directory() {
        let filter = IgnoreFilter::from_patterns(["vendor", "!vendor/keep/config.json"]);
        assert!(!filter.included("vendor/lib.rs"));
        assert!(filter.included("vendor/keep/config.json"));
    }

    #[test]
    fn test_double_star() {
        let filter = IgnoreFilter::from_patterns(["**/*.tmp", "cache/**"]);
        assert!(!filter.included("a.tmp"));
        assert!(!filter.included("deep/nested/b.tmp"));
        assert!(!filter.included("cache/objects/ab/cd"));
        assert!(filter.included("deep/nested/b.txt"));
    }

    #[test]
    fn test_question_mark() {
        let filter = IgnoreFilter::from_patterns(["s?tup.py"]);
        assert!(!filter.included("setup.py"));
        assert!(!filter.included("situp.py"));
        assert!(filter.included("startup.py"));
    }

    #[test]
    fn test_directory_only_pattern() {
        let filter = IgnoreFilter::from_patterns(["logs/"]);
        assert!(!filter.included("logs/today.txt"));
        // A plain file named like the directory pattern is not matched.
        assert!(filter.included("logs"));
    }

    #[test]
    fn test_comments_and_blanks_skipped() {
        let filter = IgnoreFilter::from_patterns(["# a comment", "", "  ", "secret.env"]);
        assert!(!filter.included("secret.env"));
        assert!(filter.included("public.env"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let filter = IgnoreFilter::load(dir.path()).unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_load_from_context() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IGNORE_FILE), "app/skip.txt\n").unwrap();

        let filter = IgnoreFilter::load(dir.path()).unwrap();
        assert!(!filter.included("app/skip.txt"));
        assert!(filter.included("app/keep.txt"));
    }
}
