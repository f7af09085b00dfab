//! Path matcher (C1): compiled glob exclusions plus a fast substring
//! pre-filter, evaluated in that order by the walker.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{KeeplyError, Result};

/// Hard-coded substring exclusions checked before the compiled glob set.
/// Shared across platforms; OS-specific entries are included unconditionally
/// since a destination tree may be inspected from a different OS than the
/// one that produced it.
const FAST_EXCLUDE: &[&str] = &[
    "/.keeply/",
    "/.git/",
    "/node_modules/",
    // Windows
    "Windows/",
    "AppData/",
    "System Volume Information/",
    "$Recycle.Bin/",
    "ProgramData/",
    // POSIX
    "proc/",
    "sys/",
    "dev/",
    "run/",
    "tmp/",
    "var/cache/",
    "var/tmp/",
    ".cache/",
    ".local/share/Trash/",
];

/// A compiled set of glob exclusion patterns.
pub struct Matcher {
    set: GlobSet,
}

impl Matcher {
    /// Compiles shell-style glob patterns (`**`, `*`, `?`). Blank or
    /// whitespace-only patterns are skipped.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let trimmed = pattern.trim();
            if trimmed.is_empty() {
                continue;
            }
            let glob = Glob::new(trimmed)
                .map_err(|e| KeeplyError::Config(format!("invalid glob {trimmed:?}: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| KeeplyError::Config(format!("failed to compile glob set: {e}")))?;
        Ok(Matcher { set })
    }

    /// `rel_path_normalized` must already use forward slashes.
    pub fn matches(&self, rel_path_normalized: &str) -> bool {
        self.set.is_match(rel_path_normalized)
    }
}

/// Deterministic substring exclusion, independent of any compiled matcher.
pub fn fast_exclude(rel_path_normalized: &str) -> bool {
    let padded = format!("/{rel_path_normalized}/");
    FAST_EXCLUDE.iter().any(|needle| padded.contains(needle))
}

/// Normalizes a path's separators to forward slashes for comparison and
/// storage, per the data model's byte-exact string comparison rule.
pub fn normalize_rel_path(path: &std::path::Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_exclude_matches_hard_coded_entries() {
        assert!(fast_exclude(".git/HEAD"));
        assert!(fast_exclude("project/node_modules/pkg/index.js"));
        assert!(!fast_exclude("src/main.rs"));
    }

    #[test]
    fn empty_patterns_are_skipped() {
        let matcher = Matcher::compile(&["".into(), "   ".into()]).unwrap();
        assert!(!matcher.matches("anything"));
    }

    #[test]
    fn glob_star_star_matches_nested() {
        let matcher = Matcher::compile(&["**/*.log".into()]).unwrap();
        assert!(matcher.matches("a/b/c.log"));
        assert!(!matcher.matches("a/b/c.txt"));
    }
}
