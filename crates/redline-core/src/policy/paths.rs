//! Repository-relative path normalization and pattern matching.
//!
//! Patterns are either globs (containing `*`, `?`, `[` or `{`) or literal
//! paths. A path is covered by a pattern when the pattern matches the path
//! itself or any of its ancestor directories, which gives literal patterns
//! prefix semantics (`src` covers `src/a.py`) and lets `src/*` cover nested
//! files below a matching directory.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use super::error::{PolicyError, PolicyResult};

/// Normalize a repository-relative path.
///
/// Strips `./` segments, collapses repeated separators and trailing slashes.
/// Rejects empty paths, absolute paths and any `..` component.
pub fn normalize_relative(path: &str) -> Result<String, &'static str> {
    if path.is_empty() {
        return Err("empty path");
    }
    if path.starts_with('/') || path.starts_with('\\') || std::path::Path::new(path).is_absolute()
    {
        return Err("absolute path");
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err("parent directory traversal"),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err("empty path");
    }
    Ok(parts.join("/"))
}

/// A compiled set of path patterns.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    patterns: Vec<String>,
    literals: Vec<String>,
    globs: GlobSet,
}

impl PathMatcher {
    pub fn new<I, S>(patterns: I) -> PolicyResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = Vec::new();
        let mut literals = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            let pattern: String = pattern.into();
            if is_glob(&pattern) {
                let glob = GlobBuilder::new(pattern.trim_start_matches("./"))
                    .literal_separator(true)
                    .build()
                    .map_err(|e| PolicyError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: e.to_string(),
                    })?;
                builder.add(glob);
            } else {
                let literal =
                    normalize_relative(&pattern).map_err(|reason| PolicyError::InvalidPattern {
                        pattern: pattern.clone(),
                        reason: reason.to_string(),
                    })?;
                literals.push(literal);
            }
            all.push(pattern);
        }
        let globs = builder.build().map_err(|e| PolicyError::InvalidPattern {
            pattern: all.join(","),
            reason: e.to_string(),
        })?;
        Ok(Self {
            patterns: all,
            literals,
            globs,
        })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            literals: Vec::new(),
            globs: GlobSet::empty(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `path` (already normalized) or one of its ancestors matches.
    pub fn matches(&self, path: &str) -> bool {
        let mut candidate = path;
        loop {
            if self.literals.iter().any(|l| l == candidate) || self.globs.is_match(candidate) {
                return true;
            }
            match candidate.rfind('/') {
                Some(idx) => candidate = &candidate[..idx],
                None => return false,
            }
        }
    }
}

fn is_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '[', '{'])
}
