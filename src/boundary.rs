//! Boundary enforcement — path patterns the engine must never modify.
//!
//! Patterns come from the `## Boundaries` section of identity.md and are
//! interpreted as path prefixes and simple globs. The Execute prompt advises
//! the model to stay away from them; this module is the enforcement side,
//! applied to the touched files after Execute.

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

pub struct BoundarySet {
    patterns: Vec<String>,
    globs: GlobSet,
}

/// Pull the list items out of identity.md's `## Boundaries` section.
pub fn parse_boundary_patterns(identity: &str) -> Vec<String> {
    let mut patterns = Vec::new();
    let mut in_section = false;
    for line in identity.lines() {
        let trimmed = line.trim();
        if let Some(heading) = trimmed.strip_prefix("## ") {
            in_section = heading.trim().eq_ignore_ascii_case("boundaries");
            continue;
        }
        if trimmed.starts_with('#') {
            in_section = false;
            continue;
        }
        if in_section {
            if let Some(item) = trimmed.strip_prefix("- ").or_else(|| trimmed.strip_prefix("* ")) {
                let pattern = item.trim().trim_matches('`').trim();
                if !pattern.is_empty() {
                    patterns.push(pattern.to_string());
                }
            }
        }
    }
    patterns
}

fn normalize(path: &str) -> String {
    path.trim().trim_start_matches("./").replace('\\', "/")
}

impl BoundarySet {
    pub fn from_identity(identity: &str) -> Result<Self> {
        Self::new(parse_boundary_patterns(identity))
    }

    pub fn new(patterns: Vec<String>) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        let mut add = |builder: &mut GlobSetBuilder, raw: &str, original: &str| -> Result<()> {
            let glob = Glob::new(raw)
                .map_err(|e| Error::config(format!("bad boundary pattern '{original}': {e}")))?;
            builder.add(glob);
            Ok(())
        };
        for pattern in &patterns {
            let normalized = normalize(pattern);
            if normalized.contains(['*', '?', '[']) {
                add(&mut builder, &normalized, pattern)?;
            } else {
                // Plain entries are prefixes: match the path itself and
                // everything below it.
                let base = normalized.trim_end_matches('/');
                add(&mut builder, base, pattern)?;
                add(&mut builder, &format!("{base}/**"), pattern)?;
            }
        }
        let globs = builder
            .build()
            .map_err(|e| Error::config(format!("boundary set: {e}")))?;
        Ok(Self { patterns, globs })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Does this project-relative path fall inside a boundary?
    pub fn matches(&self, path: &str) -> bool {
        self.globs.is_match(normalize(path))
    }

    /// First touched path that violates a boundary, if any.
    pub fn first_violation<'a>(&self, paths: &'a [String]) -> Option<&'a str> {
        paths
            .iter()
            .map(|p| p.as_str())
            .find(|p| self.matches(p))
    }

    /// Advisory text for the Execute prompt.
    pub fn prompt_section(&self) -> String {
        if self.patterns.is_empty() {
            return String::new();
        }
        let mut lines = vec![
            "## Protected Paths".to_string(),
            String::new(),
            "You must NOT create, modify, or delete anything matching these \
             patterns. A cycle that touches them is reverted:"
                .to_string(),
            String::new(),
        ];
        for pattern in &self.patterns {
            lines.push(format!("- `{pattern}`"));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_finds_boundaries_section() {
        let identity = "# Identity\n\n## Mission\nShip.\n\n## Boundaries\n\n\
                        - legacy/\n- `secrets.toml`\n- migrations/*.sql\n\n## Values\n- speed\n";
        let patterns = parse_boundary_patterns(identity);
        assert_eq!(patterns, vec!["legacy/", "secrets.toml", "migrations/*.sql"]);
    }

    #[test]
    fn prefix_patterns_match_descendants() {
        let set = BoundarySet::new(vec!["legacy/".into()]).unwrap();
        assert!(set.matches("legacy/old.rs"));
        assert!(set.matches("legacy/deep/nested.rs"));
        assert!(!set.matches("src/legacy.rs"));
    }

    #[test]
    fn glob_patterns_match_literally() {
        let set = BoundarySet::new(vec!["migrations/*.sql".into()]).unwrap();
        assert!(set.matches("migrations/001-init.sql"));
        assert!(!set.matches("migrations/notes.md"));
    }

    #[test]
    fn exact_file_pattern_matches_itself_only() {
        let set = BoundarySet::new(vec!["secrets.toml".into()]).unwrap();
        assert!(set.matches("secrets.toml"));
        assert!(set.matches("./secrets.toml"));
        assert!(!set.matches("config/secrets.toml.bak"));
    }

    #[test]
    fn first_violation_reports_the_path() {
        let set = BoundarySet::new(vec!["vendor/".into()]).unwrap();
        let touched = vec!["src/main.rs".to_string(), "vendor/lib.c".to_string()];
        assert_eq!(set.first_violation(&touched), Some("vendor/lib.c"));
        assert!(set.first_violation(&["src/main.rs".to_string()]).is_none());
    }
}
