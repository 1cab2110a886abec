//! Ignore predicate built from the project's own ignore files plus defaults.
//!
//! The predicate is applied when filtering the project before sandbox sync
//! and prompt construction, and when filtering sandbox filesystem
//! snapshots. `.gitignore` and `.agentignore` themselves are always kept.

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::project::ProjectFiles;

const IGNORE_FILES: [&str; 2] = [".gitignore", ".agentignore"];

/// Built-in patterns: VCS dirs, dependency caches, build outputs, editor
/// state. Project ignore files can extend (or negate) these.
const DEFAULT_PATTERNS: &[&str] = &[
    ".git/",
    ".hg/",
    ".svn/",
    "node_modules/",
    "vendor/bundle/",
    ".bundle/",
    "__pycache__/",
    "*.pyc",
    "venv/",
    ".venv/",
    ".cache/",
    "dist/",
    "build/",
    "target/",
    ".next/",
    "coverage/",
    ".DS_Store",
    ".idea/",
    ".vscode/",
];

pub struct IgnorePredicate {
    matcher: Gitignore,
}

impl IgnorePredicate {
    /// Compile the predicate from built-in defaults plus any `.gitignore`
    /// and `.agentignore` contents found in the project map.
    pub fn build(project: &ProjectFiles) -> Self {
        let mut builder = GitignoreBuilder::new("");
        for pattern in DEFAULT_PATTERNS {
            let _ = builder.add_line(None, pattern);
        }
        for ignore_file in IGNORE_FILES {
            if let Some(content) = project.get(ignore_file) {
                for line in content.lines() {
                    let _ = builder.add_line(None, line);
                }
            }
        }
        let matcher = builder
            .build()
            .unwrap_or_else(|_| Gitignore::empty());
        Self { matcher }
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        let path = path.trim_start_matches("./");
        if IGNORE_FILES.contains(&path) {
            return false;
        }
        self.matcher
            .matched_path_or_any_parents(path, false)
            .is_ignore()
    }

    /// Copy of `project` with ignored paths dropped (ignore files kept).
    pub fn filter(&self, project: &ProjectFiles) -> ProjectFiles {
        project
            .iter()
            .filter(|(path, _)| !self.is_ignored(path))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn project(entries: &[(&str, &str)]) -> ProjectFiles {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    // ── defaults ───────────────────────────────────────────────────────

    #[test]
    fn default_patterns_match_dependency_caches() {
        let pred = IgnorePredicate::build(&ProjectFiles::new());
        assert!(pred.is_ignored("node_modules/x.js"));
        assert!(pred.is_ignored("node_modules/a/b/c.js"));
        assert!(pred.is_ignored(".git/HEAD"));
        assert!(pred.is_ignored("__pycache__/mod.cpython-312.pyc"));
        assert!(pred.is_ignored("app/__pycache__/mod.pyc"));
        assert!(!pred.is_ignored("src/a.ts"));
        assert!(!pred.is_ignored("main.py"));
    }

    #[test]
    fn leading_dot_slash_is_stripped() {
        let pred = IgnorePredicate::build(&ProjectFiles::new());
        assert!(pred.is_ignored("./node_modules/x.js"));
        assert!(!pred.is_ignored("./src/a.ts"));
    }

    // ── project ignore files ───────────────────────────────────────────

    #[test]
    fn gitignore_entries_extend_defaults() {
        let p = project(&[(".gitignore", "secrets.txt\nlogs/\n")]);
        let pred = IgnorePredicate::build(&p);
        assert!(pred.is_ignored("secrets.txt"));
        assert!(pred.is_ignored("logs/app.log"));
        assert!(!pred.is_ignored("src/main.rs"));
    }

    #[test]
    fn agentignore_entries_are_honored() {
        let p = project(&[(".agentignore", "generated/**\n")]);
        let pred = IgnorePredicate::build(&p);
        assert!(pred.is_ignored("generated/out.bin"));
        assert!(pred.is_ignored("generated/deep/out.bin"));
    }

    #[test]
    fn ignore_files_themselves_are_always_kept() {
        let p = project(&[(".gitignore", ".gitignore\n.agentignore\n*")]);
        let pred = IgnorePredicate::build(&p);
        assert!(!pred.is_ignored(".gitignore"));
        assert!(!pred.is_ignored(".agentignore"));
    }

    #[test]
    fn negation_reinstates_a_path() {
        let p = project(&[(".gitignore", "docs/\n!docs/keep.md\n")]);
        let pred = IgnorePredicate::build(&p);
        assert!(pred.is_ignored("docs/skip.md"));
        assert!(!pred.is_ignored("docs/keep.md"));
    }

    // ── filtering ──────────────────────────────────────────────────────

    #[test]
    fn filter_drops_ignored_paths_and_keeps_ignore_files() {
        let p = indexmap! {
            "src/a.ts".to_string() => "a".to_string(),
            "node_modules/x.js".to_string() => "x".to_string(),
            ".gitignore".to_string() => "dist/".to_string(),
            "dist/out.js".to_string() => "o".to_string(),
        };
        let pred = IgnorePredicate::build(&p);
        let filtered = pred.filter(&p);
        assert!(filtered.contains_key("src/a.ts"));
        assert!(filtered.contains_key(".gitignore"));
        assert!(!filtered.contains_key("node_modules/x.js"));
        assert!(!filtered.contains_key("dist/out.js"));
    }
}
