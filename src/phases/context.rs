//! Static project signals gathered once per run and injected into Observe
//! prompts, so the LM does not burn turns rediscovering them.

use std::path::Path;

use tokio::process::Command;
use walkdir::WalkDir;

const FILE_TREE_CAP: usize = 150;
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".venv",
    "venv",
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
];

async fn run_git(project: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(project)
        .output()
        .await
        .ok()?;
    if output.status.success() {
        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!text.is_empty()).then_some(text)
    } else {
        None
    }
}

/// Recent git history plus the tracked file tree, as a markdown section.
/// Commands that fail are skipped silently — the prompt just gets less
/// context.
pub async fn gather_static_context(project: &Path) -> String {
    let mut sections: Vec<String> = Vec::new();

    if let Some(log) = run_git(project, &["log", "--stat", "-5", "--oneline", "--", "."]).await {
        sections.push(format!("### Recent Git History\n\n```\n{log}\n```"));
    }

    if let Some(files) = run_git(
        project,
        &["ls-files", "--cached", "--others", "--exclude-standard", "--", "."],
    )
    .await
    {
        let listed: Vec<&str> = files
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter(|line| !SKIP_DIRS.iter().any(|d| line.contains(&format!("{d}/"))))
            .take(FILE_TREE_CAP)
            .collect();
        if !listed.is_empty() {
            sections.push(format!(
                "### Source File Tree\n\n```\n{}\n```",
                listed.join("\n")
            ));
        }
    }

    if sections.is_empty() {
        return String::new();
    }
    format!(
        "## Pre-gathered Project Signals\n\n{}",
        sections.join("\n\n")
    )
}

/// Count tracked source files, respecting .gitignore. Falls back to a
/// directory walk excluding the usual build/vendor dirs when git is
/// unavailable.
pub async fn count_source_files(project: &Path) -> usize {
    if let Some(files) = run_git(
        project,
        &["ls-files", "--cached", "--others", "--exclude-standard"],
    )
    .await
    {
        return files.lines().filter(|l| !l.trim().is_empty()).count();
    }

    WalkDir::new(project)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !SKIP_DIRS.contains(&name.as_ref())
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn count_falls_back_to_walk_without_git() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn main() {}").unwrap();
        std::fs::create_dir_all(dir.path().join("target")).unwrap();
        std::fs::write(dir.path().join("target").join("junk.o"), "x").unwrap();
        let count = count_source_files(dir.path()).await;
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn static_context_is_empty_without_git() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = gather_static_context(dir.path()).await;
        assert!(ctx.is_empty());
    }
}
