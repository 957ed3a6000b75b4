//! GitGateway — checkpoint, diff, commit, revert, scoped to one project.
//!
//! Every invocation runs with the project root as cwd and pathspecs limited
//! to `.`, so a package inside a monorepo never stages its siblings.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::warn;

use crate::error::{Error, Result};

pub struct GitGateway {
    root: PathBuf,
}

impl GitGateway {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| Error::git(format!("git exec failed: {e}")))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::git(format!(
                "git {} failed: {}",
                args.first().unwrap_or(&"?"),
                stderr.trim()
            )))
        }
    }

    /// Checkpoint the working tree (including untracked files) under a
    /// labeled stash. Returns false when there was nothing to save, so the
    /// caller knows not to pop or drop later.
    pub async fn stash(&self, label: &str) -> Result<bool> {
        let output = self
            .run(&["stash", "push", "-u", "-m", &format!("evonest-{label}"), "--", "."])
            .await?;
        Ok(!output.contains("No local changes"))
    }

    pub async fn stash_drop(&self) {
        if let Err(e) = self.run(&["stash", "drop"]).await {
            // An empty stash list is the common, harmless case here
            warn!("stash drop: {e}");
        }
    }

    pub async fn has_changes(&self) -> Result<bool> {
        let status = self.run(&["status", "--porcelain", "--", "."]).await?;
        Ok(!status.is_empty())
    }

    /// Files changed relative to HEAD, project-relative paths.
    pub async fn changed_files(&self) -> Result<Vec<String>> {
        let diff = self
            .run(&["diff", "--name-only", "HEAD", "--", "."])
            .await?;
        let mut files: Vec<String> = diff
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();
        // Untracked files never show in diff HEAD; pick them up from status
        let status = self.run(&["status", "--porcelain", "--", "."]).await?;
        for line in status.lines() {
            if let Some(path) = line.strip_prefix("?? ") {
                files.push(path.trim().to_string());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    pub async fn diff_stat(&self) -> Result<String> {
        self.run(&["diff", "--stat", "HEAD", "--", "."]).await
    }

    pub async fn current_branch(&self) -> Result<String> {
        let branch = self.run(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(if branch.is_empty() { "main".into() } else { branch })
    }

    /// Stage everything in scope and commit. Returns the new commit sha.
    pub async fn commit(&self, message: &str) -> Result<String> {
        self.run(&["add", "-A", "--", "."]).await?;
        self.run(&["commit", "-m", message, "--quiet"]).await?;
        self.run(&["rev-parse", "HEAD"]).await
    }

    /// Branch, commit, push, and open a pull request via the gh CLI.
    /// Falls back to a direct commit on the current branch when push or PR
    /// creation fails. Returns (sha, pr_url).
    pub async fn commit_pr(
        &self,
        message: &str,
        branch: &str,
        body: &str,
    ) -> Result<(String, Option<String>)> {
        let base = self.current_branch().await?;
        self.run(&["checkout", "-b", branch]).await?;
        let sha = match self.commit(message).await {
            Ok(sha) => sha,
            Err(e) => {
                let _ = self.run(&["checkout", &base]).await;
                return Err(e);
            }
        };

        let pushed = self.run(&["push", "-u", "origin", branch]).await;
        let pr_url = match pushed {
            Ok(_) => {
                let output = Command::new("gh")
                    .args(["pr", "create", "--title", message, "--body", body, "--base", &base])
                    .current_dir(&self.root)
                    .output()
                    .await;
                match output {
                    Ok(out) if out.status.success() => {
                        Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
                    }
                    Ok(out) => {
                        warn!(
                            "gh pr create failed: {}",
                            String::from_utf8_lossy(&out.stderr).trim()
                        );
                        None
                    }
                    Err(e) => {
                        warn!("gh pr create failed: {e}");
                        None
                    }
                }
            }
            Err(e) => {
                warn!("git push failed, leaving commit on branch {branch}: {e}");
                None
            }
        };

        self.run(&["checkout", &base]).await?;
        if pr_url.is_none() {
            // Fold the branch commit back so the change is not stranded
            warn!("PR creation failed — falling back to direct merge of {branch}");
            self.run(&["merge", "--ff-only", branch]).await?;
            let _ = self.run(&["branch", "-D", branch]).await;
        }
        Ok((sha, pr_url))
    }

    /// Discard the working tree back to the pre-Execute checkpoint:
    /// checkout, clean, then pop the stash when one was taken.
    pub async fn revert(&self, pop_stash: bool) -> Result<()> {
        self.run(&["checkout", "--", "."]).await?;
        self.run(&["clean", "-fd", "--", "."]).await?;
        if pop_stash {
            self.run(&["stash", "pop"]).await?;
        }
        Ok(())
    }
}
