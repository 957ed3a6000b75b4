//! All .evonest/ path calculations in one place. Pure, no I/O.

use std::path::{Path, PathBuf};

/// Computes paths for every file and directory inside a `.evonest/` root.
#[derive(Debug, Clone)]
pub struct EvonestPaths {
    pub project: PathBuf,
    pub root: PathBuf,
}

impl EvonestPaths {
    pub fn new(project: impl AsRef<Path>) -> Self {
        let project = project.as_ref().to_path_buf();
        let root = project.join(".evonest");
        Self { project, root }
    }

    // ── Config / meta ───────────────────────────────────────────────────

    pub fn config(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn identity(&self) -> PathBuf {
        self.root.join("identity.md")
    }

    pub fn progress(&self) -> PathBuf {
        self.root.join("progress.json")
    }

    pub fn backlog(&self) -> PathBuf {
        self.root.join("backlog.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(".lock")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("logs").join("orchestrator.log")
    }

    pub fn advice(&self) -> PathBuf {
        self.root.join("advice.json")
    }

    pub fn environment(&self) -> PathBuf {
        self.root.join("environment.json")
    }

    pub fn scout(&self) -> PathBuf {
        self.root.join("scout.json")
    }

    pub fn cautious_resume(&self) -> PathBuf {
        self.root.join(".cautious-resume")
    }

    // ── Dynamic mutations ───────────────────────────────────────────────

    pub fn dynamic_personas(&self) -> PathBuf {
        self.root.join("dynamic-personas.json")
    }

    pub fn dynamic_adversarials(&self) -> PathBuf {
        self.root.join("dynamic-adversarials.json")
    }

    // ── Directories ─────────────────────────────────────────────────────

    pub fn history_dir(&self) -> PathBuf {
        self.root.join("history")
    }

    pub fn stimuli_dir(&self) -> PathBuf {
        self.root.join("stimuli")
    }

    pub fn processed_stimuli_dir(&self) -> PathBuf {
        self.root.join("stimuli").join(".processed")
    }

    pub fn decisions_dir(&self) -> PathBuf {
        self.root.join("decisions")
    }

    pub fn proposals_dir(&self) -> PathBuf {
        self.root.join("proposals")
    }

    pub fn proposals_done_dir(&self) -> PathBuf {
        self.root.join("proposals").join("done")
    }

    // ── Phase artifacts (latest cycle) ──────────────────────────────────

    pub fn observe_artifact(&self) -> PathBuf {
        self.root.join("observe.txt")
    }

    pub fn plan_artifact(&self) -> PathBuf {
        self.root.join("plan.txt")
    }

    pub fn execute_artifact(&self) -> PathBuf {
        self.root.join("execute.txt")
    }

    pub fn meta_observe_artifact(&self) -> PathBuf {
        self.root.join("meta-observe.txt")
    }

    pub fn scout_artifact(&self) -> PathBuf {
        self.root.join("scout.txt")
    }
}
