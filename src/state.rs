//! ProjectState — sole gateway to the on-disk .evonest/ directory.
//!
//! Every module reads and writes project files through this type.
//! Never construct .evonest/ paths manually elsewhere. All state writes
//! are atomic (temp file + rename), and filenames derived from model
//! output are slugified and checked to stay inside their directory.

use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::error::{Error, Result};
use crate::paths::EvonestPaths;
use crate::types::{
    Advice, Backlog, Adversarial, CycleRecord, Environment, Persona, Progress, ResumeToken,
    ScoutCache,
};

/// Convert a model-produced title into a filename-safe slug.
///
/// "Shell injection risk in verify.build" → "shell-injection-risk-in-verify-build"
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= 64 {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

fn atomic_write(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{ext}.tmp"),
        None => "tmp".to_string(),
    });
    let result = (|| -> Result<()> {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() && tmp.exists() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Join `name` onto `dir`, rejecting anything that would escape it.
fn scoped_file(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    let escapes = candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
        || !candidate.starts_with(dir);
    if escapes {
        return Err(Error::Other(format!(
            "path escapes {}: {name}",
            dir.display()
        )));
    }
    Ok(candidate)
}

pub struct ProjectState {
    pub paths: EvonestPaths,
}

impl ProjectState {
    /// Open an initialized project. Fails if `.evonest/` is missing.
    pub fn open(project: impl AsRef<Path>) -> Result<Self> {
        let project = project.as_ref();
        if !project.is_dir() {
            return Err(Error::NotInitialized(project.to_path_buf()));
        }
        let paths = EvonestPaths::new(project);
        if !paths.root.is_dir() {
            return Err(Error::NotInitialized(project.to_path_buf()));
        }
        Ok(Self { paths })
    }

    pub fn project(&self) -> &Path {
        &self.paths.project
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.paths.root.clone(),
            self.paths.history_dir(),
            self.paths.root.join("logs"),
            self.paths.stimuli_dir(),
            self.paths.processed_stimuli_dir(),
            self.paths.decisions_dir(),
            self.paths.proposals_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    // ── Generic I/O ─────────────────────────────────────────────────────

    fn read_json_or_default<T: DeserializeOwned + Default>(&self, path: &Path) -> Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| Error::corrupt(path, e.to_string()))
    }

    fn write_json<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let mut content = serde_json::to_string_pretty(data)?;
        content.push('\n');
        atomic_write(path, &content)
    }

    pub fn read_text(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            return Ok(String::new());
        }
        Ok(fs::read_to_string(path)?)
    }

    pub fn write_text(&self, path: &Path, content: &str) -> Result<()> {
        atomic_write(path, content)
    }

    // ── Identity ────────────────────────────────────────────────────────

    pub fn read_identity(&self) -> Result<String> {
        self.read_text(&self.paths.identity())
    }

    pub fn write_identity(&self, content: &str) -> Result<()> {
        self.write_text(&self.paths.identity(), content)
    }

    // ── Progress ────────────────────────────────────────────────────────

    pub fn read_progress(&self) -> Result<Progress> {
        self.read_json_or_default(&self.paths.progress())
    }

    pub fn write_progress(&self, progress: &Progress) -> Result<()> {
        self.write_json(&self.paths.progress(), progress)
    }

    // ── Backlog ─────────────────────────────────────────────────────────

    pub fn load_backlog(&self) -> Result<Backlog> {
        self.read_json_or_default(&self.paths.backlog())
    }

    pub fn save_backlog(&self, backlog: &Backlog) -> Result<()> {
        self.write_json(&self.paths.backlog(), backlog)
    }

    // ── Dynamic mutations ───────────────────────────────────────────────

    pub fn read_dynamic_personas(&self) -> Result<Vec<Persona>> {
        self.read_json_or_default(&self.paths.dynamic_personas())
    }

    pub fn write_dynamic_personas(&self, personas: &[Persona]) -> Result<()> {
        self.write_json(&self.paths.dynamic_personas(), &personas)
    }

    pub fn read_dynamic_adversarials(&self) -> Result<Vec<Adversarial>> {
        self.read_json_or_default(&self.paths.dynamic_adversarials())
    }

    pub fn write_dynamic_adversarials(&self, adversarials: &[Adversarial]) -> Result<()> {
        self.write_json(&self.paths.dynamic_adversarials(), &adversarials)
    }

    // ── Advice / environment / scout ────────────────────────────────────

    pub fn read_advice(&self) -> Result<Advice> {
        self.read_json_or_default(&self.paths.advice())
    }

    pub fn write_advice(&self, advice: &Advice) -> Result<()> {
        self.write_json(&self.paths.advice(), advice)
    }

    pub fn read_environment(&self) -> Result<Environment> {
        self.read_json_or_default(&self.paths.environment())
    }

    pub fn write_environment(&self, env: &Environment) -> Result<()> {
        self.write_json(&self.paths.environment(), env)
    }

    pub fn read_scout_cache(&self) -> Result<ScoutCache> {
        self.read_json_or_default(&self.paths.scout())
    }

    pub fn update_scout_cache(&self, cache: &ScoutCache) -> Result<()> {
        self.write_json(&self.paths.scout(), cache)
    }

    // ── Cautious resume token ───────────────────────────────────────────

    pub fn read_resume_token(&self) -> Result<Option<ResumeToken>> {
        let path = self.paths.cautious_resume();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let token = serde_json::from_str(&raw).map_err(|e| Error::corrupt(&path, e.to_string()))?;
        Ok(Some(token))
    }

    pub fn write_resume_token(&self, token: &ResumeToken) -> Result<()> {
        self.write_json(&self.paths.cautious_resume(), token)
    }

    pub fn clear_resume_token(&self) -> Result<()> {
        let path = self.paths.cautious_resume();
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    // ── Proposals ───────────────────────────────────────────────────────

    /// Save a proposal file. Filename carries an ordinal plus a timestamp,
    /// with the slugified title when one is available.
    pub fn create_proposal(&self, content: &str, title: Option<&str>) -> Result<String> {
        let dir = self.paths.proposals_dir();
        fs::create_dir_all(&dir)?;
        let ordinal = self.list_proposals()?.len() + 1;
        let ts = Utc::now().format("%H%M%S");
        let slug = title.map(slugify).filter(|s| !s.is_empty());
        let stem = match slug {
            Some(s) => format!("{ordinal:03}-{s}-{ts}"),
            None => format!("{ordinal:03}-proposal-{ts}"),
        };
        let mut path = scoped_file(&dir, &format!("{stem}.md"))?;
        let mut counter = 2;
        while path.exists() {
            path = scoped_file(&dir, &format!("{stem}-{counter}.md"))?;
            counter += 1;
        }
        atomic_write(&path, content)?;
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default())
    }

    /// Pending proposal files sorted by name (ordinal order).
    pub fn list_proposals(&self) -> Result<Vec<PathBuf>> {
        let dir = self.paths.proposals_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Move a consumed proposal into proposals/done/.
    pub fn mark_proposal_done(&self, filename: &str) -> Result<PathBuf> {
        let name = Path::new(filename)
            .file_name()
            .ok_or_else(|| Error::Other(format!("bad proposal name: {filename}")))?;
        let src = scoped_file(&self.paths.proposals_dir(), &name.to_string_lossy())?;
        if !src.exists() {
            return Err(Error::Other(format!(
                "proposal not found: {}",
                src.display()
            )));
        }
        let done = self.paths.proposals_done_dir();
        fs::create_dir_all(&done)?;
        let dest = done.join(name);
        fs::rename(&src, &dest)?;
        Ok(dest)
    }

    // ── Stimuli ─────────────────────────────────────────────────────────

    pub fn add_stimulus(&self, content: &str) -> Result<PathBuf> {
        let dir = self.paths.stimuli_dir();
        fs::create_dir_all(&dir)?;
        let ts = Utc::now().format("%Y%m%d-%H%M%S%.6f");
        let mut path = dir.join(format!("stimulus-{ts}.md"));
        let mut counter = 2;
        while path.exists() {
            path = dir.join(format!("stimulus-{ts}-{counter}.md"));
            counter += 1;
        }
        atomic_write(&path, content)?;
        Ok(path)
    }

    /// Read all unprocessed stimuli, move them to .processed/, return contents.
    pub fn consume_stimuli(&self) -> Result<Vec<String>> {
        let dir = self.paths.stimuli_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let processed = self.paths.processed_stimuli_dir();
        fs::create_dir_all(&processed)?;
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
            .collect();
        files.sort();
        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            contents.push(fs::read_to_string(&file)?);
            if let Some(name) = file.file_name() {
                fs::rename(&file, processed.join(name))?;
            }
        }
        Ok(contents)
    }

    // ── Decisions ───────────────────────────────────────────────────────

    pub fn add_decision(&self, content: &str) -> Result<PathBuf> {
        let dir = self.paths.decisions_dir();
        fs::create_dir_all(&dir)?;
        let ts = Utc::now().format("%Y%m%d-%H%M%S%.6f");
        let mut path = dir.join(format!("decision-{ts}.md"));
        let mut counter = 2;
        while path.exists() {
            path = dir.join(format!("decision-{ts}-{counter}.md"));
            counter += 1;
        }
        atomic_write(&path, content)?;
        Ok(path)
    }

    /// Read all decision files, delete them, return contents. Single-shot.
    pub fn consume_decisions(&self) -> Result<Vec<String>> {
        let dir = self.paths.decisions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "md"))
            .collect();
        files.sort();
        let mut contents = Vec::with_capacity(files.len());
        for file in files {
            contents.push(fs::read_to_string(&file)?);
            fs::remove_file(&file)?;
        }
        Ok(contents)
    }

    // ── History ─────────────────────────────────────────────────────────

    pub fn append_history(&self, record: &CycleRecord) -> Result<PathBuf> {
        let dir = self.paths.history_dir();
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("cycle-{:04}.json", record.cycle_number));
        self.write_json(&path, record)?;
        Ok(path)
    }

    pub fn list_history_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.paths.history_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("cycle-") && n.ends_with(".json"))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Most recent history records, oldest first.
    pub fn read_history(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let files = self.list_history_files()?;
        let start = files.len().saturating_sub(limit);
        let mut records = Vec::with_capacity(files.len() - start);
        for file in &files[start..] {
            let raw = fs::read_to_string(file)?;
            let record =
                serde_json::from_str(&raw).map_err(|e| Error::corrupt(file, e.to_string()))?;
            records.push(record);
        }
        Ok(records)
    }

    // ── Run log ─────────────────────────────────────────────────────────

    /// Append a timestamped line to the orchestrator run log. Log failures
    /// are reported through tracing but never abort the run.
    pub fn log(&self, message: &str) {
        info!("{message}");
        let path = self.paths.log();
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let ts = Utc::now().format("%Y-%m-%d %H:%M:%S");
            let mut f = fs::OpenOptions::new().create(true).append(true).open(path)?;
            writeln!(f, "{ts}: {message}")
        })();
        if let Err(e) = result {
            tracing::warn!("run log write failed: {e}");
        }
    }

    // ── Status summary ──────────────────────────────────────────────────

    pub fn summary(&self) -> Result<String> {
        let progress = self.read_progress()?;
        let total = progress.total_cycles;
        let rate = if total > 0 {
            (progress.total_successes as f64 / total as f64 * 100.0).round() as u32
        } else {
            0
        };
        let mut lines = vec![
            format!("Project: {}", self.paths.project.display()),
            format!(
                "Cycles: {total} (success: {}, failure: {}, rate: {rate}%)",
                progress.total_successes, progress.total_failures
            ),
            format!(
                "Last run: {}",
                progress.last_run.as_deref().unwrap_or("never")
            ),
            format!(
                "Running: {}",
                if self.paths.lock().exists() { "yes" } else { "no" }
            ),
            format!("Pending proposals: {}", self.list_proposals()?.len()),
        ];
        if !progress.converged_areas.is_empty() {
            lines.push(format!(
                "Converged areas: {}",
                progress.converged_areas.join(", ")
            ));
        }
        Ok(lines.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_strips_and_collapses() {
        assert_eq!(
            slugify("Shell injection risk in verify.build"),
            "shell-injection-risk-in-verify-build"
        );
        assert_eq!(slugify("  --Weird__ Title!!  "), "weird-title");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn slugify_truncates_to_64() {
        let long = "x".repeat(200);
        assert!(slugify(&long).len() <= 64);
    }

    #[test]
    fn scoped_file_rejects_traversal() {
        let dir = Path::new("/tmp/evonest-test/proposals");
        assert!(scoped_file(dir, "../../etc/passwd").is_err());
        assert!(scoped_file(dir, "ok.md").is_ok());
    }
}
