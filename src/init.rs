//! Project initialization — scaffold .evonest/ with templates.

use std::fs;
use std::path::Path;

use chrono::Utc;
use regex::Regex;

use crate::error::{Error, Result};
use crate::mutations::{builtin_adversarials, builtin_personas};
use crate::paths::EvonestPaths;
use crate::runner::{LmRequest, LmRunner, OBSERVE_TOOLS};

const CONFIG_TEMPLATE: &str = include_str!("templates/config.json");
const IDENTITY_TEMPLATE: &str = include_str!("templates/identity.md");
const PROGRESS_TEMPLATE: &str = include_str!("templates/progress.json");
const BACKLOG_TEMPLATE: &str = include_str!("templates/backlog.json");
const IDENTITY_DRAFT_PROMPT: &str = include_str!("prompts/identity_draft.md");

/// Create .evonest/ in a project directory. Idempotent: existing files are
/// left alone, and re-running only reports what was newly created.
pub fn init_project(path: &Path, level: &str, identity_draft: Option<String>) -> Result<String> {
    if !path.is_dir() {
        return Err(Error::Other(format!(
            "directory not found: {}",
            path.display()
        )));
    }
    let paths = EvonestPaths::new(path);
    let mut created: Vec<String> = Vec::new();

    for dir in [
        paths.root.clone(),
        paths.history_dir(),
        paths.root.join("logs"),
        paths.stimuli_dir(),
        paths.processed_stimuli_dir(),
        paths.decisions_dir(),
        paths.proposals_dir(),
    ] {
        fs::create_dir_all(dir)?;
    }

    if !paths.config().exists() {
        fs::write(paths.config(), render_config_template(level)?)?;
        created.push("config.json".into());
    }
    if !paths.identity().exists() {
        let content = identity_draft.unwrap_or_else(|| IDENTITY_TEMPLATE.to_string());
        fs::write(paths.identity(), content)?;
        created.push("identity.md".into());
    }
    if !paths.progress().exists() {
        let mut progress: serde_json::Value = serde_json::from_str(PROGRESS_TEMPLATE)?;
        progress["activation"]["initialized_at"] =
            serde_json::Value::String(Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string());
        fs::write(
            paths.progress(),
            serde_json::to_string_pretty(&progress)? + "\n",
        )?;
        created.push("progress.json".into());
    }
    if !paths.backlog().exists() {
        fs::write(paths.backlog(), BACKLOG_TEMPLATE)?;
        created.push("backlog.json".into());
    }
    for (path, name) in [
        (paths.dynamic_personas(), "dynamic-personas.json"),
        (paths.dynamic_adversarials(), "dynamic-adversarials.json"),
    ] {
        if !path.exists() {
            fs::write(path, "[]\n")?;
            created.push(name.into());
        }
    }
    for (path, name) in [
        (paths.advice(), "advice.json"),
        (paths.environment(), "environment.json"),
        (paths.scout(), "scout.json"),
    ] {
        if !path.exists() {
            fs::write(path, "{}\n")?;
            created.push(name.into());
        }
    }

    ensure_gitignore(path)?;

    let mut lines = vec![format!("Initialized: {}", paths.root.display())];
    if created.is_empty() {
        lines.push("Already initialized — nothing created.".into());
    } else {
        lines.push(format!("Created: {}", created.join(", ")));
    }
    lines.extend([
        String::new(),
        "Next steps:".into(),
        format!(
            "  1. Edit {} — describe your project",
            paths.identity().display()
        ),
        format!(
            "  2. Edit {} — set verify commands",
            paths.config().display()
        ),
        format!("  3. Run first analysis: evonest analyze {}", path.display()),
    ]);
    Ok(lines.join("\n"))
}

/// Seed the config template with the chosen level and full per-id toggle
/// maps for every built-in mutation.
fn render_config_template(level: &str) -> Result<String> {
    let stripped = Regex::new(r"(?m)^\s*//[^\n]*\n")
        .expect("static regex")
        .replace_all(CONFIG_TEMPLATE, "")
        .into_owned();
    let mut config: serde_json::Value = serde_json::from_str(&stripped)?;
    config["active_level"] = serde_json::Value::String(level.to_string());
    config["personas"] = builtin_personas()
        .iter()
        .map(|p| (p.id.clone(), serde_json::Value::Bool(true)))
        .collect::<serde_json::Map<_, _>>()
        .into();
    config["adversarials"] = builtin_adversarials()
        .iter()
        .map(|a| (a.id.clone(), serde_json::Value::Bool(true)))
        .collect::<serde_json::Map<_, _>>()
        .into();
    Ok(serde_json::to_string_pretty(&config)? + "\n")
}

/// Keep engine state out of the project's version control.
fn ensure_gitignore(project: &Path) -> Result<()> {
    let gitignore = project.join(".gitignore");
    if gitignore.exists() {
        let content = fs::read_to_string(&gitignore)?;
        if !content.contains(".evonest") {
            let mut updated = content;
            if !updated.ends_with('\n') {
                updated.push('\n');
            }
            updated.push_str("\n# Evonest evolution data\n.evonest/\n");
            fs::write(&gitignore, updated)?;
        }
    } else {
        fs::write(&gitignore, "# Evonest evolution data\n.evonest/\n")?;
    }
    Ok(())
}

/// Ask the LM to explore the project and draft identity.md. Returns None
/// when the CLI is unavailable or produced nothing usable, so init can fall
/// back to the blank template.
pub async fn draft_identity(project: &Path, runner: &LmRunner) -> Option<String> {
    let result = runner
        .run(&LmRequest {
            prompt: IDENTITY_DRAFT_PROMPT.to_string(),
            model: "haiku".into(),
            max_turns: 15,
            allowed_tools: OBSERVE_TOOLS,
            cwd: project.to_path_buf(),
        })
        .await
        .ok()?;
    if !result.success {
        return None;
    }
    let cleaned = clean_identity_draft(&result.output);
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Strip LLM preamble and code fences from an identity draft.
fn clean_identity_draft(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    let fence = Regex::new(r"(?s)```(?:markdown|md)?\s*\n(.*?)```").expect("static regex");
    if let Some(captures) = fence.captures(&text) {
        text = captures[1].trim().to_string();
    }

    if let Some(pos) = text.find("\n# ") {
        if !text.starts_with('#') {
            text = text[pos + 1..].to_string();
        }
    }

    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_template_renders_with_toggles() {
        let rendered = render_config_template("deep").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(parsed["active_level"], "deep");
        assert_eq!(parsed["personas"]["architect"], true);
        assert_eq!(parsed["adversarials"]["corrupt-state"], true);
    }

    #[test]
    fn clean_identity_draft_unwraps_fences_and_preamble() {
        let raw = "Here is the draft:\n```markdown\n# Project Identity\n\n## Mission\nShip.\n```";
        let cleaned = clean_identity_draft(raw);
        assert!(cleaned.starts_with("# Project Identity"));
        assert!(cleaned.contains("## Mission"));
        assert!(!cleaned.contains("```"));
    }
}
