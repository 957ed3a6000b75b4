//! Verify phase — run the configured build and test commands, then read
//! the git diff to learn what actually changed.

use std::time::Duration;

use tokio::process::Command;

use crate::config::EvonestConfig;
use crate::error::Result;
use crate::git::GitGateway;
use crate::state::ProjectState;

use super::envelope::extract_json;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct VerifyOutcome {
    pub build_passed: bool,
    pub test_passed: bool,
    pub overall: bool,
    pub changed_files: Vec<String>,
    pub diff_stat: String,
    pub commit_message: String,
    pub notes: String,
}

/// Run a user-configured shell command inside the project. A missing
/// command (`null`) passes trivially.
async fn run_check(state: &ProjectState, label: &str, command: &str) -> bool {
    let result = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new("bash")
            .arg("-c")
            .arg(command)
            .current_dir(state.project())
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            state.log(&format!("    {label}: PASSED"));
            true
        }
        Ok(Ok(output)) => {
            state.log(&format!("    {label}: FAILED"));
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .trim()
                .chars()
                .rev()
                .take(500)
                .collect::<String>()
                .chars()
                .rev()
                .collect();
            if !tail.is_empty() {
                state.log(&format!("    {label} stderr: {tail}"));
            }
            false
        }
        Ok(Err(e)) => {
            state.log(&format!("    {label}: FAILED (spawn: {e})"));
            false
        }
        Err(_) => {
            state.log(&format!("    {label}: FAILED (timeout)"));
            false
        }
    }
}

pub async fn run_verify(
    state: &ProjectState,
    config: &EvonestConfig,
    git: &GitGateway,
    cycle_number: u32,
) -> Result<VerifyOutcome> {
    let mut notes: Vec<&str> = Vec::new();

    let build_passed = match &config.verify.build {
        Some(cmd) => {
            let ok = run_check(state, "Build", cmd).await;
            notes.push(if ok { "build: passed" } else { "build: FAILED" });
            ok
        }
        None => true,
    };

    let test_passed = match &config.verify.test {
        Some(cmd) => {
            let ok = run_check(state, "Tests", cmd).await;
            notes.push(if ok { "tests: passed" } else { "tests: FAILED" });
            ok
        }
        None => true,
    };

    let changed_files = git.changed_files().await?;
    let diff_stat = git.diff_stat().await.unwrap_or_default();

    let plan_text = state.read_text(&state.paths.plan_artifact())?;
    let commit_message = extract_commit_message(&plan_text, cycle_number);

    Ok(VerifyOutcome {
        build_passed,
        test_passed,
        overall: build_passed && test_passed,
        changed_files,
        diff_stat,
        commit_message,
        notes: notes.join(", "),
    })
}

/// Commit message from the plan envelope, with a plain fallback.
pub(crate) fn extract_commit_message(plan_text: &str, cycle_number: u32) -> String {
    extract_json(plan_text)
        .and_then(|envelope| {
            envelope
                .get("commit_message")
                .and_then(|m| m.as_str())
                .filter(|m| !m.trim().is_empty())
                .map(String::from)
        })
        .unwrap_or_else(|| format!("evolve: auto-improvement (cycle {cycle_number})"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_comes_from_plan_envelope() {
        let plan = "prose\n```json\n{\"commit_message\": \"fix: tighten parser\"}\n```";
        assert_eq!(extract_commit_message(plan, 3), "fix: tighten parser");
    }

    #[test]
    fn commit_message_falls_back_per_cycle() {
        assert_eq!(
            extract_commit_message("no envelope here", 7),
            "evolve: auto-improvement (cycle 7)"
        );
    }
}
