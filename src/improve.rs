//! Improve mode — execute an existing proposal.
//!
//! Skips Observe and Plan entirely: the selected proposal file becomes the
//! plan artifact, then Execute + Verify run behind the usual git
//! checkpoint. A proposal that passes verification is archived to
//! proposals/done/ whether or not it produced code changes, so design-only
//! proposals never jam the queue.

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::boundary::BoundarySet;
use crate::config::EvonestConfig;
use crate::error::{Error, Result};
use crate::git::GitGateway;
use crate::lock::EngineLock;
use crate::phases::{run_execute, run_verify};
use crate::progress::{recalculate_weights, update_progress};
use crate::runner::LmRunner;
use crate::state::ProjectState;
use crate::types::{CycleOutcome, CycleRecord, PhaseRecord};

fn priority_rank(priority: &str) -> u8 {
    match priority {
        "high" => 0,
        "medium" => 1,
        "low" => 2,
        _ => 1,
    }
}

/// Priority declared in a proposal's header lines, defaulting to medium.
fn proposal_priority(content: &str) -> u8 {
    for line in content.lines().take(10) {
        let lower = line.to_lowercase();
        if lower.contains("priority") {
            for priority in ["high", "medium", "low"] {
                if lower.contains(priority) {
                    return priority_rank(priority);
                }
            }
        }
    }
    1
}

/// Pick the proposal to implement: an explicit id wins, otherwise highest
/// priority first, oldest filename within the same priority.
pub fn select_proposal(state: &ProjectState, proposal_id: Option<&str>) -> Result<Option<PathBuf>> {
    if let Some(id) = proposal_id {
        let name = Path::new(id)
            .file_name()
            .ok_or_else(|| Error::Other(format!("bad proposal id: {id}")))?;
        let candidate = state.paths.proposals_dir().join(name);
        if !candidate.exists() {
            return Err(Error::Other(format!(
                "proposal not found: {}",
                candidate.display()
            )));
        }
        return Ok(Some(candidate));
    }

    let mut proposals = state.list_proposals()?;
    if proposals.is_empty() {
        return Ok(None);
    }
    proposals.sort_by_key(|path| {
        let priority = std::fs::read_to_string(path)
            .map(|content| proposal_priority(&content))
            .unwrap_or(1);
        (priority, path.file_name().map(|n| n.to_os_string()))
    });
    Ok(proposals.into_iter().next())
}

/// Commit message derived from the proposal's title line.
fn commit_message_from_proposal(content: &str) -> Option<String> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("# Proposal:"))
        .map(|title| {
            let normalized = title.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("improve: {}", normalized.to_lowercase())
        })
}

/// Persona recorded in the proposal header, for statistics attribution.
fn proposal_persona(content: &str) -> String {
    content
        .lines()
        .take(15)
        .find_map(|line| line.strip_prefix("**From persona**:"))
        .map(|p| p.trim().trim_end_matches("  ").trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "improve".to_string())
}

pub struct ImproveReport {
    pub message: String,
    pub any_verify_failed: bool,
}

/// Execute one proposal (or, with `all`, drain the pending queue).
pub async fn run_improve(
    project: &Path,
    proposal_id: Option<String>,
    all: bool,
    cancel: CancellationToken,
) -> Result<ImproveReport> {
    let state = ProjectState::open(project)?;
    state.ensure_dirs()?;
    let config = EvonestConfig::load(project)?;
    let git = GitGateway::new(project);
    let runner = LmRunner::new(cancel.clone());

    let _lock = EngineLock::acquire(state.paths.lock())?;

    let mut messages: Vec<String> = Vec::new();
    let mut any_verify_failed = false;
    let mut attempted: Vec<PathBuf> = Vec::new();

    loop {
        if cancel.is_cancelled() {
            messages.push("Cancelled.".to_string());
            break;
        }

        let selected = select_proposal(&state, proposal_id.as_deref())?;
        let Some(path) = selected else {
            if messages.is_empty() {
                messages.push("No pending proposals. Run `evonest analyze` first.".to_string());
            }
            break;
        };
        // A failing proposal stays pending; don't retry it within one run
        if attempted.contains(&path) {
            break;
        }
        attempted.push(path.clone());

        let outcome = improve_one(&state, &config, &git, &runner, &path).await?;
        if outcome.failed {
            any_verify_failed = true;
        }
        messages.push(outcome.message);

        if !all || proposal_id.is_some() {
            break;
        }
    }

    Ok(ImproveReport {
        message: messages.join("\n"),
        any_verify_failed,
    })
}

struct ImproveOutcome {
    message: String,
    failed: bool,
}

async fn improve_one(
    state: &ProjectState,
    config: &EvonestConfig,
    git: &GitGateway,
    runner: &LmRunner,
    proposal_path: &Path,
) -> Result<ImproveOutcome> {
    let proposal_name = proposal_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let content = std::fs::read_to_string(proposal_path)?;
    let persona_id = proposal_persona(&content);

    state.log(&format!("  [Improve] Selected proposal: {proposal_name}"));

    // The proposal IS the plan
    state.write_text(&state.paths.plan_artifact(), &content)?;

    let identity = state.read_identity()?;
    let boundaries = BoundarySet::from_identity(&identity)?;

    let cycle_start = Instant::now();
    let started_at = Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
    let mut phases: Vec<PhaseRecord> = Vec::new();

    let stashed = git.stash(&format!("improve-{proposal_name}")).await?;

    let phase_start = Instant::now();
    let execute = run_execute(state, config, runner, &boundaries, "").await?;
    phases.push(PhaseRecord {
        phase: "execute".into(),
        status: (if execute.success { "success" } else { "failure" }).into(),
        duration_ms: phase_start.elapsed().as_millis() as u64,
    });
    state.log(&format!(
        "  [Improve] Execute complete ({} bytes)",
        execute.output.len()
    ));

    let touched = git.changed_files().await?;
    let boundary_violation = boundaries.first_violation(&touched).map(String::from);

    if let Some(violation) = boundary_violation {
        state.log(&format!(
            "  [Improve] FAIL: boundary violation ({violation}) — Reverting."
        ));
        git.revert(stashed).await?;
        phases.push(PhaseRecord {
            phase: "verify".into(),
            status: format!("boundary violation: {violation}"),
            duration_ms: 0,
        });
        return record_improve(state, RecordArgs {
            persona_id,
            started_at,
            phases,
            outcome: CycleOutcome::Failure,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: Vec::new(),
            message: format!("Improve failed: boundary violation ({violation}). Changes reverted."),
        });
    }

    // Design-only proposal: nothing changed, archive without verifying
    if touched.is_empty() {
        if stashed {
            git.stash_drop().await;
        }
        let dest = state.mark_proposal_done(&proposal_name)?;
        state.log(&format!(
            "  [Improve] Proposal archived (no changes needed): {}",
            dest.display()
        ));
        phases.push(PhaseRecord {
            phase: "verify".into(),
            status: "skipped".into(),
            duration_ms: 0,
        });
        return record_improve(state, RecordArgs {
            persona_id,
            started_at,
            phases,
            outcome: CycleOutcome::Skipped,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: Vec::new(),
            message: "Improve skipped: Execute succeeded but no files were changed.".to_string(),
        });
    }

    let phase_start = Instant::now();
    let verify = run_verify(state, config, git, 0).await?;
    phases.push(PhaseRecord {
        phase: "verify".into(),
        status: (if verify.overall { "success" } else { "failure" }).into(),
        duration_ms: phase_start.elapsed().as_millis() as u64,
    });

    let commit_message =
        commit_message_from_proposal(&content).unwrap_or_else(|| verify.commit_message.clone());

    let (outcome, message, commit_sha, files_touched) = if verify.overall
        && !verify.changed_files.is_empty()
    {
        state.log(&format!("  [Improve] PASS: {commit_message}"));
        let (sha, pr_url) = if config.code_output == "pr" {
            let stem = proposal_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let branch = format!("evonest/improve-{stem}");
            git.commit_pr(&commit_message, &branch, "Automated improvement by Evonest.")
                .await?
        } else {
            (git.commit(&commit_message).await?, None)
        };
        if stashed {
            git.stash_drop().await;
        }
        let dest = state.mark_proposal_done(&proposal_name)?;
        state.log(&format!("  [Improve] Proposal archived to: {}", dest.display()));
        let mut message = format!(
            "Improve complete: {commit_message}\nChanged files: {}\nProposal archived: {}\nDuration: {}s",
            verify.changed_files.join(", "),
            proposal_name,
            cycle_start.elapsed().as_secs()
        );
        if let Some(url) = pr_url {
            message.push_str(&format!("\nPR: {url}"));
        }
        (
            CycleOutcome::Success,
            message,
            Some(sha),
            verify.changed_files.clone(),
        )
    } else if verify.overall {
        // Design-only proposal: no code changed, archive it anyway
        if stashed {
            git.stash_drop().await;
        }
        let dest = state.mark_proposal_done(&proposal_name)?;
        state.log(&format!(
            "  [Improve] Proposal archived (no changes needed): {}",
            dest.display()
        ));
        (
            CycleOutcome::Skipped,
            "Improve skipped: Execute succeeded but no files were changed.".to_string(),
            None,
            Vec::new(),
        )
    } else {
        git.revert(stashed).await.map_err(|e| {
            state.log(&format!("  FATAL: revert failed, aborting run: {e}"));
            e
        })?;
        (
            CycleOutcome::Failure,
            format!("Improve failed: {}. Changes reverted.", verify.notes),
            None,
            verify.changed_files.clone(),
        )
    };

    record_improve(state, RecordArgs {
        persona_id,
        started_at,
        phases,
        outcome,
        commit_sha,
        commit_message: if outcome == CycleOutcome::Success {
            commit_message
        } else {
            String::new()
        },
        files_touched,
        message,
    })
}

struct RecordArgs {
    persona_id: String,
    started_at: String,
    phases: Vec<PhaseRecord>,
    outcome: CycleOutcome,
    commit_sha: Option<String>,
    commit_message: String,
    files_touched: Vec<String>,
    message: String,
}

/// Shared bookkeeping tail: progress, weights, history.
fn record_improve(state: &ProjectState, args: RecordArgs) -> Result<ImproveOutcome> {
    let progress = update_progress(
        state,
        args.outcome == CycleOutcome::Success,
        &args.persona_id,
        None,
        &args.files_touched,
    )?;
    let persona_ids: Vec<String> = crate::mutations::list_all_personas(state)?
        .into_iter()
        .map(|p| p.id)
        .collect();
    let adversarial_ids: Vec<String> = crate::mutations::list_all_adversarials(state)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    recalculate_weights(state, &persona_ids, &adversarial_ids)?;

    state.append_history(&CycleRecord {
        cycle_number: progress.total_cycles,
        started_at: args.started_at,
        ended_at: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        persona_id: args.persona_id,
        persona_name: "Improve".to_string(),
        adversarial_id: None,
        phases: args.phases,
        outcome: args.outcome,
        commit_sha: args.commit_sha,
        commit_message: args.commit_message,
        files_touched: args.files_touched,
    })?;

    Ok(ImproveOutcome {
        message: args.message,
        failed: args.outcome == CycleOutcome::Failure,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_message_uses_proposal_title() {
        let content = "# Proposal: Tighten The Parser\n\n**Priority**: high\n";
        assert_eq!(
            commit_message_from_proposal(content),
            Some("improve: tighten the parser".to_string())
        );
        assert_eq!(commit_message_from_proposal("no title here"), None);
    }

    #[test]
    fn proposal_priority_reads_header() {
        assert_eq!(proposal_priority("# P\n**Priority**: high\n"), 0);
        assert_eq!(proposal_priority("# P\n**Priority**: low\n"), 2);
        assert_eq!(proposal_priority("# P\nno priority line\n"), 1);
    }

    #[test]
    fn proposal_persona_falls_back() {
        let content = "# Proposal: X\n\n**From persona**: security-auditor  \n";
        assert_eq!(proposal_persona(content), "security-auditor");
        assert_eq!(proposal_persona("# Proposal: X\n"), "improve");
    }
}
