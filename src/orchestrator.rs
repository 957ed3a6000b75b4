//! Orchestrator — the evolution cycle loop.
//!
//! evolve: gates → mutation selection → Observe → Plan → Execute → Verify →
//! commit or revert → progress update → weight recompute → backlog prune →
//! history append. analyze: Observe only, everything becomes a proposal.
//! Cautious runs pause after Plan behind an externalized resume token.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio_util::sync::CancellationToken;

use crate::backlog;
use crate::boundary::BoundarySet;
use crate::config::EvonestConfig;
use crate::error::{Error, Result};
use crate::git::GitGateway;
use crate::lock::EngineLock;
use crate::meta::{run_meta, should_run_meta};
use crate::mutations::{
    list_all_adversarials, list_all_personas, select_mutation, sweep_persona_ids,
    SelectedMutation, SelectionOverrides,
};
use crate::phases::{
    count_source_files, gather_static_context, run_execute, run_observe, run_plan, run_verify,
    ObserveArgs, VerifyOutcome,
};
use crate::progress::{recalculate_weights, rebuild_from_history, update_progress};
use crate::runner::LmRunner;
use crate::scout::{run_scout, should_run_scout};
use crate::state::ProjectState;
use crate::types::{CycleOutcome, CycleRecord, PhaseRecord, ResumeToken};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cycles: Option<u32>,
    pub no_meta: bool,
    pub no_scout: bool,
    pub observe_mode: Option<String>,
    pub persona_id: Option<String>,
    pub adversarial_id: Option<String>,
    pub group: Option<String>,
    pub all_personas: bool,
    pub cautious: bool,
    pub level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub any_verify_failed: bool,
    pub message: String,
}

fn now_ts() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Resolve config with runtime overrides and scale the observe turn budget
/// to the project's size.
async fn resolve_config(project: &Path, opts: &RunOptions) -> Result<EvonestConfig> {
    let mut config = EvonestConfig::load(project)?;
    if let Some(level) = &opts.level {
        config.set_level(level)?;
    }
    if let Some(cycles) = opts.cycles {
        config.max_cycles_per_run = cycles;
    }
    if let Some(mode) = &opts.observe_mode {
        config.observe_mode = mode.clone();
        config.validate()?;
    }

    // Observe turn budget scales with project size, floored per mode
    let file_count = count_source_files(project).await as f64;
    config.max_turns.observe = config
        .observe_turns_min_quick
        .max((file_count * config.observe_turns_quick_ratio) as u32);
    config.max_turns.observe_deep = config
        .observe_turns_min_deep
        .max((file_count * config.observe_turns_deep_ratio) as u32);
    Ok(config)
}

/// Startup consistency check: progress counters must agree with history.
fn check_progress_consistency(state: &ProjectState) {
    let Ok(progress) = state.read_progress() else { return };
    let Ok(records) = state.read_history(usize::MAX) else { return };
    if records.is_empty() {
        return;
    }
    let rebuilt = rebuild_from_history(&records);
    if rebuilt.total_cycles != progress.total_cycles
        || rebuilt.total_successes != progress.total_successes
    {
        state.log(&format!(
            "  WARNING: progress counters disagree with history \
             (progress {}/{}, history {}/{})",
            progress.total_successes,
            progress.total_cycles,
            rebuilt.total_successes,
            rebuilt.total_cycles
        ));
    }
}

fn deep_observe_this_cycle(config: &EvonestConfig, total_so_far: u32) -> bool {
    match config.observe_mode.as_str() {
        "deep" => true,
        "quick" => false,
        _ => {
            config.deep_cycle_interval > 0
                && total_so_far > 0
                && total_so_far % config.deep_cycle_interval == 0
        }
    }
}

fn stop_requested(mutation: &SelectedMutation) -> bool {
    mutation.decisions.iter().any(|d| {
        d.lines()
            .map(str::trim)
            .find(|l| !l.is_empty() && !l.starts_with('#'))
            .is_some_and(|l| l.to_lowercase().starts_with("stop"))
    })
}

struct CycleContext<'a> {
    state: &'a ProjectState,
    config: &'a EvonestConfig,
    git: &'a GitGateway,
    runner: &'a LmRunner,
}

/// Run N full evolution cycles on a project.
pub async fn run_evolve(
    project: &Path,
    opts: RunOptions,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let state = ProjectState::open(project)?;
    state.ensure_dirs()?;
    let config = resolve_config(project, &opts).await?;
    check_progress_consistency(&state);

    let no_meta = opts.no_meta || std::env::var("EVONEST_NO_META").is_ok();
    let no_scout = opts.no_scout || std::env::var("EVONEST_NO_SCOUT").is_ok();

    // Deterministic persona sweep for --all-personas
    let persona_queue: Option<Vec<String>> = if opts.all_personas {
        Some(sweep_persona_ids(&state, &config)?)
    } else {
        None
    };
    let total_cycles = persona_queue
        .as_ref()
        .map(|q| q.len() as u32)
        .unwrap_or(config.max_cycles_per_run);

    let git = GitGateway::new(project);
    let runner = LmRunner::new(cancel.clone());
    let mut rng = StdRng::from_entropy();

    state.log(&format!(
        "Evonest starting ({total_cycles} cycles, model={}, level={})",
        config.model, config.active_level
    ));

    let static_context = gather_static_context(project).await;
    if !static_context.is_empty() {
        state.log(&format!(
            "  Static context gathered ({} chars)",
            static_context.len()
        ));
    }

    let mut lock = EngineLock::acquire(state.paths.lock())?;

    let mut succeeded = 0u32;
    let mut attempted = 0u32;
    let mut any_verify_failed = false;

    let ctx = CycleContext {
        state: &state,
        config: &config,
        git: &git,
        runner: &runner,
    };

    for cycle in 1..=total_cycles {
        if cancel.is_cancelled() {
            state.log("  Cancelled — stopping before next cycle.");
            break;
        }
        state.log(&format!("=== Cycle {cycle}/{total_cycles} ==="));
        let cycle_start = Instant::now();
        let started_at = now_ts();

        // ── Gate phases ────────────────────────────────────────────────
        if !no_meta {
            let progress = state.read_progress()?;
            if should_run_meta(&progress, &config) {
                state.log("  [META] Running meta-observe...");
                run_meta(&state, &config, &runner).await?;
            }
        }
        if !no_scout {
            let progress = state.read_progress()?;
            if should_run_scout(&progress, &config) {
                state.log("  [SCOUT] Running external scout...");
                run_scout(&state, &config, &runner).await?;
            }
        }

        // ── Mutation selection ─────────────────────────────────────────
        let overrides = SelectionOverrides {
            persona_id: persona_queue
                .as_ref()
                .map(|q| q[(cycle - 1) as usize].clone())
                .or_else(|| opts.persona_id.clone()),
            adversarial_id: opts.adversarial_id.clone(),
            group: opts.group.clone(),
        };
        let progress = state.read_progress()?;
        let mutation = select_mutation(&state, &config, &overrides, &progress, &mut rng)?;
        state.log(&format!(
            "  Mutation: persona={} ({}), adversarial={}",
            mutation.persona_name,
            mutation.persona_id,
            mutation.adversarial_name.as_deref().unwrap_or("none")
        ));

        if stop_requested(&mutation) {
            state.log("  Human decision says stop — ending run.");
            break;
        }

        attempted += 1;
        let mut phases: Vec<PhaseRecord> = Vec::new();

        // ── Phase 1: Observe ───────────────────────────────────────────
        let total_so_far = progress.total_cycles;
        let deep = deep_observe_this_cycle(&config, total_so_far);
        let observe_turns = if deep {
            config.max_turns.observe_deep
        } else {
            config.max_turns.observe
        };
        state.log(&format!(
            "  [1/4] Observe ({}, max_turns={observe_turns})...",
            if deep { "deep" } else { "quick" }
        ));
        let phase_start = Instant::now();
        let observe = run_observe(
            &state,
            &config,
            &runner,
            ObserveArgs {
                mutation: &mutation,
                deep,
                analyze_mode: false,
                static_context: &static_context,
            },
            &mut rng,
        )
        .await?;
        phases.push(PhaseRecord {
            phase: "observe".into(),
            status: (if observe.success { "success" } else { "failure" }).into(),
            duration_ms: phase_start.elapsed().as_millis() as u64,
        });
        if !observe.success {
            state.log(&format!(
                "  ERROR: Observe produced no output. Skipping cycle. stderr: {}",
                &observe.stderr.chars().take(300).collect::<String>()
            ));
            finish_cycle(&ctx, FinishArgs {
                cycle_start,
                started_at,
                mutation: &mutation,
                phases,
                outcome: CycleOutcome::Failure,
                commit_sha: None,
                commit_message: String::new(),
                files_touched: Vec::new(),
            })?;
            continue;
        }
        state.log(&format!(
            "  Observe complete ({} bytes)",
            observe.output.len()
        ));

        // ── Phase 2: Plan ──────────────────────────────────────────────
        state.log("  [2/4] Plan...");
        let phase_start = Instant::now();
        let plan = run_plan(&state, &config, &runner).await?;
        phases.push(PhaseRecord {
            phase: "plan".into(),
            status: (if plan.success { "success" } else { "failure" }).into(),
            duration_ms: phase_start.elapsed().as_millis() as u64,
        });
        if !plan.success {
            state.log(&format!(
                "  ERROR: Plan produced no output. Skipping cycle. stderr: {}",
                &plan.stderr.chars().take(300).collect::<String>()
            ));
            finish_cycle(&ctx, FinishArgs {
                cycle_start,
                started_at,
                mutation: &mutation,
                phases,
                outcome: CycleOutcome::Failure,
                commit_sha: None,
                commit_message: String::new(),
                files_touched: Vec::new(),
            })?;
            continue;
        }
        if plan.no_improvements {
            state.log("  No improvements needed. Stopping remaining cycles.");
            attempted -= 1;
            break;
        }
        state.log(&format!("  Plan complete ({} bytes)", plan.output.len()));

        // ── Cautious pause: externalize the continuation and stop ──────
        if opts.cautious {
            let token = ResumeToken {
                created_at: now_ts(),
                cycle_number: cycle,
                persona_id: mutation.persona_id.clone(),
                persona_name: mutation.persona_name.clone(),
                adversarial_id: mutation.adversarial_id.clone(),
                plan_artifact_path: state.paths.plan_artifact().display().to_string(),
                code_output: config.code_output.clone(),
            };
            state.write_resume_token(&token)?;
            state.log("  [Cautious] Paused after Plan. Awaiting confirmation.");
            lock.release();
            let plan_summary: String = plan.output.chars().take(500).collect();
            return Ok(RunSummary {
                attempted,
                succeeded,
                any_verify_failed,
                message: format!(
                    "CAUTIOUS MODE: Paused after Plan phase.\n\n\
                     Persona: {}\n\nPlan summary:\n{plan_summary}\n\n\
                     To proceed: evonest evolve --resume\n\
                     To cancel:  evonest evolve --cancel-pending",
                    mutation.persona_name
                ),
            });
        }

        // ── Phases 3+4: Execute + Verify ───────────────────────────────
        let outcome = execute_and_verify(
            &ctx,
            &mutation,
            plan.selected_item_id.as_deref(),
            &mutation.decisions_section,
            cycle,
            &mut phases,
        )
        .await?;

        match outcome.result {
            CycleOutcome::Success => succeeded += 1,
            CycleOutcome::Failure => any_verify_failed = true,
            _ => {}
        }

        finish_cycle(&ctx, FinishArgs {
            cycle_start,
            started_at,
            mutation: &mutation,
            phases,
            outcome: outcome.result,
            commit_sha: outcome.commit_sha,
            commit_message: outcome.commit_message,
            files_touched: outcome.files_touched,
        })?;

        state.log(&format!(
            "  Cycle {cycle} complete ({}s)",
            cycle_start.elapsed().as_secs()
        ));
    }

    drop(lock);

    let message = format!("Evonest complete: {succeeded}/{attempted} cycles succeeded");
    state.log(&message);
    Ok(RunSummary {
        attempted,
        succeeded,
        any_verify_failed,
        message,
    })
}

struct ExecVerifyOutcome {
    result: CycleOutcome,
    commit_sha: Option<String>,
    commit_message: String,
    files_touched: Vec<String>,
}

/// Execute the plan behind a git checkpoint, enforce boundaries, verify,
/// then commit, skip, or revert.
async fn execute_and_verify(
    ctx: &CycleContext<'_>,
    mutation: &SelectedMutation,
    selected_item: Option<&str>,
    decisions_section: &str,
    cycle: u32,
    phases: &mut Vec<PhaseRecord>,
) -> Result<ExecVerifyOutcome> {
    let CycleContext {
        state,
        config,
        git,
        runner,
    } = ctx;

    let identity = state.read_identity()?;
    let boundaries = BoundarySet::from_identity(&identity)?;

    state.log("  [3/4] Execute...");
    let stashed = git.stash(&format!("cycle-{cycle}")).await?;

    let phase_start = Instant::now();
    let execute = run_execute(state, config, runner, &boundaries, decisions_section).await?;
    phases.push(PhaseRecord {
        phase: "execute".into(),
        status: (if execute.success { "success" } else { "failure" }).into(),
        duration_ms: phase_start.elapsed().as_millis() as u64,
    });
    state.log(&format!(
        "  Execute complete ({} bytes)",
        execute.output.len()
    ));

    // Boundary enforcement happens on the real diff, not the model's claim
    let touched = git.changed_files().await?;
    if let Some(violation) = boundaries.first_violation(&touched) {
        let violation = violation.to_string();
        state.log(&format!(
            "  FAIL: boundary violation ({violation}) — Reverting."
        ));
        revert_or_abort(ctx, stashed).await?;
        if let Some(id) = selected_item {
            let current = state.read_progress()?.total_cycles;
            backlog::resolve_attempt(state, id, false, current)?;
        }
        phases.push(PhaseRecord {
            phase: "verify".into(),
            status: format!("boundary violation: {violation}"),
            duration_ms: 0,
        });
        return Ok(ExecVerifyOutcome {
            result: CycleOutcome::Failure,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: touched,
        });
    }

    // Empty diff: nothing to verify, drop the checkpoint and skip
    if touched.is_empty() {
        state.log("  SKIP: No changes made. Dropping stash.");
        if stashed {
            git.stash_drop().await;
        }
        phases.push(PhaseRecord {
            phase: "verify".into(),
            status: "skipped".into(),
            duration_ms: 0,
        });
        return Ok(ExecVerifyOutcome {
            result: CycleOutcome::Skipped,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: Vec::new(),
        });
    }

    state.log("  [4/4] Verify...");
    let phase_start = Instant::now();
    let verify = run_verify(state, config, git, cycle).await?;
    phases.push(PhaseRecord {
        phase: "verify".into(),
        status: (if verify.overall { "success" } else { "failure" }).into(),
        duration_ms: phase_start.elapsed().as_millis() as u64,
    });

    resolve_verify(ctx, mutation, selected_item, cycle, stashed, verify).await
}

/// Shared tail of evolve and cautious-resume: act on a VerifyOutcome.
async fn resolve_verify(
    ctx: &CycleContext<'_>,
    mutation: &SelectedMutation,
    selected_item: Option<&str>,
    cycle: u32,
    stashed: bool,
    verify: VerifyOutcome,
) -> Result<ExecVerifyOutcome> {
    let CycleContext { state, config, git, .. } = ctx;

    if verify.overall && !verify.changed_files.is_empty() {
        state.log(&format!("  PASS: {}", verify.commit_message));
        let (sha, pr_url) = if config.code_output == "pr" {
            let slug = crate::state::slugify(&verify.commit_message);
            let branch = format!("evonest/{cycle}-{slug}");
            let body = pr_body(mutation);
            git.commit_pr(&verify.commit_message, &branch, &body).await?
        } else {
            (git.commit(&verify.commit_message).await?, None)
        };
        if let Some(url) = &pr_url {
            state.log(&format!("  PR opened: {url}"));
        }
        if stashed {
            git.stash_drop().await;
        }
        if let Some(id) = selected_item {
            let current = state.read_progress()?.total_cycles;
            backlog::resolve_attempt(state, id, true, current)?;
        }
        return Ok(ExecVerifyOutcome {
            result: CycleOutcome::Success,
            commit_sha: Some(sha),
            commit_message: verify.commit_message,
            files_touched: verify.changed_files,
        });
    }

    if verify.overall {
        // Verification passed but the tree is untouched
        state.log("  SKIP: No changes made. Dropping stash.");
        if stashed {
            git.stash_drop().await;
        }
        return Ok(ExecVerifyOutcome {
            result: CycleOutcome::Skipped,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: Vec::new(),
        });
    }

    state.log(&format!("  FAIL: {} — Reverting.", verify.notes));
    revert_or_abort(ctx, stashed).await?;
    if let Some(id) = selected_item {
        let current = state.read_progress()?.total_cycles;
        backlog::resolve_attempt(state, id, false, current)?;
    }
    Ok(ExecVerifyOutcome {
        result: CycleOutcome::Failure,
        commit_sha: None,
        commit_message: String::new(),
        files_touched: verify.changed_files,
    })
}

/// A revert that itself fails leaves the tree in an unknown state — that
/// aborts the whole run.
async fn revert_or_abort(ctx: &CycleContext<'_>, stashed: bool) -> Result<()> {
    ctx.git.revert(stashed).await.map_err(|e| {
        ctx.state
            .log(&format!("  FATAL: revert failed, aborting run: {e}"));
        Error::git(format!("revert failed, aborting run: {e}"))
    })
}

fn pr_body(mutation: &SelectedMutation) -> String {
    let mut lines = vec![format!(
        "Automated improvement by Evonest.\n\nPersona: **{}**",
        mutation.persona_name
    )];
    if let Some(adv) = &mutation.adversarial_name {
        lines.push(format!("Adversarial: **{adv}**"));
    }
    lines.push("\n---\n*Review and merge if this looks good.*".to_string());
    lines.join("\n")
}

struct FinishArgs<'a> {
    cycle_start: Instant,
    started_at: String,
    mutation: &'a SelectedMutation,
    phases: Vec<PhaseRecord>,
    outcome: CycleOutcome,
    commit_sha: Option<String>,
    commit_message: String,
    files_touched: Vec<String>,
}

/// Post-cycle bookkeeping: progress update, weight recompute, backlog
/// prune, history append. Progress lands before the next cycle's selection
/// reads it.
fn finish_cycle(ctx: &CycleContext<'_>, args: FinishArgs<'_>) -> Result<()> {
    let state = ctx.state;
    let success = args.outcome == CycleOutcome::Success;

    let progress = update_progress(
        state,
        success,
        &args.mutation.persona_id,
        args.mutation.adversarial_id.as_deref(),
        &args.files_touched,
    )?;

    let persona_ids: Vec<String> = list_all_personas(state)?.into_iter().map(|p| p.id).collect();
    let adversarial_ids: Vec<String> = list_all_adversarials(state)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    recalculate_weights(state, &persona_ids, &adversarial_ids)?;

    backlog::prune(state, progress.total_cycles)?;

    let record = CycleRecord {
        cycle_number: progress.total_cycles,
        started_at: args.started_at,
        ended_at: now_ts(),
        persona_id: args.mutation.persona_id.clone(),
        persona_name: args.mutation.persona_name.clone(),
        adversarial_id: args.mutation.adversarial_id.clone(),
        phases: args.phases,
        outcome: args.outcome,
        commit_sha: args.commit_sha,
        commit_message: args.commit_message,
        files_touched: args.files_touched,
    };
    state.append_history(&record)?;

    state.log(&format!(
        "  Recorded cycle {} ({}, {}s): persona={} {}",
        record.cycle_number,
        record.outcome,
        args.cycle_start.elapsed().as_secs(),
        record.persona_name,
        record
            .commit_sha
            .as_deref()
            .map(|sha| format!("commit={sha}"))
            .unwrap_or_default()
    ));
    Ok(())
}

// ── Analyze mode ────────────────────────────────────────────────────────

/// Observe-only pass: every improvement becomes a proposal, nothing is
/// executed and git is never touched.
pub async fn run_analyze(
    project: &Path,
    opts: RunOptions,
    cancel: CancellationToken,
) -> Result<String> {
    let state = ProjectState::open(project)?;
    state.ensure_dirs()?;
    let config = resolve_config(project, &opts).await?;

    let persona_queue: Option<Vec<String>> = if opts.all_personas {
        Some(sweep_persona_ids(&state, &config)?)
    } else {
        None
    };
    let total = persona_queue.as_ref().map(|q| q.len() as u32).unwrap_or(1);

    let runner = LmRunner::new(cancel.clone());
    let mut rng = StdRng::from_entropy();

    state.log(&format!("Evonest analyze starting ({total} persona(s))"));
    let static_context = gather_static_context(project).await;

    let _lock = EngineLock::acquire(state.paths.lock())?;
    let mut saved_total = 0usize;

    for i in 0..total {
        if cancel.is_cancelled() {
            break;
        }
        let overrides = SelectionOverrides {
            persona_id: persona_queue
                .as_ref()
                .map(|q| q[i as usize].clone())
                .or_else(|| opts.persona_id.clone()),
            adversarial_id: opts.adversarial_id.clone(),
            group: opts.group.clone(),
        };
        let progress = state.read_progress()?;
        let mutation = select_mutation(&state, &config, &overrides, &progress, &mut rng)?;
        let deep = deep_observe_this_cycle(&config, progress.total_cycles);

        state.log(&format!(
            "  [Analyze {}/{total}] persona={}",
            i + 1,
            mutation.persona_name
        ));
        let observe = run_observe(
            &state,
            &config,
            &runner,
            ObserveArgs {
                mutation: &mutation,
                deep,
                analyze_mode: true,
                static_context: &static_context,
            },
            &mut rng,
        )
        .await?;

        if observe.success {
            saved_total += observe.proposals_saved;
            state.log(&format!(
                "  [Analyze] {} proposals saved",
                observe.proposals_saved
            ));
        } else {
            state.log(&format!(
                "  [Analyze] Observe failed. stderr: {}",
                &observe.stderr.chars().take(200).collect::<String>()
            ));
        }
    }

    let summary = format!("Analyze complete: {saved_total} proposals saved from {total} persona(s)");
    state.log(&summary);
    Ok(summary)
}

// ── Cautious resume / cancel ────────────────────────────────────────────

/// Resume a paused cautious run: reacquire the lock, read the token, run
/// Execute + Verify, write history, clear the token.
pub async fn resume_cautious(project: &Path, cancel: CancellationToken) -> Result<String> {
    let state = ProjectState::open(project)?;
    let Some(token) = state.read_resume_token()? else {
        return Ok("No paused cautious session found. Nothing to resume.".to_string());
    };

    let mut config = EvonestConfig::load(project)?;
    config.code_output = token.code_output.clone();

    let git = GitGateway::new(project);
    let runner = LmRunner::new(cancel);
    let lock = EngineLock::acquire(state.paths.lock())?;

    state.log(&format!(
        "  [Cautious] Resuming cycle {} (Execute + Verify)",
        token.cycle_number
    ));
    let cycle_start = Instant::now();
    let started_at = now_ts();

    let mutation = SelectedMutation {
        persona_id: token.persona_id.clone(),
        persona_name: token.persona_name.clone(),
        persona_text: String::new(),
        adversarial_id: token.adversarial_id.clone(),
        adversarial_name: None,
        adversarial_section: String::new(),
        stimuli_section: String::new(),
        decisions_section: String::new(),
        decisions: Vec::new(),
    };

    let ctx = CycleContext {
        state: &state,
        config: &config,
        git: &git,
        runner: &runner,
    };
    let mut phases: Vec<PhaseRecord> = Vec::new();
    let outcome =
        execute_and_verify(&ctx, &mutation, None, "", token.cycle_number, &mut phases).await?;

    let message = match outcome.result {
        CycleOutcome::Success => format!(
            "Cautious evolve complete: {}\nChanged: {}\nDuration: {}s",
            outcome.commit_message,
            outcome.files_touched.join(", "),
            cycle_start.elapsed().as_secs()
        ),
        CycleOutcome::Skipped => {
            "Cautious evolve: Execute succeeded but no files were changed.".to_string()
        }
        _ => "Cautious evolve FAILED. Changes reverted.".to_string(),
    };

    finish_cycle(&ctx, FinishArgs {
        cycle_start,
        started_at,
        mutation: &mutation,
        phases,
        outcome: outcome.result,
        commit_sha: outcome.commit_sha,
        commit_message: outcome.commit_message,
        files_touched: outcome.files_touched,
    })?;

    state.clear_resume_token()?;
    drop(lock);
    Ok(message)
}

/// Cancel a paused cautious run without executing anything.
pub fn cancel_cautious(project: &Path) -> Result<String> {
    let state = ProjectState::open(project)?;
    if state.read_resume_token()?.is_none() {
        return Ok("No paused cautious session found.".to_string());
    }
    state.clear_resume_token()?;
    Ok("Cautious evolve cancelled. No changes made.".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deep_observe_follows_mode_and_interval() {
        let mut config = EvonestConfig::default();
        config.observe_mode = "deep".into();
        assert!(deep_observe_this_cycle(&config, 0));

        config.observe_mode = "quick".into();
        assert!(!deep_observe_this_cycle(&config, 10));

        config.observe_mode = "auto".into();
        config.deep_cycle_interval = 10;
        assert!(!deep_observe_this_cycle(&config, 0));
        assert!(!deep_observe_this_cycle(&config, 9));
        assert!(deep_observe_this_cycle(&config, 10));
        assert!(deep_observe_this_cycle(&config, 20));
    }

    #[test]
    fn stop_decision_is_detected() {
        let mutation = SelectedMutation {
            persona_id: "p".into(),
            persona_name: "P".into(),
            persona_text: String::new(),
            adversarial_id: None,
            adversarial_name: None,
            adversarial_section: String::new(),
            stimuli_section: String::new(),
            decisions_section: String::new(),
            decisions: vec!["# Decision\nstop the run, we are refactoring".into()],
        };
        assert!(stop_requested(&mutation));

        let benign = SelectedMutation {
            decisions: vec!["focus on the parser module".into()],
            ..mutation
        };
        assert!(!stop_requested(&benign));
    }
}
