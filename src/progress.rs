//! Progress tracking — per-mutation statistics, selection weights,
//! convergence detection.
//!
//! Weight formula: 1.0 + 0.5*success_rate - 0.3*failure_rate + recency,
//! recency = 0.3 when unused for 3+ cycles, clamped to [0.2, 3.0].
//! Weights are recomputed for every mutation after every cycle so the
//! recency bonus stays consistent.

use chrono::Utc;

use crate::error::Result;
use crate::state::ProjectState;
use crate::types::{CycleOutcome, CycleRecord, MutationStats, Progress};

pub const WEIGHT_MIN: f64 = 0.2;
pub const WEIGHT_MAX: f64 = 3.0;
pub const RECENCY_THRESHOLD: u32 = 3;
pub const RECENCY_BONUS: f64 = 0.3;
pub const CONVERGENCE_THRESHOLD: u32 = 3;
const OUTCOME_WINDOW: usize = 3;

pub fn calculate_weight(
    uses: u32,
    successes: u32,
    failures: u32,
    last_used_cycle: u32,
    current_cycle: u32,
) -> f64 {
    if uses == 0 {
        return 1.0;
    }
    let success_rate = successes as f64 / uses as f64;
    let failure_rate = failures as f64 / uses as f64;
    let recency = if current_cycle.saturating_sub(last_used_cycle) >= RECENCY_THRESHOLD {
        RECENCY_BONUS
    } else {
        0.0
    };
    let weight = 1.0 + 0.5 * success_rate - 0.3 * failure_rate + recency;
    ((weight * 100.0).round() / 100.0).clamp(WEIGHT_MIN, WEIGHT_MAX)
}

fn now_ts() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Directory key for convergence tracking: the file's parent directory,
/// "." for top-level files.
pub fn area_of(path: &str) -> String {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => ".".to_string(),
    }
}

fn touch_stats(stats: &mut MutationStats, success: bool, cycle: u32) {
    stats.uses += 1;
    if success {
        stats.successes += 1;
    } else {
        stats.failures += 1;
    }
    stats.last_used_cycle = cycle;
}

/// Update progress after a cycle completes and persist it.
///
/// `committed_cleanly` is true only when verify passed and the change was
/// committed; `touched_files` covers everything Execute modified, so failed
/// cycles still feed the convergence window.
pub fn update_progress(
    state: &ProjectState,
    committed_cleanly: bool,
    persona_id: &str,
    adversarial_id: Option<&str>,
    touched_files: &[String],
) -> Result<Progress> {
    let mut progress = state.read_progress()?;

    progress.total_cycles += 1;
    if committed_cleanly {
        progress.total_successes += 1;
    } else {
        progress.total_failures += 1;
    }
    let ts = now_ts();
    progress.last_run = Some(ts.clone());
    if committed_cleanly {
        progress.last_improvement = Some(ts.clone());
    }

    let cycle = progress.total_cycles;
    touch_stats(
        progress.persona_stats.entry(persona_id.to_string()).or_default(),
        committed_cleanly,
        cycle,
    );
    if let Some(aid) = adversarial_id {
        touch_stats(
            progress.adversarial_stats.entry(aid.to_string()).or_default(),
            committed_cleanly,
            cycle,
        );
    }

    if committed_cleanly {
        let activation = &mut progress.activation;
        if activation.first_success_at.is_none() {
            activation.first_success_at = Some(ts);
        }
        activation.successful_commits += 1;
    }

    record_area_touches(&mut progress, committed_cleanly, touched_files);

    state.write_progress(&progress)?;
    Ok(progress)
}

fn record_area_touches(progress: &mut Progress, committed_cleanly: bool, touched_files: &[String]) {
    let mut areas: Vec<String> = touched_files
        .iter()
        .filter(|f| !f.is_empty())
        .map(|f| area_of(f))
        .collect();
    areas.sort();
    areas.dedup();

    for area in areas {
        *progress.area_touch_counts.entry(area.clone()).or_insert(0) += 1;
        let window = progress.area_recent_outcomes.entry(area).or_default();
        window.push(committed_cleanly);
        if window.len() > OUTCOME_WINDOW {
            window.drain(..window.len() - OUTCOME_WINDOW);
        }
    }

    // Recompute the converged set: touched 3+ times and none of the last 3
    // touches committed cleanly.
    progress.converged_areas = progress
        .area_touch_counts
        .iter()
        .filter(|(area, count)| {
            **count >= CONVERGENCE_THRESHOLD
                && progress
                    .area_recent_outcomes
                    .get(*area)
                    .is_some_and(|w| w.len() >= OUTCOME_WINDOW && !w.iter().any(|ok| *ok))
        })
        .map(|(area, _)| area.clone())
        .collect();
}

/// Recompute every known mutation's weight from its stats and persist.
pub fn recalculate_weights(
    state: &ProjectState,
    persona_ids: &[String],
    adversarial_ids: &[String],
) -> Result<Progress> {
    let mut progress = state.read_progress()?;
    let current = progress.total_cycles;
    if current == 0 {
        return Ok(progress);
    }

    for pid in persona_ids {
        let stats = progress.persona_stats.entry(pid.clone()).or_default();
        stats.weight = calculate_weight(
            stats.uses,
            stats.successes,
            stats.failures,
            stats.last_used_cycle,
            current,
        );
    }
    for aid in adversarial_ids {
        let stats = progress.adversarial_stats.entry(aid.clone()).or_default();
        stats.weight = calculate_weight(
            stats.uses,
            stats.successes,
            stats.failures,
            stats.last_used_cycle,
            current,
        );
    }

    state.write_progress(&progress)?;
    Ok(progress)
}

/// Recompute counters and stats purely from history records. Used as a
/// startup consistency check against the persisted progress file.
pub fn rebuild_from_history(records: &[CycleRecord]) -> Progress {
    let mut progress = Progress::default();
    for record in records {
        let success = record.outcome == CycleOutcome::Success;
        progress.total_cycles += 1;
        if success {
            progress.total_successes += 1;
        } else {
            progress.total_failures += 1;
        }
        let cycle = progress.total_cycles;
        touch_stats(
            progress
                .persona_stats
                .entry(record.persona_id.clone())
                .or_default(),
            success,
            cycle,
        );
        if let Some(aid) = &record.adversarial_id {
            touch_stats(
                progress.adversarial_stats.entry(aid.clone()).or_default(),
                success,
                cycle,
            );
        }
        record_area_touches(&mut progress, success, &record.files_touched);
    }
    progress
}

/// Convergence warning text for the Observe prompt. Empty when no area is
/// flagged.
pub fn build_convergence_context(progress: &Progress) -> String {
    if progress.converged_areas.is_empty() {
        return String::new();
    }
    let mut lines = vec![
        "## Convergence Warning".to_string(),
        String::new(),
        "The following areas have been touched 3+ times without a clean \
         commit. Avoid them or try a different angle:"
            .to_string(),
        String::new(),
    ];
    for area in &progress.converged_areas {
        let count = progress.area_touch_counts.get(area).copied().unwrap_or(0);
        lines.push(format!("- **{area}**: touched {count} times"));
    }
    lines.join("\n")
}

/// Detailed progress report for the CLI.
pub fn progress_report(progress: &Progress) -> String {
    let total = progress.total_cycles;
    let rate = if total > 0 {
        (progress.total_successes as f64 / total as f64 * 100.0).round() as u32
    } else {
        0
    };
    let mut lines = vec![
        format!("Total cycles: {total}"),
        format!("Success rate: {rate}% ({}/{total})", progress.total_successes),
        format!(
            "Last run: {}",
            progress.last_run.as_deref().unwrap_or("never")
        ),
        format!(
            "Last improvement: {}",
            progress.last_improvement.as_deref().unwrap_or("never")
        ),
        String::new(),
    ];

    if !progress.persona_stats.is_empty() {
        lines.push("Persona weights:".to_string());
        let mut entries: Vec<_> = progress.persona_stats.iter().collect();
        entries.sort_by(|a, b| b.1.weight.partial_cmp(&a.1.weight).unwrap_or(std::cmp::Ordering::Equal));
        for (id, s) in entries {
            lines.push(format!(
                "  {id}: weight={:.2} (uses={}, success={}, fail={})",
                s.weight, s.uses, s.successes, s.failures
            ));
        }
    }

    if !progress.adversarial_stats.is_empty() {
        lines.push(String::new());
        lines.push("Adversarial weights:".to_string());
        let mut entries: Vec<_> = progress.adversarial_stats.iter().collect();
        entries.sort_by(|a, b| b.1.weight.partial_cmp(&a.1.weight).unwrap_or(std::cmp::Ordering::Equal));
        for (id, s) in entries {
            lines.push(format!("  {id}: weight={:.2} (uses={})", s.weight, s.uses));
        }
    }

    if !progress.area_touch_counts.is_empty() {
        lines.push(String::new());
        lines.push("Area touch counts:".to_string());
        let mut entries: Vec<_> = progress.area_touch_counts.iter().collect();
        entries.sort_by(|a, b| b.1.cmp(a.1));
        for (area, count) in entries {
            let flag = if progress.converged_areas.contains(area) {
                " [CONVERGED]"
            } else {
                ""
            };
            lines.push(format!("  {area}: {count}{flag}"));
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_formula_seeded_scenario() {
        // Persona X: 3/3 successes, last used cycle 1, current cycle 5
        assert_eq!(calculate_weight(3, 3, 0, 1, 5), 1.80);
        // Persona Y: 0/3 successes
        assert_eq!(calculate_weight(3, 0, 3, 1, 5), 1.00);
    }

    #[test]
    fn weight_is_clamped() {
        // All-failure, recently used: 1.0 - 0.3 = 0.7, above the floor
        assert_eq!(calculate_weight(10, 0, 10, 10, 10), 0.7);
        // Unused mutations stay neutral
        assert_eq!(calculate_weight(0, 0, 0, 0, 100), 1.0);
        for uses in 1..20 {
            let w = calculate_weight(uses, uses, 0, 0, 1000);
            assert!((WEIGHT_MIN..=WEIGHT_MAX).contains(&w));
        }
    }

    #[test]
    fn recency_bonus_at_three_cycles() {
        // Exactly 3 cycles unused qualifies
        assert_eq!(calculate_weight(2, 1, 1, 2, 5), 1.40);
        // 2 cycles unused does not
        assert_eq!(calculate_weight(2, 1, 1, 3, 5), 1.10);
    }

    #[test]
    fn area_of_uses_parent_directory() {
        assert_eq!(area_of("src/foo/bar.rs"), "src/foo");
        assert_eq!(area_of("src/lib.rs"), "src");
        assert_eq!(area_of("README.md"), ".");
    }

    #[test]
    fn convergence_flags_after_three_failed_touches() {
        let mut progress = Progress::default();
        let files = vec!["src/foo/a.rs".to_string()];
        record_area_touches(&mut progress, false, &files);
        record_area_touches(&mut progress, false, &files);
        assert!(progress.converged_areas.is_empty());
        record_area_touches(&mut progress, false, &files);
        assert_eq!(progress.converged_areas, vec!["src/foo".to_string()]);
    }

    #[test]
    fn clean_commit_clears_convergence() {
        let mut progress = Progress::default();
        let files = vec!["src/foo/a.rs".to_string()];
        for _ in 0..3 {
            record_area_touches(&mut progress, false, &files);
        }
        assert!(!progress.converged_areas.is_empty());
        record_area_touches(&mut progress, true, &files);
        assert!(progress.converged_areas.is_empty());
    }

    #[test]
    fn rebuild_from_history_counts_outcomes() {
        let record = |n: u32, outcome: CycleOutcome| CycleRecord {
            cycle_number: n,
            started_at: String::new(),
            ended_at: String::new(),
            persona_id: "architect".into(),
            persona_name: "Architect".into(),
            adversarial_id: None,
            phases: Vec::new(),
            outcome,
            commit_sha: None,
            commit_message: String::new(),
            files_touched: vec!["src/a.rs".into()],
        };
        let records = vec![
            record(1, CycleOutcome::Success),
            record(2, CycleOutcome::Failure),
            record(3, CycleOutcome::Skipped),
        ];
        let progress = rebuild_from_history(&records);
        assert_eq!(progress.total_cycles, 3);
        assert_eq!(progress.total_successes, 1);
        assert_eq!(progress.total_failures, 2);
        assert_eq!(progress.persona_stats["architect"].uses, 3);
    }

    #[test]
    fn convergence_context_lists_flagged_areas() {
        let mut progress = Progress::default();
        for _ in 0..3 {
            record_area_touches(&mut progress, false, &["src/foo/a.rs".to_string()]);
        }
        let ctx = build_convergence_context(&progress);
        assert!(ctx.contains("src/foo"));
        assert!(ctx.contains("Convergence Warning"));
    }
}
