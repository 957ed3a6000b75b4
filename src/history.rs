//! Cycle history summaries for prompts and the CLI.

use crate::error::Result;
use crate::state::ProjectState;
use crate::types::{CycleOutcome, CycleRecord};

/// Recent-history context for phase prompts. Empty when no cycles ran yet.
pub fn build_history_summary(state: &ProjectState, count: usize) -> Result<String> {
    let records = state.read_history(count)?;
    if records.is_empty() {
        return Ok(String::new());
    }

    let mut lines = vec!["## Recent Cycle History".to_string(), String::new()];
    for record in records.iter().rev() {
        lines.push(format!(
            "- **{}**: {} | persona={} | adversarial={} | {}",
            record.started_at,
            status_label(record.outcome),
            record.persona_name,
            record.adversarial_id.as_deref().unwrap_or("none"),
            if record.commit_message.is_empty() {
                "N/A"
            } else {
                &record.commit_message
            }
        ));
    }
    Ok(lines.join("\n"))
}

fn status_label(outcome: CycleOutcome) -> &'static str {
    match outcome {
        CycleOutcome::Success => "SUCCESS",
        CycleOutcome::Failure => "FAIL",
        CycleOutcome::Skipped => "SKIPPED",
        CycleOutcome::Aborted => "ABORTED",
    }
}

/// Detailed history listing for the CLI.
pub fn render_history(records: &[CycleRecord], total: usize) -> String {
    if records.is_empty() {
        return "No cycle history yet.".to_string();
    }
    let mut lines = vec![
        format!("Showing {} of {} total cycles:", records.len(), total),
        String::new(),
    ];
    for record in records.iter().rev() {
        lines.push(format!(
            "[{}] {}",
            record.started_at,
            status_label(record.outcome)
        ));
        lines.push(format!("  Persona: {}", record.persona_name));
        if let Some(adv) = &record.adversarial_id {
            lines.push(format!("  Adversarial: {adv}"));
        }
        if !record.commit_message.is_empty() {
            lines.push(format!("  Commit: {}", record.commit_message));
        }
        if let Some(sha) = &record.commit_sha {
            lines.push(format!("  Sha: {sha}"));
        }
        if !record.files_touched.is_empty() {
            lines.push(format!("  Files: {}", record.files_touched.join(", ")));
        }
        for phase in &record.phases {
            lines.push(format!(
                "  {}: {} ({}ms)",
                phase.phase, phase.status, phase.duration_ms
            ));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhaseRecord;

    fn record(outcome: CycleOutcome) -> CycleRecord {
        CycleRecord {
            cycle_number: 1,
            started_at: "2026-08-02T00:00:00Z".into(),
            ended_at: "2026-08-02T00:01:00Z".into(),
            persona_id: "architect".into(),
            persona_name: "Architect".into(),
            adversarial_id: Some("corrupt-state".into()),
            phases: vec![PhaseRecord {
                phase: "observe".into(),
                status: "success".into(),
                duration_ms: 1200,
            }],
            outcome,
            commit_sha: Some("abc123".into()),
            commit_message: "evolve: tighten parser".into(),
            files_touched: vec!["src/parser.rs".into()],
        }
    }

    #[test]
    fn render_history_includes_persona_and_outcome() {
        let out = render_history(&[record(CycleOutcome::Success)], 1);
        assert!(out.contains("SUCCESS"));
        assert!(out.contains("Architect"));
        assert!(out.contains("corrupt-state"));
        assert!(out.contains("abc123"));
    }

    #[test]
    fn render_history_empty() {
        assert_eq!(render_history(&[], 0), "No cycle history yet.");
    }
}
