//! Scout gate — outward-looking search for developments that should steer
//! the next cycles.
//!
//! Findings are keyed by the (source_url, title) pair; the cache in
//! .evonest/scout.json guarantees a pair is never injected twice. Findings
//! at or above the relevance threshold become stimuli for the next Observe.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::config::EvonestConfig;
use crate::error::Result;
use crate::phases::extract_json;
use crate::runner::{LmRequest, LmRunner, SCOUT_TOOLS};
use crate::state::ProjectState;
use crate::types::{Progress, ScoutFinding};

const SCOUT_PROMPT: &str = include_str!("prompts/scout.md");
const SEEN_LIST_CAP: usize = 50;

#[derive(Debug, Default, Clone)]
pub struct ScoutSummary {
    pub findings_found: usize,
    pub findings_injected: usize,
    pub findings_skipped_score: usize,
    pub findings_skipped_duplicate: usize,
}

pub fn should_run_scout(progress: &Progress, config: &EvonestConfig) -> bool {
    if !config.scout_enabled || config.scout_cycle_interval == 0 {
        return false;
    }
    if progress.total_cycles == 0 {
        return false;
    }
    progress.total_cycles - progress.last_scout_cycle >= config.scout_cycle_interval
}

/// Stable dedup key for the (source_url, title) pair.
pub fn finding_key(title: &str, source_url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    format!("{title}|{source_url}").hash(&mut hasher);
    format!("{:012x}", hasher.finish() & 0xffff_ffff_ffff)
}

pub fn build_scout_prompt(state: &ProjectState) -> Result<String> {
    let mut parts = vec![SCOUT_PROMPT.to_string()];

    let identity = state.read_identity()?;
    if !identity.is_empty() {
        parts.push(format!("---\n\n## Project Identity\n\n{identity}"));
    }

    let cache = state.read_scout_cache()?;
    let seen: Vec<String> = cache
        .findings
        .iter()
        .rev()
        .take(SEEN_LIST_CAP)
        .map(|f| format!("- {} ({})", f.title, f.source_url))
        .collect();
    if !seen.is_empty() {
        parts.push(format!(
            "---\n\n## Already Reported Findings (do not repeat)\n\n{}",
            seen.join("\n")
        ));
    }

    Ok(parts.join("\n"))
}

/// Run the scout gate end to end: prompt → LM (with WebFetch) → apply.
pub async fn run_scout(
    state: &ProjectState,
    config: &EvonestConfig,
    runner: &LmRunner,
) -> Result<Option<ScoutSummary>> {
    let prompt = build_scout_prompt(state)?;
    let result = runner
        .run(&LmRequest {
            prompt,
            model: config.model.clone(),
            max_turns: config.max_turns.scout,
            allowed_tools: SCOUT_TOOLS,
            cwd: state.project().to_path_buf(),
        })
        .await?;

    state.write_text(&state.paths.scout_artifact(), &result.output)?;

    if !result.success {
        state.log("  [SCOUT] No output from scout");
        return Ok(None);
    }

    let mut progress = state.read_progress()?;
    let current_cycle = progress.total_cycles;
    let summary = apply_scout_results(state, &result.output, config, current_cycle)?;
    progress.last_scout_cycle = current_cycle;
    state.write_progress(&progress)?;
    state.log(&format!(
        "  [SCOUT] Scout complete: {} injected, {} below threshold, {} duplicates",
        summary.findings_injected,
        summary.findings_skipped_score,
        summary.findings_skipped_duplicate
    ));
    Ok(Some(summary))
}

/// Apply a scout envelope: dedupe against the cache, inject qualifying
/// findings as stimuli, record everything seen.
pub fn apply_scout_results(
    state: &ProjectState,
    scout_output: &str,
    config: &EvonestConfig,
    current_cycle: u32,
) -> Result<ScoutSummary> {
    let mut summary = ScoutSummary::default();

    let Some(envelope) = extract_json(scout_output) else {
        state.log("  [SCOUT] JSON parse failed, skipping application");
        return Ok(summary);
    };
    let Some(findings) = envelope.get("findings").and_then(|v| v.as_array()) else {
        return Ok(summary);
    };

    let mut cache = state.read_scout_cache()?;
    let mut seen: Vec<String> = cache.findings.iter().map(|f| f.id.clone()).collect();

    summary.findings_found = findings.len();

    for raw in findings {
        let title = raw.get("title").and_then(|v| v.as_str()).unwrap_or("");
        if title.is_empty() {
            continue;
        }
        let source_url = raw.get("source_url").and_then(|v| v.as_str()).unwrap_or("");
        let relevance = raw
            .get("relevance_score")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        let summary_text = raw.get("summary").and_then(|v| v.as_str()).unwrap_or("");
        let direction = raw
            .get("mutation_direction")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let id = finding_key(title, source_url);
        if seen.contains(&id) {
            summary.findings_skipped_duplicate += 1;
            continue;
        }

        let mut finding = ScoutFinding {
            id: id.clone(),
            title: title.to_string(),
            source_url: source_url.to_string(),
            relevance_score: relevance,
            summary: summary_text.to_string(),
            mutation_direction: direction.to_string(),
            injected_as_stimulus: false,
            injected_cycle: None,
        };

        if relevance >= config.scout_min_relevance_score {
            let mut lines = vec![format!("# Scout Finding: {title}"), String::new()];
            if !source_url.is_empty() {
                lines.push(format!("**Source**: {source_url}"));
            }
            lines.push(format!("**Relevance**: {relevance}/10"));
            lines.extend([
                String::new(),
                "## Summary".to_string(),
                String::new(),
                summary_text.to_string(),
            ]);
            if !direction.is_empty() {
                lines.extend([
                    String::new(),
                    "## Suggested Direction".to_string(),
                    String::new(),
                    direction.to_string(),
                ]);
            }
            state.add_stimulus(&lines.join("\n"))?;
            finding.injected_as_stimulus = true;
            finding.injected_cycle = Some(current_cycle);
            summary.findings_injected += 1;
        } else {
            summary.findings_skipped_score += 1;
        }

        seen.push(id);
        cache.findings.push(finding);
    }

    cache.last_scout_cycle = current_cycle;
    state.update_scout_cache(&cache)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scout_gate_respects_enable_and_interval() {
        let mut config = EvonestConfig::default(); // interval 10
        let mut progress = Progress::default();
        assert!(!should_run_scout(&progress, &config));

        progress.total_cycles = 10;
        assert!(should_run_scout(&progress, &config));

        config.scout_enabled = false;
        assert!(!should_run_scout(&progress, &config));
    }

    #[test]
    fn finding_key_is_stable_and_pair_sensitive() {
        let a = finding_key("Title", "https://a");
        assert_eq!(a, finding_key("Title", "https://a"));
        assert_ne!(a, finding_key("Title", "https://b"));
        assert_ne!(a, finding_key("Other", "https://a"));
        assert_eq!(a.len(), 12);
    }
}
