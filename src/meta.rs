//! Meta-observe gate — the loop watching the loop.
//!
//! Every `meta_cycle_interval` cycles the engine reviews its own history
//! and statistics, proposes project-specific dynamic mutations (with a
//! TTL), drops auto-stimuli for stuck areas, and records strategic advice
//! for future Observe prompts. Expired dynamic mutations are pruned before
//! anything new is applied.

use serde_json::json;

use crate::config::EvonestConfig;
use crate::error::Result;
use crate::history::build_history_summary;
use crate::mutations::{
    expire_dynamic_mutations, list_all_adversarials, list_all_personas, load_adversarials,
    load_personas,
};
use crate::phases::extract_json;
use crate::progress::build_convergence_context;
use crate::runner::{LmRequest, LmRunner, META_TOOLS};
use crate::state::ProjectState;
use crate::types::{Advice, Adversarial, Persona, Progress};

const META_PROMPT: &str = include_str!("prompts/meta_observe.md");

#[derive(Debug, Default, Clone)]
pub struct MetaSummary {
    pub expired_personas: usize,
    pub expired_adversarials: usize,
    pub added_personas: usize,
    pub added_adversarials: usize,
    pub auto_stimuli: usize,
    pub advice_saved: bool,
}

pub fn should_run_meta(progress: &Progress, config: &EvonestConfig) -> bool {
    if progress.total_cycles == 0 || config.meta_cycle_interval == 0 {
        return false;
    }
    progress.total_cycles - progress.last_meta_cycle >= config.meta_cycle_interval
}

pub fn build_meta_prompt(state: &ProjectState, config: &EvonestConfig) -> Result<String> {
    let personas = load_personas(state, config)?;
    let adversarials = load_adversarials(state, config)?;

    let persona_list = if personas.is_empty() {
        "none".to_string()
    } else {
        personas
            .iter()
            .map(|p| format!("- {}: {}", p.id, p.name))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let adversarial_list = if adversarials.is_empty() {
        "none".to_string()
    } else {
        adversarials
            .iter()
            .map(|a| format!("- {}: {}", a.id, a.name))
            .collect::<Vec<_>>()
            .join("\n")
    };

    let progress = state.read_progress()?;
    let progress_summary = serde_json::to_string_pretty(&json!({
        "total_cycles": progress.total_cycles,
        "total_successes": progress.total_successes,
        "total_failures": progress.total_failures,
        "persona_stats": progress.persona_stats.iter().map(|(id, s)| {
            (id.clone(), json!({
                "uses": s.uses,
                "successes": s.successes,
                "weight": s.weight,
            }))
        }).collect::<serde_json::Map<_, _>>(),
        "converged_areas": progress.converged_areas,
    }))?;

    let backlog = state.load_backlog()?;
    let mut categories: Vec<String> = backlog
        .items
        .iter()
        .map(|i| i.category.clone())
        .collect();
    categories.sort();
    categories.dedup();
    let backlog_summary = serde_json::to_string_pretty(&json!({
        "total_items": backlog.items.len(),
        "pending": backlog.items.iter()
            .filter(|i| i.status == crate::types::BacklogStatus::Pending).count(),
        "stale": backlog.items.iter()
            .filter(|i| i.status == crate::types::BacklogStatus::Stale).count(),
        "categories": categories,
    }))?;

    let mut parts = vec![
        META_PROMPT.to_string(),
        "---".to_string(),
        format!("## Current Personas\n{persona_list}"),
        format!("\n## Current Adversarial Challenges\n{adversarial_list}"),
        format!("\n## Progress Statistics\n```json\n{progress_summary}\n```"),
        format!("\n## Backlog Summary\n```json\n{backlog_summary}\n```"),
    ];

    let history = build_history_summary(state, 10)?;
    if !history.is_empty() {
        parts.push(history);
    }
    let convergence = build_convergence_context(&progress);
    if !convergence.is_empty() {
        parts.push(convergence);
    }
    let identity = state.read_identity()?;
    if !identity.is_empty() {
        parts.push(format!("---\n\n## Project Identity\n\n{identity}"));
    }

    Ok(parts.join("\n"))
}

/// Run the meta-observe gate end to end: prompt → LM → apply.
pub async fn run_meta(
    state: &ProjectState,
    config: &EvonestConfig,
    runner: &LmRunner,
) -> Result<Option<MetaSummary>> {
    let prompt = build_meta_prompt(state, config)?;
    let result = runner
        .run(&LmRequest {
            prompt,
            model: config.model.clone(),
            max_turns: config.max_turns.meta,
            allowed_tools: META_TOOLS,
            cwd: state.project().to_path_buf(),
        })
        .await?;

    state.write_text(&state.paths.meta_observe_artifact(), &result.output)?;

    if !result.success {
        state.log("  [META] No output from meta-observe");
        return Ok(None);
    }

    let mut progress = state.read_progress()?;
    let current_cycle = progress.total_cycles;
    let summary = apply_meta_results(state, &result.output, config, current_cycle)?;
    progress.last_meta_cycle = current_cycle;
    state.write_progress(&progress)?;
    state.log(&format!(
        "  [META] Meta-observe complete: +{} personas, +{} adversarials, {} stimuli",
        summary.added_personas, summary.added_adversarials, summary.auto_stimuli
    ));
    Ok(Some(summary))
}

/// Apply a meta envelope: expire TTLs, add capped dynamic mutations, drop
/// auto-stimuli, save advice.
pub fn apply_meta_results(
    state: &ProjectState,
    meta_output: &str,
    config: &EvonestConfig,
    current_cycle: u32,
) -> Result<MetaSummary> {
    let mut summary = MetaSummary::default();

    let (expired_p, expired_a) = expire_dynamic_mutations(state, current_cycle)?;
    summary.expired_personas = expired_p;
    summary.expired_adversarials = expired_a;

    let Some(envelope) = extract_json(meta_output) else {
        state.log("  [META] JSON parse failed, skipping application");
        return Ok(summary);
    };

    let expires_cycle = current_cycle + config.dynamic_mutation_ttl_cycles;

    // New personas, deduplicated by id, capped
    let mut dynamic = state.read_dynamic_personas()?;
    let mut known_ids: Vec<String> = list_all_personas(state)?
        .into_iter()
        .map(|p| p.id)
        .collect();
    if let Some(new_personas) = envelope.get("new_personas").and_then(|v| v.as_array()) {
        for raw in new_personas {
            if dynamic.len() >= config.max_dynamic_personas {
                break;
            }
            let Ok(mut persona) = serde_json::from_value::<Persona>(raw.clone()) else {
                continue;
            };
            if persona.id.is_empty() || known_ids.contains(&persona.id) {
                continue;
            }
            persona.dynamic = true;
            persona.expires_cycle = Some(expires_cycle);
            known_ids.push(persona.id.clone());
            dynamic.push(persona);
            summary.added_personas += 1;
        }
    }
    if summary.added_personas > 0 {
        state.write_dynamic_personas(&dynamic)?;
    }

    // New adversarials, same treatment
    let mut dynamic_adv = state.read_dynamic_adversarials()?;
    let mut known_adv_ids: Vec<String> = list_all_adversarials(state)?
        .into_iter()
        .map(|a| a.id)
        .collect();
    if let Some(new_adversarials) = envelope.get("new_adversarials").and_then(|v| v.as_array()) {
        for raw in new_adversarials {
            if dynamic_adv.len() >= config.max_dynamic_adversarials {
                break;
            }
            let Ok(mut adversarial) = serde_json::from_value::<Adversarial>(raw.clone()) else {
                continue;
            };
            if adversarial.id.is_empty() || known_adv_ids.contains(&adversarial.id) {
                continue;
            }
            adversarial.dynamic = true;
            adversarial.expires_cycle = Some(expires_cycle);
            known_adv_ids.push(adversarial.id.clone());
            dynamic_adv.push(adversarial);
            summary.added_adversarials += 1;
        }
    }
    if summary.added_adversarials > 0 {
        state.write_dynamic_adversarials(&dynamic_adv)?;
    }

    // Auto-stimuli
    if let Some(stimuli) = envelope.get("auto_stimuli").and_then(|v| v.as_array()) {
        for stimulus in stimuli {
            let Some(text) = stimulus.as_str().filter(|s| !s.trim().is_empty()) else {
                continue;
            };
            state.add_stimulus(&format!(
                "# Auto-Generated Stimulus (Meta-Observe)\n\n{text}"
            ))?;
            summary.auto_stimuli += 1;
        }
    }

    // Strategic advice
    if let Some(advice_value) = envelope.get("advice") {
        if let Ok(mut advice) = serde_json::from_value::<Advice>(advice_value.clone()) {
            if !advice.strategic_direction.is_empty() {
                advice.generated_cycle = current_cycle;
                state.write_advice(&advice)?;
                summary.advice_saved = true;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_gate_fires_on_interval() {
        let config = EvonestConfig::default(); // interval 5
        let mut progress = Progress::default();
        assert!(!should_run_meta(&progress, &config)); // cycle 0 never fires

        progress.total_cycles = 4;
        assert!(!should_run_meta(&progress, &config));
        progress.total_cycles = 5;
        assert!(should_run_meta(&progress, &config));

        progress.last_meta_cycle = 5;
        progress.total_cycles = 9;
        assert!(!should_run_meta(&progress, &config));
        progress.total_cycles = 10;
        assert!(should_run_meta(&progress, &config));
    }
}
