//! Mutation catalog and selection.
//!
//! Built-in mutations are packaged with the binary (read-only). Dynamic
//! mutations live in .evonest/dynamic-*.json, written only by the
//! meta-observe apply step and the TTL pruner here. Selection merges both
//! sets, filters by enablement, and picks by weight-proportional random.

use rand::Rng;

use crate::config::EvonestConfig;
use crate::error::{Error, Result};
use crate::state::ProjectState;
use crate::types::{Adversarial, MutationStats, Persona, Progress};

static BUILTIN_PERSONAS: &str = include_str!("mutations/personas.json");
static BUILTIN_ADVERSARIALS: &str = include_str!("mutations/adversarial.json");

pub fn builtin_personas() -> Vec<Persona> {
    serde_json::from_str(BUILTIN_PERSONAS).expect("packaged personas.json is valid")
}

pub fn builtin_adversarials() -> Vec<Adversarial> {
    serde_json::from_str(BUILTIN_ADVERSARIALS).expect("packaged adversarial.json is valid")
}

/// All personas (built-in + dynamic), unfiltered.
pub fn list_all_personas(state: &ProjectState) -> Result<Vec<Persona>> {
    let mut personas = builtin_personas();
    personas.extend(state.read_dynamic_personas()?);
    Ok(personas)
}

/// All adversarials (built-in + dynamic), unfiltered.
pub fn list_all_adversarials(state: &ProjectState) -> Result<Vec<Adversarial>> {
    let mut adversarials = builtin_adversarials();
    adversarials.extend(state.read_dynamic_adversarials()?);
    Ok(adversarials)
}

/// Enabled personas: per-id toggle AND group membership (empty groups = all).
pub fn load_personas(state: &ProjectState, config: &EvonestConfig) -> Result<Vec<Persona>> {
    let disabled = config.disabled_persona_ids();
    let personas = list_all_personas(state)?
        .into_iter()
        .filter(|p| !disabled.contains(&p.id))
        .filter(|p| {
            config.active_groups.is_empty() || config.active_groups.contains(&p.group)
        })
        .collect();
    Ok(personas)
}

pub fn load_adversarials(state: &ProjectState, config: &EvonestConfig) -> Result<Vec<Adversarial>> {
    let disabled = config.disabled_adversarial_ids();
    let adversarials = list_all_adversarials(state)?
        .into_iter()
        .filter(|a| !disabled.contains(&a.id))
        .collect();
    Ok(adversarials)
}

/// Remove expired dynamic mutations. Returns (personas, adversarials) counts.
pub fn expire_dynamic_mutations(state: &ProjectState, current_cycle: u32) -> Result<(usize, usize)> {
    let personas = state.read_dynamic_personas()?;
    let kept: Vec<Persona> = personas
        .iter()
        .filter(|p| p.expires_cycle.map_or(true, |exp| exp > current_cycle))
        .cloned()
        .collect();
    let expired_personas = personas.len() - kept.len();
    if expired_personas > 0 {
        state.write_dynamic_personas(&kept)?;
    }

    let adversarials = state.read_dynamic_adversarials()?;
    let kept: Vec<Adversarial> = adversarials
        .iter()
        .filter(|a| a.expires_cycle.map_or(true, |exp| exp > current_cycle))
        .cloned()
        .collect();
    let expired_adversarials = adversarials.len() - kept.len();
    if expired_adversarials > 0 {
        state.write_dynamic_adversarials(&kept)?;
    }

    Ok((expired_personas, expired_adversarials))
}

/// Pick an index with probability proportional to each item's weight.
pub fn weighted_index<R: Rng>(weights: &[f64], rng: &mut R) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let roll = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        if *w > 0.0 {
            cumulative += w;
            if roll < cumulative {
                return i;
            }
        }
    }
    weights.len() - 1
}

fn stat_weight(stats: &std::collections::BTreeMap<String, MutationStats>, id: &str) -> f64 {
    stats.get(id).map(|s| s.weight).unwrap_or(1.0)
}

/// The mutation chosen for one cycle, with rendered prompt sections.
#[derive(Debug, Clone)]
pub struct SelectedMutation {
    pub persona_id: String,
    pub persona_name: String,
    pub persona_text: String,
    pub adversarial_id: Option<String>,
    pub adversarial_name: Option<String>,
    pub adversarial_section: String,
    pub stimuli_section: String,
    pub decisions_section: String,
    /// Raw decision bodies, for the stop-directive check.
    pub decisions: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionOverrides {
    /// Force this persona (bypasses group and toggle filters).
    pub persona_id: Option<String>,
    /// Force this adversarial, or "none" to suppress the roll.
    pub adversarial_id: Option<String>,
    /// Restrict random persona selection to this group.
    pub group: Option<String>,
}

fn render_adversarial(adv: &Adversarial) -> String {
    format!(
        "## Adversarial Challenge: {}\n\n{}\n\nTarget directory: {}",
        adv.name, adv.challenge, adv.target
    )
}

/// Select persona + optional adversarial for a cycle, and consume any
/// pending stimuli (moved to processed) and decisions (deleted).
pub fn select_mutation<R: Rng>(
    state: &ProjectState,
    config: &EvonestConfig,
    overrides: &SelectionOverrides,
    progress: &Progress,
    rng: &mut R,
) -> Result<SelectedMutation> {
    // 1. Persona (forced or weighted random)
    let persona = if let Some(forced) = &overrides.persona_id {
        list_all_personas(state)?
            .into_iter()
            .find(|p| &p.id == forced)
            .ok_or_else(|| Error::NoMutations(format!("persona not found: {forced}")))?
    } else {
        let mut pool = load_personas(state, config)?;
        if let Some(group) = &overrides.group {
            pool.retain(|p| &p.group == group);
        }
        if pool.is_empty() {
            return Err(Error::NoMutations(
                "no enabled personas match the current filters".into(),
            ));
        }
        let weights: Vec<f64> = pool
            .iter()
            .map(|p| stat_weight(&progress.persona_stats, &p.id))
            .collect();
        let idx = weighted_index(&weights, rng);
        pool.swap_remove(idx)
    };

    // 2. Adversarial (forced, suppressed, or probability roll)
    let mut adversarial: Option<Adversarial> = None;
    match overrides.adversarial_id.as_deref() {
        Some("none") => {}
        Some(forced) => {
            adversarial = list_all_adversarials(state)?
                .into_iter()
                .find(|a| a.id == forced);
            if adversarial.is_none() {
                return Err(Error::NoMutations(format!(
                    "adversarial not found: {forced}"
                )));
            }
        }
        None => {
            let pool = load_adversarials(state, config)?;
            if !pool.is_empty() && rng.gen_range(0.0..1.0) < config.adversarial_probability {
                let weights: Vec<f64> = pool
                    .iter()
                    .map(|a| stat_weight(&progress.adversarial_stats, &a.id))
                    .collect();
                let idx = weighted_index(&weights, rng);
                adversarial = Some(pool[idx].clone());
            }
        }
    }

    // 3. External stimuli (consumed: moved to .processed/)
    let stimuli = state.consume_stimuli()?;
    let stimuli_section = if stimuli.is_empty() {
        String::new()
    } else {
        let mut section = String::from("## External Stimuli\n");
        for s in &stimuli {
            section.push_str("---\n");
            section.push_str(s);
            section.push('\n');
        }
        section
    };

    // 4. Human decisions (consumed: deleted, single-shot)
    let decisions = state.consume_decisions()?;
    let decisions_section = if decisions.is_empty() {
        String::new()
    } else {
        let mut section = String::from("## Human Decisions\n");
        for d in &decisions {
            section.push_str("---\n");
            section.push_str(d);
            section.push('\n');
        }
        section
    };

    Ok(SelectedMutation {
        persona_id: persona.id,
        persona_name: persona.name,
        persona_text: persona.perspective,
        adversarial_id: adversarial.as_ref().map(|a| a.id.clone()),
        adversarial_name: adversarial.as_ref().map(|a| a.name.clone()),
        adversarial_section: adversarial.as_ref().map(render_adversarial).unwrap_or_default(),
        stimuli_section,
        decisions_section,
        decisions,
    })
}

/// Deterministic sweep order for --all-personas runs.
pub fn sweep_persona_ids(state: &ProjectState, config: &EvonestConfig) -> Result<Vec<String>> {
    let mut ids: Vec<String> = load_personas(state, config)?
        .into_iter()
        .map(|p| p.id)
        .collect();
    ids.sort();
    if ids.is_empty() {
        return Err(Error::NoMutations("all personas are disabled".into()));
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn builtin_data_parses() {
        let personas = builtin_personas();
        assert!(personas.len() >= 6);
        assert!(personas.iter().any(|p| p.id == "architect"));
        let adversarials = builtin_adversarials();
        assert!(adversarials.iter().any(|a| a.id == "corrupt-state"));
    }

    #[test]
    fn builtin_groups_are_known() {
        for p in builtin_personas() {
            assert!(
                matches!(p.group.as_str(), "tech" | "biz" | "quality"),
                "unexpected group {} for {}",
                p.group,
                p.id
            );
        }
    }

    #[test]
    fn weighted_index_prefers_heavy_items() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = vec![0.2, 3.0, 0.2];
        let mut hits = [0usize; 3];
        for _ in 0..2000 {
            hits[weighted_index(&weights, &mut rng)] += 1;
        }
        assert!(hits[1] > hits[0] * 5);
        assert!(hits[1] > hits[2] * 5);
    }

    #[test]
    fn weighted_index_ignores_nonpositive_weights() {
        let mut rng = StdRng::seed_from_u64(7);
        let weights = vec![0.0, 1.0];
        for _ in 0..100 {
            assert_eq!(weighted_index(&weights, &mut rng), 1);
        }
    }
}
