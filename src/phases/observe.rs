//! Observe phase — explore the project from a persona's viewpoint and
//! harvest improvement candidates.

use rand::Rng;
use serde_json::Value;

use crate::backlog;
use crate::config::EvonestConfig;
use crate::error::Result;
use crate::history::build_history_summary;
use crate::mutations::SelectedMutation;
use crate::progress::build_convergence_context;
use crate::runner::{LmRequest, LmRunner, OBSERVE_TOOLS};
use crate::state::ProjectState;

use super::envelope::{extract_json, parse_improvements};
use super::{assemble, language_section, OBSERVE_DEEP_PROMPT, OBSERVE_PROMPT};

#[derive(Debug, Clone)]
pub struct ObserveOutcome {
    pub output: String,
    pub success: bool,
    pub stderr: String,
    /// Set in analyze mode: how many improvements became proposal files.
    pub proposals_saved: usize,
}

pub struct ObserveArgs<'a> {
    pub mutation: &'a SelectedMutation,
    pub deep: bool,
    /// Analyze mode saves every improvement as a proposal and skips the
    /// backlog entirely.
    pub analyze_mode: bool,
    pub static_context: &'a str,
}

pub async fn run_observe<R: Rng>(
    state: &ProjectState,
    config: &EvonestConfig,
    runner: &LmRunner,
    args: ObserveArgs<'_>,
    rng: &mut R,
) -> Result<ObserveOutcome> {
    let mut parts = vec![if args.deep {
        OBSERVE_DEEP_PROMPT.to_string()
    } else {
        OBSERVE_PROMPT.to_string()
    }];

    if !args.static_context.is_empty() {
        parts.push(args.static_context.to_string());
    }

    let identity = state.read_identity()?;
    if !identity.is_empty() {
        parts.push(format!("## Project Identity\n\n{identity}"));
    }

    parts.push(build_history_summary(state, 5)?);

    let progress = state.read_progress()?;
    parts.push(build_convergence_context(&progress));

    let advice = state.read_advice()?;
    if !advice.strategic_direction.is_empty() {
        let mut section = format!(
            "## Advisor's Guidance (from accumulated experience)\n\n\
             **Strategic direction**: {}",
            advice.strategic_direction
        );
        if let Some(focus) = &advice.recommended_focus {
            section.push_str(&format!("\n**Recommended focus**: {focus}"));
        }
        if !advice.untapped_areas.is_empty() {
            section.push_str(&format!(
                "\n**Untapped areas**: {}",
                advice.untapped_areas.join(", ")
            ));
        }
        parts.push(section);
    }

    let environment = state.read_environment()?;
    if !environment.items.is_empty() {
        let preview: Vec<&Value> = environment.items.iter().take(10).collect();
        parts.push(format!(
            "## Previous Environment Scan\n\nAlready reported (do not repeat):\n```json\n{}\n```",
            serde_json::to_string_pretty(&preview)?
        ));
    }

    parts.push(format!(
        "## Your Perspective This Cycle: {}\n\n{}",
        args.mutation.persona_name, args.mutation.persona_text
    ));
    parts.push(args.mutation.adversarial_section.clone());
    parts.push(args.mutation.stimuli_section.clone());
    parts.push(args.mutation.decisions_section.clone());
    if let Some(section) = language_section(
        &config.language,
        "descriptions, observations, titles, rationale, commit messages",
    ) {
        parts.push(section);
    }

    let max_turns = if args.deep {
        config.max_turns.observe_deep
    } else {
        config.max_turns.observe
    };
    let result = runner
        .run(&LmRequest {
            prompt: assemble(parts),
            model: config.model.clone(),
            max_turns,
            allowed_tools: OBSERVE_TOOLS,
            cwd: state.project().to_path_buf(),
        })
        .await?;

    state.write_text(&state.paths.observe_artifact(), &result.output)?;

    if !result.success {
        return Ok(ObserveOutcome {
            output: result.output,
            success: false,
            stderr: result.stderr,
            proposals_saved: 0,
        });
    }

    let proposals_saved = if args.analyze_mode {
        save_all_as_proposals(state, &result.output, &args.mutation.persona_id)?
    } else {
        route_improvements(state, &result.output, &args.mutation.persona_id, rng)?;
        0
    };

    Ok(ObserveOutcome {
        output: result.output,
        success: true,
        stderr: result.stderr,
        proposals_saved,
    })
}

/// Normal evolve routing: `proposal` items become proposal files,
/// `ecosystem` items are cached in environment.json (and kept in the
/// backlog), everything else goes to the backlog.
fn route_improvements<R: Rng>(
    state: &ProjectState,
    output: &str,
    persona_id: &str,
    rng: &mut R,
) -> Result<()> {
    let Some(envelope) = extract_json(output) else {
        tracing::warn!("observe: no JSON envelope found, improvements not saved");
        return Ok(());
    };
    let improvements = parse_improvements(&envelope);
    if improvements.is_empty() {
        return Ok(());
    }

    let cycle = state.read_progress()?.total_cycles;
    let category = |imp: &Value| {
        imp.get("category")
            .and_then(|c| c.as_str())
            .unwrap_or("general")
            .to_string()
    };

    let (proposals, regular): (Vec<Value>, Vec<Value>) = improvements
        .into_iter()
        .partition(|imp| category(imp) == "proposal");

    if !regular.is_empty() {
        backlog::save_observations(state, &regular, persona_id, cycle, rng)?;
    }
    for proposal in &proposals {
        save_proposal(state, proposal, persona_id, cycle)?;
    }

    let eco_items: Vec<&Value> = regular
        .iter()
        .filter(|imp| category(imp) == "ecosystem")
        .collect();
    if !eco_items.is_empty() {
        let mut environment = state.read_environment()?;
        let existing_titles: Vec<String> = environment
            .items
            .iter()
            .filter_map(|i| i.get("title").and_then(|t| t.as_str()).map(String::from))
            .collect();
        for item in eco_items {
            let title = item.get("title").and_then(|t| t.as_str()).unwrap_or("");
            if !title.is_empty() && !existing_titles.contains(&title.to_string()) {
                environment.items.push((*item).clone());
            }
        }
        environment.last_scan_cycle = cycle;
        state.write_environment(&environment)?;
    }

    Ok(())
}

/// Analyze mode: every improvement becomes a proposal, no backlog writes.
fn save_all_as_proposals(state: &ProjectState, output: &str, persona_id: &str) -> Result<usize> {
    let Some(envelope) = extract_json(output) else {
        tracing::warn!("analyze: no JSON envelope found, proposals not saved");
        return Ok(0);
    };
    let improvements = parse_improvements(&envelope);
    let cycle = state.read_progress()?.total_cycles;
    for imp in &improvements {
        save_proposal(state, imp, persona_id, cycle)?;
    }
    Ok(improvements.len())
}

fn save_proposal(state: &ProjectState, proposal: &Value, persona_id: &str, cycle: u32) -> Result<()> {
    let title = proposal
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("Untitled Proposal");
    let description = proposal
        .get("description")
        .and_then(|d| d.as_str())
        .unwrap_or("");
    let priority = proposal
        .get("priority")
        .and_then(|p| p.as_str())
        .unwrap_or("medium");
    let files = super::envelope::string_list(proposal.get("files"));

    let mut lines = vec![
        format!("# Proposal: {title}"),
        String::new(),
        format!("**Priority**: {priority}  "),
        format!("**From persona**: {persona_id}  "),
        format!("**Cycle**: {cycle}  "),
        "**Status**: pending review".to_string(),
        String::new(),
        "## Description".to_string(),
        String::new(),
        description.to_string(),
    ];
    if !files.is_empty() {
        lines.push(String::new());
        lines.push("## Relevant Files".to_string());
        lines.push(String::new());
        for file in &files {
            lines.push(format!("- {file}"));
        }
    }
    lines.extend([
        String::new(),
        "---".to_string(),
        String::new(),
        "*This is a design-level proposal. No code was changed.*  ".to_string(),
        "*Review, reject, or act on this as the team sees fit.*".to_string(),
    ]);

    state.create_proposal(&lines.join("\n"), Some(title))?;
    Ok(())
}
