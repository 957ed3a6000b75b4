//! Plan phase — pick exactly one improvement and lay out the change.

use crate::backlog;
use crate::config::EvonestConfig;
use crate::error::Result;
use crate::runner::{LmRequest, LmRunner, PLAN_TOOLS};
use crate::state::ProjectState;

use super::envelope::{extract_json, string_or_id};
use super::{assemble, language_section, PLAN_PROMPT};

#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub output: String,
    pub success: bool,
    pub stderr: String,
    /// Plan decided nothing is worth doing — the run stops early.
    pub no_improvements: bool,
    /// Backlog item the plan selected, already marked in_progress.
    pub selected_item_id: Option<String>,
    pub commit_message: Option<String>,
}

pub async fn run_plan(
    state: &ProjectState,
    config: &EvonestConfig,
    runner: &LmRunner,
) -> Result<PlanOutcome> {
    let observe_text = state.read_text(&state.paths.observe_artifact())?;
    if observe_text.is_empty() {
        return Ok(PlanOutcome {
            output: String::new(),
            success: false,
            stderr: "no observe artifact".into(),
            no_improvements: false,
            selected_item_id: None,
            commit_message: None,
        });
    }

    let mut parts = vec![PLAN_PROMPT.to_string()];
    let identity = state.read_identity()?;
    if !identity.is_empty() {
        parts.push(format!("## Project Identity\n\n{identity}"));
    }
    parts.push(backlog::build_context(state, 10)?);
    parts.push(format!(
        "## Observations from Previous Phase\n\n{observe_text}"
    ));
    if let Some(section) = language_section(
        &config.language,
        "descriptions, plans, titles, rationale, commit messages",
    ) {
        parts.push(section);
    }

    let result = runner
        .run(&LmRequest {
            prompt: assemble(parts),
            model: config.model.clone(),
            max_turns: config.max_turns.plan,
            allowed_tools: PLAN_TOOLS,
            cwd: state.project().to_path_buf(),
        })
        .await?;

    state.write_text(&state.paths.plan_artifact(), &result.output)?;

    if !result.success {
        return Ok(PlanOutcome {
            output: result.output,
            success: false,
            stderr: result.stderr,
            no_improvements: false,
            selected_item_id: None,
            commit_message: None,
        });
    }

    let envelope = extract_json(&result.output);
    let selected = envelope
        .as_ref()
        .and_then(|e| string_or_id(e.get("selected_improvement")));
    let commit_message = envelope
        .as_ref()
        .and_then(|e| e.get("commit_message"))
        .and_then(|m| m.as_str())
        .filter(|m| !m.trim().is_empty())
        .map(String::from);

    let no_improvements = selected.is_none() && plan_says_no_improvements(&result.output);
    if no_improvements {
        return Ok(PlanOutcome {
            output: result.output,
            success: true,
            stderr: result.stderr,
            no_improvements: true,
            selected_item_id: None,
            commit_message: None,
        });
    }

    if let Some(id) = &selected {
        backlog::mark_in_progress(state, id)?;
    }

    Ok(PlanOutcome {
        output: result.output,
        success: true,
        stderr: result.stderr,
        no_improvements: false,
        selected_item_id: selected,
        commit_message,
    })
}

/// Textual fallbacks for the null-selection contract, for models that skip
/// the envelope.
pub(crate) fn plan_says_no_improvements(output: &str) -> bool {
    let lower = output.to_lowercase();
    ["no improvements", "nothing to do", "\"selected_improvement\": null", "\"selected_improvement\":null"]
        .iter()
        .any(|phrase| lower.contains(phrase))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_selection_is_detected() {
        assert!(plan_says_no_improvements(
            "```json\n{\"selected_improvement\": null}\n```"
        ));
        assert!(plan_says_no_improvements("There are no improvements worth making."));
        assert!(!plan_says_no_improvements(
            "{\"selected_improvement\": {\"id\": \"improve-1\"}}"
        ));
    }
}
