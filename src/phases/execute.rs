//! Execute phase — the only phase allowed to mutate source files, via the
//! LM child's Write/Edit tools. A git stash is taken before this runs and
//! boundary paths are checked against the diff afterwards.

use crate::boundary::BoundarySet;
use crate::config::EvonestConfig;
use crate::error::Result;
use crate::runner::{LmRequest, LmRunner, EXECUTE_TOOLS};
use crate::state::ProjectState;

use super::{assemble, language_section, ExecuteOutcome, EXECUTE_PROMPT};

pub async fn run_execute(
    state: &ProjectState,
    config: &EvonestConfig,
    runner: &LmRunner,
    boundaries: &BoundarySet,
    decisions_section: &str,
) -> Result<ExecuteOutcome> {
    let plan_text = state.read_text(&state.paths.plan_artifact())?;
    if plan_text.is_empty() {
        return Ok(ExecuteOutcome {
            output: String::new(),
            success: false,
            stderr: "no plan artifact".into(),
        });
    }

    let mut parts = vec![EXECUTE_PROMPT.to_string()];
    let identity = state.read_identity()?;
    if !identity.is_empty() {
        parts.push(format!("## Project Identity\n\n{identity}"));
    }
    parts.push(boundaries.prompt_section());
    parts.push(format!("## Plan to Execute\n\n{plan_text}"));
    if !decisions_section.is_empty() {
        parts.push(decisions_section.to_string());
    }
    if let Some(section) = language_section(
        &config.language,
        "code comments, commit messages, summaries",
    ) {
        parts.push(section);
    }

    let result = runner
        .run(&LmRequest {
            prompt: assemble(parts),
            model: config.model.clone(),
            max_turns: config.max_turns.execute,
            allowed_tools: EXECUTE_TOOLS,
            cwd: state.project().to_path_buf(),
        })
        .await?;

    state.write_text(&state.paths.execute_artifact(), &result.output)?;

    Ok(ExecuteOutcome {
        output: result.output,
        success: result.success,
        stderr: result.stderr,
    })
}
