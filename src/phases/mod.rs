//! Phase execution — Observe, Plan, Execute, Verify.
//!
//! Each phase assembles a prompt from an embedded template plus context
//! sections, calls the LM runner, writes its artifact into .evonest/, and
//! parses the JSON envelope out of the final message.

mod context;
mod envelope;
mod execute;
mod observe;
mod plan;
mod verify;

pub use context::{count_source_files, gather_static_context};
pub use envelope::{extract_json, parse_improvements};
pub use execute::run_execute;
pub use observe::{run_observe, ObserveArgs, ObserveOutcome};
pub use plan::{run_plan, PlanOutcome};
pub use verify::{run_verify, VerifyOutcome};

pub(crate) const OBSERVE_PROMPT: &str = include_str!("../prompts/observe.md");
pub(crate) const OBSERVE_DEEP_PROMPT: &str = include_str!("../prompts/observe_deep.md");
pub(crate) const PLAN_PROMPT: &str = include_str!("../prompts/plan.md");
pub(crate) const EXECUTE_PROMPT: &str = include_str!("../prompts/execute.md");

/// Outcome of the Execute phase. The envelope's file lists are advisory;
/// git diff is the source of truth for what actually changed.
#[derive(Debug, Clone)]
pub struct ExecuteOutcome {
    pub output: String,
    pub success: bool,
    pub stderr: String,
}

/// Append the non-English language instruction the way every phase does.
pub(crate) fn language_section(language: &str, what: &str) -> Option<String> {
    if language.eq_ignore_ascii_case("english") {
        return None;
    }
    Some(format!(
        "## Language Instruction\n\nWrite ALL content — {what} — in **{language}**. \
         Use {language} throughout your entire response."
    ))
}

/// Join prompt sections with horizontal rules, skipping empties.
pub(crate) fn assemble(parts: Vec<String>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_skips_empty_sections() {
        let prompt = assemble(vec![
            "a".to_string(),
            String::new(),
            "  ".to_string(),
            "b".to_string(),
        ]);
        assert_eq!(prompt, "a\n\n---\n\nb");
    }

    #[test]
    fn language_section_only_for_non_english() {
        assert!(language_section("english", "titles").is_none());
        assert!(language_section("English", "titles").is_none());
        let section = language_section("korean", "titles").unwrap();
        assert!(section.contains("**korean**"));
    }

    #[test]
    fn packaged_templates_are_nonempty() {
        for template in [OBSERVE_PROMPT, OBSERVE_DEEP_PROMPT, PLAN_PROMPT, EXECUTE_PROMPT] {
            assert!(template.contains("```json"));
        }
    }
}
