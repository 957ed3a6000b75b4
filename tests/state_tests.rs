//! Integration tests for ProjectState and project initialization.

use evonest::error::Error;
use evonest::init::init_project;
use evonest::state::ProjectState;
use evonest::types::{CycleOutcome, CycleRecord, Progress};

fn fixture() -> (tempfile::TempDir, ProjectState) {
    let dir = tempfile::tempdir().expect("tempdir");
    init_project(dir.path(), "standard", None).expect("init");
    let state = ProjectState::open(dir.path()).expect("open");
    (dir, state)
}

#[test]
fn init_creates_layout_and_gitignore() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path(), "standard", None).unwrap();

    let root = dir.path().join(".evonest");
    for name in [
        "config.json",
        "identity.md",
        "progress.json",
        "backlog.json",
        "dynamic-personas.json",
        "dynamic-adversarials.json",
        "advice.json",
        "environment.json",
        "scout.json",
    ] {
        assert!(root.join(name).exists(), "missing {name}");
    }
    for sub in ["history", "stimuli", "stimuli/.processed", "decisions", "proposals", "logs"] {
        assert!(root.join(sub).is_dir(), "missing dir {sub}");
    }

    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert!(gitignore.contains(".evonest/"));
}

#[test]
fn init_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    init_project(dir.path(), "standard", None).unwrap();

    // Edit the identity, re-init, and confirm it survived
    let identity_path = dir.path().join(".evonest").join("identity.md");
    std::fs::write(&identity_path, "# Custom\n").unwrap();
    let report = init_project(dir.path(), "deep", None).unwrap();
    assert!(report.contains("nothing created"));
    assert_eq!(std::fs::read_to_string(&identity_path).unwrap(), "# Custom\n");

    // .gitignore is not appended twice
    let gitignore = std::fs::read_to_string(dir.path().join(".gitignore")).unwrap();
    assert_eq!(gitignore.matches(".evonest").count(), 1);
}

#[test]
fn open_requires_initialization() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        ProjectState::open(dir.path()),
        Err(Error::NotInitialized(_))
    ));
}

#[test]
fn progress_round_trip_is_lossless() {
    let (_dir, state) = fixture();
    let mut progress = state.read_progress().unwrap();
    progress.total_cycles = 7;
    progress.total_successes = 3;
    progress
        .persona_stats
        .entry("architect".into())
        .or_default()
        .uses = 4;
    progress
        .area_touch_counts
        .insert("src/foo".into(), 3);
    state.write_progress(&progress).unwrap();

    let reread = state.read_progress().unwrap();
    state.write_progress(&reread).unwrap();
    let again = state.read_progress().unwrap();
    assert_eq!(again.total_cycles, 7);
    assert_eq!(again.total_successes, 3);
    assert_eq!(again.persona_stats["architect"].uses, 4);
    assert_eq!(again.area_touch_counts["src/foo"], 3);
}

#[test]
fn corrupt_state_raises_instead_of_defaulting() {
    let (dir, state) = fixture();
    std::fs::write(
        dir.path().join(".evonest").join("progress.json"),
        "{not json",
    )
    .unwrap();
    assert!(matches!(
        state.read_progress(),
        Err(Error::StateCorrupt { .. })
    ));
}

#[test]
fn missing_optional_files_default_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join(".evonest")).unwrap();
    let state = ProjectState::open(dir.path()).unwrap();
    assert_eq!(state.read_progress().unwrap().total_cycles, 0);
    assert!(state.load_backlog().unwrap().items.is_empty());
    assert!(state.read_dynamic_personas().unwrap().is_empty());
    assert!(state.read_scout_cache().unwrap().findings.is_empty());
    assert!(state.read_history(10).unwrap().is_empty());
}

#[test]
fn stimuli_are_consumed_once() {
    let (dir, state) = fixture();
    state.add_stimulus("first nudge").unwrap();
    state.add_stimulus("second nudge").unwrap();

    let consumed = state.consume_stimuli().unwrap();
    assert_eq!(consumed.len(), 2);
    assert!(consumed[0].contains("first") || consumed[1].contains("first"));

    // Moved to .processed/, not deleted
    let processed = dir.path().join(".evonest").join("stimuli").join(".processed");
    assert_eq!(std::fs::read_dir(&processed).unwrap().count(), 2);

    // Second consume finds nothing
    assert!(state.consume_stimuli().unwrap().is_empty());
}

#[test]
fn decisions_are_single_shot() {
    let (dir, state) = fixture();
    state.add_decision("focus on the parser").unwrap();
    let consumed = state.consume_decisions().unwrap();
    assert_eq!(consumed.len(), 1);

    // Deleted outright
    let decisions = dir.path().join(".evonest").join("decisions");
    assert_eq!(std::fs::read_dir(&decisions).unwrap().count(), 0);
    assert!(state.consume_decisions().unwrap().is_empty());
}

#[test]
fn proposal_lifecycle_add_list_done() {
    let (_dir, state) = fixture();
    let name = state
        .create_proposal("# Proposal: Split The Parser\n\nbody", Some("Split The Parser"))
        .unwrap();
    assert!(name.contains("split-the-parser"));
    assert!(name.starts_with("001-"));

    let listed = state.list_proposals().unwrap();
    assert_eq!(listed.len(), 1);

    let dest = state.mark_proposal_done(&name).unwrap();
    assert!(dest.parent().unwrap().ends_with("done"));
    assert!(state.list_proposals().unwrap().is_empty());
}

#[test]
fn proposal_done_rejects_traversal() {
    let (_dir, state) = fixture();
    assert!(state.mark_proposal_done("../../etc/passwd").is_err());
}

#[test]
fn history_appends_in_cycle_order() {
    let (_dir, state) = fixture();
    for n in 1..=3u32 {
        state
            .append_history(&CycleRecord {
                cycle_number: n,
                started_at: format!("2026-08-0{n}T00:00:00Z"),
                ended_at: format!("2026-08-0{n}T00:01:00Z"),
                persona_id: "architect".into(),
                persona_name: "Architect".into(),
                adversarial_id: None,
                phases: Vec::new(),
                outcome: if n == 2 {
                    CycleOutcome::Failure
                } else {
                    CycleOutcome::Success
                },
                commit_sha: None,
                commit_message: String::new(),
                files_touched: Vec::new(),
            })
            .unwrap();
    }
    let records = state.read_history(10).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].cycle_number, 1);
    assert_eq!(records[2].cycle_number, 3);

    let last_two = state.read_history(2).unwrap();
    assert_eq!(last_two[0].cycle_number, 2);
}

#[test]
fn resume_token_round_trip_and_clear() {
    let (_dir, state) = fixture();
    assert!(state.read_resume_token().unwrap().is_none());

    let token = evonest::types::ResumeToken {
        created_at: "2026-08-02T00:00:00Z".into(),
        cycle_number: 3,
        persona_id: "architect".into(),
        persona_name: "Architect".into(),
        adversarial_id: None,
        plan_artifact_path: "/tmp/plan.txt".into(),
        code_output: "commit".into(),
    };
    state.write_resume_token(&token).unwrap();
    let read = state.read_resume_token().unwrap().unwrap();
    assert_eq!(read.cycle_number, 3);
    assert_eq!(read.persona_id, "architect");

    state.clear_resume_token().unwrap();
    assert!(state.read_resume_token().unwrap().is_none());
    // Clearing twice is fine
    state.clear_resume_token().unwrap();
}

#[test]
fn summary_reports_counters() {
    let (_dir, state) = fixture();
    let mut progress = Progress::default();
    progress.total_cycles = 4;
    progress.total_successes = 3;
    progress.total_failures = 1;
    state.write_progress(&progress).unwrap();

    let summary = state.summary().unwrap();
    assert!(summary.contains("Cycles: 4"));
    assert!(summary.contains("success: 3"));
    assert!(summary.contains("rate: 75%"));
    assert!(summary.contains("Running: no"));
}
