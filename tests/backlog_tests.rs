//! Integration tests for the backlog lifecycle state machine.

use evonest::backlog::{
    build_context, mark_in_progress, prune, resolve_attempt, save_observations,
};
use evonest::init::init_project;
use evonest::state::ProjectState;
use evonest::types::BacklogStatus;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;

fn fixture() -> (tempfile::TempDir, ProjectState, StdRng) {
    let dir = tempfile::tempdir().expect("tempdir");
    init_project(dir.path(), "standard", None).expect("init");
    let state = ProjectState::open(dir.path()).expect("open");
    (dir, state, StdRng::seed_from_u64(42))
}

#[test]
fn observations_enter_as_pending_and_dedupe_by_title() {
    let (_dir, state, mut rng) = fixture();
    let improvements = vec![
        json!({"title": "Fix the parser", "category": "bug", "priority": "high",
               "files": ["src/parser.rs"]}),
        json!({"title": "Fix the parser", "category": "bug"}),
        json!({"title": "fix THE parser  ", "category": "bug"}),
        json!({"title": "Add retry tests", "category": "test-coverage",
               "files": "src/a.rs, src/b.rs"}),
    ];
    let added = save_observations(&state, &improvements, "architect", 1, &mut rng).unwrap();
    assert_eq!(added, 2);

    let backlog = state.load_backlog().unwrap();
    assert_eq!(backlog.items.len(), 2);
    assert!(backlog
        .items
        .iter()
        .all(|i| i.status == BacklogStatus::Pending));
    // Comma-separated file strings are split
    let tests_item = backlog
        .items
        .iter()
        .find(|i| i.title == "Add retry tests")
        .unwrap();
    assert_eq!(tests_item.files, vec!["src/a.rs", "src/b.rs"]);
}

#[test]
fn lifecycle_follows_the_state_machine() {
    let (_dir, state, mut rng) = fixture();
    save_observations(
        &state,
        &[json!({"title": "Tighten errors", "priority": "high"})],
        "architect",
        1,
        &mut rng,
    )
    .unwrap();
    let id = state.load_backlog().unwrap().items[0].id.clone();

    mark_in_progress(&state, &id).unwrap();
    assert_eq!(
        state.load_backlog().unwrap().items[0].status,
        BacklogStatus::InProgress
    );

    // Failure sends it back to pending with an attempt recorded
    resolve_attempt(&state, &id, false, 2).unwrap();
    let item = state.load_backlog().unwrap().items[0].clone();
    assert_eq!(item.status, BacklogStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert_eq!(item.last_attempt_cycle, Some(2));

    // Success completes it
    mark_in_progress(&state, &id).unwrap();
    resolve_attempt(&state, &id, true, 3).unwrap();
    assert_eq!(
        state.load_backlog().unwrap().items[0].status,
        BacklogStatus::Completed
    );
}

#[test]
fn three_failed_attempts_mark_stale() {
    let (_dir, state, mut rng) = fixture();
    save_observations(
        &state,
        &[json!({"title": "Impossible refactor"})],
        "architect",
        1,
        &mut rng,
    )
    .unwrap();
    let id = state.load_backlog().unwrap().items[0].id.clone();

    for cycle in 2..=4 {
        mark_in_progress(&state, &id).unwrap();
        resolve_attempt(&state, &id, false, cycle).unwrap();
    }
    let item = state.load_backlog().unwrap().items[0].clone();
    assert_eq!(item.status, BacklogStatus::Stale);
    assert_eq!(item.attempts, 3);
}

#[test]
fn prune_removes_old_completed_and_stale_only() {
    let (_dir, state, mut rng) = fixture();
    save_observations(
        &state,
        &[
            json!({"title": "old done"}),
            json!({"title": "old pending"}),
            json!({"title": "recent done"}),
        ],
        "architect",
        1,
        &mut rng,
    )
    .unwrap();

    let mut backlog = state.load_backlog().unwrap();
    backlog.items[0].status = BacklogStatus::Completed;
    backlog.items[0].source_cycle = 1;
    backlog.items[1].source_cycle = 1; // pending survives any age
    backlog.items[2].status = BacklogStatus::Completed;
    backlog.items[2].source_cycle = 30;
    state.save_backlog(&backlog).unwrap();

    let removed = prune(&state, 40).unwrap();
    assert_eq!(removed, 1);
    let titles: Vec<String> = state
        .load_backlog()
        .unwrap()
        .items
        .iter()
        .map(|i| i.title.clone())
        .collect();
    assert!(titles.contains(&"old pending".to_string()));
    assert!(titles.contains(&"recent done".to_string()));
    assert!(!titles.contains(&"old done".to_string()));
}

#[test]
fn plan_context_lists_pending_by_priority() {
    let (_dir, state, mut rng) = fixture();
    save_observations(
        &state,
        &[
            json!({"title": "low prio", "priority": "low"}),
            json!({"title": "high prio", "priority": "high"}),
        ],
        "architect",
        1,
        &mut rng,
    )
    .unwrap();

    let context = build_context(&state, 10).unwrap();
    let high_pos = context.find("high prio").unwrap();
    let low_pos = context.find("low prio").unwrap();
    assert!(high_pos < low_pos);
    assert!(context.contains("Accumulated Backlog"));
}

#[test]
fn plan_context_is_empty_without_pending_items() {
    let (_dir, state, _rng) = fixture();
    assert!(build_context(&state, 10).unwrap().is_empty());
}
