//! Integration tests for three-tier config resolution against real files.

use std::sync::Mutex;

use evonest::config::EvonestConfig;
use evonest::init::init_project;

/// Guards EVONEST_MODEL so the env-override test cannot race the tests
/// that assert a resolved model.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn write_config(dir: &std::path::Path, content: &str) {
    std::fs::write(dir.join(".evonest").join("config.json"), content).unwrap();
}

fn fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    init_project(dir.path(), "standard", None).expect("init");
    dir
}

#[test]
fn defaults_apply_when_config_is_minimal() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = fixture();
    write_config(dir.path(), "{}");
    let config = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(config.model, "sonnet");
    assert_eq!(config.max_cycles_per_run, 5);
    assert_eq!(config.active_level, "standard");
}

#[test]
fn project_level_preset_applies_before_explicit_keys() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = fixture();
    write_config(
        dir.path(),
        r#"{
            // deep preset brings opus, but the explicit model wins
            "active_level": "deep",
            "model": "haiku"
        }"#,
    );
    let config = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(config.model, "haiku");
    assert_eq!(config.observe_mode, "deep");
    assert_eq!(config.max_turns.observe, 50);
}

#[test]
fn custom_level_table_feeds_the_preset() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = fixture();
    write_config(
        dir.path(),
        r#"{
            "active_level": "deep",
            "levels": {
                "deep": {"model": "sonnet", "max_turns": {"plan": 33}}
            }
        }"#,
    );
    let config = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(config.model, "sonnet");
    assert_eq!(config.max_turns.plan, 33);
    // Untouched preset fields keep the built-in deep values
    assert_eq!(config.max_turns.observe, 50);
}

#[test]
fn verify_commands_round_trip_with_null_unset() {
    let dir = fixture();
    write_config(
        dir.path(),
        r#"{"verify": {"build": "cargo build", "test": null}}"#,
    );
    let config = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(config.verify.build.as_deref(), Some("cargo build"));
    assert!(config.verify.test.is_none());
}

#[test]
fn unknown_key_in_project_config_is_rejected() {
    let dir = fixture();
    write_config(dir.path(), r#"{"max_cyclez": 3}"#);
    let err = EvonestConfig::load(dir.path()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn invalid_level_is_rejected() {
    let dir = fixture();
    write_config(dir.path(), r#"{"active_level": "extreme"}"#);
    let err = EvonestConfig::load(dir.path()).unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[test]
fn dotted_set_persists_through_save() {
    let dir = fixture();
    let mut config = EvonestConfig::load(dir.path()).unwrap();
    config.set("verify.test", "cargo test -q").unwrap();
    config.set("adversarial_probability", "0.35").unwrap();
    config.save().unwrap();

    let reloaded = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(reloaded.verify.test.as_deref(), Some("cargo test -q"));
    assert!((reloaded.adversarial_probability - 0.35).abs() < 1e-9);
}

#[test]
fn env_model_override_wins() {
    let _guard = ENV_LOCK.lock().unwrap();
    let dir = fixture();
    write_config(dir.path(), r#"{"model": "haiku"}"#);
    std::env::set_var("EVONEST_MODEL", "opus");
    let config = EvonestConfig::load(dir.path());
    std::env::remove_var("EVONEST_MODEL");
    assert_eq!(config.unwrap().model, "opus");
}

#[test]
fn persona_toggles_disable_ids() {
    let dir = fixture();
    write_config(
        dir.path(),
        r#"{"personas": {"architect": false, "test-engineer": true}}"#,
    );
    let config = EvonestConfig::load(dir.path()).unwrap();
    assert_eq!(config.disabled_persona_ids(), vec!["architect".to_string()]);
}
