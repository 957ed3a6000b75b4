//! EvonestConfig — three-tier configuration resolution.
//!
//! Resolution order:
//! 1. Engine defaults (the `Default` impls below)
//! 2. Project config (.evonest/config.json, JSONC — `//` comments allowed)
//! 3. Runtime overrides (CLI flags / environment)
//!
//! The active level preset (quick/standard/deep) is applied as a baseline
//! between tiers 1 and 2, so explicit project keys still win over it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::paths::EvonestPaths;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    pub build: Option<String>,
    pub test: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MaxTurns {
    pub observe: u32,
    pub observe_deep: u32,
    pub plan: u32,
    pub execute: u32,
    pub meta: u32,
    pub scout: u32,
}

impl Default for MaxTurns {
    fn default() -> Self {
        Self {
            observe: 25,
            observe_deep: 100,
            plan: 15,
            execute: 25,
            meta: 10,
            scout: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LevelPreset {
    pub model: String,
    pub observe_mode: String,
    pub max_turns: MaxTurns,
}

impl Default for LevelPreset {
    fn default() -> Self {
        Self {
            model: "sonnet".to_string(),
            observe_mode: "auto".to_string(),
            max_turns: MaxTurns::default(),
        }
    }
}

fn default_levels() -> BTreeMap<String, LevelPreset> {
    let mut levels = BTreeMap::new();
    levels.insert(
        "quick".to_string(),
        LevelPreset {
            model: "haiku".into(),
            observe_mode: "quick".into(),
            max_turns: MaxTurns {
                observe: 15,
                observe_deep: 40,
                plan: 10,
                execute: 20,
                meta: 8,
                scout: 10,
            },
        },
    );
    levels.insert("standard".to_string(), LevelPreset::default());
    levels.insert(
        "deep".to_string(),
        LevelPreset {
            model: "opus".into(),
            observe_mode: "deep".into(),
            max_turns: MaxTurns {
                observe: 50,
                observe_deep: 150,
                plan: 20,
                execute: 35,
                meta: 15,
                scout: 20,
            },
        },
    );
    levels
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvonestConfig {
    pub active_level: String,
    pub language: String,
    /// "commit" = direct commit; "pr" = branch + pull request.
    pub code_output: String,
    pub model: String,
    pub max_cycles_per_run: u32,
    pub meta_cycle_interval: u32,
    pub max_dynamic_personas: usize,
    pub max_dynamic_adversarials: usize,
    pub dynamic_mutation_ttl_cycles: u32,
    pub adversarial_probability: f64,
    pub scout_enabled: bool,
    pub scout_cycle_interval: u32,
    pub scout_min_relevance_score: i64,
    /// Persona group filter: empty = all groups.
    pub active_groups: Vec<String>,
    /// Per-id toggle maps. Missing id = enabled.
    pub personas: BTreeMap<String, bool>,
    pub adversarials: BTreeMap<String, bool>,
    pub observe_mode: String,
    pub deep_cycle_interval: u32,
    pub observe_turns_quick_ratio: f64,
    pub observe_turns_deep_ratio: f64,
    pub observe_turns_min_quick: u32,
    pub observe_turns_min_deep: u32,
    pub verify: VerifyConfig,
    pub max_turns: MaxTurns,
    pub levels: BTreeMap<String, LevelPreset>,

    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl Default for EvonestConfig {
    fn default() -> Self {
        Self {
            active_level: "standard".into(),
            language: "english".into(),
            code_output: "commit".into(),
            model: "sonnet".into(),
            max_cycles_per_run: 5,
            meta_cycle_interval: 5,
            max_dynamic_personas: 5,
            max_dynamic_adversarials: 3,
            dynamic_mutation_ttl_cycles: 15,
            adversarial_probability: 0.2,
            scout_enabled: true,
            scout_cycle_interval: 10,
            scout_min_relevance_score: 6,
            active_groups: Vec::new(),
            personas: BTreeMap::new(),
            adversarials: BTreeMap::new(),
            observe_mode: "auto".into(),
            deep_cycle_interval: 10,
            observe_turns_quick_ratio: 0.10,
            observe_turns_deep_ratio: 0.50,
            observe_turns_min_quick: 15,
            observe_turns_min_deep: 30,
            verify: VerifyConfig::default(),
            max_turns: MaxTurns::default(),
            levels: default_levels(),
            config_path: None,
        }
    }
}

/// Strip `//` line comments so hand-edited config files may carry notes.
fn strip_jsonc_comments(text: &str) -> String {
    let re = Regex::new(r"(?m)^\s*//[^\n]*|\s+//[^\n]*").expect("static regex");
    re.replace_all(text, "").into_owned()
}

impl EvonestConfig {
    /// Load config for a project with full three-tier resolution.
    pub fn load(project: &Path) -> Result<Self> {
        let paths = EvonestPaths::new(project);
        let mut config = Self::default();
        config.config_path = Some(paths.config());

        let mut project_data: Option<Value> = None;
        if paths.config().exists() {
            let raw = std::fs::read_to_string(paths.config())?;
            let parsed: Value = serde_json::from_str(&strip_jsonc_comments(&raw))
                .map_err(|e| Error::config(format!("{}: {e}", paths.config().display())))?;
            // Levels first so the preset application below sees customized
            // presets; active_level next so the right preset is picked.
            if let Some(levels) = parsed.get("levels") {
                config.apply_levels(levels)?;
            }
            if let Some(level) = parsed.get("active_level").and_then(|v| v.as_str()) {
                config.active_level = level.to_string();
            }
            project_data = Some(parsed);
        }

        let active_level = config.active_level.clone();
        config.apply_level(&active_level);

        if let Some(data) = &project_data {
            config.apply_value(data)?;
        }

        // Environment overrides
        if let Ok(model) = std::env::var("EVONEST_MODEL") {
            if !model.trim().is_empty() {
                config.model = model;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Apply a level preset (model, observe_mode, max_turns) as the new
    /// baseline. Unknown level names are ignored here; `validate` rejects
    /// them when they are the active level.
    pub fn apply_level(&mut self, level: &str) {
        if let Some(preset) = self.levels.get(level) {
            self.model = preset.model.clone();
            self.observe_mode = preset.observe_mode.clone();
            self.max_turns = preset.max_turns.clone();
        }
    }

    pub fn set_level(&mut self, level: &str) -> Result<()> {
        if !self.levels.contains_key(level) {
            return Err(Error::config(format!("unknown level: {level}")));
        }
        self.active_level = level.to_string();
        self.apply_level(level);
        Ok(())
    }

    fn apply_levels(&mut self, value: &Value) -> Result<()> {
        let Some(table) = value.as_object() else {
            return Err(Error::config("levels must be an object"));
        };
        for (name, data) in table {
            if !data.is_object() {
                continue;
            }
            let mut preset = self.levels.get(name).cloned().unwrap_or_default();
            if let Some(model) = data.get("model").and_then(|v| v.as_str()) {
                preset.model = model.to_string();
            }
            if let Some(mode) = data.get("observe_mode").and_then(|v| v.as_str()) {
                preset.observe_mode = mode.to_string();
            }
            if let Some(turns) = data.get("max_turns") {
                apply_max_turns(&mut preset.max_turns, turns);
            }
            self.levels.insert(name.clone(), preset);
        }
        Ok(())
    }

    /// Deep-merge a JSON object onto this config. Objects merge, scalars and
    /// lists replace, explicit `null` unsets nullable fields.
    pub fn apply_value(&mut self, data: &Value) -> Result<()> {
        let Some(map) = data.as_object() else {
            return Err(Error::config("config must be a JSON object"));
        };
        for (key, value) in map {
            match key.as_str() {
                "active_level" => {
                    if let Some(s) = value.as_str() {
                        self.active_level = s.to_string();
                    }
                }
                "language" => apply_string(&mut self.language, value),
                "code_output" => apply_string(&mut self.code_output, value),
                "model" => apply_string(&mut self.model, value),
                "max_cycles_per_run" => apply_u32(&mut self.max_cycles_per_run, value),
                "meta_cycle_interval" => apply_u32(&mut self.meta_cycle_interval, value),
                "max_dynamic_personas" => apply_usize(&mut self.max_dynamic_personas, value),
                "max_dynamic_adversarials" => {
                    apply_usize(&mut self.max_dynamic_adversarials, value)
                }
                "dynamic_mutation_ttl_cycles" => {
                    apply_u32(&mut self.dynamic_mutation_ttl_cycles, value)
                }
                "adversarial_probability" => {
                    if let Some(f) = value.as_f64() {
                        self.adversarial_probability = f;
                    }
                }
                "scout_enabled" => {
                    if let Some(b) = value.as_bool() {
                        self.scout_enabled = b;
                    }
                }
                "scout_cycle_interval" => apply_u32(&mut self.scout_cycle_interval, value),
                "scout_min_relevance_score" => {
                    if let Some(n) = value.as_i64() {
                        self.scout_min_relevance_score = n;
                    }
                }
                "active_groups" => {
                    if let Some(list) = value.as_array() {
                        self.active_groups = list
                            .iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect();
                    }
                }
                "personas" => apply_toggles(&mut self.personas, value),
                "adversarials" => apply_toggles(&mut self.adversarials, value),
                "observe_mode" => apply_string(&mut self.observe_mode, value),
                "deep_cycle_interval" => apply_u32(&mut self.deep_cycle_interval, value),
                "observe_turns_quick_ratio" => {
                    if let Some(f) = value.as_f64() {
                        self.observe_turns_quick_ratio = f;
                    }
                }
                "observe_turns_deep_ratio" => {
                    if let Some(f) = value.as_f64() {
                        self.observe_turns_deep_ratio = f;
                    }
                }
                "observe_turns_min_quick" => apply_u32(&mut self.observe_turns_min_quick, value),
                "observe_turns_min_deep" => apply_u32(&mut self.observe_turns_min_deep, value),
                "verify" => {
                    if let Some(obj) = value.as_object() {
                        // null is an explicit unset, distinct from missing
                        if let Some(build) = obj.get("build") {
                            self.verify.build = build.as_str().map(String::from);
                        }
                        if let Some(test) = obj.get("test") {
                            self.verify.test = test.as_str().map(String::from);
                        }
                    }
                }
                "max_turns" => apply_max_turns(&mut self.max_turns, value),
                "levels" => self.apply_levels(value)?,
                _ => {
                    return Err(Error::config(format!("unknown config key: {key}")));
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.adversarial_probability) {
            return Err(Error::config(format!(
                "adversarial_probability must be between 0.0 and 1.0, got {}",
                self.adversarial_probability
            )));
        }
        if !self.levels.contains_key(&self.active_level) {
            return Err(Error::config(format!(
                "active_level must be one of {:?}, got '{}'",
                self.levels.keys().collect::<Vec<_>>(),
                self.active_level
            )));
        }
        if !(1..=10).contains(&self.scout_min_relevance_score) {
            return Err(Error::config(format!(
                "scout_min_relevance_score must be in 1..=10, got {}",
                self.scout_min_relevance_score
            )));
        }
        match self.code_output.as_str() {
            "commit" | "pr" => {}
            other => {
                return Err(Error::config(format!(
                    "code_output must be 'commit' or 'pr', got '{other}'"
                )))
            }
        }
        match self.observe_mode.as_str() {
            "auto" | "quick" | "deep" => {}
            other => {
                return Err(Error::config(format!(
                    "observe_mode must be auto/quick/deep, got '{other}'"
                )))
            }
        }
        Ok(())
    }

    /// Ids explicitly toggled off in the persona map.
    pub fn disabled_persona_ids(&self) -> Vec<String> {
        self.personas
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn disabled_adversarial_ids(&self) -> Vec<String> {
        self.adversarials
            .iter()
            .filter(|(_, enabled)| !**enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Set a single value by key. Dotted keys reach into nested sections
    /// (`verify.test`, `max_turns.observe`) and toggle maps
    /// (`personas.<id>`).
    pub fn set(&mut self, key: &str, raw: &str) -> Result<()> {
        let parse_bool = |raw: &str| matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes");
        if let Some((head, rest)) = key.split_once('.') {
            match head {
                "personas" => {
                    self.personas.insert(rest.to_string(), parse_bool(raw));
                    return Ok(());
                }
                "adversarials" => {
                    self.adversarials.insert(rest.to_string(), parse_bool(raw));
                    return Ok(());
                }
                "verify" => {
                    let value = if raw == "null" || raw.is_empty() {
                        None
                    } else {
                        Some(raw.to_string())
                    };
                    match rest {
                        "build" => self.verify.build = value,
                        "test" => self.verify.test = value,
                        _ => return Err(Error::config(format!("unknown config key: {key}"))),
                    }
                    return Ok(());
                }
                "max_turns" => {
                    let n: u32 = raw
                        .parse()
                        .map_err(|_| Error::config(format!("{key} expects an integer")))?;
                    match rest {
                        "observe" => self.max_turns.observe = n,
                        "observe_deep" => self.max_turns.observe_deep = n,
                        "plan" => self.max_turns.plan = n,
                        "execute" => self.max_turns.execute = n,
                        "meta" => self.max_turns.meta = n,
                        "scout" => self.max_turns.scout = n,
                        _ => return Err(Error::config(format!("unknown config key: {key}"))),
                    }
                    return Ok(());
                }
                _ => return Err(Error::config(format!("unknown config key: {key}"))),
            }
        }

        let int = || -> Result<u32> {
            raw.parse()
                .map_err(|_| Error::config(format!("{key} expects an integer")))
        };
        let float = || -> Result<f64> {
            raw.parse()
                .map_err(|_| Error::config(format!("{key} expects a number")))
        };
        match key {
            "active_level" => self.set_level(raw)?,
            "language" => self.language = raw.to_string(),
            "code_output" => self.code_output = raw.to_string(),
            "model" => self.model = raw.to_string(),
            "max_cycles_per_run" => self.max_cycles_per_run = int()?,
            "meta_cycle_interval" => self.meta_cycle_interval = int()?,
            "max_dynamic_personas" => self.max_dynamic_personas = int()? as usize,
            "max_dynamic_adversarials" => self.max_dynamic_adversarials = int()? as usize,
            "dynamic_mutation_ttl_cycles" => self.dynamic_mutation_ttl_cycles = int()?,
            "adversarial_probability" => self.adversarial_probability = float()?,
            "scout_enabled" => self.scout_enabled = parse_bool(raw),
            "scout_cycle_interval" => self.scout_cycle_interval = int()?,
            "scout_min_relevance_score" => self.scout_min_relevance_score = int()? as i64,
            "observe_mode" => self.observe_mode = raw.to_string(),
            "deep_cycle_interval" => self.deep_cycle_interval = int()?,
            "observe_turns_quick_ratio" => self.observe_turns_quick_ratio = float()?,
            "observe_turns_deep_ratio" => self.observe_turns_deep_ratio = float()?,
            "observe_turns_min_quick" => self.observe_turns_min_quick = int()?,
            "observe_turns_min_deep" => self.observe_turns_min_deep = int()?,
            _ => return Err(Error::config(format!("unknown config key: {key}"))),
        }
        self.validate()
    }

    /// Write the resolved config back to .evonest/config.json.
    pub fn save(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or_else(|| Error::config("config path not set — load from a project first"))?;
        let mut content = serde_json::to_string_pretty(self)?;
        content.push('\n');
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn apply_string(slot: &mut String, value: &Value) {
    if let Some(s) = value.as_str() {
        *slot = s.to_string();
    }
}

fn apply_u32(slot: &mut u32, value: &Value) {
    if let Some(n) = value.as_u64() {
        *slot = n as u32;
    }
}

fn apply_usize(slot: &mut usize, value: &Value) {
    if let Some(n) = value.as_u64() {
        *slot = n as usize;
    }
}

fn apply_toggles(map: &mut BTreeMap<String, bool>, value: &Value) {
    if let Some(obj) = value.as_object() {
        for (id, enabled) in obj {
            if let Some(b) = enabled.as_bool() {
                map.insert(id.clone(), b);
            }
        }
    }
}

fn apply_max_turns(turns: &mut MaxTurns, value: &Value) {
    let Some(obj) = value.as_object() else { return };
    let get = |key: &str| obj.get(key).and_then(|v| v.as_u64()).map(|n| n as u32);
    if let Some(n) = get("observe") {
        turns.observe = n;
    }
    if let Some(n) = get("observe_deep") {
        turns.observe_deep = n;
    }
    if let Some(n) = get("plan") {
        turns.plan = n;
    }
    if let Some(n) = get("execute") {
        turns.execute = n;
    }
    if let Some(n) = get("meta") {
        turns.meta = n;
    }
    if let Some(n) = get("scout") {
        turns.scout = n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_match_contract() {
        let cfg = EvonestConfig::default();
        assert_eq!(cfg.model, "sonnet");
        assert_eq!(cfg.max_cycles_per_run, 5);
        assert_eq!(cfg.adversarial_probability, 0.2);
        assert_eq!(cfg.meta_cycle_interval, 5);
        assert_eq!(cfg.scout_cycle_interval, 10);
        assert_eq!(cfg.scout_min_relevance_score, 6);
        assert!(cfg.verify.build.is_none());
    }

    #[test]
    fn level_preset_applies_before_explicit_keys() {
        let mut cfg = EvonestConfig::default();
        cfg.active_level = "deep".into();
        cfg.apply_level("deep");
        assert_eq!(cfg.model, "opus");
        assert_eq!(cfg.observe_mode, "deep");
        // Explicit project key still wins over the preset
        cfg.apply_value(&json!({"model": "haiku"})).unwrap();
        assert_eq!(cfg.model, "haiku");
        assert_eq!(cfg.max_turns.observe, 50);
    }

    #[test]
    fn verify_null_is_explicit_unset() {
        let mut cfg = EvonestConfig::default();
        cfg.verify.test = Some("cargo test".into());
        cfg.apply_value(&json!({"verify": {"test": null}})).unwrap();
        assert!(cfg.verify.test.is_none());
        // Missing key inherits
        cfg.verify.build = Some("cargo build".into());
        cfg.apply_value(&json!({"verify": {"test": "pytest"}}))
            .unwrap();
        assert_eq!(cfg.verify.build.as_deref(), Some("cargo build"));
    }

    #[test]
    fn unknown_key_is_config_error() {
        let mut cfg = EvonestConfig::default();
        let err = cfg.apply_value(&json!({"max_cycels": 3})).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn dotted_set_reaches_nested_sections() {
        let mut cfg = EvonestConfig::default();
        cfg.set("verify.test", "uv run pytest -q").unwrap();
        assert_eq!(cfg.verify.test.as_deref(), Some("uv run pytest -q"));
        cfg.set("max_turns.observe", "42").unwrap();
        assert_eq!(cfg.max_turns.observe, 42);
        cfg.set("personas.architect", "false").unwrap();
        assert_eq!(cfg.personas.get("architect"), Some(&false));
        assert!(cfg.set("nope.nope", "1").is_err());
    }

    #[test]
    fn validate_rejects_bad_probability_and_level() {
        let mut cfg = EvonestConfig::default();
        cfg.adversarial_probability = 1.5;
        assert!(cfg.validate().is_err());
        cfg.adversarial_probability = 0.2;
        cfg.active_level = "extreme".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn jsonc_comments_are_stripped() {
        let raw = "{\n  // verify commands\n  \"model\": \"haiku\" // inline\n}";
        let parsed: Value = serde_json::from_str(&strip_jsonc_comments(raw)).unwrap();
        assert_eq!(parsed["model"], "haiku");
    }

    #[test]
    fn max_cycles_zero_is_allowed() {
        let mut cfg = EvonestConfig::default();
        cfg.apply_value(&json!({"max_cycles_per_run": 0})).unwrap();
        assert_eq!(cfg.max_cycles_per_run, 0);
        assert!(cfg.validate().is_ok());
    }
}
