//! Persisted data types — everything serialized into .evonest/ lives here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

fn default_weight() -> f64 {
    1.0
}

// ── Mutations ───────────────────────────────────────────────────────────

/// A persona biases the LM's viewpoint for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub group: String,
    pub perspective: String,
    #[serde(default)]
    pub dynamic: bool,
    /// Cycle after which a dynamic persona is removed. None for built-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_cycle: Option<u32>,
}

/// An adversarial pairs a destructive challenge with a persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adversarial {
    pub id: String,
    pub name: String,
    pub challenge: String,
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_cycle: Option<u32>,
}

fn default_target() -> String {
    ".".to_string()
}

// ── Progress ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MutationStats {
    pub uses: u32,
    pub successes: u32,
    pub failures: u32,
    pub last_used_cycle: u32,
    pub weight: f64,
}

impl Default for MutationStats {
    fn default() -> Self {
        Self {
            uses: 0,
            successes: 0,
            failures: 0,
            last_used_cycle: 0,
            weight: default_weight(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Activation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initialized_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_success_at: Option<String>,
    pub successful_commits: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Progress {
    pub total_cycles: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_improvement: Option<String>,
    pub last_meta_cycle: u32,
    pub last_scout_cycle: u32,
    pub persona_stats: BTreeMap<String, MutationStats>,
    pub adversarial_stats: BTreeMap<String, MutationStats>,
    pub area_touch_counts: BTreeMap<String, u32>,
    /// Rolling window of the last 3 touch outcomes per area
    /// (true = change committed cleanly).
    pub area_recent_outcomes: BTreeMap<String, Vec<bool>>,
    pub converged_areas: Vec<String>,
    pub activation: Activation,
}

// ── Backlog ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacklogStatus {
    Pending,
    InProgress,
    Completed,
    Stale,
}

impl std::fmt::Display for BacklogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Stale => write!(f, "stale"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogItem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub source_persona: String,
    #[serde(default)]
    pub source_cycle: u32,
    pub status: BacklogStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_cycle: Option<u32>,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backlog {
    pub version: u32,
    pub items: Vec<BacklogItem>,
}

impl Default for Backlog {
    fn default() -> Self {
        Self {
            version: 2,
            items: Vec::new(),
        }
    }
}

// ── Cycle history ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    Failure,
    Skipped,
    Aborted,
}

impl std::fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::Skipped => write!(f, "skipped"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    pub status: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_number: u32,
    pub started_at: String,
    pub ended_at: String,
    pub persona_id: String,
    pub persona_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adversarial_id: Option<String>,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    pub outcome: CycleOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    #[serde(default)]
    pub commit_message: String,
    #[serde(default)]
    pub files_touched: Vec<String>,
}

// ── Advisor ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Advice {
    pub strategic_direction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_focus: Option<String>,
    pub untapped_areas: Vec<String>,
    pub generated_cycle: u32,
}

// ── Scout cache ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutFinding {
    pub id: String,
    pub title: String,
    pub source_url: String,
    pub relevance_score: i64,
    pub summary: String,
    pub mutation_direction: String,
    pub injected_as_stimulus: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub injected_cycle: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutCache {
    pub last_scout_cycle: u32,
    pub findings: Vec<ScoutFinding>,
}

// ── Environment scan cache ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Environment {
    pub items: Vec<serde_json::Value>,
    pub last_scan_cycle: u32,
}

// ── Cautious-mode resume token ──────────────────────────────────────────

/// Externalized continuation written after Plan in cautious mode. The next
/// invocation with resume=true reads this, reacquires the lock, and enters
/// Execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeToken {
    pub created_at: String,
    pub cycle_number: u32,
    pub persona_id: String,
    pub persona_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adversarial_id: Option<String>,
    pub plan_artifact_path: String,
    pub code_output: String,
}
