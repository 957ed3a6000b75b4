//! Backlog management — improvement lifecycle, pruning, prompt context.
//!
//! Items are added by Observe, selected by Plan (pending → in_progress),
//! resolved after Verify (completed, or back to pending with an attempt
//! recorded; 3 failed attempts marks an item stale). Completed and stale
//! items are pruned 20 cycles after their source cycle.

use chrono::Utc;
use rand::Rng;
use serde_json::Value;

use crate::error::Result;
use crate::state::ProjectState;
use crate::types::{Backlog, BacklogItem, BacklogStatus};

pub const MAX_ATTEMPTS: u32 = 3;
pub const PRUNE_AGE_CYCLES: u32 = 20;

fn new_item_id<R: Rng>(rng: &mut R) -> String {
    format!(
        "improve-{}-{}",
        Utc::now().timestamp(),
        rng.gen_range(1000..10000)
    )
}

/// Add improvement items from an observe envelope. Items are deduplicated
/// by title against the existing backlog. Returns the count added.
pub fn save_observations<R: Rng>(
    state: &ProjectState,
    improvements: &[Value],
    persona_id: &str,
    current_cycle: u32,
    rng: &mut R,
) -> Result<usize> {
    let mut backlog = state.load_backlog()?;
    let mut existing: std::collections::BTreeSet<String> = backlog
        .items
        .iter()
        .map(|item| item.title.trim().to_lowercase())
        .collect();
    let mut added = 0;

    for imp in improvements {
        let title = imp
            .get("title")
            .and_then(|v| v.as_str())
            .or_else(|| imp.get("description").and_then(|v| v.as_str()))
            .unwrap_or("untitled")
            .to_string();
        let key = title.trim().to_lowercase();
        if existing.contains(&key) {
            continue;
        }

        let files = match imp.get("files") {
            Some(Value::Array(list)) => list
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|f| f.trim().to_string())
                .filter(|f| !f.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        backlog.items.push(BacklogItem {
            id: new_item_id(rng),
            title,
            description: imp
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            category: imp
                .get("category")
                .and_then(|v| v.as_str())
                .unwrap_or("general")
                .to_string(),
            priority: imp
                .get("priority")
                .and_then(|v| v.as_str())
                .unwrap_or("medium")
                .to_string(),
            files,
            source_persona: persona_id.to_string(),
            source_cycle: current_cycle,
            status: BacklogStatus::Pending,
            attempts: 0,
            last_attempt_cycle: None,
        });
        existing.insert(key);
        added += 1;
    }

    state.save_backlog(&backlog)?;
    Ok(added)
}

/// Mark the item Plan selected as in_progress.
pub fn mark_in_progress(state: &ProjectState, item_id: &str) -> Result<()> {
    transition(state, item_id, BacklogStatus::InProgress, None)
}

/// Resolve an attempted item after Verify: completed on success, back to
/// pending (stale after 3 attempts) on failure.
pub fn resolve_attempt(
    state: &ProjectState,
    item_id: &str,
    success: bool,
    current_cycle: u32,
) -> Result<()> {
    let status = if success {
        BacklogStatus::Completed
    } else {
        BacklogStatus::Pending
    };
    transition(state, item_id, status, Some(current_cycle))
}

fn transition(
    state: &ProjectState,
    item_id: &str,
    new_status: BacklogStatus,
    attempt_cycle: Option<u32>,
) -> Result<()> {
    let mut backlog = state.load_backlog()?;
    if let Some(item) = backlog.items.iter_mut().find(|i| i.id == item_id) {
        item.status = new_status;
        if let Some(cycle) = attempt_cycle {
            item.last_attempt_cycle = Some(cycle);
        }
        if new_status == BacklogStatus::Pending {
            item.attempts += 1;
            if item.attempts >= MAX_ATTEMPTS {
                item.status = BacklogStatus::Stale;
            }
        }
        state.save_backlog(&backlog)?;
    }
    Ok(())
}

/// Remove completed/stale items older than PRUNE_AGE_CYCLES. Returns the
/// count removed.
pub fn prune(state: &ProjectState, current_cycle: u32) -> Result<usize> {
    let mut backlog = state.load_backlog()?;
    let cutoff = current_cycle.saturating_sub(PRUNE_AGE_CYCLES);

    let before = backlog.items.len();
    backlog.items.retain(|item| {
        matches!(
            item.status,
            BacklogStatus::Pending | BacklogStatus::InProgress
        ) || item.source_cycle > cutoff
    });
    let removed = before - backlog.items.len();

    if removed > 0 {
        state.save_backlog(&backlog)?;
    }
    Ok(removed)
}

fn priority_rank(priority: &str) -> u8 {
    match priority {
        "high" => 0,
        "medium" => 1,
        "low" => 2,
        _ => 1,
    }
}

/// Pending-backlog context for the Plan prompt, priority-sorted.
pub fn build_context(state: &ProjectState, limit: usize) -> Result<String> {
    let backlog = state.load_backlog()?;
    let mut pending: Vec<&BacklogItem> = backlog
        .items
        .iter()
        .filter(|i| i.status == BacklogStatus::Pending)
        .collect();
    if pending.is_empty() {
        return Ok(String::new());
    }
    pending.sort_by_key(|i| priority_rank(&i.priority));

    let mut lines = vec![
        "## Accumulated Backlog".to_string(),
        String::new(),
        "The following improvements were identified in previous cycles but \
         not yet implemented. Select from this list if any align with your \
         current observations."
            .to_string(),
        String::new(),
    ];
    for item in pending.iter().take(limit) {
        lines.push(format!(
            "- [{}] {} (id: {}, category: {}, files: {})",
            item.priority,
            item.title,
            item.id,
            item.category,
            item.files.join(", ")
        ));
    }
    Ok(lines.join("\n"))
}

/// Human-readable backlog listing for the CLI.
pub fn render_list(backlog: &Backlog) -> String {
    if backlog.items.is_empty() {
        return "Backlog is empty.".to_string();
    }
    let count = |status: BacklogStatus| {
        backlog
            .items
            .iter()
            .filter(|i| i.status == status)
            .count()
    };
    let mut lines = vec![format!(
        "Backlog: {} items (pending: {}, stale: {}, completed: {})",
        backlog.items.len(),
        count(BacklogStatus::Pending),
        count(BacklogStatus::Stale),
        count(BacklogStatus::Completed)
    )];
    for item in &backlog.items {
        lines.push(format!("  [{}] {} ({})", item.status, item.title, item.category));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(priority_rank("high") < priority_rank("medium"));
        assert!(priority_rank("medium") < priority_rank("low"));
        assert_eq!(priority_rank("unknown"), priority_rank("medium"));
    }

    #[test]
    fn render_list_counts_statuses() {
        let item = |status| BacklogItem {
            id: "i".into(),
            title: "t".into(),
            description: String::new(),
            category: "general".into(),
            priority: "medium".into(),
            files: Vec::new(),
            source_persona: "human".into(),
            source_cycle: 0,
            status,
            attempts: 0,
            last_attempt_cycle: None,
        };
        let backlog = Backlog {
            version: 2,
            items: vec![
                item(BacklogStatus::Pending),
                item(BacklogStatus::Stale),
                item(BacklogStatus::Completed),
            ],
        };
        let listing = render_list(&backlog);
        assert!(listing.contains("pending: 1"));
        assert!(listing.contains("stale: 1"));
        assert!(listing.contains("completed: 1"));
    }
}
