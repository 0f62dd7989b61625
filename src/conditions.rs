//! Kubernetes-style status condition helpers
//!
//! Backup requests keep an ordered condition list whose single `True` entry
//! names the current state. Older entries are demoted to `False` rather than
//! removed, so the list doubles as a history of the states a request visited.

use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// Condition status values
pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// A single status condition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type; for backup requests this is the state name
    pub r#type: String,
    /// "True" or "False"
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub last_heartbeat_time: Option<String>,
    #[serde(default)]
    pub last_transition_time: Option<String>,
}

/// Build a condition with the current timestamp.
pub fn build_condition(
    condition_type: &str,
    status: &str,
    reason: &str,
    message: &str,
) -> Condition {
    let now = Utc::now().to_rfc3339();
    Condition {
        r#type: condition_type.to_string(),
        status: status.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        last_heartbeat_time: Some(now.clone()),
        last_transition_time: Some(now),
    }
}

/// Set or update a condition in a list.
///
/// The transition time only moves when status, reason or message change;
/// the heartbeat always moves.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) {
    let Some(existing) = conditions.iter_mut().find(|c| c.r#type == new.r#type) else {
        conditions.push(new);
        return;
    };

    if existing.status != new.status
        || existing.reason != new.reason
        || existing.message != new.message
    {
        existing.status = new.status;
        existing.reason = new.reason;
        existing.message = new.message;
        existing.last_transition_time = new.last_transition_time;
    }
    existing.last_heartbeat_time = new.last_heartbeat_time;
}

/// The condition currently marked `True`, if any.
pub fn current_condition(conditions: &[Condition]) -> Option<&Condition> {
    conditions.iter().find(|c| c.status == CONDITION_TRUE)
}

/// Demote the current condition to `False` and promote `condition_type` to `True`.
pub fn update_current_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    reason: &str,
    message: &str,
) {
    if let Some(current) = current_condition(conditions).cloned() {
        let mut demoted = build_condition(&current.r#type, CONDITION_FALSE, "", "");
        demoted.reason = current.reason;
        demoted.message = current.message;
        set_condition(conditions, demoted);
    }

    set_condition(
        conditions,
        build_condition(condition_type, CONDITION_TRUE, reason, message),
    );
}

/// Copy of `conditions` without heartbeat and transition timestamps, for
/// comparing two statuses by meaning only.
pub fn normalized(conditions: &[Condition]) -> Vec<Condition> {
    conditions
        .iter()
        .map(|c| Condition {
            last_heartbeat_time: None,
            last_transition_time: None,
            ..c.clone()
        })
        .collect()
}
