//! Condition ledger: keyed upsert over a resource's condition set.
//!
//! At most one condition per type survives an upsert. The transition time moves
//! only when the status value changes; reason, message and observed generation
//! are refreshed in place otherwise.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    pub last_transition_time: Time,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Borrowed input to [`upsert`].
#[derive(Debug, Clone, Copy)]
pub struct NewCondition<'a> {
    pub type_: &'a str,
    pub status: ConditionStatus,
    pub reason: &'a str,
    pub message: &'a str,
    pub observed_generation: Option<i64>,
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Insert or update the condition of `new.type_`. Returns whether the set changed.
pub fn upsert(conditions: &mut Vec<Condition>, new: NewCondition<'_>, now: Time) -> bool {
    let Some(idx) = conditions.iter().position(|c| c.type_ == new.type_) else {
        conditions.push(Condition {
            type_: new.type_.to_string(),
            status: new.status,
            observed_generation: new.observed_generation,
            last_transition_time: now,
            reason: new.reason.to_string(),
            message: new.message.to_string(),
        });
        return true;
    };

    // Stale duplicates from a hand-edited status collapse onto the first entry.
    let mut seen = 0usize;
    let before = conditions.len();
    conditions.retain(|c| {
        if c.type_ != new.type_ {
            return true;
        }
        seen += 1;
        seen == 1
    });
    let mut changed = before != conditions.len();

    let cur = &mut conditions[idx];
    if cur.status != new.status {
        cur.status = new.status;
        cur.last_transition_time = now;
        changed = true;
    }
    if cur.reason != new.reason {
        cur.reason = new.reason.to_string();
        changed = true;
    }
    if cur.message != new.message {
        cur.message = new.message.to_string();
        changed = true;
    }
    if cur.observed_generation != new.observed_generation {
        cur.observed_generation = new.observed_generation;
        changed = true;
    }
    changed
}
