use chrono::{DateTime, Utc};
use pkg_constants::controller::{
    REASON_INSUFFICIENT_QUOTA, REASON_SUFFICIENT_QUOTA, REJECTED_BY_RESOURCE_QUOTA,
};
use pkg_types::migration::{Condition, ConditionStatus};

use crate::admission::Decision;

/// Apply `decision` to a migration's condition list in place.
///
/// Only the `RejectedByResourceQuota` entry is touched; other conditions keep
/// their values and positions. `last_transition_time` moves only when the
/// status flips, and never backwards. Returns whether anything changed, i.e.
/// whether a write is needed.
pub fn apply_decision(
    conditions: &mut Vec<Condition>,
    decision: &Decision,
    now: DateTime<Utc>,
) -> bool {
    let existing = conditions
        .iter_mut()
        .find(|c| c.condition_type == REJECTED_BY_RESOURCE_QUOTA);

    match (decision, existing) {
        (Decision::Allow, Some(cond)) if cond.status == ConditionStatus::True => {
            cond.status = ConditionStatus::False;
            cond.reason = REASON_SUFFICIENT_QUOTA.to_string();
            cond.message = String::new();
            cond.last_transition_time = cond.last_transition_time.max(now);
            true
        }
        (Decision::Allow, _) => false,
        (Decision::Block { .. }, Some(cond)) if cond.status == ConditionStatus::True => {
            let message = decision.message();
            if cond.message == message && cond.reason == REASON_INSUFFICIENT_QUOTA {
                return false;
            }
            cond.reason = REASON_INSUFFICIENT_QUOTA.to_string();
            cond.message = message;
            true
        }
        (Decision::Block { .. }, Some(cond)) => {
            cond.status = ConditionStatus::True;
            cond.reason = REASON_INSUFFICIENT_QUOTA.to_string();
            cond.message = decision.message();
            cond.last_transition_time = cond.last_transition_time.max(now);
            true
        }
        (Decision::Block { .. }, None) => {
            conditions.push(Condition {
                condition_type: REJECTED_BY_RESOURCE_QUOTA.to_string(),
                status: ConditionStatus::True,
                reason: REASON_INSUFFICIENT_QUOTA.to_string(),
                message: decision.message(),
                last_transition_time: now,
            });
            true
        }
    }
}
