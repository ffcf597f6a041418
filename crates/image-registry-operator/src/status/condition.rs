//! Helpers for `status.conditions` lists built from the upstream
//! [`Condition`] type.

use jiff::Timestamp;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ConditionType {
    /// The delivered credentials can be used against the registry.
    Ready,

    /// The last reconciliation brought account and Secret in line with the request.
    Synced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ConditionReason {
    Success,
    FailedSync,
    RegistryUnavailable,
    InvalidRegistryCertificate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum::AsRefStr)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { Self::True } else { Self::False }
    }
}

/// Builds a condition, its transition time is set to `now`.
pub fn new_condition(
    type_: ConditionType,
    status: impl Into<ConditionStatus>,
    reason: ConditionReason,
    message: impl Into<String>,
    observed_generation: Option<i64>,
    now: Timestamp,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.into().to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(now),
    }
}

pub fn find_condition(conditions: &[Condition], type_: ConditionType) -> Option<&Condition> {
    conditions.iter().find(|c| c.type_ == type_.as_ref())
}

pub fn is_condition_true(conditions: &[Condition], type_: ConditionType) -> bool {
    find_condition(conditions, type_)
        .is_some_and(|c| c.status == ConditionStatus::True.as_ref())
}

/// Inserts or replaces the condition with the same type as `new`.
///
/// The existing `lastTransitionTime` is kept unless the status flips. Returns
/// whether anything apart from the transition time changed.
pub fn set_condition(conditions: &mut Vec<Condition>, new: Condition) -> bool {
    let Some(existing) = conditions.iter_mut().find(|c| c.type_ == new.type_) else {
        conditions.push(new);
        return true;
    };

    let changed = existing.status != new.status
        || existing.reason != new.reason
        || existing.message != new.message
        || existing.observed_generation != new.observed_generation;

    if existing.status != new.status {
        existing.last_transition_time = new.last_transition_time;
    }
    existing.status = new.status;
    existing.reason = new.reason;
    existing.message = new.message;
    existing.observed_generation = new.observed_generation;

    changed
}
