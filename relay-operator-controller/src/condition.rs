use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Type of the distinguished condition every phase is derived from
pub const READY: &str = "Ready";

/// Reason marking a Ready=False condition as an in-progress deletion
pub const TERMINATING_REASON: &str = "Terminating";
/// Reason marking a Ready=Unknown condition as a lost heartbeat
pub const STATUS_UNKNOWN_REASON: &str = "ServiceClusterStatusUnknown";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl Display for ConditionStatus {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value { ConditionStatus::True } else { ConditionStatus::False }
    }
}

/// Single-value summary of an object's readiness, kept for clients
/// that do not read conditions.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Phase {
    Ready,
    NotReady,
    #[default]
    Unknown,
    Terminating,
    Unreachable,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            Phase::Ready => write!(f, "Ready"),
            Phase::NotReady => write!(f, "NotReady"),
            Phase::Unknown => write!(f, "Unknown"),
            Phase::Terminating => write!(f, "Terminating"),
            Phase::Unreachable => write!(f, "Unreachable"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition, e.g. Ready or Discovered
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    /// Machine readable reason for the last transition
    #[serde(default)]
    pub reason: String,
    /// Human readable message
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            last_heartbeat_time: None,
        }
    }

    pub fn ready(status: ConditionStatus, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(READY, status, reason, message)
    }

    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat_time = Some(at);
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Upsert `condition` by type.
///
/// `lastTransitionTime` is only moved when the status flips. Reason, message and
/// heartbeat are taken from `condition`. Returns whether the list changed in a
/// way a reader could observe.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            let status_changed = existing.status != condition.status;
            let changed = status_changed
                || existing.reason != condition.reason
                || existing.message != condition.message
                || existing.last_heartbeat_time != condition.last_heartbeat_time;

            if status_changed {
                existing.status = condition.status;
                existing.last_transition_time = condition.last_transition_time;
            }
            existing.reason = condition.reason;
            existing.message = condition.message;
            existing.last_heartbeat_time = condition.last_heartbeat_time;
            changed
        }
        None => {
            conditions.push(condition);
            true
        }
    }
}

pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn derive_phase(conditions: &[Condition], ready_type: &str) -> Phase {
    match get_condition(conditions, ready_type) {
        Some(c) => match c.status {
            ConditionStatus::True => Phase::Ready,
            ConditionStatus::False if c.reason == TERMINATING_REASON => Phase::Terminating,
            ConditionStatus::False => Phase::NotReady,
            ConditionStatus::Unknown if c.reason == STATUS_UNKNOWN_REASON => Phase::Unreachable,
            ConditionStatus::Unknown => Phase::Unknown,
        },
        None => Phase::Unknown,
    }
}

/// Implemented by every status that reports conditions. Mutations go through
/// `set_condition` so the phase is always recomputed.
pub trait ConditionedStatus {
    fn conditions(&self) -> &[Condition];
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
    fn phase_mut(&mut self) -> &mut Phase;
    fn observed_generation(&self) -> Option<i64>;

    fn set_condition(&mut self, condition: Condition) -> bool {
        let changed = set_condition(self.conditions_mut(), condition);
        let phase = derive_phase(self.conditions(), READY);
        *self.phase_mut() = phase;
        changed
    }

    fn condition(&self, type_: &str) -> Option<&Condition> {
        get_condition(self.conditions(), type_)
    }

    fn is_condition_true(&self, type_: &str) -> bool {
        self.condition(type_).is_some_and(Condition::is_true)
    }
}

/// An object is ready when its status describes its current generation and Ready is True
pub fn is_ready<S: ConditionedStatus>(status: Option<&S>, generation: Option<i64>) -> bool {
    match status {
        Some(status) => status.observed_generation() == generation && status.is_condition_true(READY),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rstest::rstest;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn condition(type_: &str, status: ConditionStatus, reason: &str, time: DateTime<Utc>) -> Condition {
        Condition {
            last_transition_time: time,
            ..Condition::new(type_, status, reason, "")
        }
    }

    #[test]
    fn unknown_types_are_appended() {
        let mut list = vec![condition("Discovered", ConditionStatus::True, "Found", at(0))];

        assert!(set_condition(&mut list, condition(READY, ConditionStatus::False, "Waiting", at(1))));
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].type_, READY);
    }

    #[test]
    fn transition_time_moves_only_on_status_change() {
        let mut list = vec![condition(READY, ConditionStatus::False, "Waiting", at(0))];

        let changed = set_condition(&mut list, condition(READY, ConditionStatus::False, "StillWaiting", at(10)));
        assert!(changed);
        assert_eq!(list[0].reason, "StillWaiting");
        assert_eq!(list[0].last_transition_time, at(0));

        set_condition(&mut list, condition(READY, ConditionStatus::True, "Done", at(20)));
        assert_eq!(list[0].last_transition_time, at(20));
    }

    #[test]
    fn identical_condition_is_not_a_change() {
        let mut list = vec![condition(READY, ConditionStatus::True, "Done", at(0))];

        assert!(!set_condition(&mut list, condition(READY, ConditionStatus::True, "Done", at(30))));
        assert_eq!(list[0].last_transition_time, at(0));
    }

    #[test]
    fn heartbeat_refresh_is_a_change_without_transition() {
        let mut list = vec![condition(READY, ConditionStatus::True, "Up", at(0)).with_heartbeat(at(0))];
        let next = condition(READY, ConditionStatus::True, "Up", at(5)).with_heartbeat(at(0) + Duration::seconds(5));

        assert!(set_condition(&mut list, next));
        assert_eq!(list[0].last_transition_time, at(0));
        assert_eq!(list[0].last_heartbeat_time, Some(at(5)));
    }

    #[rstest]
    #[case::ready(Some((ConditionStatus::True, "Done")), Phase::Ready)]
    #[case::not_ready(Some((ConditionStatus::False, "Waiting")), Phase::NotReady)]
    #[case::terminating(Some((ConditionStatus::False, TERMINATING_REASON)), Phase::Terminating)]
    #[case::unknown(Some((ConditionStatus::Unknown, "Probing")), Phase::Unknown)]
    #[case::unreachable(Some((ConditionStatus::Unknown, STATUS_UNKNOWN_REASON)), Phase::Unreachable)]
    #[case::absent(None, Phase::Unknown)]
    fn phase_follows_ready_condition(#[case] ready: Option<(ConditionStatus, &str)>, #[case] expected: Phase) {
        let mut list = vec![condition("Discovered", ConditionStatus::True, "Found", at(0))];
        if let Some((status, reason)) = ready {
            list.push(condition(READY, status, reason, at(0)));
        }

        assert_eq!(derive_phase(&list, READY), expected);
    }

    #[test]
    fn get_condition_reports_existence() {
        let list = vec![condition("Discovered", ConditionStatus::True, "Found", at(0))];

        assert!(get_condition(&list, "Discovered").is_some());
        assert!(get_condition(&list, READY).is_none());
    }
}
