//! Instance lifecycle state machine.
//!
//! The transition table is data: each non-terminal state lists its legal
//! targets, and every non-terminal state may additionally move to FAILED.
//! Applying a transition validates, mutates the instance's state and
//! timestamps, and produces exactly one audit event. A rejected transition
//! leaves the instance untouched.

use chrono::{DateTime, Utc};
use thiserror::Error;
use warren_id::EventId;
use warren_proto::{InstanceEventType, InstanceState};

use crate::model::{Instance, InstanceEvent};

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("invalid instance state transition from {from} to {to}")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },

    #[error("a failure reason is required when transitioning to FAILED")]
    ReasonRequired,

    #[error("a failure reason is only valid for FAILED transitions, not {to}")]
    ReasonNotAllowed { to: InstanceState },
}

/// Legal non-FAILED targets per source state. Terminal states have none.
fn allowed_targets(from: InstanceState) -> &'static [InstanceState] {
    use InstanceState::*;
    match from {
        Requested => &[Preparing],
        Preparing => &[Starting],
        Starting => &[Running],
        Running => &[Stopping],
        Stopping => &[Destroyed, Stopped],
        Stopped => &[Destroyed, Starting],
        Destroyed | Failed => &[],
    }
}

pub fn is_terminal(state: InstanceState) -> bool {
    matches!(state, InstanceState::Destroyed | InstanceState::Failed)
}

/// Whether `from -> to` is in the transition table.
///
/// Self-transitions are always rejected; FAILED is reachable from every
/// non-terminal state.
pub fn is_allowed(from: InstanceState, to: InstanceState) -> bool {
    if from == to {
        return false;
    }
    if to == InstanceState::Failed {
        return !is_terminal(from);
    }
    allowed_targets(from).contains(&to)
}

/// Applies one transition to `instance` and returns the audit event to
/// append.
///
/// The caller persists the returned event in the same atomic scope as the
/// instance mutation; this function either fully applies the transition or
/// returns an error having touched nothing.
pub fn transition(
    instance: &mut Instance,
    to: InstanceState,
    event_type: InstanceEventType,
    now: DateTime<Utc>,
    failure_reason: Option<&str>,
) -> Result<InstanceEvent, TransitionError> {
    let from = instance.state;
    if !is_allowed(from, to) {
        return Err(TransitionError::InvalidTransition { from, to });
    }
    match (to, failure_reason) {
        (InstanceState::Failed, None) => return Err(TransitionError::ReasonRequired),
        (InstanceState::Failed, Some(reason)) if reason.trim().is_empty() => {
            return Err(TransitionError::ReasonRequired)
        }
        (state, Some(_)) if state != InstanceState::Failed => {
            return Err(TransitionError::ReasonNotAllowed { to });
        }
        _ => {}
    }

    instance.state = to;
    instance.updated_at = now;
    match to {
        InstanceState::Running => {
            if instance.started_at.is_none() {
                instance.started_at = Some(now);
            }
            instance.stopped_at = None;
            instance.failure_reason = None;
        }
        InstanceState::Stopped => {
            if instance.stopped_at.is_none() {
                instance.stopped_at = Some(now);
            }
            instance.failure_reason = None;
        }
        InstanceState::Failed => {
            instance.failure_reason = failure_reason.map(|r| r.trim().to_string());
            if instance.stopped_at.is_none() {
                instance.stopped_at = Some(now);
            }
        }
        _ => {}
    }

    Ok(InstanceEvent {
        id: EventId::new(),
        instance_id: instance.id,
        event_type,
        payload: None,
        created_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use warren_id::InstanceId;

    fn instance_in(state: InstanceState) -> Instance {
        let now = Utc::now();
        Instance {
            id: InstanceId::new(),
            name: "lobby-1".to_string(),
            display_name: None,
            state,
            node_id: None,
            requested_region: None,
            requested_tags: None,
            dev_mode: None,
            layers: Vec::new(),
            ports_json: None,
            variables_json: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            stopped_at: None,
        }
    }

    const ALL_STATES: [InstanceState; 8] = [
        InstanceState::Requested,
        InstanceState::Preparing,
        InstanceState::Starting,
        InstanceState::Running,
        InstanceState::Stopping,
        InstanceState::Stopped,
        InstanceState::Destroyed,
        InstanceState::Failed,
    ];

    #[rstest]
    #[case(InstanceState::Requested, InstanceState::Preparing)]
    #[case(InstanceState::Preparing, InstanceState::Starting)]
    #[case(InstanceState::Starting, InstanceState::Running)]
    #[case(InstanceState::Running, InstanceState::Stopping)]
    #[case(InstanceState::Stopping, InstanceState::Stopped)]
    #[case(InstanceState::Stopping, InstanceState::Destroyed)]
    #[case(InstanceState::Stopped, InstanceState::Destroyed)]
    #[case(InstanceState::Stopped, InstanceState::Starting)]
    fn legal_transitions_are_allowed(#[case] from: InstanceState, #[case] to: InstanceState) {
        assert!(is_allowed(from, to));
    }

    #[test]
    fn every_non_terminal_state_may_fail() {
        for from in ALL_STATES {
            assert_eq!(is_allowed(from, InstanceState::Failed), !is_terminal(from));
        }
    }

    #[test]
    fn self_transitions_rejected_everywhere() {
        for state in ALL_STATES {
            assert!(!is_allowed(state, state));
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for to in ALL_STATES {
            assert!(!is_allowed(InstanceState::Destroyed, to));
            assert!(!is_allowed(InstanceState::Failed, to));
        }
    }

    #[test]
    fn rejected_transition_leaves_instance_untouched() {
        let mut instance = instance_in(InstanceState::Requested);
        let before_updated = instance.updated_at;
        let err = transition(
            &mut instance,
            InstanceState::Running,
            InstanceEventType::StartCompleted,
            Utc::now(),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::InvalidTransition {
                from: InstanceState::Requested,
                to: InstanceState::Running,
            }
        ));
        assert_eq!(instance.state, InstanceState::Requested);
        assert_eq!(instance.updated_at, before_updated);
        assert!(instance.started_at.is_none());
    }

    #[test]
    fn transition_appends_one_event_and_bumps_updated_at() {
        let mut instance = instance_in(InstanceState::Requested);
        let now = Utc::now();
        let event = transition(
            &mut instance,
            InstanceState::Preparing,
            InstanceEventType::PrepareDispatched,
            now,
            None,
        )
        .unwrap();
        assert_eq!(instance.state, InstanceState::Preparing);
        assert_eq!(instance.updated_at, now);
        assert_eq!(event.instance_id, instance.id);
        assert_eq!(event.event_type, InstanceEventType::PrepareDispatched);
        assert_eq!(event.created_at, now);
    }

    #[test]
    fn running_sets_started_at_once_and_clears_stop_fields() {
        let mut instance = instance_in(InstanceState::Starting);
        instance.stopped_at = Some(Utc::now());
        instance.failure_reason = Some("leftover".to_string());
        let first_start = Utc::now();
        transition(
            &mut instance,
            InstanceState::Running,
            InstanceEventType::StartCompleted,
            first_start,
            None,
        )
        .unwrap();
        assert_eq!(instance.started_at, Some(first_start));
        assert!(instance.stopped_at.is_none());
        assert!(instance.failure_reason.is_none());

        // Restart path: started_at is preserved from the first run.
        instance.state = InstanceState::Starting;
        transition(
            &mut instance,
            InstanceState::Running,
            InstanceEventType::StartCompleted,
            Utc::now(),
            None,
        )
        .unwrap();
        assert_eq!(instance.started_at, Some(first_start));
    }

    #[test]
    fn stopped_sets_stopped_at_if_unset() {
        let mut instance = instance_in(InstanceState::Stopping);
        let now = Utc::now();
        transition(
            &mut instance,
            InstanceState::Stopped,
            InstanceEventType::StopCompleted,
            now,
            None,
        )
        .unwrap();
        assert_eq!(instance.stopped_at, Some(now));
    }

    #[test]
    fn failed_requires_reason() {
        let mut instance = instance_in(InstanceState::Preparing);
        let err = transition(
            &mut instance,
            InstanceState::Failed,
            InstanceEventType::FailureTimeout,
            Utc::now(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::ReasonRequired));
        assert_eq!(instance.state, InstanceState::Preparing);

        let err = transition(
            &mut instance,
            InstanceState::Failed,
            InstanceEventType::FailureTimeout,
            Utc::now(),
            Some("  "),
        )
        .unwrap_err();
        assert!(matches!(err, TransitionError::ReasonRequired));
    }

    #[test]
    fn failed_records_reason_and_stop_time() {
        let mut instance = instance_in(InstanceState::Preparing);
        let now = Utc::now();
        transition(
            &mut instance,
            InstanceState::Failed,
            InstanceEventType::FailureTimeout,
            now,
            Some("timeout"),
        )
        .unwrap();
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.failure_reason.as_deref(), Some("timeout"));
        assert_eq!(instance.stopped_at, Some(now));
    }

    #[test]
    fn reason_rejected_on_non_failed_transition() {
        let mut instance = instance_in(InstanceState::Requested);
        let err = transition(
            &mut instance,
            InstanceState::Preparing,
            InstanceEventType::PrepareDispatched,
            Utc::now(),
            Some("nope"),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::ReasonNotAllowed {
                to: InstanceState::Preparing
            }
        ));
        assert_eq!(instance.state, InstanceState::Requested);
    }

    #[test]
    fn exhaustive_table_rejects_everything_not_listed() {
        for from in ALL_STATES {
            for to in ALL_STATES {
                let expected = match (from, to) {
                    _ if from == to => false,
                    (f, InstanceState::Failed) => !is_terminal(f),
                    (InstanceState::Requested, InstanceState::Preparing) => true,
                    (InstanceState::Preparing, InstanceState::Starting) => true,
                    (InstanceState::Starting, InstanceState::Running) => true,
                    (InstanceState::Running, InstanceState::Stopping) => true,
                    (InstanceState::Stopping, InstanceState::Stopped) => true,
                    (InstanceState::Stopping, InstanceState::Destroyed) => true,
                    (InstanceState::Stopped, InstanceState::Destroyed) => true,
                    (InstanceState::Stopped, InstanceState::Starting) => true,
                    _ => false,
                };
                assert_eq!(is_allowed(from, to), expected, "{from} -> {to}");
            }
        }
    }
}
