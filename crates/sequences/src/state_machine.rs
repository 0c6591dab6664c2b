use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};

use crate::types::EnrollmentStatus;

/// Describes a single valid status transition for an enrollment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: EnrollmentStatus,
    pub to: EnrollmentStatus,
    pub trigger: String,
}

/// Guards the enrollment lifecycle by enforcing a finite set of valid
/// status transitions. `active` is the only state the engine advances
/// from; every state other than `active`/`paused` is terminal.
#[derive(Debug, Clone)]
pub struct EnrollmentStateMachine {
    pub transitions: Vec<StateTransition>,
}

impl EnrollmentStateMachine {
    pub fn new() -> Self {
        use EnrollmentStatus::*;

        let edges: [(EnrollmentStatus, EnrollmentStatus, &str); 13] = [
            (Active, Active, "step_advanced"),
            (Active, Paused, "paused"),
            (Active, Completed, "sequence_complete"),
            (Active, Converted, "converted"),
            (Active, Exited, "exit_condition"),
            (Active, Unsubscribed, "unsubscribed"),
            (Active, Bounced, "bounced"),
            (Paused, Active, "resumed"),
            (Paused, Completed, "sequence_complete"),
            (Paused, Converted, "converted"),
            (Paused, Exited, "exited_while_paused"),
            (Paused, Unsubscribed, "unsubscribed"),
            (Paused, Bounced, "bounced"),
        ];

        let transitions = edges
            .into_iter()
            .map(|(from, to, trigger)| StateTransition {
                from,
                to,
                trigger: trigger.to_string(),
            })
            .collect();

        Self { transitions }
    }

    /// Returns `true` if the given transition is allowed.
    pub fn can_transition(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> bool {
        self.transitions.iter().any(|t| t.from == from && t.to == to)
    }

    /// Returns a validation error naming both states when the move is not
    /// permitted.
    pub fn check(&self, from: EnrollmentStatus, to: EnrollmentStatus) -> OutreachResult<()> {
        if self.can_transition(from, to) {
            Ok(())
        } else {
            Err(OutreachError::Validation(format!(
                "Invalid enrollment transition from {:?} to {:?}",
                from, to
            )))
        }
    }
}

impl Default for EnrollmentStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
