//! Pure predicates for condition steps.
//!
//! Each condition kind has its own function. Facts the predicate needs
//! (the enrollment's activity log, the contact record) are fetched by the
//! caller; evaluation itself never performs I/O and never fails.

use tracing::debug;

use crate::collaborators::ContactRecord;
use crate::types::{Activity, ActivityKind, Condition, Enrollment, StepId};

/// Inputs gathered for one evaluation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionFacts<'a> {
    pub activities: &'a [Activity],
    pub contact: Option<&'a ContactRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(
        &self,
        enrollment: &Enrollment,
        condition: &Condition,
        facts: &ConditionFacts<'_>,
    ) -> bool {
        let result = match condition {
            Condition::EmailOpened { step_id } => {
                has_activity(enrollment, facts, ActivityKind::EmailOpened, *step_id)
            }
            Condition::EmailClicked { step_id } => {
                has_activity(enrollment, facts, ActivityKind::EmailClicked, *step_id)
            }
            Condition::EmailReplied { step_id } => {
                has_activity(enrollment, facts, ActivityKind::EmailReplied, *step_id)
            }
            Condition::LeadScoreAbove { threshold } => score_above(facts, *threshold),
            Condition::LeadScoreBelow { threshold } => score_below(facts, *threshold),
            Condition::HasTag { tag } => has_tag(facts, tag),
            Condition::FieldEquals { field, value } => field_equals(facts, field, value),
            Condition::Unknown => false,
        };
        debug!(
            enrollment_id = %enrollment.id,
            ?condition,
            result,
            "Condition evaluated"
        );
        result
    }
}

fn has_activity(
    enrollment: &Enrollment,
    facts: &ConditionFacts<'_>,
    kind: ActivityKind,
    step_id: Option<StepId>,
) -> bool {
    facts.activities.iter().any(|a| {
        a.enrollment_id == enrollment.id
            && a.kind == kind
            && step_id.map(|s| a.step_id == Some(s)).unwrap_or(true)
    })
}

fn score_above(facts: &ConditionFacts<'_>, threshold: f64) -> bool {
    facts
        .contact
        .and_then(|c| c.lead_score)
        .map(|score| score > threshold)
        .unwrap_or(false)
}

fn score_below(facts: &ConditionFacts<'_>, threshold: f64) -> bool {
    facts
        .contact
        .and_then(|c| c.lead_score)
        .map(|score| score < threshold)
        .unwrap_or(false)
}

fn has_tag(facts: &ConditionFacts<'_>, tag: &str) -> bool {
    facts
        .contact
        .map(|c| c.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)))
        .unwrap_or(false)
}

fn field_equals(facts: &ConditionFacts<'_>, field: &str, expected: &serde_json::Value) -> bool {
    facts
        .contact
        .and_then(|c| c.field(field))
        .map(|actual| values_equal(&actual, expected))
        .unwrap_or(false)
}

/// JSON equality that treats numerically equal numbers as equal.
pub(crate) fn values_equal(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}
