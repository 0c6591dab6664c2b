//! Trigger matching: auto-enrollment from CRM events.
//!
//! Event payloads are JSON objects carrying the contact id plus whatever the
//! event type describes:
//!
//! | event type           | payload fields               |
//! |----------------------|------------------------------|
//! | `lead_score_changed` | `lead_score`                 |
//! | `stage_changed`      | `stage`                      |
//! | `contact_inactive`   | `days_inactive`              |
//! | `tag_added/removed`  | `tag`                        |
//! | `field_changed`      | `field`, `value`             |
//!
//! Generic trigger conditions address payload fields by dotted path.

use outreach_core::event_bus::make_event;
use outreach_core::types::EventType;
use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::condition::values_equal;
use crate::engine::{authorize, SequenceEngine};
use crate::types::{
    ConditionOperator, EnrollmentSource, ScoreOperator, Trigger, TriggerCondition,
    TriggerEventType, TriggerRule,
};

/// Payload key holding the contact the event is about.
pub const CONTACT_ID_FIELD: &str = "contact_id";

/// Input for creating a trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTrigger {
    pub name: String,
    pub rule: TriggerRule,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub prevent_re_enrollment: bool,
}

/// Outcome of one `evaluate_trigger` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReport {
    /// Triggers whose rule and conditions matched.
    pub matched: u32,
    /// Enrollments newly created.
    pub enrolled: Vec<Uuid>,
    /// Matching triggers whose enrollment attempt failed.
    pub errors: u32,
}

/// Pure predicates over a trigger and an event payload.
#[derive(Debug, Clone, Default)]
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Full match: rule, every generic condition, and the re-enrollment
    /// guard when the trigger sets it.
    pub fn matches(&self, trigger: &Trigger, payload: &Value, already_enrolled: bool) -> bool {
        self.rule_fires(&trigger.rule, payload)
            && self.conditions_hold(&trigger.conditions, payload)
            && !(trigger.prevent_re_enrollment && already_enrolled)
    }

    pub fn rule_fires(&self, rule: &TriggerRule, payload: &Value) -> bool {
        match rule {
            TriggerRule::LeadScore {
                threshold,
                operator,
            } => payload
                .get("lead_score")
                .and_then(Value::as_f64)
                .map(|score| match operator {
                    ScoreOperator::Gte => score >= *threshold,
                    ScoreOperator::Lte => score <= *threshold,
                    ScoreOperator::Eq => (score - threshold).abs() < f64::EPSILON,
                })
                .unwrap_or(false),
            TriggerRule::StageChanged { stage } => text_equals(payload.get("stage"), stage),
            TriggerRule::Inactivity { days } => payload
                .get("days_inactive")
                .and_then(Value::as_f64)
                .map(|elapsed| elapsed >= f64::from(*days))
                .unwrap_or(false),
            TriggerRule::TagAdded { tag } | TriggerRule::TagRemoved { tag } => {
                text_equals(payload.get("tag"), tag)
            }
            TriggerRule::FieldChanged { field, value } => {
                payload.get("field").and_then(Value::as_str) == Some(field.as_str())
                    && payload
                        .get("value")
                        .map(|actual| values_equal(actual, value))
                        .unwrap_or(false)
            }
        }
    }

    pub fn conditions_hold(&self, conditions: &[TriggerCondition], payload: &Value) -> bool {
        conditions.iter().all(|c| condition_matches(c, payload))
    }
}

fn text_equals(actual: Option<&Value>, expected: &str) -> bool {
    actual
        .and_then(Value::as_str)
        .map(|s| s.trim().eq_ignore_ascii_case(expected.trim()))
        .unwrap_or(false)
}

/// Resolves `a.b.c` against nested objects.
fn lookup<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(payload, |value, key| value.as_object()?.get(key))
}

fn condition_matches(condition: &TriggerCondition, payload: &Value) -> bool {
    let actual = lookup(payload, &condition.field).unwrap_or(&Value::Null);
    match condition.operator {
        ConditionOperator::Eq => values_equal(actual, &condition.value),
        ConditionOperator::Neq => !values_equal(actual, &condition.value),
        ConditionOperator::Contains => match (actual, &condition.value) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), needle) => items.iter().any(|i| values_equal(i, needle)),
            _ => false,
        },
        ConditionOperator::In => condition
            .value
            .as_array()
            .map(|options| options.iter().any(|o| values_equal(actual, o)))
            .unwrap_or(false),
    }
}

fn validate_rule(rule: &TriggerRule) -> OutreachResult<()> {
    let invalid = |msg: &str| Err(OutreachError::Validation(msg.to_string()));
    match rule {
        TriggerRule::LeadScore { threshold, .. } if !threshold.is_finite() => {
            invalid("lead score threshold must be finite")
        }
        TriggerRule::StageChanged { stage } if stage.trim().is_empty() => {
            invalid("stage trigger requires a stage")
        }
        TriggerRule::Inactivity { days: 0 } => invalid("inactivity trigger requires days > 0"),
        TriggerRule::TagAdded { tag } | TriggerRule::TagRemoved { tag } if tag.trim().is_empty() => {
            invalid("tag trigger requires a tag")
        }
        TriggerRule::FieldChanged { field, .. } if field.trim().is_empty() => {
            invalid("field trigger requires a field")
        }
        _ => Ok(()),
    }
}

impl SequenceEngine {
    pub fn create_trigger(
        &self,
        sequence_id: Uuid,
        actor: &str,
        new: NewTrigger,
    ) -> OutreachResult<Trigger> {
        let sequence = self.require_sequence(&sequence_id)?;
        authorize(&sequence, actor)?;
        if new.name.trim().is_empty() {
            return Err(OutreachError::Validation("trigger name is required".into()));
        }
        validate_rule(&new.rule)?;
        if let Some(bad) = new.conditions.iter().find(|c| c.field.trim().is_empty()) {
            return Err(OutreachError::Validation(format!(
                "trigger condition has an empty field: {:?}",
                bad
            )));
        }

        let trigger = Trigger {
            id: Uuid::new_v4(),
            sequence_id,
            name: new.name,
            rule: new.rule,
            conditions: new.conditions,
            prevent_re_enrollment: new.prevent_re_enrollment,
            is_active: true,
            total_triggered: 0,
            total_enrolled: 0,
            created_at: self.clock.now(),
        };
        info!(trigger_id = %trigger.id, sequence_id = %sequence_id, event_type = ?trigger.rule.event_type(), "Creating trigger");
        self.store.insert_trigger(trigger.clone());
        Ok(trigger)
    }

    pub fn trigger(&self, id: &Uuid) -> Option<Trigger> {
        self.store.trigger(id)
    }

    pub fn set_trigger_active(&self, id: Uuid, is_active: bool) -> OutreachResult<()> {
        self.store
            .update_trigger(&id, |t| t.is_active = is_active)
            .ok_or_else(|| OutreachError::NotFound(format!("trigger {}", id)))
    }

    /// Runs every active trigger for `event_type` against `payload`.
    ///
    /// `total_triggered` counts rule matches; the re-enrollment guard only
    /// decides whether `enroll` is attempted, and `total_enrolled` counts
    /// enrollments actually created.
    pub async fn evaluate_trigger(
        &self,
        event_type: TriggerEventType,
        payload: &Value,
    ) -> OutreachResult<TriggerReport> {
        let contact_id = payload
            .get(CONTACT_ID_FIELD)
            .and_then(Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                OutreachError::Validation(format!("trigger payload is missing {}", CONTACT_ID_FIELD))
            })?;

        let matcher = TriggerMatcher::new();
        let mut report = TriggerReport::default();

        for trigger in self.store.triggers_for(event_type) {
            if !matcher.rule_fires(&trigger.rule, payload)
                || !matcher.conditions_hold(&trigger.conditions, payload)
            {
                continue;
            }
            report.matched += 1;

            let already_enrolled = self
                .store
                .has_any_enrollment(&trigger.sequence_id, contact_id);
            if !matcher.matches(&trigger, payload, already_enrolled) {
                debug!(trigger_id = %trigger.id, contact_id, "Re-enrollment prevented");
                self.store.increment_trigger(&trigger.id, false);
                continue;
            }

            let source = EnrollmentSource::Trigger {
                trigger_id: trigger.id,
            };
            match self.enroll(trigger.sequence_id, contact_id, source).await {
                Ok(outcome) => {
                    self.store.increment_trigger(&trigger.id, outcome.created);
                    if outcome.created {
                        report.enrolled.push(outcome.enrollment.id);
                    }
                    let mut event = make_event(
                        EventType::TriggerFired,
                        trigger.sequence_id,
                        Some(outcome.enrollment.id),
                        Some(contact_id.to_string()),
                    );
                    event.node_id = self.settings.node_id.clone();
                    event.timestamp = self.clock.now();
                    event.detail = serde_json::json!({
                        "trigger_id": trigger.id,
                        "created": outcome.created,
                    });
                    self.event_sink.emit(event);
                }
                Err(err) => {
                    self.store.increment_trigger(&trigger.id, false);
                    report.errors += 1;
                    warn!(trigger_id = %trigger.id, contact_id, error = %err, "Trigger enrollment failed");
                }
            }
        }

        if report.matched > 0 {
            info!(
                ?event_type,
                contact_id,
                matched = report.matched,
                enrolled = report.enrolled.len(),
                "Triggers evaluated"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn trigger(rule: TriggerRule) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            name: "t".into(),
            rule,
            conditions: vec![],
            prevent_re_enrollment: false,
            is_active: true,
            total_triggered: 0,
            total_enrolled: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_score_operators() {
        let matcher = TriggerMatcher::new();
        let rule = |operator| TriggerRule::LeadScore {
            threshold: 50.0,
            operator,
        };
        let payload = json!({"contact_id": "c-1", "lead_score": 60});
        assert!(matcher.rule_fires(&rule(ScoreOperator::Gte), &payload));
        assert!(!matcher.rule_fires(&rule(ScoreOperator::Lte), &payload));
        assert!(!matcher.rule_fires(&rule(ScoreOperator::Eq), &payload));
        assert!(matcher.rule_fires(&rule(ScoreOperator::Eq), &json!({"lead_score": 50.0})));
        assert!(!matcher.rule_fires(&rule(ScoreOperator::Gte), &json!({"lead_score": "high"})));
    }

    #[test]
    fn test_type_specific_rules() {
        let matcher = TriggerMatcher::new();
        assert!(matcher.rule_fires(
            &TriggerRule::StageChanged { stage: "SQL".into() },
            &json!({"stage": "sql"})
        ));
        assert!(matcher.rule_fires(
            &TriggerRule::Inactivity { days: 30 },
            &json!({"days_inactive": 45})
        ));
        assert!(!matcher.rule_fires(
            &TriggerRule::Inactivity { days: 30 },
            &json!({"days_inactive": 10})
        ));
        assert!(matcher.rule_fires(
            &TriggerRule::TagRemoved { tag: "trial".into() },
            &json!({"tag": "trial"})
        ));
        let field_rule = TriggerRule::FieldChanged {
            field: "plan".into(),
            value: json!("enterprise"),
        };
        assert!(matcher.rule_fires(&field_rule, &json!({"field": "plan", "value": "enterprise"})));
        assert!(!matcher.rule_fires(&field_rule, &json!({"field": "plan", "value": "starter"})));
    }

    #[test]
    fn test_generic_conditions() {
        let matcher = TriggerMatcher::new();
        let payload = json!({
            "lead_score": 70,
            "contact": {"region": "emea", "tags": ["vip", "beta"]},
            "source": "webinar-2026"
        });
        let cond = |field: &str, operator, value| TriggerCondition {
            field: field.into(),
            operator,
            value,
        };
        assert!(matcher.conditions_hold(
            &[
                cond("contact.region", ConditionOperator::Eq, json!("emea")),
                cond("contact.region", ConditionOperator::Neq, json!("apac")),
                cond("contact.tags", ConditionOperator::Contains, json!("vip")),
                cond("source", ConditionOperator::Contains, json!("webinar")),
                cond("lead_score", ConditionOperator::In, json!([50, 70.0])),
            ],
            &payload
        ));
        assert!(!matcher.conditions_hold(
            &[cond("contact.missing", ConditionOperator::Eq, json!("x"))],
            &payload
        ));
        assert!(matcher.conditions_hold(
            &[cond("contact.missing", ConditionOperator::Neq, json!("x"))],
            &payload
        ));
    }

    #[test]
    fn test_prevent_re_enrollment_guard() {
        let matcher = TriggerMatcher::new();
        let mut t = trigger(TriggerRule::TagAdded { tag: "vip".into() });
        let payload = json!({"tag": "vip"});
        assert!(matcher.matches(&t, &payload, true));
        t.prevent_re_enrollment = true;
        assert!(matcher.matches(&t, &payload, false));
        assert!(!matcher.matches(&t, &payload, true));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(validate_rule(&TriggerRule::Inactivity { days: 0 }).is_err());
        assert!(validate_rule(&TriggerRule::TagAdded { tag: " ".into() }).is_err());
        assert!(validate_rule(&TriggerRule::LeadScore {
            threshold: f64::NAN,
            operator: ScoreOperator::Gte
        })
        .is_err());
        assert!(validate_rule(&TriggerRule::StageChanged { stage: "mql".into() }).is_ok());
    }
}
