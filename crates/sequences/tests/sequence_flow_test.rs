//! End-to-end sequence flows driven through the public engine API with
//! in-memory collaborators and a manual clock.

use std::collections::HashMap;

use chrono::Duration;
use outreach_core::types::EventType;
use outreach_sequences::testing::{fixture, fixture_start, Fixture};
use outreach_sequences::types::{
    AbMetric, ActivityKind, Condition, ConditionStep, EmailStep, EnrollmentSource,
    EnrollmentStatus, InboundEvent, InboundKind, NewStep, NewVariant, ScoreOperator, StepAction,
    TagStep, TaskPriority, TaskStep, TriggerEventType, TriggerRule,
};
use outreach_sequences::{AbDecision, NewAbTest, NewTrigger};
use serde_json::json;
use uuid::Uuid;

const OWNER: &str = "owner-1";
const DAY: u64 = 86_400;

/// Runs poller cycles until nothing is due.
async fn drain(fx: &Fixture) {
    for _ in 0..100 {
        let report = fx.engine.run_due_actions().await;
        if report.processed == 0 && report.errors == 0 {
            break;
        }
    }
}

fn email(name: &str) -> NewStep {
    NewStep::new(name, 0, StepAction::Email(EmailStep::default()))
}

/// Groups sent messages by variant id, in send order.
fn sends_by_variant(fx: &Fixture) -> HashMap<String, Vec<Uuid>> {
    let mut grouped: HashMap<String, Vec<Uuid>> = HashMap::new();
    for message in fx.backends.mailer.sent() {
        let enrollment_id = message.metadata["enrollment_id"]
            .parse()
            .expect("enrollment id");
        grouped
            .entry(message.metadata["variant_id"].clone())
            .or_default()
            .push(enrollment_id);
    }
    grouped
}

fn opened(enrollment_id: Uuid, variant_id: Option<Uuid>) -> InboundEvent {
    InboundEvent {
        enrollment_id,
        variant_id,
        step_id: None,
        kind: InboundKind::Opened,
        occurred_at: None,
    }
}

#[tokio::test]
async fn test_opened_email_takes_yes_branch() {
    let fx = fixture();
    fx.contact("c-1", "Ada");
    let seq = fx.draft(OWNER).unwrap();

    let intro = fx.engine.add_step(seq.id, email("intro").at(0)).unwrap();
    fx.engine
        .add_variant(intro.id, NewVariant::new("A", "Hi {first_name}", "<p>A</p>", 70))
        .unwrap();
    fx.engine
        .add_variant(intro.id, NewVariant::new("B", "Hey {first_name}", "<p>B</p>", 30))
        .unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("one day", DAY, StepAction::Wait).at(1))
        .unwrap();
    let no = fx
        .engine
        .add_step(
            seq.id,
            NewStep::new("nudge", 4 * 3600, StepAction::AddTag(TagStep { tag: "cold".into() }))
                .at(3),
        )
        .unwrap();
    let yes = fx
        .engine
        .add_step(
            seq.id,
            NewStep::new(
                "call",
                2 * 3600,
                StepAction::Task(TaskStep {
                    title: "Call {first_name}".into(),
                    description: String::new(),
                    assignee: Some(OWNER.into()),
                    due_in_days: 1,
                    priority: TaskPriority::High,
                }),
            )
            .at(4),
        )
        .unwrap();
    fx.engine
        .add_step(
            seq.id,
            NewStep::new(
                "opened?",
                0,
                StepAction::Condition(ConditionStep {
                    condition: Condition::EmailOpened { step_id: Some(intro.id) },
                    yes_step: Some(yes.id),
                    no_step: Some(no.id),
                }),
            )
            .at(2),
        )
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();

    let enrollment = fx
        .engine
        .enroll(seq.id, "c-1", EnrollmentSource::Api)
        .await
        .unwrap()
        .enrollment;
    let report = fx.engine.run_due_actions().await;
    assert_eq!(report.sent, 1);
    assert_eq!(
        fx.engine.enrollment(&enrollment.id).unwrap().next_action_at,
        Some(fixture_start() + Duration::days(1))
    );

    let sent = fx.backends.mailer.sent();
    let variant_id: Uuid = sent[0].metadata["variant_id"].parse().unwrap();
    assert!(sent[0].subject.ends_with("Ada"));
    fx.engine
        .record_inbound_event(opened(enrollment.id, Some(variant_id)))
        .unwrap();
    let variant = fx
        .engine
        .variants(&intro.id)
        .into_iter()
        .find(|v| v.id == variant_id)
        .unwrap();
    assert_eq!(variant.counters.opened, 1);

    fx.clock.advance(Duration::days(1));
    fx.engine.run_due_actions().await;

    let stored = fx.engine.enrollment(&enrollment.id).unwrap();
    assert_eq!(stored.status, EnrollmentStatus::Active);
    assert_eq!(stored.current_step, Some(yes.id));
    assert_eq!(
        stored.next_action_at,
        Some(fixture_start() + Duration::days(1) + Duration::hours(2))
    );
    let kinds: Vec<_> = fx
        .engine
        .activities(&enrollment.id)
        .iter()
        .map(|a| a.kind)
        .collect();
    assert_eq!(
        kinds,
        vec![
            ActivityKind::Enrolled,
            ActivityKind::EmailSent,
            ActivityKind::Advanced,
            ActivityKind::EmailOpened,
            ActivityKind::Advanced,
            ActivityKind::Branched,
        ]
    );

    fx.clock.advance(Duration::hours(2));
    fx.engine.run_due_actions().await;
    assert_eq!(fx.backends.tasks.tasks()[0].title, "Call Ada");
    assert_eq!(
        fx.engine.enrollment(&enrollment.id).unwrap().status,
        EnrollmentStatus::Completed
    );
    assert!(!fx.backends.contacts.snapshot("c-1").unwrap().tags.contains("cold"));
}

#[tokio::test]
async fn test_unopened_email_takes_no_branch() {
    let fx = fixture();
    fx.contact("c-1", "Ada");
    let seq = fx.draft(OWNER).unwrap();
    let intro = fx.engine.add_step(seq.id, email("intro")).unwrap();
    fx.engine
        .add_variant(intro.id, NewVariant::new("A", "Hi", "<p>A</p>", 100))
        .unwrap();
    let no = fx
        .engine
        .add_step(
            seq.id,
            NewStep::new("nudge", 3600, StepAction::AddTag(TagStep { tag: "cold".into() })).at(5),
        )
        .unwrap();
    fx.engine
        .add_step(
            seq.id,
            NewStep::new(
                "opened?",
                DAY,
                StepAction::Condition(ConditionStep {
                    condition: Condition::EmailOpened { step_id: None },
                    yes_step: None,
                    no_step: Some(no.id),
                }),
            )
            .at(1),
        )
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();
    let enrollment = fx
        .engine
        .enroll(seq.id, "c-1", EnrollmentSource::Api)
        .await
        .unwrap()
        .enrollment;

    fx.engine.run_due_actions().await;
    fx.clock.advance(Duration::days(1));
    fx.engine.run_due_actions().await;
    assert_eq!(
        fx.engine.enrollment(&enrollment.id).unwrap().current_step,
        Some(no.id)
    );
}

#[tokio::test]
async fn test_variant_split_follows_weights() {
    let fx = fixture();
    let seq = fx.draft(OWNER).unwrap();
    let intro = fx.engine.add_step(seq.id, email("intro")).unwrap();
    let a = fx
        .engine
        .add_variant(intro.id, NewVariant::new("A", "A", "<p>A</p>", 70))
        .unwrap();
    fx.engine
        .add_variant(intro.id, NewVariant::new("B", "B", "<p>B</p>", 30))
        .unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("rest", DAY, StepAction::Wait))
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();

    let trials = 2_000;
    for i in 0..trials {
        let id = format!("c-{}", i);
        fx.contact(&id, "Contact");
        fx.engine
            .enroll(seq.id, &id, EnrollmentSource::Api)
            .await
            .unwrap();
    }
    drain(&fx).await;

    let grouped = sends_by_variant(&fx);
    let a_sends = grouped.get(&a.id.to_string()).map(Vec::len).unwrap_or(0);
    let share = a_sends as f64 / trials as f64;
    assert!((share - 0.70).abs() < 0.04, "variant A share was {}", share);
}

#[tokio::test]
async fn test_lead_score_trigger_enrolls_once() {
    let fx = fixture();
    fx.contact("c-1", "Ada");
    let seq = fx.draft(OWNER).unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("tag", 0, StepAction::AddTag(TagStep { tag: "hot".into() })))
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();
    let trigger = fx
        .engine
        .create_trigger(
            seq.id,
            OWNER,
            NewTrigger {
                name: "Hot lead".into(),
                rule: TriggerRule::LeadScore {
                    threshold: 50.0,
                    operator: ScoreOperator::Gte,
                },
                conditions: vec![],
                prevent_re_enrollment: true,
            },
        )
        .unwrap();
    let payload = json!({"contact_id": "c-1", "lead_score": 60});

    let first = fx
        .engine
        .evaluate_trigger(TriggerEventType::LeadScoreChanged, &payload)
        .await
        .unwrap();
    assert_eq!(first.matched, 1);
    assert_eq!(first.enrolled.len(), 1);
    let enrollment = fx.engine.enrollment(&first.enrolled[0]).unwrap();
    assert_eq!(
        enrollment.source,
        EnrollmentSource::Trigger {
            trigger_id: trigger.id
        }
    );

    // Same event while the enrollment is open, then after it completed.
    let again = fx
        .engine
        .evaluate_trigger(TriggerEventType::LeadScoreChanged, &payload)
        .await
        .unwrap();
    assert!(again.enrolled.is_empty());
    drain(&fx).await;
    assert_eq!(
        fx.engine.enrollment(&enrollment.id).unwrap().status,
        EnrollmentStatus::Completed
    );
    let after = fx
        .engine
        .evaluate_trigger(TriggerEventType::LeadScoreChanged, &payload)
        .await
        .unwrap();
    assert!(after.enrolled.is_empty());

    let below = fx
        .engine
        .evaluate_trigger(
            TriggerEventType::LeadScoreChanged,
            &json!({"contact_id": "c-1", "lead_score": 40}),
        )
        .await
        .unwrap();
    assert_eq!(below.matched, 0);

    let stored = fx.engine.trigger(&trigger.id).unwrap();
    assert_eq!(stored.total_triggered, 3);
    assert_eq!(stored.total_enrolled, 1);
    assert_eq!(fx.engine.enrollments(&seq.id).len(), 1);
    assert_eq!(fx.events.count_type(EventType::TriggerFired), 1);

    let missing = fx
        .engine
        .evaluate_trigger(TriggerEventType::LeadScoreChanged, &json!({"lead_score": 90}))
        .await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn test_trigger_without_guard_re_enrolls_after_completion() {
    let fx = fixture();
    fx.contact("c-1", "Ada");
    let seq = fx.draft(OWNER).unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("tag", 0, StepAction::AddTag(TagStep { tag: "vip".into() })))
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();
    fx.engine
        .create_trigger(
            seq.id,
            OWNER,
            NewTrigger {
                name: "Tagged".into(),
                rule: TriggerRule::TagAdded { tag: "lead".into() },
                conditions: vec![],
                prevent_re_enrollment: false,
            },
        )
        .unwrap();
    let payload = json!({"contact_id": "c-1", "tag": "lead"});

    let first = fx
        .engine
        .evaluate_trigger(TriggerEventType::TagAdded, &payload)
        .await
        .unwrap();
    drain(&fx).await;
    let second = fx
        .engine
        .evaluate_trigger(TriggerEventType::TagAdded, &payload)
        .await
        .unwrap();
    assert_eq!(first.enrolled.len(), 1);
    assert_eq!(second.enrolled.len(), 1);
    assert_ne!(first.enrolled[0], second.enrolled[0]);
}

/// Sends the A/B step to fresh contacts until every variant has at least
/// `per_variant` sends.
async fn send_until(fx: &Fixture, sequence_id: Uuid, per_variant: usize) -> HashMap<String, Vec<Uuid>> {
    let mut next = 0;
    for _ in 0..50 {
        let grouped = sends_by_variant(fx);
        if grouped.len() == 2 && grouped.values().all(|ids| ids.len() >= per_variant) {
            return grouped;
        }
        for _ in 0..50 {
            let id = format!("c-{}", next);
            next += 1;
            fx.contact(&id, "Contact");
            fx.engine
                .enroll(sequence_id, &id, EnrollmentSource::Api)
                .await
                .unwrap();
        }
        drain(fx).await;
    }
    sends_by_variant(fx)
}

async fn ab_sequence(fx: &Fixture) -> (Uuid, Uuid, Uuid, Uuid) {
    let seq = fx.draft(OWNER).unwrap();
    let intro = fx.engine.add_step(seq.id, email("intro")).unwrap();
    let a = fx
        .engine
        .add_variant(intro.id, NewVariant::new("A", "A", "<p>A</p>", 50))
        .unwrap();
    let b = fx
        .engine
        .add_variant(intro.id, NewVariant::new("B", "B", "<p>B</p>", 50))
        .unwrap();
    let test = fx
        .engine
        .create_ab_test(
            intro.id,
            OWNER,
            NewAbTest {
                metric: AbMetric::OpenRate,
                sample_size: 100,
                confidence_level: 0.95,
            },
        )
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();
    (seq.id, test.id, a.id, b.id)
}

fn record_opens(fx: &Fixture, variant_id: Uuid, enrollments: &[Uuid], count: usize) {
    for enrollment_id in enrollments.iter().take(count) {
        fx.engine
            .record_inbound_event(opened(*enrollment_id, Some(variant_id)))
            .unwrap();
    }
}

#[tokio::test]
async fn test_ab_winner_takes_all_traffic() {
    let fx = fixture();
    let (sequence_id, test_id, a, b) = ab_sequence(&fx).await;

    // Not enough sends yet.
    assert!(matches!(
        fx.engine.evaluate_ab_test(test_id).unwrap(),
        AbDecision::InsufficientSample {
            required_per_variant: 50
        }
    ));

    let grouped = send_until(&fx, sequence_id, 50).await;
    let a_ids = &grouped[&a.to_string()];
    let b_ids = &grouped[&b.to_string()];
    // About 40% versus 25%.
    record_opens(&fx, a, a_ids, a_ids.len() * 40 / 100);
    record_opens(&fx, b, b_ids, b_ids.len() * 25 / 100);

    let decision = fx.engine.evaluate_ab_test(test_id).unwrap();
    assert!(matches!(decision, AbDecision::Winner { variant_id, .. } if variant_id == a));
    let test = fx.engine.ab_test(&test_id).unwrap();
    assert_eq!(test.winner_variant_id, Some(a));
    assert!(test.completed_at.is_some());
    assert_eq!(fx.events.count_type(EventType::WinnerDeclared), 1);
    let declared = fx
        .events
        .events()
        .into_iter()
        .find(|e| e.event_type == EventType::WinnerDeclared)
        .unwrap();
    assert_eq!(Some(declared.timestamp), test.completed_at);

    let step_id = test.step_id;
    let weights: HashMap<Uuid, (u32, bool)> = fx
        .engine
        .variants(&step_id)
        .into_iter()
        .map(|v| (v.id, (v.weight, v.is_winner)))
        .collect();
    assert_eq!(weights[&a], (100, true));
    assert_eq!(weights[&b], (0, false));

    // Later sends all use the winner; the decision is final.
    let before = fx.backends.mailer.count();
    for i in 0..20 {
        let id = format!("late-{}", i);
        fx.contact(&id, "Late");
        fx.engine
            .enroll(sequence_id, &id, EnrollmentSource::Api)
            .await
            .unwrap();
    }
    drain(&fx).await;
    let late = &fx.backends.mailer.sent()[before..];
    assert_eq!(late.len(), 20);
    assert!(late
        .iter()
        .all(|m| m.metadata["variant_id"] == a.to_string()));
    assert!(matches!(
        fx.engine.evaluate_ab_test(test_id).unwrap(),
        AbDecision::AlreadyDecided { variant_id: Some(id) } if id == a
    ));
}

#[tokio::test]
async fn test_ab_small_lift_keeps_running() {
    let fx = fixture();
    let (sequence_id, test_id, a, b) = ab_sequence(&fx).await;
    let grouped = send_until(&fx, sequence_id, 50).await;
    let a_ids = &grouped[&a.to_string()];
    let b_ids = &grouped[&b.to_string()];
    // At most 27% versus at least 25%: under the 10% lift bar either way.
    record_opens(&fx, a, a_ids, a_ids.len() * 27 / 100);
    record_opens(&fx, b, b_ids, (b_ids.len() * 25).div_ceil(100));

    let decision = fx.engine.evaluate_ab_test(test_id).unwrap();
    assert!(matches!(decision, AbDecision::NoClearWinner { .. }), "{:?}", decision);
    let test = fx.engine.ab_test(&test_id).unwrap();
    assert_eq!(test.winner_variant_id, None);
    assert!(test.results.is_some());
    assert!(fx
        .engine
        .variants(&test.step_id)
        .iter()
        .all(|v| v.weight == 50 && !v.is_winner));
}

#[tokio::test]
async fn test_concurrent_enroll_creates_one_enrollment() {
    let fx = fixture();
    fx.contact("c-1", "Ada");
    let seq = fx.draft(OWNER).unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("wait", DAY, StepAction::Wait))
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = fx.engine.clone();
        let sequence_id = seq.id;
        handles.push(tokio::spawn(async move {
            engine
                .enroll(sequence_id, "c-1", EnrollmentSource::Api)
                .await
                .unwrap()
        }));
    }
    let mut created = 0;
    let mut ids = Vec::new();
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.created {
            created += 1;
        }
        ids.push(outcome.enrollment.id);
    }
    assert_eq!(created, 1);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(fx.engine.sequence(&seq.id).unwrap().counters.enrolled, 1);
}

#[tokio::test]
async fn test_concurrent_poller_cycles_send_once() {
    let fx = fixture();
    let seq = fx.draft(OWNER).unwrap();
    let intro = fx.engine.add_step(seq.id, email("intro")).unwrap();
    fx.engine
        .add_variant(intro.id, NewVariant::new("A", "Hi", "<p>A</p>", 100))
        .unwrap();
    fx.engine
        .add_step(seq.id, NewStep::new("rest", DAY, StepAction::Wait))
        .unwrap();
    fx.engine.activate_sequence(seq.id, OWNER).unwrap();
    for i in 0..50 {
        let id = format!("c-{}", i);
        fx.contact(&id, "Contact");
        fx.engine
            .enroll(seq.id, &id, EnrollmentSource::Api)
            .await
            .unwrap();
    }

    let first = fx.engine.clone();
    let second = fx.engine.clone();
    let (a, b) = tokio::join!(
        tokio::spawn(async move { first.run_due_actions().await }),
        tokio::spawn(async move { second.run_due_actions().await })
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.sent + b.sent, 50);
    assert_eq!(fx.backends.mailer.count(), 50);
    assert!(fx
        .engine
        .enrollments(&seq.id)
        .iter()
        .all(|e| e.emails_sent == 1));
}
