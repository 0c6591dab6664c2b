use outreach_core::OutreachResult;
use tracing::info;
use uuid::Uuid;

use crate::ab_test::NewAbTest;
use crate::engine::SequenceEngine;
use crate::trigger::NewTrigger;
use crate::types::{
    AbMetric, Condition, ConditionStep, EmailStep, ExitConditions, NewSequence, NewStep,
    NewVariant, ScoreOperator, SendWindow, StepAction, TagStep, TaskPriority, TaskStep,
    TriggerRule,
};

/// Ids of the seeded demo objects.
#[derive(Debug, Clone, Copy)]
pub struct DemoSeed {
    pub sequence_id: Uuid,
    pub trigger_id: Uuid,
    pub ab_test_id: Uuid,
}

const DAY: u64 = 86_400;

impl SequenceEngine {
    /// Seeds an active "Trial Nurture" sequence owned by `owner`: an A/B
    /// tested welcome email, a two-day wait, an opened/not-opened branch, a
    /// follow-up, and a sales task, plus a lead-score trigger.
    pub fn seed_demo(&self, owner: &str) -> OutreachResult<DemoSeed> {
        info!(owner, "Seeding demo sequence");

        let sequence = self.create_sequence(NewSequence {
            name: "Trial Nurture".into(),
            description: "Welcome and qualify new trial sign-ups".into(),
            owner_id: owner.into(),
            exit_conditions: ExitConditions {
                exit_on_reply: true,
                exit_on_click: false,
            },
            send_window: Some(SendWindow::business_hours()),
        })?;
        let id = sequence.id;

        let welcome = self.add_step(
            id,
            NewStep::new("Welcome email", 0, StepAction::Email(EmailStep::default())).at(0),
        )?;
        self.add_variant(
            welcome.id,
            NewVariant::new(
                "Direct",
                "Welcome aboard, {first_name}",
                "<p>Hi {first_name}, thanks for trying us at {company}.</p>",
                70,
            ),
        )?;
        self.add_variant(
            welcome.id,
            NewVariant::new(
                "Question",
                "{first_name}, what brought you here?",
                "<p>Hi {first_name}, what are you hoping to solve at {company}?</p>",
                30,
            ),
        )?;
        self.add_step(id, NewStep::new("Give it two days", 2 * DAY, StepAction::Wait).at(1))?;

        let follow_up = self.add_step(
            id,
            NewStep::new("Follow-up email", 0, StepAction::Email(EmailStep::default())).at(3),
        )?;
        self.add_variant(
            follow_up.id,
            NewVariant::new(
                "Nudge",
                "Did you get a chance to look, {first_name}?",
                "<p>Just bumping this up in case it got buried.</p>",
                100,
            ),
        )?;
        self.add_step(
            id,
            NewStep::new(
                "Tag as nurtured",
                DAY,
                StepAction::AddTag(TagStep {
                    tag: "nurtured".into(),
                }),
            )
            .at(4),
        )?;
        let call = self.add_step(
            id,
            NewStep::new(
                "Sales call",
                0,
                StepAction::Task(TaskStep {
                    title: "Call {full_name}".into(),
                    description: "Trial contact at {company} finished the nurture sequence".into(),
                    assignee: Some(owner.into()),
                    due_in_days: 2,
                    priority: TaskPriority::High,
                }),
            )
            .at(5),
        )?;
        self.add_step(
            id,
            NewStep::new(
                "Opened welcome?",
                0,
                StepAction::Condition(ConditionStep {
                    condition: Condition::EmailOpened {
                        step_id: Some(welcome.id),
                    },
                    yes_step: Some(call.id),
                    no_step: Some(follow_up.id),
                }),
            )
            .at(2),
        )?;

        let ab_test = self.create_ab_test(
            welcome.id,
            owner,
            NewAbTest {
                metric: AbMetric::OpenRate,
                sample_size: 200,
                confidence_level: 0.95,
            },
        )?;
        self.activate_sequence(id, owner)?;

        let trigger = self.create_trigger(
            id,
            owner,
            NewTrigger {
                name: "Engaged trial".into(),
                rule: TriggerRule::LeadScore {
                    threshold: 50.0,
                    operator: ScoreOperator::Gte,
                },
                conditions: vec![],
                prevent_re_enrollment: true,
            },
        )?;

        Ok(DemoSeed {
            sequence_id: id,
            trigger_id: trigger.id,
            ab_test_id: ab_test.id,
        })
    }
}
