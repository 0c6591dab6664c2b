//! Step executor: one handler per step type.
//!
//! Handlers perform the step's side effect through the collaborators and
//! report how the enrollment should move on. They never change enrollment
//! status themselves; that is the state machine's job.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use outreach_core::{OutreachError, OutreachResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::{bounded, Collaborators, ContactRecord, OutboundEmail, TaskRequest};
use crate::condition::{ConditionEvaluator, ConditionFacts};
use crate::render::render;
use crate::store::SequenceStore;
use crate::types::{
    Activity, ActivityKind, ConditionStep, EmailStep, Enrollment, NotifyStep, Step, StepAction,
    StepOutcome, TaskStep, VariantCounter, WebhookStep,
};
use crate::variant::VariantSelector;

/// What a handler did.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub outcome: StepOutcome,
    pub email_sent: bool,
    /// Extra context recorded on the resulting transition activity.
    pub detail: serde_json::Value,
}

impl Execution {
    fn advance() -> Self {
        Self {
            outcome: StepOutcome::Advance,
            email_sent: false,
            detail: serde_json::Value::Null,
        }
    }
}

pub struct StepExecutor {
    store: Arc<SequenceStore>,
    collaborators: Collaborators,
    selector: VariantSelector,
    evaluator: ConditionEvaluator,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor")
            .field("collaborators", &self.collaborators)
            .finish()
    }
}

impl StepExecutor {
    pub fn new(
        store: Arc<SequenceStore>,
        collaborators: Collaborators,
        rng: Arc<Mutex<StdRng>>,
    ) -> Self {
        Self {
            store,
            collaborators,
            selector: VariantSelector::new(),
            evaluator: ConditionEvaluator::new(),
            rng,
        }
    }

    /// Runs `step` for `enrollment`. An `Err` leaves the enrollment on this
    /// step so the next due tick retries it.
    pub async fn execute(
        &self,
        step: &Step,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Execution> {
        debug!(
            step_id = %step.id,
            enrollment_id = %enrollment.id,
            kind = step.kind(),
            "Executing step"
        );

        match &step.action {
            StepAction::Email(config) => self.send_email(step, config, enrollment, now).await,
            StepAction::Wait => Ok(Execution::advance()),
            StepAction::Condition(config) => self.branch(config, enrollment).await,
            StepAction::Task(config) => self.create_task(step, config, enrollment, now).await,
            StepAction::UpdateField(config) => {
                let timeout = self.collaborators.timeouts.contact_ms;
                bounded(
                    "contacts.update_field",
                    timeout,
                    self.collaborators.contacts.update_field(
                        &enrollment.contact_id,
                        &config.field,
                        config.value.clone(),
                    ),
                )
                .await?;
                self.log(
                    enrollment,
                    step,
                    ActivityKind::FieldUpdated,
                    json!({"field": config.field, "value": config.value}),
                    now,
                );
                Ok(Execution::advance())
            }
            StepAction::AddTag(config) => {
                let timeout = self.collaborators.timeouts.contact_ms;
                bounded(
                    "contacts.add_tag",
                    timeout,
                    self.collaborators
                        .contacts
                        .add_tag(&enrollment.contact_id, &config.tag),
                )
                .await?;
                self.log(enrollment, step, ActivityKind::TagAdded, json!({"tag": config.tag}), now);
                Ok(Execution::advance())
            }
            StepAction::RemoveTag(config) => {
                let timeout = self.collaborators.timeouts.contact_ms;
                bounded(
                    "contacts.remove_tag",
                    timeout,
                    self.collaborators
                        .contacts
                        .remove_tag(&enrollment.contact_id, &config.tag),
                )
                .await?;
                self.log(enrollment, step, ActivityKind::TagRemoved, json!({"tag": config.tag}), now);
                Ok(Execution::advance())
            }
            StepAction::Notify(config) => self.notify(step, config, enrollment, now).await,
            StepAction::Webhook(config) => self.call_webhook(step, config, enrollment, now).await,
        }
    }

    async fn send_email(
        &self,
        step: &Step,
        config: &EmailStep,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Execution> {
        let variants = self.store.variants_for_step(&step.id);
        let chosen = {
            let mut rng = self.rng.lock();
            self.selector.select(&variants, &mut *rng).cloned()
        };
        let Some(variant) = chosen else {
            warn!(step_id = %step.id, enrollment_id = %enrollment.id, "Email step has no variants, skipping send");
            self.log(
                enrollment,
                step,
                ActivityKind::EmailSkipped,
                json!({"reason": "no_variants"}),
                now,
            );
            return Ok(Execution::advance());
        };

        let contact = self.contact(&enrollment.contact_id).await?;
        if contact.email.trim().is_empty() {
            return Err(OutreachError::Collaborator(format!(
                "contact {} has no email address",
                contact.id
            )));
        }

        let timeouts = &self.collaborators.timeouts;
        let content = bounded(
            "content.compose",
            timeouts.mail_ms,
            self.collaborators.content.compose(&variant, &contact, enrollment),
        )
        .await?;

        let context = &enrollment.personalization;
        let mut metadata = HashMap::from([
            ("enrollment_id".to_string(), enrollment.id.to_string()),
            ("sequence_id".to_string(), enrollment.sequence_id.to_string()),
            ("step_id".to_string(), step.id.to_string()),
            ("variant_id".to_string(), variant.id.to_string()),
        ]);
        if let Some(from_name) = &config.from_name {
            metadata.insert("from_name".to_string(), from_name.clone());
        }
        if let Some(reply_to) = &config.reply_to {
            metadata.insert("reply_to".to_string(), reply_to.clone());
        }

        let email = OutboundEmail {
            to: contact.email.clone(),
            subject: render(&content.subject, context),
            html_body: render(&content.html_body, context),
            text_body: content.text_body.as_deref().map(|t| render(t, context)),
            metadata,
        };

        let delivery_id = bounded(
            "mail.send",
            timeouts.mail_ms,
            self.collaborators.mail.send(&email),
        )
        .await?;

        self.store.increment_variant(&variant.id, VariantCounter::Sent);
        self.store
            .update_enrollment(&enrollment.id, |e| e.emails_sent += 1);
        self.log(
            enrollment,
            step,
            ActivityKind::EmailSent,
            json!({
                "variant_id": variant.id,
                "delivery_id": delivery_id,
                "subject": email.subject,
            }),
            now,
        );
        info!(
            enrollment_id = %enrollment.id,
            variant = %variant.name,
            delivery_id = %delivery_id,
            "Sequence email sent"
        );

        Ok(Execution {
            outcome: StepOutcome::Advance,
            email_sent: true,
            detail: json!({"variant_id": variant.id}),
        })
    }

    /// A missing branch pointer falls through to the next step by order.
    async fn branch(
        &self,
        config: &ConditionStep,
        enrollment: &Enrollment,
    ) -> OutreachResult<Execution> {
        let activities = self.store.activities_for(&enrollment.id);
        let contact = if config.condition.needs_contact() {
            Some(self.contact(&enrollment.contact_id).await?)
        } else {
            None
        };
        let facts = ConditionFacts {
            activities: &activities,
            contact: contact.as_ref(),
        };
        let matched = self.evaluator.evaluate(enrollment, &config.condition, &facts);
        let target = if matched { config.yes_step } else { config.no_step };

        Ok(Execution {
            outcome: target.map(StepOutcome::Branch).unwrap_or(StepOutcome::Advance),
            email_sent: false,
            detail: json!({"condition_matched": matched, "fell_through": target.is_none()}),
        })
    }

    async fn create_task(
        &self,
        step: &Step,
        config: &TaskStep,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Execution> {
        let context = &enrollment.personalization;
        let request = TaskRequest {
            title: render(&config.title, context),
            description: render(&config.description, context),
            assignee: config.assignee.clone(),
            due_date: now + Duration::days(i64::from(config.due_in_days)),
            priority: config.priority,
        };
        let task_id = bounded(
            "tasks.create",
            self.collaborators.timeouts.task_ms,
            self.collaborators.tasks.create_task(&request),
        )
        .await?;
        self.log(
            enrollment,
            step,
            ActivityKind::TaskCreated,
            json!({"task_id": task_id, "title": request.title}),
            now,
        );
        Ok(Execution::advance())
    }

    async fn notify(
        &self,
        step: &Step,
        config: &NotifyStep,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Execution> {
        let message = render(&config.message, &enrollment.personalization);
        bounded(
            "notifications.notify",
            self.collaborators.timeouts.notification_ms,
            self.collaborators
                .notifications
                .notify(&config.recipient, &message, config.channel),
        )
        .await?;
        self.log(
            enrollment,
            step,
            ActivityKind::Notified,
            json!({"recipient": config.recipient, "channel": config.channel}),
            now,
        );
        Ok(Execution::advance())
    }

    /// Webhook failures are recorded but never block the sequence.
    async fn call_webhook(
        &self,
        step: &Step,
        config: &WebhookStep,
        enrollment: &Enrollment,
        now: DateTime<Utc>,
    ) -> OutreachResult<Execution> {
        let payload = json!({
            "event": "sequence.step",
            "sequence_id": enrollment.sequence_id,
            "enrollment_id": enrollment.id,
            "contact_id": enrollment.contact_id,
            "step_id": step.id,
            "step_name": step.name,
            "personalization": enrollment.personalization,
            "occurred_at": now,
        });
        let timeout_ms = config
            .timeout_ms
            .unwrap_or(self.collaborators.timeouts.webhook_ms);

        match bounded(
            "webhook.post",
            timeout_ms,
            self.collaborators
                .webhooks
                .post(&config.url, &payload, &config.headers, timeout_ms),
        )
        .await
        {
            Ok(status) => self.log(
                enrollment,
                step,
                ActivityKind::WebhookCalled,
                json!({"url": config.url, "status": status}),
                now,
            ),
            Err(err) => {
                warn!(url = %config.url, error = %err, "Webhook call failed");
                self.log(
                    enrollment,
                    step,
                    ActivityKind::WebhookFailed,
                    json!({"url": config.url, "error": err.to_string()}),
                    now,
                );
            }
        }
        Ok(Execution::advance())
    }

    async fn contact(&self, contact_id: &str) -> OutreachResult<ContactRecord> {
        bounded(
            "contacts.get",
            self.collaborators.timeouts.contact_ms,
            self.collaborators.contacts.get(contact_id),
        )
        .await?
        .ok_or_else(|| OutreachError::Collaborator(format!("contact {} not found", contact_id)))
    }

    fn log(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        kind: ActivityKind,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.store.append_activity(Activity {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            sequence_id: enrollment.sequence_id,
            step_id: Some(step.id),
            kind,
            detail,
            created_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture, Fixture};
    use crate::types::{
        EnrollmentSource, EnrollmentStatus, NewStep, NewVariant, TaskPriority, UpdateFieldStep,
    };

    const OWNER: &str = "owner-1";

    async fn run_single(fx: &Fixture, action: StepAction) -> (Step, Enrollment) {
        let seq = fx.draft(OWNER).unwrap();
        let step = fx.engine.add_step(seq.id, NewStep::new("only", 0, action)).unwrap();
        fx.engine.activate_sequence(seq.id, OWNER).unwrap();
        let enrollment = fx
            .engine
            .enroll(seq.id, "c-1", EnrollmentSource::Api)
            .await
            .unwrap()
            .enrollment;
        fx.engine.advance(enrollment.id).await.unwrap();
        (step, fx.engine.enrollment(&enrollment.id).unwrap())
    }

    fn activity(fx: &Fixture, enrollment: &Enrollment, kind: ActivityKind) -> Option<Activity> {
        fx.engine
            .activities(&enrollment.id)
            .into_iter()
            .find(|a| a.kind == kind)
    }

    fn hook(timeout_ms: Option<u64>) -> StepAction {
        StepAction::Webhook(WebhookStep {
            url: "https://hooks.example.com/sequence".into(),
            headers: HashMap::from([("x-token".to_string(), "abc".to_string())]),
            timeout_ms,
        })
    }

    #[tokio::test]
    async fn test_webhook_posts_payload() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        let (step, enrollment) = run_single(&fx, hook(None)).await;

        let calls = fx.backends.webhooks.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].payload["step_id"], step.id.to_string());
        assert_eq!(calls[0].payload["personalization"]["first_name"], "Ada");
        assert_eq!(calls[0].headers["x-token"], "abc");
        assert!(activity(&fx, &enrollment, ActivityKind::WebhookCalled).is_some());
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_webhook_failure_does_not_block() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        fx.backends.webhooks.set_failing(true);
        let (_, enrollment) = run_single(&fx, hook(None)).await;

        let failed = activity(&fx, &enrollment, ActivityKind::WebhookFailed).unwrap();
        assert!(failed.detail["error"].as_str().unwrap().contains("502"));
        assert!(activity(&fx, &enrollment, ActivityKind::Error).is_none());
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_webhook_timeout_uses_step_override() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        fx.backends.webhooks.set_delay_ms(500);
        let (_, enrollment) = run_single(&fx, hook(Some(20))).await;

        let failed = activity(&fx, &enrollment, ActivityKind::WebhookFailed).unwrap();
        assert!(failed.detail["error"].as_str().unwrap().contains("20ms"));
        assert!(fx.backends.webhooks.calls().is_empty());
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
    }

    #[tokio::test]
    async fn test_email_without_variants_is_skipped() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        let (_, enrollment) = run_single(&fx, StepAction::Email(EmailStep::default())).await;

        assert!(fx.backends.mailer.sent().is_empty());
        let skipped = activity(&fx, &enrollment, ActivityKind::EmailSkipped).unwrap();
        assert_eq!(skipped.detail["reason"], "no_variants");
        assert_eq!(enrollment.status, EnrollmentStatus::Completed);
        assert_eq!(enrollment.emails_sent, 0);
    }

    #[tokio::test]
    async fn test_email_carries_sender_metadata() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        let seq = fx.draft(OWNER).unwrap();
        let step = fx
            .engine
            .add_step(
                seq.id,
                NewStep::new(
                    "intro",
                    0,
                    StepAction::Email(EmailStep {
                        from_name: Some("Sam from Sales".into()),
                        reply_to: Some("sam@vendor.example".into()),
                    }),
                ),
            )
            .unwrap();
        let mut variant = NewVariant::new("A", "Hi {first_name}", "<p>{unknown}</p>", 100);
        variant.text_body = Some("Hello {first_name} at {company}".into());
        let variant = fx.engine.add_variant(step.id, variant).unwrap();
        fx.engine.activate_sequence(seq.id, OWNER).unwrap();
        let enrollment = fx
            .engine
            .enroll(seq.id, "c-1", EnrollmentSource::Api)
            .await
            .unwrap()
            .enrollment;
        fx.engine.advance(enrollment.id).await.unwrap();

        let sent = fx.backends.mailer.sent();
        assert_eq!(sent[0].metadata["from_name"], "Sam from Sales");
        assert_eq!(sent[0].metadata["reply_to"], "sam@vendor.example");
        assert_eq!(sent[0].metadata["variant_id"], variant.id.to_string());
        assert_eq!(sent[0].html_body, "<p></p>");
        assert_eq!(sent[0].text_body.as_deref(), Some("Hello Ada at Acme"));
    }

    #[tokio::test]
    async fn test_contact_steps_and_tasks() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        let (_, enrollment) = run_single(
            &fx,
            StepAction::UpdateField(UpdateFieldStep {
                field: "lifecycle".into(),
                value: json!("nurture"),
            }),
        )
        .await;
        assert_eq!(
            fx.backends.contacts.snapshot("c-1").unwrap().field("lifecycle"),
            Some(json!("nurture"))
        );
        assert!(activity(&fx, &enrollment, ActivityKind::FieldUpdated).is_some());

        let fx = fixture();
        fx.contact("c-1", "Ada");
        let (_, enrollment) = run_single(
            &fx,
            StepAction::Task(TaskStep {
                title: "Call {first_name}".into(),
                description: "Follow up with {company}".into(),
                assignee: Some(OWNER.into()),
                due_in_days: 3,
                priority: TaskPriority::High,
            }),
        )
        .await;
        let tasks = fx.backends.tasks.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "Call Ada");
        assert_eq!(tasks[0].description, "Follow up with Acme");
        assert_eq!(tasks[0].due_date, enrollment.enrolled_at + Duration::days(3));
        assert!(activity(&fx, &enrollment, ActivityKind::TaskCreated).is_some());
    }

    #[tokio::test]
    async fn test_missing_contact_is_a_retryable_error() {
        let fx = fixture();
        fx.contact("c-1", "Ada");
        let seq = fx.draft(OWNER).unwrap();
        let step = fx
            .engine
            .add_step(seq.id, NewStep::new("intro", 0, StepAction::Email(EmailStep::default())))
            .unwrap();
        fx.engine
            .add_variant(step.id, NewVariant::new("A", "Hi", "<p>Hi</p>", 100))
            .unwrap();
        fx.engine.activate_sequence(seq.id, OWNER).unwrap();
        let enrollment = fx
            .engine
            .enroll(seq.id, "c-1", EnrollmentSource::Api)
            .await
            .unwrap()
            .enrollment;

        let mut blank = ContactRecord::new("c-1", "");
        blank.first_name = Some("Ada".into());
        fx.backends.contacts.upsert(blank);
        let report = fx.engine.advance(enrollment.id).await.unwrap();
        assert!(report.error.unwrap().contains("no email address"));

        let stored = fx.engine.enrollment(&enrollment.id).unwrap();
        assert_eq!(stored.current_step, Some(step.id));
        let error = activity(&fx, &stored, ActivityKind::Error).unwrap();
        assert_eq!(error.detail["error_kind"], "collaborator");
    }
}
