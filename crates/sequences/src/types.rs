use std::collections::HashMap;

use chrono::{DateTime, Duration, FixedOffset, Utc, Weekday};
use outreach_core::{OutreachError, OutreachResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type StepId = Uuid;

/// Longest delay a step may carry (ten years).
pub const MAX_WAIT_SECS: u64 = 10 * 365 * 86_400;

/// A reusable multi-step outbound campaign definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub owner_id: String,
    pub status: SequenceStatus,
    #[serde(default)]
    pub exit_conditions: ExitConditions,
    pub send_window: Option<SendWindow>,
    #[serde(default)]
    pub counters: SequenceCounters,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a sequence definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Archived,
}

/// Conditions that pull an enrollment out of the sequence before its next step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExitConditions {
    #[serde(default)]
    pub exit_on_reply: bool,
    #[serde(default)]
    pub exit_on_click: bool,
}

impl ExitConditions {
    /// Returns the reason the enrollment should exit, if any.
    pub fn exit_reason(&self, enrollment: &Enrollment) -> Option<&'static str> {
        if self.exit_on_reply && enrollment.replies > 0 {
            return Some("replied");
        }
        if self.exit_on_click && enrollment.clicks > 0 {
            return Some("clicked");
        }
        None
    }
}

/// Hours and weekdays during which automated actions may fire.
///
/// Hours are interpreted in the sender's fixed UTC offset; `end_hour` is
/// exclusive and may be 24.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendWindow {
    pub start_hour: u32,
    pub end_hour: u32,
    pub allowed_weekdays: Vec<Weekday>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl SendWindow {
    pub fn business_hours() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            allowed_weekdays: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            utc_offset_minutes: 0,
        }
    }

    pub fn validate(&self) -> OutreachResult<()> {
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(OutreachError::Validation(format!(
                "send window hours must satisfy start < end <= 24, got {}..{}",
                self.start_hour, self.end_hour
            )));
        }
        if self.allowed_weekdays.is_empty() {
            return Err(OutreachError::Validation(
                "send window must allow at least one weekday".into(),
            ));
        }
        if self.offset().is_none() {
            return Err(OutreachError::Validation(format!(
                "invalid UTC offset {} minutes",
                self.utc_offset_minutes
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> Option<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60)
    }

    /// An empty weekday list allows every day.
    pub fn allows(&self, weekday: Weekday) -> bool {
        self.allowed_weekdays.is_empty() || self.allowed_weekdays.contains(&weekday)
    }
}

/// Denormalized totals maintained by the engine with atomic increments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SequenceCounters {
    pub enrolled: u64,
    pub completed: u64,
    pub converted: u64,
    pub exited: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCounter {
    Enrolled,
    Completed,
    Converted,
    Exited,
}

/// One node in a sequence's action graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub sequence_id: Uuid,
    pub name: String,
    pub position: u32,
    /// Delay applied before this step fires, measured from the previous step.
    pub wait_secs: u64,
    pub is_active: bool,
    pub action: StepAction,
    #[serde(default)]
    pub executed: u64,
    #[serde(default)]
    pub failed: u64,
}

impl Step {
    pub fn wait(&self) -> Duration {
        Duration::seconds(self.wait_secs.min(MAX_WAIT_SECS) as i64)
    }

    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }
}

/// Typed per-step payload, keyed by step type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StepAction {
    Email(EmailStep),
    Wait,
    Condition(ConditionStep),
    Task(TaskStep),
    UpdateField(UpdateFieldStep),
    AddTag(TagStep),
    RemoveTag(TagStep),
    Notify(NotifyStep),
    Webhook(WebhookStep),
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            StepAction::Email(_) => "email",
            StepAction::Wait => "wait",
            StepAction::Condition(_) => "condition",
            StepAction::Task(_) => "task",
            StepAction::UpdateField(_) => "update_field",
            StepAction::AddTag(_) => "add_tag",
            StepAction::RemoveTag(_) => "remove_tag",
            StepAction::Notify(_) => "notify",
            StepAction::Webhook(_) => "webhook",
        }
    }

    /// Checks the payload is complete enough to execute. Branch targets are
    /// checked separately against the owning sequence.
    pub fn validate(&self) -> OutreachResult<()> {
        let require = |value: &str, what: &str| {
            if value.trim().is_empty() {
                Err(OutreachError::Validation(format!(
                    "{} step requires a non-empty {}",
                    self.kind(),
                    what
                )))
            } else {
                Ok(())
            }
        };

        match self {
            StepAction::Email(_) | StepAction::Wait => Ok(()),
            StepAction::Condition(step) => step.condition.validate(),
            StepAction::Task(task) => require(&task.title, "title"),
            StepAction::UpdateField(update) => require(&update.field, "field"),
            StepAction::AddTag(tag) | StepAction::RemoveTag(tag) => require(&tag.tag, "tag"),
            StepAction::Notify(notify) => {
                require(&notify.recipient, "recipient")?;
                require(&notify.message, "message")
            }
            StepAction::Webhook(webhook) => {
                let parsed = url::Url::parse(&webhook.url).map_err(|e| {
                    OutreachError::Validation(format!("invalid webhook url {}: {}", webhook.url, e))
                })?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(OutreachError::Validation(format!(
                        "webhook url must be http(s), got {}",
                        other
                    ))),
                }
            }
        }
    }

    /// Step ids this action may branch to.
    pub fn branch_targets(&self) -> Vec<StepId> {
        match self {
            StepAction::Condition(step) => step.yes_step.into_iter().chain(step.no_step).collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailStep {
    #[serde(default)]
    pub from_name: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub condition: Condition,
    #[serde(default)]
    pub yes_step: Option<StepId>,
    #[serde(default)]
    pub no_step: Option<StepId>,
}

/// Predicate evaluated by a condition step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Condition {
    EmailOpened {
        #[serde(default)]
        step_id: Option<StepId>,
    },
    EmailClicked {
        #[serde(default)]
        step_id: Option<StepId>,
    },
    EmailReplied {
        #[serde(default)]
        step_id: Option<StepId>,
    },
    LeadScoreAbove {
        threshold: f64,
    },
    LeadScoreBelow {
        threshold: f64,
    },
    HasTag {
        tag: String,
    },
    FieldEquals {
        field: String,
        value: serde_json::Value,
    },
    #[serde(other)]
    Unknown,
}

impl Condition {
    pub fn validate(&self) -> OutreachResult<()> {
        match self {
            Condition::LeadScoreAbove { threshold } | Condition::LeadScoreBelow { threshold }
                if !threshold.is_finite() =>
            {
                Err(OutreachError::Validation("lead score threshold must be finite".into()))
            }
            Condition::HasTag { tag } if tag.trim().is_empty() => {
                Err(OutreachError::Validation("has_tag condition requires a tag".into()))
            }
            Condition::FieldEquals { field, .. } if field.trim().is_empty() => {
                Err(OutreachError::Validation("field_equals condition requires a field".into()))
            }
            Condition::Unknown => Err(OutreachError::Validation(
                "unrecognized condition kind".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Whether evaluating this condition needs the contact record.
    pub fn needs_contact(&self) -> bool {
        matches!(
            self,
            Condition::LeadScoreAbove { .. }
                | Condition::LeadScoreBelow { .. }
                | Condition::HasTag { .. }
                | Condition::FieldEquals { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub due_in_days: u32,
    #[serde(default)]
    pub priority: TaskPriority,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFieldStep {
    pub field: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagStep {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyStep {
    pub recipient: String,
    pub message: String,
    #[serde(default)]
    pub channel: NotifyChannel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyChannel {
    #[default]
    InApp,
    Email,
    Slack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookStep {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Overrides the configured webhook timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Interchangeable email content attached to an email step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailVariant {
    pub id: Uuid,
    pub step_id: StepId,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    pub weight: u32,
    #[serde(default)]
    pub is_winner: bool,
    #[serde(default)]
    pub counters: VariantCounters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantCounters {
    pub sent: u64,
    pub opened: u64,
    pub clicked: u64,
    pub replied: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantCounter {
    Sent,
    Opened,
    Clicked,
    Replied,
}

/// One contact's run through a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub contact_id: String,
    pub current_step: Option<StepId>,
    pub status: EnrollmentStatus,
    /// Set iff `status == Active` and `current_step` is set.
    pub next_action_at: Option<DateTime<Utc>>,
    /// Snapshot captured at enrollment time; never rewritten.
    pub personalization: HashMap<String, String>,
    pub source: EnrollmentSource,
    #[serde(default)]
    pub emails_sent: u32,
    #[serde(default)]
    pub opens: u32,
    #[serde(default)]
    pub clicks: u32,
    #[serde(default)]
    pub replies: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
}

impl Enrollment {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EnrollmentStatus::Active
            && self.next_action_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// Runtime status of an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Converted,
    Unsubscribed,
    Bounced,
    Exited,
}

impl EnrollmentStatus {
    /// Active and paused enrollments hold the (sequence, contact) slot.
    pub fn is_open(self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Paused)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

/// How an enrollment came to exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum EnrollmentSource {
    Manual { actor: String },
    Trigger { trigger_id: Uuid },
    Api,
}

/// Append-only per-enrollment log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub sequence_id: Uuid,
    pub step_id: Option<StepId>,
    pub kind: ActivityKind,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Enrolled,
    Advanced,
    Branched,
    StepSkipped,
    EmailSent,
    EmailSkipped,
    EmailOpened,
    EmailClicked,
    EmailReplied,
    Bounced,
    Unsubscribed,
    TaskCreated,
    FieldUpdated,
    TagAdded,
    TagRemoved,
    Notified,
    WebhookCalled,
    WebhookFailed,
    Error,
    Paused,
    Resumed,
    Completed,
    Converted,
    Exited,
}

/// What the state machine should do after a step handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Move to the next active step by position.
    Advance,
    /// Jump to the given step.
    Branch(StepId),
    /// Move to the next step but stop chaining for this tick.
    Halt,
}

/// A/B experiment over the variants of one email step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,
    pub step_id: StepId,
    pub metric: AbMetric,
    pub sample_size: u64,
    pub confidence_level: f64,
    pub status: AbTestStatus,
    pub winner_variant_id: Option<Uuid>,
    pub results: Option<AbTestResults>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Running,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbMetric {
    OpenRate,
    ClickRate,
    ReplyRate,
}

impl AbMetric {
    pub fn value(self, counters: &VariantCounters) -> f64 {
        if counters.sent == 0 {
            return 0.0;
        }
        let hits = match self {
            AbMetric::OpenRate => counters.opened,
            AbMetric::ClickRate => counters.clicked,
            AbMetric::ReplyRate => counters.replied,
        };
        hits as f64 / counters.sent as f64
    }
}

/// Snapshot of variant performance taken at the last evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestResults {
    pub evaluated_at: DateTime<Utc>,
    pub variants: Vec<VariantResult>,
    pub relative_lift: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: Uuid,
    pub sent: u64,
    pub metric_value: f64,
}

/// Rule that auto-enrolls contacts in response to external events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub sequence_id: Uuid,
    pub name: String,
    pub rule: TriggerRule,
    #[serde(default)]
    pub conditions: Vec<TriggerCondition>,
    #[serde(default)]
    pub prevent_re_enrollment: bool,
    pub is_active: bool,
    #[serde(default)]
    pub total_triggered: u64,
    #[serde(default)]
    pub total_enrolled: u64,
    pub created_at: DateTime<Utc>,
}

/// Type-specific trigger match configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerRule {
    LeadScore {
        threshold: f64,
        operator: ScoreOperator,
    },
    StageChanged {
        stage: String,
    },
    Inactivity {
        days: u32,
    },
    TagAdded {
        tag: String,
    },
    TagRemoved {
        tag: String,
    },
    FieldChanged {
        field: String,
        value: serde_json::Value,
    },
}

impl TriggerRule {
    pub fn event_type(&self) -> TriggerEventType {
        match self {
            TriggerRule::LeadScore { .. } => TriggerEventType::LeadScoreChanged,
            TriggerRule::StageChanged { .. } => TriggerEventType::StageChanged,
            TriggerRule::Inactivity { .. } => TriggerEventType::ContactInactive,
            TriggerRule::TagAdded { .. } => TriggerEventType::TagAdded,
            TriggerRule::TagRemoved { .. } => TriggerEventType::TagRemoved,
            TriggerRule::FieldChanged { .. } => TriggerEventType::FieldChanged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOperator {
    Gte,
    Lte,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEventType {
    LeadScoreChanged,
    StageChanged,
    ContactInactive,
    TagAdded,
    TagRemoved,
    FieldChanged,
}

/// Generic `field operator value` filter applied to the event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Contains,
    In,
}

/// Open/click/reply/bounce callback from the mail transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub enrollment_id: Uuid,
    #[serde(default)]
    pub variant_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<StepId>,
    pub kind: InboundKind,
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Opened,
    Clicked,
    Replied,
    Bounced,
    Unsubscribed,
}

/// Summary of one poller cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DueRunReport {
    pub processed: u32,
    pub sent: u32,
    pub errors: u32,
    pub skipped: u32,
}

/// Aggregate statistics for a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceStats {
    pub sequence_id: Uuid,
    pub counters: SequenceCounters,
    pub by_status: HashMap<EnrollmentStatus, u64>,
    pub emails_sent: u64,
    pub replies: u64,
}

/// Input for creating a sequence. New sequences always start in draft.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSequence {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub owner_id: String,
    #[serde(default)]
    pub exit_conditions: ExitConditions,
    #[serde(default)]
    pub send_window: Option<SendWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStep {
    pub name: String,
    /// Appended after the current last step when omitted.
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(default)]
    pub wait_secs: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub action: StepAction,
}

impl NewStep {
    pub fn new(name: impl Into<String>, wait_secs: u64, action: StepAction) -> Self {
        Self {
            name: name.into(),
            position: None,
            wait_secs,
            is_active: true,
            action,
        }
    }

    pub fn at(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewVariant {
    pub name: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    pub weight: u32,
}

impl NewVariant {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
        weight: u32,
    ) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            html_body: html_body.into(),
            text_body: None,
            weight,
        }
    }
}

/// Result of `enroll`: the open enrollment and whether this call created it.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub enrollment: Enrollment,
    pub created: bool,
}

/// What one `advance` call did to a single enrollment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvanceReport {
    /// Steps executed or skipped this tick.
    pub hops: u32,
    pub emails_sent: u32,
    /// Nothing was done: not due, claimed elsewhere, or sequence not active.
    pub skipped: bool,
    /// The handler error that left the enrollment on its step.
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}
