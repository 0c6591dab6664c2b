use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_core::event_bus::{make_event, noop_sink, EventSink};
use outreach_core::types::EventType;
use outreach_core::{AppConfig, OutreachError, OutreachResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{bounded, Collaborators};
use crate::executor::StepExecutor;
use crate::schedule::{clamp_to_window, next_action_time, Clock, SystemClock};
use crate::state_machine::EnrollmentStateMachine;
use crate::store::SequenceStore;
use crate::types::{
    Activity, ActivityKind, AdvanceReport, EmailVariant, EnrollOutcome, Enrollment,
    EnrollmentSource, EnrollmentStatus, InboundEvent, InboundKind, NewSequence, NewStep,
    NewVariant, SendWindow, Sequence, SequenceCounter, SequenceCounters, SequenceStats,
    SequenceStatus, Step, StepAction, StepId, StepOutcome, VariantCounter, VariantCounters,
    MAX_WAIT_SECS,
};

/// Runtime knobs taken from `AppConfig`.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub node_id: String,
    pub batch_size: usize,
    pub max_concurrency: usize,
    /// Upper bound on steps one enrollment may take in a single tick.
    pub max_hops_per_tick: u32,
    /// `None` retries failing steps forever.
    pub max_step_failures: Option<u32>,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            node_id: config.node_id.clone(),
            batch_size: config.scheduler.batch_size.max(1),
            max_concurrency: config.scheduler.max_concurrency.max(1),
            max_hops_per_tick: config.scheduler.max_hops_per_tick.max(1),
            max_step_failures: config.engine.max_step_failures,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Sequence execution engine: owns the definitions and drives every
/// enrollment through its step graph.
#[derive(Clone)]
pub struct SequenceEngine {
    pub(crate) store: Arc<SequenceStore>,
    pub(crate) collaborators: Collaborators,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) event_sink: Arc<dyn EventSink>,
    pub(crate) settings: EngineSettings,
    executor: Arc<StepExecutor>,
    machine: Arc<EnrollmentStateMachine>,
    rng: Arc<Mutex<StdRng>>,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("store", &self.store)
            .field("settings", &self.settings)
            .finish()
    }
}

impl SequenceEngine {
    /// Creates an engine with default settings, the system clock and an
    /// entropy-seeded random source.
    pub fn new(collaborators: Collaborators) -> Self {
        let store = Arc::new(SequenceStore::new());
        let rng = Arc::new(Mutex::new(StdRng::from_entropy()));
        let executor = Arc::new(StepExecutor::new(
            store.clone(),
            collaborators.clone(),
            rng.clone(),
        ));
        Self {
            store,
            collaborators,
            clock: Arc::new(SystemClock),
            event_sink: noop_sink(),
            settings: EngineSettings::default(),
            executor,
            machine: Arc::new(EnrollmentStateMachine::new()),
            rng,
        }
    }

    /// Builds an engine from loaded configuration. The configured timeouts
    /// replace whatever the collaborators carried.
    pub fn from_config(config: &AppConfig, mut collaborators: Collaborators) -> Self {
        collaborators.timeouts = config.timeouts.clone();
        let engine = Self::new(collaborators).with_settings(EngineSettings::from_config(config));
        match config.engine.rng_seed {
            Some(seed) => engine.with_rng_seed(seed),
            None => engine,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Reseeds the variant draw so selections are reproducible.
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ------------------------------------------------------------------
    // Sequence definitions
    // ------------------------------------------------------------------

    pub fn create_sequence(&self, draft: NewSequence) -> OutreachResult<Sequence> {
        if draft.name.trim().is_empty() {
            return Err(OutreachError::Validation("sequence name is required".into()));
        }
        if draft.owner_id.trim().is_empty() {
            return Err(OutreachError::Validation("sequence owner is required".into()));
        }
        if let Some(window) = &draft.send_window {
            window.validate()?;
        }

        let now = self.clock.now();
        let sequence = Sequence {
            id: Uuid::new_v4(),
            name: draft.name,
            description: draft.description,
            owner_id: draft.owner_id,
            status: SequenceStatus::Draft,
            exit_conditions: draft.exit_conditions,
            send_window: draft.send_window,
            counters: SequenceCounters::default(),
            created_at: now,
            updated_at: now,
        };
        info!(sequence_id = %sequence.id, name = %sequence.name, "Creating sequence");
        self.store.insert_sequence(sequence.clone());
        Ok(sequence)
    }

    pub fn sequence(&self, id: &Uuid) -> Option<Sequence> {
        self.store.sequence(id)
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        self.store.list_sequences()
    }

    /// Steps of a sequence in traversal order.
    pub fn steps(&self, sequence_id: &Uuid) -> Vec<Step> {
        self.store.steps_for(sequence_id)
    }

    pub fn step(&self, id: &StepId) -> Option<Step> {
        self.store.step(id)
    }

    /// Adds a step after validating its payload. Branch targets must already
    /// exist in the same sequence; add targets first or wire them later with
    /// `update_step_action`.
    pub fn add_step(&self, sequence_id: Uuid, new: NewStep) -> OutreachResult<Step> {
        let sequence = self.require_sequence(&sequence_id)?;
        if sequence.status == SequenceStatus::Archived {
            return Err(OutreachError::Validation(format!(
                "sequence {} is archived",
                sequence_id
            )));
        }
        if new.name.trim().is_empty() {
            return Err(OutreachError::Validation("step name is required".into()));
        }
        if new.wait_secs > MAX_WAIT_SECS {
            return Err(OutreachError::Validation(format!(
                "wait of {}s exceeds the maximum of {}s",
                new.wait_secs, MAX_WAIT_SECS
            )));
        }
        new.action.validate()?;
        self.check_branch_targets(&sequence_id, &new.action)?;

        let position = new.position.unwrap_or_else(|| {
            self.store
                .steps_for(&sequence_id)
                .last()
                .map(|s| s.position + 1)
                .unwrap_or(0)
        });
        let step = Step {
            id: Uuid::new_v4(),
            sequence_id,
            name: new.name,
            position,
            wait_secs: new.wait_secs,
            is_active: new.is_active,
            action: new.action,
            executed: 0,
            failed: 0,
        };
        debug!(sequence_id = %sequence_id, step_id = %step.id, kind = step.kind(), position, "Adding step");
        self.store.insert_step(step.clone());
        Ok(step)
    }

    /// Replaces a step's payload, e.g. to point a condition at a step added
    /// after it.
    pub fn update_step_action(&self, step_id: StepId, action: StepAction) -> OutreachResult<Step> {
        let step = self.require_step(&step_id)?;
        action.validate()?;
        self.check_branch_targets(&step.sequence_id, &action)?;
        if step.kind() != action.kind() && !self.store.variants_for_step(&step_id).is_empty() {
            return Err(OutreachError::Validation(
                "cannot change the type of an email step that has variants".into(),
            ));
        }
        self.store
            .update_step(&step_id, |s| {
                s.action = action;
                s.clone()
            })
            .ok_or_else(|| OutreachError::NotFound(format!("step {}", step_id)))
    }

    /// Inactive steps are skipped during traversal.
    pub fn set_step_active(&self, step_id: StepId, is_active: bool) -> OutreachResult<Step> {
        self.store
            .update_step(&step_id, |s| {
                s.is_active = is_active;
                s.clone()
            })
            .ok_or_else(|| OutreachError::NotFound(format!("step {}", step_id)))
    }

    pub fn add_variant(&self, step_id: StepId, new: NewVariant) -> OutreachResult<EmailVariant> {
        let step = self.require_step(&step_id)?;
        if !matches!(step.action, StepAction::Email(_)) {
            return Err(OutreachError::Validation(format!(
                "variants can only be attached to email steps, step {} is {}",
                step_id,
                step.kind()
            )));
        }
        if !(1..=100).contains(&new.weight) {
            return Err(OutreachError::Validation(format!(
                "variant weight must be in [1, 100], got {}",
                new.weight
            )));
        }
        if new.subject.trim().is_empty() {
            return Err(OutreachError::Validation("variant subject is required".into()));
        }

        let variant = EmailVariant {
            id: Uuid::new_v4(),
            step_id,
            name: new.name,
            subject: new.subject,
            html_body: new.html_body,
            text_body: new.text_body,
            weight: new.weight,
            is_winner: false,
            counters: VariantCounters::default(),
        };
        debug!(step_id = %step_id, variant_id = %variant.id, weight = variant.weight, "Adding variant");
        self.store.insert_variant(variant.clone());
        Ok(variant)
    }

    pub fn variants(&self, step_id: &StepId) -> Vec<EmailVariant> {
        self.store.variants_for_step(step_id)
    }

    /// Draft or paused → active. Requires at least one active step and a
    /// branch graph whose targets all belong to the sequence.
    pub fn activate_sequence(&self, sequence_id: Uuid, actor: &str) -> OutreachResult<Sequence> {
        let sequence = self.require_sequence(&sequence_id)?;
        authorize(&sequence, actor)?;
        if !matches!(sequence.status, SequenceStatus::Draft | SequenceStatus::Paused) {
            return Err(OutreachError::Validation(format!(
                "cannot activate a sequence in status {:?}",
                sequence.status
            )));
        }

        let steps = self.store.steps_for(&sequence_id);
        if !steps.iter().any(|s| s.is_active) {
            return Err(OutreachError::Validation(format!(
                "sequence {} has no active steps",
                sequence_id
            )));
        }
        for step in &steps {
            self.check_branch_targets(&sequence_id, &step.action)?;
            if step.is_active
                && matches!(step.action, StepAction::Email(_))
                && self.store.variants_for_step(&step.id).is_empty()
            {
                warn!(step_id = %step.id, "Email step has no variants; sends will be skipped");
            }
        }

        self.set_sequence_status(&sequence_id, SequenceStatus::Active)
    }

    /// Stops the poller from advancing this sequence's enrollments; they
    /// keep their schedule and resume when the sequence is reactivated.
    pub fn pause_sequence(&self, sequence_id: Uuid, actor: &str) -> OutreachResult<Sequence> {
        let sequence = self.require_sequence(&sequence_id)?;
        authorize(&sequence, actor)?;
        if sequence.status != SequenceStatus::Active {
            return Err(OutreachError::Validation(format!(
                "only active sequences can be paused, status is {:?}",
                sequence.status
            )));
        }
        self.set_sequence_status(&sequence_id, SequenceStatus::Paused)
    }

    /// Archiving exits every open enrollment.
    pub fn archive_sequence(&self, sequence_id: Uuid, actor: &str) -> OutreachResult<Sequence> {
        let sequence = self.require_sequence(&sequence_id)?;
        authorize(&sequence, actor)?;
        let archived = self.set_sequence_status(&sequence_id, SequenceStatus::Archived)?;

        let now = self.clock.now();
        let mut exited = 0;
        for enrollment in self.store.enrollments_for(&sequence_id) {
            if enrollment.status.is_open()
                && self
                    .finish(&enrollment.id, EnrollmentStatus::Exited, Some("sequence_archived"), None, now)?
                    .is_some()
            {
                exited += 1;
            }
        }
        info!(sequence_id = %sequence_id, exited, "Sequence archived");
        Ok(archived)
    }

    fn set_sequence_status(&self, id: &Uuid, status: SequenceStatus) -> OutreachResult<Sequence> {
        let now = self.clock.now();
        info!(sequence_id = %id, ?status, "Updating sequence status");
        self.store
            .update_sequence(id, |s| {
                s.status = status;
                s.updated_at = now;
                s.clone()
            })
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {}", id)))
    }

    fn check_branch_targets(&self, sequence_id: &Uuid, action: &StepAction) -> OutreachResult<()> {
        let targets = action.branch_targets();
        if targets.is_empty() {
            return Ok(());
        }
        let known = self.store.step_ids_for(sequence_id);
        match targets.iter().find(|t| !known.contains(t)) {
            Some(missing) => Err(OutreachError::Validation(format!(
                "branch target {} is not a step of sequence {}",
                missing, sequence_id
            ))),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Enrollment lifecycle
    // ------------------------------------------------------------------

    /// Enrolls a contact. An existing active or paused enrollment for the
    /// same (sequence, contact) is returned unchanged.
    pub async fn enroll(
        &self,
        sequence_id: Uuid,
        contact_id: &str,
        source: EnrollmentSource,
    ) -> OutreachResult<EnrollOutcome> {
        let sequence = self
            .store
            .sequence(&sequence_id)
            .ok_or_else(|| OutreachError::Validation(format!("unknown sequence {}", sequence_id)))?;
        if contact_id.trim().is_empty() {
            return Err(OutreachError::Validation("contact id is required".into()));
        }
        if let Some(existing) = self.store.open_enrollment(&sequence_id, contact_id) {
            debug!(enrollment_id = %existing.id, contact_id, "Contact already enrolled");
            return Ok(EnrollOutcome {
                enrollment: existing,
                created: false,
            });
        }
        if sequence.status != SequenceStatus::Active {
            return Err(OutreachError::Validation(format!(
                "sequence {} is {:?}, not active",
                sequence_id, sequence.status
            )));
        }

        let contact = bounded(
            "contacts.get",
            self.collaborators.timeouts.contact_ms,
            self.collaborators.contacts.get(contact_id),
        )
        .await?
        .ok_or_else(|| OutreachError::Validation(format!("unknown contact {}", contact_id)))?;

        let first = self.store.first_active_step(&sequence_id).ok_or_else(|| {
            OutreachError::Validation(format!("sequence {} has no active steps", sequence_id))
        })?;

        let now = self.clock.now();
        let candidate = Enrollment {
            id: Uuid::new_v4(),
            sequence_id,
            contact_id: contact_id.to_string(),
            current_step: Some(first.id),
            status: EnrollmentStatus::Active,
            next_action_at: Some(next_action_time(&first, sequence.send_window.as_ref(), now)),
            personalization: contact.personalization(),
            source,
            emails_sent: 0,
            opens: 0,
            clicks: 0,
            replies: 0,
            consecutive_failures: 0,
            enrolled_at: now,
            updated_at: now,
            finished_at: None,
            exit_reason: None,
        };

        let (enrollment, created) = self.store.insert_enrollment_unique(candidate);
        if created {
            self.store
                .increment_sequence(&sequence_id, SequenceCounter::Enrolled);
            let detail = json!({
                "source": enrollment.source,
                "first_step": first.id,
                "next_action_at": enrollment.next_action_at,
            });
            self.record(&enrollment, Some(first.id), ActivityKind::Enrolled, detail.clone(), now);
            self.emit(EventType::Enrolled, &enrollment, Some(first.id), detail);
            info!(
                enrollment_id = %enrollment.id,
                sequence_id = %sequence_id,
                contact_id,
                "Contact enrolled"
            );
        }
        Ok(EnrollOutcome {
            enrollment,
            created,
        })
    }

    pub fn enrollment(&self, id: &Uuid) -> Option<Enrollment> {
        self.store.enrollment(id)
    }

    pub fn enrollments(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        self.store.enrollments_for(sequence_id)
    }

    pub fn activities(&self, enrollment_id: &Uuid) -> Vec<Activity> {
        self.store.activities_for(enrollment_id)
    }

    /// Runs the enrollment's due steps. Steps whose computed time has
    /// already arrived are chained within the same call, up to
    /// `max_hops_per_tick`. A concurrent call for the same enrollment
    /// returns a skipped report without touching it.
    pub async fn advance(&self, enrollment_id: Uuid) -> OutreachResult<AdvanceReport> {
        let Some(_claim) = self.store.try_claim(enrollment_id) else {
            debug!(enrollment_id = %enrollment_id, "Enrollment already being advanced");
            return Ok(AdvanceReport {
                skipped: true,
                ..Default::default()
            });
        };

        let now = self.clock.now();
        let mut report = AdvanceReport::default();
        let mut transitions = 0u32;

        loop {
            let enrollment = self.store.enrollment(&enrollment_id).ok_or_else(|| {
                OutreachError::Validation(format!("unknown enrollment {}", enrollment_id))
            })?;
            if !enrollment.is_due(now) {
                break;
            }
            let sequence = self.store.sequence(&enrollment.sequence_id).ok_or_else(|| {
                OutreachError::DataConsistency(format!(
                    "enrollment {} references missing sequence {}",
                    enrollment.id, enrollment.sequence_id
                ))
            })?;
            if sequence.status != SequenceStatus::Active {
                debug!(enrollment_id = %enrollment.id, status = ?sequence.status, "Sequence not active");
                break;
            }

            if let Some(reason) = sequence.exit_conditions.exit_reason(&enrollment) {
                self.finish(&enrollment.id, EnrollmentStatus::Exited, Some(reason), enrollment.current_step, now)?;
                transitions += 1;
                break;
            }

            let step = enrollment
                .current_step
                .and_then(|id| self.store.step(&id))
                .filter(|s| s.sequence_id == sequence.id);
            let Some(step) = step else {
                let err = OutreachError::DataConsistency(format!(
                    "active enrollment {} has no resolvable current step",
                    enrollment.id
                ));
                warn!(enrollment_id = %enrollment.id, error = %err, "Completing enrollment");
                self.finish(&enrollment.id, EnrollmentStatus::Completed, None, None, now)?;
                transitions += 1;
                break;
            };

            if report.hops >= self.settings.max_hops_per_tick {
                warn!(
                    enrollment_id = %enrollment.id,
                    hops = report.hops,
                    "Hop limit reached; resuming next tick"
                );
                break;
            }
            report.hops += 1;
            let window = sequence.send_window.as_ref();

            if !step.is_active {
                let next = self.store.next_active_step(&step);
                self.move_to(
                    &enrollment,
                    &step,
                    next,
                    ActivityKind::StepSkipped,
                    json!({"reason": "step_inactive"}),
                    window,
                    now,
                )?;
                transitions += 1;
                continue;
            }

            match self.executor.execute(&step, &enrollment, now).await {
                Ok(execution) => {
                    self.store.record_step_result(&step.id, true);
                    if execution.email_sent {
                        report.emails_sent += 1;
                        self.emit(EventType::EmailSent, &enrollment, Some(step.id), execution.detail.clone());
                    }

                    let (next, kind) = match execution.outcome {
                        StepOutcome::Advance | StepOutcome::Halt => {
                            (self.store.next_active_step(&step), ActivityKind::Advanced)
                        }
                        StepOutcome::Branch(target) => match self
                            .store
                            .step(&target)
                            .filter(|t| t.sequence_id == step.sequence_id)
                        {
                            Some(target) => (Some(target), ActivityKind::Branched),
                            None => {
                                warn!(step_id = %step.id, target = %target, "Branch target missing; falling through");
                                (self.store.next_active_step(&step), ActivityKind::Advanced)
                            }
                        },
                    };
                    self.move_to(&enrollment, &step, next, kind, execution.detail, window, now)?;
                    transitions += 1;
                    if execution.outcome == StepOutcome::Halt {
                        break;
                    }
                }
                Err(err) => {
                    self.store.record_step_result(&step.id, false);
                    self.record_failure(&enrollment, &step, &err, now)?;
                    report.error = Some(err.to_string());
                    break;
                }
            }
        }

        report.skipped = transitions == 0 && report.error.is_none();
        Ok(report)
    }

    /// Stops scheduling without leaving the sequence. In-flight work is
    /// allowed to finish.
    pub fn pause(&self, enrollment_id: Uuid, actor: &str) -> OutreachResult<Enrollment> {
        let (enrollment, _) = self.owned_enrollment(&enrollment_id, actor)?;
        self.machine
            .check(enrollment.status, EnrollmentStatus::Paused)?;

        let now = self.clock.now();
        let machine = &self.machine;
        let paused = self
            .store
            .update_enrollment(&enrollment_id, |e| {
                if !machine.can_transition(e.status, EnrollmentStatus::Paused) {
                    return None;
                }
                e.status = EnrollmentStatus::Paused;
                e.next_action_at = None;
                e.updated_at = now;
                Some(e.clone())
            })
            .flatten()
            .ok_or_else(|| OutreachError::Validation("enrollment is no longer active".into()))?;

        self.record(&paused, paused.current_step, ActivityKind::Paused, json!({"actor": actor}), now);
        self.emit(EventType::Paused, &paused, paused.current_step, json!({"actor": actor}));
        info!(enrollment_id = %enrollment_id, actor, "Enrollment paused");
        Ok(paused)
    }

    /// Reactivates a paused enrollment on its current step, scheduled for
    /// the next moment the send window allows.
    pub fn resume(&self, enrollment_id: Uuid, actor: &str) -> OutreachResult<Enrollment> {
        let (enrollment, sequence) = self.owned_enrollment(&enrollment_id, actor)?;
        self.machine
            .check(enrollment.status, EnrollmentStatus::Active)?;
        if enrollment.status == EnrollmentStatus::Active {
            return Err(OutreachError::Validation("enrollment is not paused".into()));
        }

        let now = self.clock.now();
        if enrollment.current_step.and_then(|id| self.store.step(&id)).is_none() {
            warn!(enrollment_id = %enrollment_id, "Paused enrollment has no step left; completing");
            return self
                .finish(&enrollment_id, EnrollmentStatus::Completed, None, None, now)?
                .ok_or_else(|| OutreachError::Validation("enrollment is no longer paused".into()));
        }

        let next_at = clamp_to_window(now, sequence.send_window.as_ref());
        let resumed = self
            .store
            .update_enrollment(&enrollment_id, |e| {
                if e.status != EnrollmentStatus::Paused {
                    return None;
                }
                e.status = EnrollmentStatus::Active;
                e.next_action_at = Some(next_at);
                e.updated_at = now;
                Some(e.clone())
            })
            .flatten()
            .ok_or_else(|| OutreachError::Validation("enrollment is no longer paused".into()))?;

        let detail = json!({"actor": actor, "next_action_at": next_at});
        self.record(&resumed, resumed.current_step, ActivityKind::Resumed, detail.clone(), now);
        self.emit(EventType::Resumed, &resumed, resumed.current_step, detail);
        info!(enrollment_id = %enrollment_id, actor, "Enrollment resumed");
        Ok(resumed)
    }

    /// Moves past the current step without running it.
    pub fn skip_step(&self, enrollment_id: Uuid, actor: &str) -> OutreachResult<Enrollment> {
        // Holding the claim keeps a concurrent advance from executing the
        // step being skipped; the enrollment is read after claiming.
        let Some(_claim) = self.store.try_claim(enrollment_id) else {
            return Err(OutreachError::Validation(format!(
                "enrollment {} is being advanced, retry the skip",
                enrollment_id
            )));
        };
        let (enrollment, sequence) = self.owned_enrollment(&enrollment_id, actor)?;
        if !enrollment.status.is_open() {
            return Err(OutreachError::Validation(format!(
                "cannot skip a step of a {:?} enrollment",
                enrollment.status
            )));
        }
        let current = enrollment
            .current_step
            .and_then(|id| self.store.step(&id))
            .ok_or_else(|| OutreachError::Validation("enrollment has no step to skip".into()))?;

        let now = self.clock.now();
        let next = self.store.next_active_step(&current);
        self.move_to(
            &enrollment,
            &current,
            next,
            ActivityKind::StepSkipped,
            json!({"actor": actor}),
            sequence.send_window.as_ref(),
            now,
        )?;
        self.store
            .enrollment(&enrollment_id)
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", enrollment_id)))
    }

    pub fn mark_converted(&self, enrollment_id: Uuid, actor: &str) -> OutreachResult<Enrollment> {
        let (enrollment, _) = self.owned_enrollment(&enrollment_id, actor)?;
        self.machine
            .check(enrollment.status, EnrollmentStatus::Converted)?;
        self.finish(
            &enrollment_id,
            EnrollmentStatus::Converted,
            None,
            enrollment.current_step,
            self.clock.now(),
        )?
        .ok_or_else(|| OutreachError::Validation("enrollment already finished".into()))
    }

    pub fn exit_enrollment(
        &self,
        enrollment_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> OutreachResult<Enrollment> {
        let (enrollment, _) = self.owned_enrollment(&enrollment_id, actor)?;
        self.machine
            .check(enrollment.status, EnrollmentStatus::Exited)?;
        self.finish(
            &enrollment_id,
            EnrollmentStatus::Exited,
            Some(reason),
            enrollment.current_step,
            self.clock.now(),
        )?
        .ok_or_else(|| OutreachError::Validation("enrollment already finished".into()))
    }

    // ------------------------------------------------------------------
    // Inbound feed
    // ------------------------------------------------------------------

    /// Applies an open/click/reply/bounce/unsubscribe callback.
    pub fn record_inbound_event(&self, event: InboundEvent) -> OutreachResult<()> {
        let enrollment = self.store.enrollment(&event.enrollment_id).ok_or_else(|| {
            OutreachError::Validation(format!("unknown enrollment {}", event.enrollment_id))
        })?;
        let variant = match event.variant_id {
            Some(id) => Some(
                self.store
                    .variant(&id)
                    .ok_or_else(|| OutreachError::Validation(format!("unknown variant {}", id)))?,
            ),
            None => None,
        };
        let step_id = event.step_id.or_else(|| variant.as_ref().map(|v| v.step_id));
        let now = event.occurred_at.unwrap_or_else(|| self.clock.now());
        let detail = json!({"variant_id": event.variant_id});

        let (kind, counter) = match event.kind {
            InboundKind::Opened => (ActivityKind::EmailOpened, Some(VariantCounter::Opened)),
            InboundKind::Clicked => (ActivityKind::EmailClicked, Some(VariantCounter::Clicked)),
            InboundKind::Replied => (ActivityKind::EmailReplied, Some(VariantCounter::Replied)),
            InboundKind::Bounced => (ActivityKind::Bounced, None),
            InboundKind::Unsubscribed => (ActivityKind::Unsubscribed, None),
        };

        if let (Some(counter), Some(variant)) = (counter, &variant) {
            self.store.increment_variant(&variant.id, counter);
        }

        match event.kind {
            InboundKind::Opened | InboundKind::Clicked | InboundKind::Replied => {
                self.store.update_enrollment(&enrollment.id, |e| match event.kind {
                    InboundKind::Opened => e.opens += 1,
                    InboundKind::Clicked => e.clicks += 1,
                    _ => e.replies += 1,
                });
                self.record(&enrollment, step_id, kind, detail, now);
            }
            InboundKind::Bounced | InboundKind::Unsubscribed => {
                let status = if event.kind == InboundKind::Bounced {
                    EnrollmentStatus::Bounced
                } else {
                    EnrollmentStatus::Unsubscribed
                };
                let finished = if enrollment.status.is_open() {
                    self.finish(&enrollment.id, status, None, step_id, now)?
                } else {
                    None
                };
                if finished.is_none() {
                    self.record(&enrollment, step_id, kind, detail, now);
                }
            }
        }

        debug!(enrollment_id = %enrollment.id, kind = ?event.kind, "Inbound event recorded");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reporting and maintenance
    // ------------------------------------------------------------------

    pub fn sequence_stats(&self, sequence_id: &Uuid) -> OutreachResult<SequenceStats> {
        let sequence = self.require_sequence(sequence_id)?;
        let mut by_status: HashMap<EnrollmentStatus, u64> = HashMap::new();
        let mut emails_sent = 0u64;
        let mut replies = 0u64;
        for enrollment in self.store.enrollments_for(sequence_id) {
            *by_status.entry(enrollment.status).or_insert(0) += 1;
            emails_sent += u64::from(enrollment.emails_sent);
            replies += u64::from(enrollment.replies);
        }
        Ok(SequenceStats {
            sequence_id: *sequence_id,
            counters: sequence.counters,
            by_status,
            emails_sent,
            replies,
        })
    }

    /// Deletes activities created before `older_than`.
    pub fn prune_activities(&self, older_than: DateTime<Utc>) -> usize {
        let removed = self.store.prune_activities(older_than);
        if removed > 0 {
            info!(removed, %older_than, "Pruned activities");
        }
        removed
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Moves an open enrollment to a terminal status. Returns `None` when
    /// the state machine does not allow the move from the stored status.
    fn finish(
        &self,
        enrollment_id: &Uuid,
        to: EnrollmentStatus,
        reason: Option<&str>,
        step_id: Option<StepId>,
        now: DateTime<Utc>,
    ) -> OutreachResult<Option<Enrollment>> {
        let (kind, event_type, counter) = match to {
            EnrollmentStatus::Completed => (
                ActivityKind::Completed,
                EventType::Completed,
                Some(SequenceCounter::Completed),
            ),
            EnrollmentStatus::Converted => (
                ActivityKind::Converted,
                EventType::Converted,
                Some(SequenceCounter::Converted),
            ),
            EnrollmentStatus::Exited => (
                ActivityKind::Exited,
                EventType::Exited,
                Some(SequenceCounter::Exited),
            ),
            EnrollmentStatus::Bounced => (ActivityKind::Bounced, EventType::Bounced, None),
            EnrollmentStatus::Unsubscribed => {
                (ActivityKind::Unsubscribed, EventType::Unsubscribed, None)
            }
            EnrollmentStatus::Active | EnrollmentStatus::Paused => {
                return Err(OutreachError::Validation(format!(
                    "{:?} is not a terminal status",
                    to
                )))
            }
        };

        let machine = &self.machine;
        let finished = self
            .store
            .update_enrollment(enrollment_id, |e| {
                if !machine.can_transition(e.status, to) {
                    return None;
                }
                e.status = to;
                e.next_action_at = None;
                if to == EnrollmentStatus::Completed {
                    e.current_step = None;
                }
                e.finished_at = Some(now);
                e.updated_at = now;
                e.exit_reason = reason.map(str::to_string);
                Some(e.clone())
            })
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", enrollment_id)))?;
        let Some(enrollment) = finished else {
            return Ok(None);
        };

        if let Some(counter) = counter {
            self.store.increment_sequence(&enrollment.sequence_id, counter);
        }
        let detail = json!({"reason": reason});
        self.record(&enrollment, step_id, kind, detail.clone(), now);
        self.emit(event_type, &enrollment, step_id, detail);
        info!(
            enrollment_id = %enrollment.id,
            status = ?to,
            reason = reason.unwrap_or(""),
            "Enrollment finished"
        );
        Ok(Some(enrollment))
    }

    /// Points the enrollment at `next`, or completes it when there is none.
    #[allow(clippy::too_many_arguments)]
    fn move_to(
        &self,
        enrollment: &Enrollment,
        from: &Step,
        next: Option<Step>,
        kind: ActivityKind,
        detail: serde_json::Value,
        window: Option<&SendWindow>,
        now: DateTime<Utc>,
    ) -> OutreachResult<()> {
        let Some(next) = next else {
            self.finish(&enrollment.id, EnrollmentStatus::Completed, None, Some(from.id), now)?;
            return Ok(());
        };

        let next_at = next_action_time(&next, window, now);
        let moved = self
            .store
            .update_enrollment(&enrollment.id, |e| {
                if !e.status.is_open() {
                    return None;
                }
                e.current_step = Some(next.id);
                e.next_action_at = (e.status == EnrollmentStatus::Active).then_some(next_at);
                e.consecutive_failures = 0;
                e.updated_at = now;
                Some(e.clone())
            })
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {}", enrollment.id)))?;
        let Some(moved) = moved else {
            return Ok(());
        };

        let detail = json!({
            "from_step": from.id,
            "to_step": next.id,
            "next_action_at": moved.next_action_at,
            "outcome": detail,
        });
        let event_type = if kind == ActivityKind::Branched {
            EventType::Branched
        } else {
            EventType::StepCompleted
        };
        self.record(&moved, Some(from.id), kind, detail.clone(), now);
        self.emit(event_type, &moved, Some(from.id), detail);
        debug!(
            enrollment_id = %moved.id,
            from = %from.name,
            to = %next.name,
            next_action_at = ?moved.next_action_at,
            "Enrollment moved"
        );
        Ok(())
    }

    /// The enrollment stays on `step` with its schedule untouched, so the
    /// next due tick retries it.
    fn record_failure(
        &self,
        enrollment: &Enrollment,
        step: &Step,
        err: &OutreachError,
        now: DateTime<Utc>,
    ) -> OutreachResult<()> {
        let failures = self
            .store
            .update_enrollment(&enrollment.id, |e| {
                e.consecutive_failures += 1;
                e.updated_at = now;
                e.consecutive_failures
            })
            .unwrap_or(0);

        let detail = json!({
            "error_kind": err.kind(),
            "message": err.to_string(),
            "recoverable": err.is_recoverable(),
            "consecutive_failures": failures,
        });
        self.record(enrollment, Some(step.id), ActivityKind::Error, detail.clone(), now);
        self.emit(EventType::StepFailed, enrollment, Some(step.id), detail);

        if err.is_recoverable() {
            warn!(enrollment_id = %enrollment.id, step_id = %step.id, error = %err, failures, "Step failed; will retry");
        } else {
            error!(enrollment_id = %enrollment.id, step_id = %step.id, error = %err, failures, "Step failed; will retry");
        }

        if let Some(cap) = self.settings.max_step_failures {
            if failures >= cap {
                self.finish(&enrollment.id, EnrollmentStatus::Exited, Some("max_failures"), Some(step.id), now)?;
            }
        }
        Ok(())
    }

    fn record(
        &self,
        enrollment: &Enrollment,
        step_id: Option<StepId>,
        kind: ActivityKind,
        detail: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        self.store.append_activity(Activity {
            id: Uuid::new_v4(),
            enrollment_id: enrollment.id,
            sequence_id: enrollment.sequence_id,
            step_id,
            kind,
            detail,
            created_at: now,
        });
    }

    pub(crate) fn emit(
        &self,
        event_type: EventType,
        enrollment: &Enrollment,
        step_id: Option<StepId>,
        detail: serde_json::Value,
    ) {
        let mut event = make_event(
            event_type,
            enrollment.sequence_id,
            Some(enrollment.id),
            Some(enrollment.contact_id.clone()),
        );
        event.timestamp = self.clock.now();
        event.step_id = step_id;
        event.node_id = self.settings.node_id.clone();
        event.detail = detail;
        self.event_sink.emit(event);
    }

    pub(crate) fn require_sequence(&self, id: &Uuid) -> OutreachResult<Sequence> {
        self.store
            .sequence(id)
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {}", id)))
    }

    pub(crate) fn require_step(&self, id: &StepId) -> OutreachResult<Step> {
        self.store
            .step(id)
            .ok_or_else(|| OutreachError::NotFound(format!("step {}", id)))
    }

    fn owned_enrollment(
        &self,
        enrollment_id: &Uuid,
        actor: &str,
    ) -> OutreachResult<(Enrollment, Sequence)> {
        let enrollment = self.store.enrollment(enrollment_id).ok_or_else(|| {
            OutreachError::Validation(format!("unknown enrollment {}", enrollment_id))
        })?;
        let sequence = self.store.sequence(&enrollment.sequence_id).ok_or_else(|| {
            OutreachError::DataConsistency(format!(
                "enrollment {} references missing sequence {}",
                enrollment_id, enrollment.sequence_id
            ))
        })?;
        authorize(&sequence, actor)?;
        Ok((enrollment, sequence))
    }
}

pub(crate) fn authorize(sequence: &Sequence, actor: &str) -> OutreachResult<()> {
    if sequence.owner_id == actor {
        Ok(())
    } else {
        Err(OutreachError::Permission(format!(
            "{} does not own sequence {}",
            actor, sequence.id
        )))
    }
}
