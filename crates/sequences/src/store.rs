//! In-memory persistence for sequences, the step graph, enrollments and
//! their activity logs.
//!
//! Every counter update is a single mutation under the map's shard lock, so
//! concurrent workers never lose increments. Lock order: when two maps are
//! touched together, `open_index` is taken before `enrollments`, and no
//! `enrollments` guard is held while `open_index` is locked.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::types::{
    AbTest, AbTestStatus, Activity, EmailVariant, Enrollment, Sequence, SequenceCounter, Step,
    StepId, Trigger, TriggerEventType, VariantCounter,
};

type ContactKey = (Uuid, String);

#[derive(Default)]
pub struct SequenceStore {
    sequences: DashMap<Uuid, Sequence>,
    steps: DashMap<StepId, Step>,
    /// Step ids per sequence, kept sorted by (position, id).
    step_order: DashMap<Uuid, Vec<(u32, StepId)>>,
    variants: DashMap<Uuid, EmailVariant>,
    step_variants: DashMap<StepId, Vec<Uuid>>,
    enrollments: DashMap<Uuid, Enrollment>,
    /// The single active/paused enrollment per (sequence, contact).
    open_index: DashMap<ContactKey, Uuid>,
    /// Every enrollment ever created per (sequence, contact).
    history: DashMap<ContactKey, Vec<Uuid>>,
    activities: DashMap<Uuid, Vec<Activity>>,
    ab_tests: DashMap<Uuid, AbTest>,
    /// Latest test started per step; only meaningful while that test runs.
    step_ab_tests: DashMap<StepId, Uuid>,
    triggers: DashMap<Uuid, Trigger>,
    claims: DashMap<Uuid, ()>,
}

impl std::fmt::Debug for SequenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceStore")
            .field("sequences", &self.sequences.len())
            .field("steps", &self.steps.len())
            .field("enrollments", &self.enrollments.len())
            .field("triggers", &self.triggers.len())
            .finish()
    }
}

/// Exclusive right to advance one enrollment; released on drop.
pub struct ClaimGuard<'a> {
    claims: &'a DashMap<Uuid, ()>,
    id: Uuid,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.id);
    }
}

impl SequenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Sequences
    // ------------------------------------------------------------------

    pub fn insert_sequence(&self, sequence: Sequence) {
        self.sequences.insert(sequence.id, sequence);
    }

    pub fn sequence(&self, id: &Uuid) -> Option<Sequence> {
        self.sequences.get(id).map(|s| s.clone())
    }

    pub fn list_sequences(&self) -> Vec<Sequence> {
        self.sequences.iter().map(|s| s.value().clone()).collect()
    }

    pub fn update_sequence<R>(&self, id: &Uuid, f: impl FnOnce(&mut Sequence) -> R) -> Option<R> {
        self.sequences.get_mut(id).map(|mut s| f(&mut s))
    }

    pub fn increment_sequence(&self, id: &Uuid, counter: SequenceCounter) {
        if let Some(mut sequence) = self.sequences.get_mut(id) {
            let counters = &mut sequence.counters;
            match counter {
                SequenceCounter::Enrolled => counters.enrolled += 1,
                SequenceCounter::Completed => counters.completed += 1,
                SequenceCounter::Converted => counters.converted += 1,
                SequenceCounter::Exited => counters.exited += 1,
            }
        }
    }

    // ------------------------------------------------------------------
    // Step graph
    // ------------------------------------------------------------------

    pub fn insert_step(&self, step: Step) {
        let mut order = self.step_order.entry(step.sequence_id).or_default();
        order.retain(|(_, id)| *id != step.id);
        order.push((step.position, step.id));
        order.sort();
        drop(order);
        self.steps.insert(step.id, step);
    }

    pub fn step(&self, id: &StepId) -> Option<Step> {
        self.steps.get(id).map(|s| s.clone())
    }

    pub fn update_step<R>(&self, id: &StepId, f: impl FnOnce(&mut Step) -> R) -> Option<R> {
        self.steps.get_mut(id).map(|mut s| f(&mut s))
    }

    /// All steps of a sequence in traversal order.
    pub fn steps_for(&self, sequence_id: &Uuid) -> Vec<Step> {
        let ids: Vec<StepId> = self
            .step_order
            .get(sequence_id)
            .map(|order| order.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.step(id)).collect()
    }

    pub fn step_ids_for(&self, sequence_id: &Uuid) -> HashSet<StepId> {
        self.step_order
            .get(sequence_id)
            .map(|order| order.iter().map(|(_, id)| *id).collect())
            .unwrap_or_default()
    }

    pub fn first_active_step(&self, sequence_id: &Uuid) -> Option<Step> {
        self.steps_for(sequence_id).into_iter().find(|s| s.is_active)
    }

    /// The next active step after `step` in (position, id) order.
    pub fn next_active_step(&self, step: &Step) -> Option<Step> {
        let key = (step.position, step.id);
        self.steps_for(&step.sequence_id)
            .into_iter()
            .find(|s| s.is_active && (s.position, s.id) > key)
    }

    pub fn record_step_result(&self, id: &StepId, succeeded: bool) {
        if let Some(mut step) = self.steps.get_mut(id) {
            if succeeded {
                step.executed += 1;
            } else {
                step.failed += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Variants
    // ------------------------------------------------------------------

    pub fn insert_variant(&self, variant: EmailVariant) {
        let mut ids = self.step_variants.entry(variant.step_id).or_default();
        if !ids.contains(&variant.id) {
            ids.push(variant.id);
        }
        drop(ids);
        self.variants.insert(variant.id, variant);
    }

    pub fn variant(&self, id: &Uuid) -> Option<EmailVariant> {
        self.variants.get(id).map(|v| v.clone())
    }

    /// Variants of a step in insertion order.
    pub fn variants_for_step(&self, step_id: &StepId) -> Vec<EmailVariant> {
        let ids: Vec<Uuid> = self
            .step_variants
            .get(step_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.variant(id)).collect()
    }

    pub fn increment_variant(&self, id: &Uuid, counter: VariantCounter) {
        if let Some(mut variant) = self.variants.get_mut(id) {
            let counters = &mut variant.counters;
            match counter {
                VariantCounter::Sent => counters.sent += 1,
                VariantCounter::Opened => counters.opened += 1,
                VariantCounter::Clicked => counters.clicked += 1,
                VariantCounter::Replied => counters.replied += 1,
            }
        }
    }

    /// Locks in `winner_id`: weight 100 and the winner flag for it, weight 0
    /// for every sibling.
    pub fn declare_winner(&self, step_id: &StepId, winner_id: &Uuid) {
        let ids: Vec<Uuid> = self
            .step_variants
            .get(step_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(mut variant) = self.variants.get_mut(&id) {
                let is_winner = id == *winner_id;
                variant.is_winner = is_winner;
                variant.weight = if is_winner { 100 } else { 0 };
            }
        }
    }

    /// Clears any winner and gives every variant of the step `weight`.
    pub fn reset_variant_weights(&self, step_id: &StepId, weight: u32) {
        let ids: Vec<Uuid> = self
            .step_variants
            .get(step_id)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids {
            if let Some(mut variant) = self.variants.get_mut(&id) {
                variant.is_winner = false;
                variant.weight = weight;
            }
        }
    }

    // ------------------------------------------------------------------
    // Enrollments
    // ------------------------------------------------------------------

    /// Inserts `enrollment` unless an active/paused one already exists for
    /// the same (sequence, contact); returns the stored row and whether it
    /// was newly created.
    pub fn insert_enrollment_unique(&self, enrollment: Enrollment) -> (Enrollment, bool) {
        let key = (enrollment.sequence_id, enrollment.contact_id.clone());
        match self.open_index.entry(key.clone()) {
            Entry::Occupied(mut slot) => {
                let existing = self
                    .enrollments
                    .get(slot.get())
                    .map(|e| e.clone())
                    .filter(|e| e.status.is_open());
                if let Some(existing) = existing {
                    return (existing, false);
                }
                slot.insert(enrollment.id);
                self.enrollments.insert(enrollment.id, enrollment.clone());
            }
            Entry::Vacant(slot) => {
                slot.insert(enrollment.id);
                self.enrollments.insert(enrollment.id, enrollment.clone());
            }
        }
        self.history.entry(key).or_default().push(enrollment.id);
        (enrollment, true)
    }

    pub fn enrollment(&self, id: &Uuid) -> Option<Enrollment> {
        self.enrollments.get(id).map(|e| e.clone())
    }

    pub fn open_enrollment(&self, sequence_id: &Uuid, contact_id: &str) -> Option<Enrollment> {
        let id = self
            .open_index
            .get(&(*sequence_id, contact_id.to_string()))
            .map(|id| *id)?;
        self.enrollment(&id).filter(|e| e.status.is_open())
    }

    /// Whether the contact was ever enrolled in the sequence, in any status.
    pub fn has_any_enrollment(&self, sequence_id: &Uuid, contact_id: &str) -> bool {
        self.history
            .get(&(*sequence_id, contact_id.to_string()))
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Applies `f` to the stored enrollment. A transition out of
    /// active/paused frees the (sequence, contact) slot.
    pub fn update_enrollment<R>(
        &self,
        id: &Uuid,
        f: impl FnOnce(&mut Enrollment) -> R,
    ) -> Option<R> {
        let (result, released) = {
            let mut entry = self.enrollments.get_mut(id)?;
            let was_open = entry.status.is_open();
            let result = f(&mut entry);
            let released = (was_open && entry.status.is_terminal())
                .then(|| (entry.sequence_id, entry.contact_id.clone()));
            (result, released)
        };
        if let Some(key) = released {
            self.open_index.remove_if(&key, |_, open_id| open_id == id);
        }
        Some(result)
    }

    /// Ids of active enrollments whose `next_action_at` has passed, oldest
    /// first, at most `limit`.
    pub fn due_enrollments(&self, now: DateTime<Utc>, limit: usize) -> Vec<Uuid> {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = self
            .enrollments
            .iter()
            .filter(|e| e.is_due(now))
            .filter_map(|e| e.next_action_at.map(|at| (at, e.id)))
            .collect();
        due.sort();
        due.truncate(limit);
        due.into_iter().map(|(_, id)| id).collect()
    }

    pub fn enrollments_for(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        self.enrollments
            .iter()
            .filter(|e| e.sequence_id == *sequence_id)
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn try_claim(&self, id: Uuid) -> Option<ClaimGuard<'_>> {
        match self.claims.entry(id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(ClaimGuard {
                    claims: &self.claims,
                    id,
                })
            }
        }
    }

    // ------------------------------------------------------------------
    // Activity log
    // ------------------------------------------------------------------

    pub fn append_activity(&self, activity: Activity) {
        self.activities
            .entry(activity.enrollment_id)
            .or_default()
            .push(activity);
    }

    pub fn activities_for(&self, enrollment_id: &Uuid) -> Vec<Activity> {
        self.activities
            .get(enrollment_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Retention pruning: drops activities created before `cutoff`.
    pub fn prune_activities(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut log in self.activities.iter_mut() {
            let before = log.len();
            log.retain(|a| a.created_at >= cutoff);
            removed += before - log.len();
        }
        self.activities.retain(|_, log| !log.is_empty());
        removed
    }

    // ------------------------------------------------------------------
    // A/B tests
    // ------------------------------------------------------------------

    /// Stores a new running test unless the step already has one running.
    /// The check and the insert happen under the step's index entry, so two
    /// concurrent creates on one step cannot both succeed.
    pub fn try_insert_running_ab_test(&self, test: AbTest) -> bool {
        match self.step_ab_tests.entry(test.step_id) {
            Entry::Occupied(mut slot) => {
                let busy = self
                    .ab_tests
                    .get(slot.get())
                    .is_some_and(|t| t.status == AbTestStatus::Running);
                if busy {
                    return false;
                }
                slot.insert(test.id);
            }
            Entry::Vacant(slot) => {
                slot.insert(test.id);
            }
        }
        self.ab_tests.insert(test.id, test);
        true
    }

    pub fn ab_test(&self, id: &Uuid) -> Option<AbTest> {
        self.ab_tests.get(id).map(|t| t.clone())
    }

    pub fn running_ab_test_for_step(&self, step_id: &StepId) -> Option<AbTest> {
        let test_id = *self.step_ab_tests.get(step_id)?;
        self.ab_test(&test_id).filter(|t| t.status == AbTestStatus::Running)
    }

    pub fn running_ab_tests(&self) -> Vec<Uuid> {
        self.ab_tests
            .iter()
            .filter(|t| t.status == AbTestStatus::Running)
            .map(|t| t.id)
            .collect()
    }

    pub fn update_ab_test<R>(&self, id: &Uuid, f: impl FnOnce(&mut AbTest) -> R) -> Option<R> {
        self.ab_tests.get_mut(id).map(|mut t| f(&mut t))
    }

    // ------------------------------------------------------------------
    // Triggers
    // ------------------------------------------------------------------

    pub fn insert_trigger(&self, trigger: Trigger) {
        self.triggers.insert(trigger.id, trigger);
    }

    pub fn trigger(&self, id: &Uuid) -> Option<Trigger> {
        self.triggers.get(id).map(|t| t.clone())
    }

    /// Active triggers listening for `event_type`.
    pub fn triggers_for(&self, event_type: TriggerEventType) -> Vec<Trigger> {
        self.triggers
            .iter()
            .filter(|t| t.is_active && t.rule.event_type() == event_type)
            .map(|t| t.value().clone())
            .collect()
    }

    pub fn update_trigger<R>(&self, id: &Uuid, f: impl FnOnce(&mut Trigger) -> R) -> Option<R> {
        self.triggers.get_mut(id).map(|mut t| f(&mut t))
    }

    pub fn increment_trigger(&self, id: &Uuid, enrolled: bool) {
        if let Some(mut trigger) = self.triggers.get_mut(id) {
            trigger.total_triggered += 1;
            if enrolled {
                trigger.total_enrolled += 1;
            }
        }
    }
}
