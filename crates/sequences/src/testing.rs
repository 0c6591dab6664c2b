//! Deterministic wiring for tests: a manual clock, a seeded random source,
//! in-memory collaborators and a capturing event sink.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use outreach_core::config::TimeoutConfig;
use outreach_core::event_bus::CaptureSink;
use outreach_core::OutreachResult;

use crate::collaborators::ContactRecord;
use crate::engine::SequenceEngine;
use crate::memory::InMemoryBackends;
use crate::schedule::ManualClock;
use crate::types::{NewSequence, Sequence};

pub const FIXTURE_SEED: u64 = 42;

pub struct Fixture {
    pub engine: SequenceEngine,
    pub clock: Arc<ManualClock>,
    pub backends: InMemoryBackends,
    pub events: Arc<CaptureSink>,
}

/// Wednesday 2026-10-14 10:00 UTC, inside business hours.
pub fn fixture_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 14, 10, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn fixture() -> Fixture {
    let clock = Arc::new(ManualClock::new(fixture_start()));
    let backends = InMemoryBackends::new();
    let events = Arc::new(CaptureSink::new());
    let engine = SequenceEngine::new(backends.collaborators(TimeoutConfig::default()))
        .with_clock(clock.clone())
        .with_event_sink(events.clone())
        .with_rng_seed(FIXTURE_SEED);
    Fixture {
        engine,
        clock,
        backends,
        events,
    }
}

impl Fixture {
    /// Adds a contact with an email address and first name.
    pub fn contact(&self, id: &str, first_name: &str) -> ContactRecord {
        let mut contact = ContactRecord::new(id, format!("{}@example.com", id));
        contact.first_name = Some(first_name.to_string());
        contact.company = Some("Acme".to_string());
        self.backends.contacts.upsert(contact.clone());
        contact
    }

    /// A draft sequence without send window owned by `owner`.
    pub fn draft(&self, owner: &str) -> OutreachResult<Sequence> {
        self.engine.create_sequence(NewSequence {
            name: "Test sequence".into(),
            owner_id: owner.into(),
            ..Default::default()
        })
    }
}
