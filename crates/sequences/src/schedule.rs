//! Scheduling clock: when may an enrollment's next step fire?

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use parking_lot::Mutex;

use crate::types::{SendWindow, Step};

/// Source of "now", injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Earliest time `step` may run when entered at `now`.
pub fn next_action_time(
    step: &Step,
    window: Option<&SendWindow>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    clamp_to_window(now + step.wait(), window)
}

/// Moves `base` forward into the send window, if one is configured.
///
/// Before `start_hour` snaps to `start_hour` the same day; at or after
/// `end_hour` snaps to `start_hour` the next day; then whole days are added
/// until the weekday is allowed. The result is never earlier than `base`.
pub fn clamp_to_window(base: DateTime<Utc>, window: Option<&SendWindow>) -> DateTime<Utc> {
    let Some(window) = window else {
        return base;
    };
    let Some(offset) = window.offset() else {
        return base;
    };
    let shift = Duration::seconds(i64::from(offset.local_minus_utc()));
    let local: NaiveDateTime = base.naive_utc() + shift;
    let start = window.start_hour.min(23);

    let mut candidate = if local.hour() < start {
        at_hour(local, start, 0)
    } else if local.hour() >= window.end_hour {
        at_hour(local, start, 1)
    } else {
        local
    };

    for _ in 0..7 {
        if window.allows(candidate.weekday()) {
            break;
        }
        candidate += Duration::days(1);
    }

    Utc.from_utc_datetime(&(candidate - shift))
}

fn at_hour(local: NaiveDateTime, hour: u32, days_ahead: i64) -> NaiveDateTime {
    let date = local.date() + Duration::days(days_ahead);
    date.and_hms_opt(hour, 0, 0)
        .unwrap_or_else(|| date.and_time(chrono::NaiveTime::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepAction;
    use chrono::Weekday;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn wait_step(wait_secs: u64) -> Step {
        Step {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            name: "wait".into(),
            position: 0,
            wait_secs,
            is_active: true,
            action: StepAction::Wait,
            executed: 0,
            failed: 0,
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_no_window_adds_wait() {
        // Wed 2026-10-14 10:00
        let now = utc(2026, 10, 14, 10, 0);
        assert_eq!(next_action_time(&wait_step(3600), None, now), utc(2026, 10, 14, 11, 0));
    }

    #[test]
    fn test_before_start_snaps_forward_same_day() {
        let window = SendWindow::business_hours();
        let now = utc(2026, 10, 14, 6, 30);
        assert_eq!(next_action_time(&wait_step(0), Some(&window), now), utc(2026, 10, 14, 9, 0));
    }

    #[test]
    fn test_after_end_snaps_to_next_morning() {
        let window = SendWindow::business_hours();
        let now = utc(2026, 10, 14, 17, 0);
        assert_eq!(next_action_time(&wait_step(0), Some(&window), now), utc(2026, 10, 15, 9, 0));
    }

    #[test]
    fn test_weekend_rolls_to_monday() {
        let window = SendWindow::business_hours();
        // Fri 2026-10-16 16:00 + 2h lands after hours; next day is Saturday.
        let now = utc(2026, 10, 16, 16, 0);
        assert_eq!(
            next_action_time(&wait_step(7200), Some(&window), now),
            utc(2026, 10, 19, 9, 0)
        );
        // Inside hours on a Saturday keeps the time of day.
        let now = utc(2026, 10, 17, 11, 15);
        assert_eq!(
            next_action_time(&wait_step(0), Some(&window), now),
            utc(2026, 10, 19, 11, 15)
        );
    }

    #[test]
    fn test_offset_is_applied() {
        let mut window = SendWindow::business_hours();
        window.utc_offset_minutes = -300;
        // 12:00 UTC is 07:00 at UTC-5, before the window opens at 09:00 local.
        let now = utc(2026, 10, 14, 12, 0);
        assert_eq!(next_action_time(&wait_step(0), Some(&window), now), utc(2026, 10, 14, 14, 0));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(utc(2026, 1, 1, 0, 0));
        clock.advance(Duration::days(1));
        assert_eq!(clock.now(), utc(2026, 1, 2, 0, 0));
    }

    const WEEK: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];

    proptest! {
        #[test]
        fn result_always_inside_window(
            start_secs in 1_600_000_000i64..1_900_000_000i64,
            wait_secs in 0u64..(60 * 86_400),
            start_hour in 0u32..23,
            span in 1u32..24,
            days in proptest::collection::btree_set(0usize..7, 1..=7),
            offset_minutes in -720i32..=840,
        ) {
            let end_hour = (start_hour + span).min(24);
            let window = SendWindow {
                start_hour,
                end_hour,
                allowed_weekdays: days.iter().map(|d| WEEK[*d]).collect(),
                utc_offset_minutes: offset_minutes,
            };
            let now = Utc.timestamp_opt(start_secs, 0).unwrap();
            let step = wait_step(wait_secs);
            let at = next_action_time(&step, Some(&window), now);

            prop_assert!(at >= now + step.wait());
            let local = at.with_timezone(&window.offset().unwrap());
            prop_assert!(window.allows(local.weekday()));
            prop_assert!(local.hour() >= start_hour && local.hour() < end_hour);
        }
    }
}
