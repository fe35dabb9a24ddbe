//! §4.6 step 1: a cached-time ring, so the hot path reads wall-clock time
//! without a syscall per connection.
//!
//! A fixed number of slots hold `(monotonic_ms, formatted string)` pairs.
//! Exactly one slot is "current"; updating advances to the next slot and
//! writes into it, so a reader racing an update either sees the old or the
//! new value, never a half-written one — nginx's own `ngx_time.c` comment
//! calls this out explicitly and this ring is grounded on that technique.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const NGX_TIME_SLOTS: usize = 64;

#[derive(Clone)]
struct Slot {
    unix_ms: u64,
    formatted: String,
}

impl Default for Slot {
    fn default() -> Slot {
        Slot {
            unix_ms: 0,
            formatted: String::new(),
        }
    }
}

/// The ring itself. `current` is the index of the most recently published
/// slot; readers only ever read through it, never through an index they
/// compute themselves, so a torn update is never observed.
pub struct TimeRing {
    slots: Vec<Slot>,
    current: AtomicUsize,
}

impl TimeRing {
    pub fn new() -> TimeRing {
        let mut ring = TimeRing {
            slots: vec![Slot::default(); NGX_TIME_SLOTS],
            current: AtomicUsize::new(0),
        };
        ring.update();
        ring
    }

    fn now_unix_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Advance to the next slot and stamp it with the current time. Called
    /// once per event-loop iteration (§4.6 step 1), never from within a
    /// signal handler despite nginx's own cached-time update historically
    /// being signal-driven — this crate drives it from the loop body only.
    pub fn update(&mut self) {
        let unix_ms = Self::now_unix_ms();
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.slots.len();
        self.slots[next] = Slot {
            unix_ms,
            formatted: format_http_date(unix_ms),
        };
        self.current.store(next, Ordering::Release);
    }

    pub fn unix_ms(&self) -> u64 {
        self.slots[self.current.load(Ordering::Acquire)].unix_ms
    }

    pub fn formatted(&self) -> &str {
        &self.slots[self.current.load(Ordering::Acquire)].formatted
    }
}

impl Default for TimeRing {
    fn default() -> TimeRing {
        TimeRing::new()
    }
}

/// A minimal RFC 7231 `HTTP-date` formatter (`Sun, 06 Nov 1994 08:49:37 GMT`)
/// — good enough for a `Date:` response header without pulling in a
/// dedicated calendar crate for one format string.
fn format_http_date(unix_ms: u64) -> String {
    const DAYS: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = (unix_ms / 1000) as i64;
    let days_since_epoch = secs.div_euclid(86_400);
    let secs_of_day = secs.rem_euclid(86_400);

    let weekday = DAYS[(((days_since_epoch % 7) + 11) % 7) as usize];

    let (year, month, day) = civil_from_days(days_since_epoch);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;

    format!(
        "{weekday}, {day:02} {month} {year} {hour:02}:{minute:02}:{second:02} GMT",
        month = MONTHS[(month - 1) as usize]
    )
}

/// Howard Hinnant's `civil_from_days` algorithm: days-since-epoch to
/// (year, month, day), valid over the full `i64` range without floating
/// point.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_epoch_formats_correctly() {
        assert_eq!(format_http_date(0), "Thu, 01 Jan 1970 00:00:00 GMT");
    }

    #[test]
    fn update_advances_through_slots_without_panicking() {
        let mut ring = TimeRing::new();
        let first = ring.unix_ms();
        for _ in 0..(NGX_TIME_SLOTS * 2) {
            ring.update();
        }
        assert!(ring.unix_ms() >= first);
        assert!(!ring.formatted().is_empty());
    }
}
