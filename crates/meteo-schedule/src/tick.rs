//! Tick-grid alignment shared by every periodic downloader: "fire at
//! the next multiple of `period` since the epoch, plus a phase offset
//! so the source has finished publishing for that boundary."

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration as StdDuration;

/// Next instant that is a multiple of `period` since the Unix epoch,
/// strictly after `now`, plus `phase_offset`.
pub fn next_tick(now: DateTime<Utc>, period: StdDuration, phase_offset: StdDuration) -> DateTime<Utc> {
    let period_s = period.as_secs().max(1) as i64;
    let phase_s = phase_offset.as_secs() as i64;
    let now_s = now.timestamp();
    let boundary = ((now_s - phase_s) / period_s + 1) * period_s + phase_s;
    Utc.timestamp_opt(boundary, 0).single().expect("tick boundary in range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligns_to_the_next_period_boundary_plus_phase() {
        let now = Utc.timestamp_opt(1_000, 0).unwrap();
        let period = StdDuration::from_secs(300);
        let phase = StdDuration::from_secs(120);
        let tick = next_tick(now, period, phase);
        // Boundaries at phase-offset 120 are ..., 720, 1020, 1320, ...
        assert_eq!(tick.timestamp(), 1_020);
    }

    #[test]
    fn a_tick_lands_strictly_after_now() {
        let now = Utc.timestamp_opt(1_020, 0).unwrap();
        let tick = next_tick(now, StdDuration::from_secs(300), StdDuration::from_secs(120));
        assert!(tick > now);
    }
}
