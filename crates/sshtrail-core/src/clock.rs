//! Boot-time to wall-clock translation
//!
//! The kernel stamps events with `bpf_ktime_get_ns()` (monotonic, pauses
//! across suspend). Consumers want wall-clock milliseconds. The difference
//! `CLOCK_REALTIME - CLOCK_MONOTONIC` is cached and refreshed whenever the
//! newest boot-time seen runs ahead of the cached high-water mark, which
//! re-anchors after suspend/resume.

use nix::time::{clock_gettime, ClockId};
use tracing::debug;

const NANOS_IN_A_SEC: i64 = 1_000_000_000;
const NANOS_IN_A_MILLI: i64 = 1_000_000;
const MILLIS_IN_A_SEC: i64 = 1_000;
const SECONDS_BETWEEN_RECOMPUTE: i64 = 10;

/// Cached realtime/monotonic offset. Mixing stored monotonic state with
/// wall-clock values is the bug this type exists to prevent: translation
/// happens only here, only at serialization time.
#[derive(Debug, Default)]
pub struct WallClockTranslator {
    diff_ms: Option<i64>,
    highest_boottime_ns: i64,
}

impl WallClockTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translate boot-time nanoseconds into wall-clock milliseconds.
    /// Zero stays zero (an unset end_time must not become an epoch date).
    pub fn to_wall_ms(&mut self, boottime_ns: u64) -> i64 {
        let boottime = boottime_ns as i64;

        let sec_diff = (boottime - self.highest_boottime_ns) / NANOS_IN_A_SEC;
        if self.diff_ms.is_none() || sec_diff >= SECONDS_BETWEEN_RECOMPUTE {
            if let (Ok(mono), Ok(real)) = (
                clock_gettime(ClockId::CLOCK_MONOTONIC),
                clock_gettime(ClockId::CLOCK_REALTIME),
            ) {
                let diff = (real.tv_sec() - mono.tv_sec()) * MILLIS_IN_A_SEC
                    + (real.tv_nsec() - mono.tv_nsec()) / NANOS_IN_A_MILLI;
                debug!(diff_ms = diff, "recomputed realtime/monotonic offset");
                self.diff_ms = Some(diff);
            }

            if boottime > self.highest_boottime_ns {
                self.highest_boottime_ns = boottime;
            }
        }

        if boottime == 0 {
            return 0;
        }

        boottime / NANOS_IN_A_MILLI + self.diff_ms.unwrap_or(0)
    }
}

/// `CLOCK_BOOTTIME - CLOCK_MONOTONIC` in milliseconds. Process start times
/// derived from /proc are anchored to boot time including suspend; kernel
/// probe timestamps are not, so the scanner subtracts this delta.
pub fn boottime_minus_monotonic_ms() -> i64 {
    match (
        clock_gettime(ClockId::CLOCK_BOOTTIME),
        clock_gettime(ClockId::CLOCK_MONOTONIC),
    ) {
        (Ok(boot), Ok(mono)) => {
            (boot.tv_sec() - mono.tv_sec()) * MILLIS_IN_A_SEC
                + (boot.tv_nsec() - mono.tv_nsec()) / NANOS_IN_A_MILLI
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn zero_boottime_stays_zero() {
        let mut translator = WallClockTranslator::new();
        assert_eq!(translator.to_wall_ms(0), 0);
    }

    #[test]
    fn current_monotonic_translates_to_roughly_now() {
        let mut translator = WallClockTranslator::new();
        let mono = clock_gettime(ClockId::CLOCK_MONOTONIC).unwrap();
        let mono_ns = (mono.tv_sec() as u64) * 1_000_000_000 + mono.tv_nsec() as u64;

        let wall_ms = translator.to_wall_ms(mono_ns);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;

        assert!((wall_ms - now_ms).abs() < 5_000, "{wall_ms} vs {now_ms}");
    }

    #[test]
    fn offset_is_cached_between_nearby_timestamps() {
        let mut translator = WallClockTranslator::new();
        let a = translator.to_wall_ms(1_000_000_000);
        let b = translator.to_wall_ms(2_000_000_000);
        // one second of boot time is one second of wall time under a
        // cached offset
        assert_eq!(b - a, 1_000);
    }

    #[test]
    fn boottime_delta_is_nonnegative() {
        // boot time includes suspend, so it can never trail monotonic
        assert!(boottime_minus_monotonic_ms() >= 0);
    }
}
