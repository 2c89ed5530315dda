//! Rollout policy and watch windows.

use std::time::Duration;

use crate::plan::spec::UpdatePolicySpec;
use crate::{DirectorError, DirectorResult};

/// Hard upper bound on `max_in_flight`.
pub const MAX_IN_FLIGHT_LIMIT: u32 = 32;

/// Shortest gap between two watch polls.
const MIN_WATCH_STEP_MS: u64 = 1000;

/// A `min-max` window in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTime {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl WatchTime {
    /// Parse `"1000"` or `"1000-5000"`.
    pub fn parse(s: &str) -> DirectorResult<Self> {
        let invalid = || DirectorError::Validation(format!("invalid watch time '{}'", s));
        let parse_ms = |part: &str| part.trim().parse::<u64>().map_err(|_| invalid());

        let (min_ms, max_ms) = match s.split_once('-') {
            Some((min, max)) => (parse_ms(min)?, parse_ms(max)?),
            None => {
                let ms = parse_ms(s)?;
                (ms, ms)
            }
        };
        if min_ms > max_ms {
            return Err(invalid());
        }
        Ok(Self { min_ms, max_ms })
    }

    /// Sleep durations for a watch window split into `intervals` polls.
    ///
    /// The first sleep is the window minimum; the rest of the window is
    /// covered in steps of at least one second.
    pub fn schedule(&self, intervals: u32) -> Vec<Duration> {
        let delta = self.max_ms - self.min_ms;
        let step = (delta / u64::from(intervals.max(1))).max(MIN_WATCH_STEP_MS);
        let steps = delta / step;

        std::iter::once(self.min_ms)
            .chain(std::iter::repeat(step).take(usize::try_from(steps).unwrap_or(usize::MAX)))
            .map(Duration::from_millis)
            .collect()
    }
}

/// Validated rollout policy for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdatePolicy {
    pub canaries: u32,
    pub max_in_flight: u32,
    pub canary_watch_time: WatchTime,
    pub update_watch_time: WatchTime,
    /// Failures tolerated in bulk updates; negative halts on the first one.
    pub max_errors: i32,
}

impl UpdatePolicy {
    pub fn from_spec(spec: &UpdatePolicySpec) -> DirectorResult<Self> {
        let missing = |field: &str| DirectorError::Validation(format!("update.{} is required", field));

        let canaries = spec.canaries.ok_or_else(|| missing("canaries"))?;
        let max_in_flight = spec.max_in_flight.ok_or_else(|| missing("max_in_flight"))?;
        if !(1..=MAX_IN_FLIGHT_LIMIT).contains(&max_in_flight) {
            return Err(DirectorError::Validation(format!(
                "update.max_in_flight must be between 1 and {}, got {}",
                MAX_IN_FLIGHT_LIMIT, max_in_flight
            )));
        }
        let canary_watch_time = WatchTime::parse(
            spec.canary_watch_time
                .as_deref()
                .ok_or_else(|| missing("canary_watch_time"))?,
        )?;
        let update_watch_time = WatchTime::parse(
            spec.update_watch_time
                .as_deref()
                .ok_or_else(|| missing("update_watch_time"))?,
        )?;

        Ok(Self {
            canaries,
            max_in_flight,
            canary_watch_time,
            update_watch_time,
            max_errors: spec.max_errors.unwrap_or(0),
        })
    }
}
