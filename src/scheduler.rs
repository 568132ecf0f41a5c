//! Wall-clock aligned tick scheduling
//!
//! Ticks fall on multiples of the interval past the hour. Waiting is done by
//! polling the wall clock with coarse sleeps, so a tick may start up to one
//! poll granularity late, and clock adjustments are noticed at the next poll.

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Timelike};
use std::time::Duration;

/// Smallest aligned instant strictly after `now`.
///
/// `now` is truncated to the interval with seconds and sub-seconds zeroed,
/// then advanced by one interval. `interval_minutes` is expected to divide 60.
pub fn next_boundary<Tz: TimeZone>(interval_minutes: u32, now: &DateTime<Tz>) -> DateTime<Tz> {
    let interval = i64::from(interval_minutes.max(1));
    let into_interval = i64::from(now.minute()) % interval;
    let truncated = now.clone()
        - ChronoDuration::minutes(into_interval)
        - ChronoDuration::seconds(i64::from(now.second()))
        - ChronoDuration::nanoseconds(i64::from(now.nanosecond()));
    truncated + ChronoDuration::minutes(interval)
}

/// Source of wall-clock time
pub trait Clock {
    fn now(&self) -> DateTime<Local>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Sleep until the clock reaches `instant`, re-checking every `granularity`
pub async fn wait_until<C: Clock>(clock: &C, instant: DateTime<Local>, granularity: Duration) {
    loop {
        let remaining = match (instant - clock.now()).to_std() {
            // negative deltas fail to convert: the instant has passed
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };
        let nap = remaining.min(granularity);
        tracing::trace!(?nap, "waiting for tick");
        tokio::time::sleep(nap).await;
    }
}

/// Produces one tick per interval, forever
#[derive(Debug)]
pub struct Scheduler<C = SystemClock> {
    clock: C,
    interval_minutes: u32,
    granularity: Duration,
}

impl Scheduler<SystemClock> {
    pub fn new(interval_minutes: u32, granularity: Duration) -> Self {
        Self::with_clock(SystemClock, interval_minutes, granularity)
    }
}

impl<C: Clock> Scheduler<C> {
    pub fn with_clock(clock: C, interval_minutes: u32, granularity: Duration) -> Self {
        Self {
            clock,
            interval_minutes,
            granularity,
        }
    }

    /// The instant the next call to `next_tick` will wait for
    pub fn upcoming(&self) -> DateTime<Local> {
        next_boundary(self.interval_minutes, &self.clock.now())
    }

    /// How long until the upcoming boundary
    pub fn time_to_next(&self) -> Duration {
        let now = self.clock.now();
        (next_boundary(self.interval_minutes, &now) - now)
            .to_std()
            .unwrap_or_default()
    }

    /// Wait for the next aligned boundary and return it
    pub async fn next_tick(&self) -> DateTime<Local> {
        let tick = self.upcoming();
        wait_until(&self.clock, tick, self.granularity).await;
        tick
    }
}
