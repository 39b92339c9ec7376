//! When heartbeat updates (and reset scans) fire.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;

/// A recurring schedule: either a cron expression or a fixed interval.
///
/// Cron expressions use the six-field form with seconds first, e.g.
/// `"*/30 * * * * *"` for every thirty seconds.
#[derive(Debug, Clone)]
pub enum HeartBeatSchedule {
    Cron(Box<Schedule>),
    Interval(Duration),
}

impl HeartBeatSchedule {
    pub fn interval(every: Duration) -> Self {
        HeartBeatSchedule::Interval(every)
    }

    /// Time from `now` until the next firing, or `None` if the schedule has
    /// no more firings.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            HeartBeatSchedule::Interval(every) => Some(*every),
            HeartBeatSchedule::Cron(schedule) => schedule
                .after(&now)
                .next()
                .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

impl FromStr for HeartBeatSchedule {
    type Err = Error;

    fn from_str(expr: &str) -> Result<Self> {
        Schedule::from_str(expr)
            .map(|schedule| HeartBeatSchedule::Cron(Box::new(schedule)))
            .map_err(|e| Error::Schedule {
                expr: expr.to_string(),
                message: e.to_string(),
            })
    }
}
