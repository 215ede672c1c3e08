//! Run timing.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Wall-clock bounds of one analysis run and how it ended.
#[derive(Debug, Clone, Default)]
pub struct TimeTracker {
    started: Option<(DateTime<Utc>, Instant)>,
    finished: Option<(DateTime<Utc>, Instant)>,
    interrupted: bool,
}

/// Serializable summary of a [`TimeTracker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSummary {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u128>,
    pub interrupted: bool,
}

impl TimeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started = Some((Utc::now(), Instant::now()));
        self.finished = None;
        self.interrupted = false;
    }

    pub fn stop(&mut self, interrupted: bool) {
        self.finished = Some((Utc::now(), Instant::now()));
        self.interrupted = interrupted;
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started.map(|(wall, _)| wall)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished.map(|(wall, _)| wall)
    }

    /// Elapsed time between start and stop, `None` until both happened.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started, self.finished) {
            (Some((_, start)), Some((_, end))) => Some(end.saturating_duration_since(start)),
            _ => None,
        }
    }

    /// Whether the run ended through a stop request.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    pub fn summary(&self) -> TimingSummary {
        TimingSummary {
            started_at: self.started_at(),
            finished_at: self.finished_at(),
            duration_ms: self.duration().map(|d| d.as_millis()),
            interrupted: self.interrupted,
        }
    }
}
