use std::time::{Duration, Instant};

use crate::scheduler::job::format_elapsed;

pub const LOADING_MESSAGE: &str = "Loading project...";
pub const EXTRA_COMPS_MESSAGE: &str = "Processing additional layer comps...";

/// Keeps a quiet render visibly alive. Once no progress has been seen for
/// `stale_after`, emits a status line each `stale_after` period until
/// progress resumes.
#[derive(Debug)]
pub struct StatusHeartbeat {
    stale_after: Duration,
    last_beat: Option<Instant>,
}

impl StatusHeartbeat {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            last_beat: None,
        }
    }

    /// Status line to show now, if any.
    ///
    /// `last_activity` is the last progress signal (or the start time) and
    /// `seen_signal` tells whether the renderer has produced any signal yet.
    pub fn poll(
        &mut self,
        now: Instant,
        started: Instant,
        last_activity: Instant,
        seen_signal: bool,
    ) -> Option<String> {
        if now.saturating_duration_since(last_activity) < self.stale_after {
            self.last_beat = None;
            return None;
        }
        if let Some(beat) = self.last_beat {
            if now.saturating_duration_since(beat) < self.stale_after {
                return None;
            }
        }
        self.last_beat = Some(now);
        let message = if seen_signal {
            EXTRA_COMPS_MESSAGE
        } else {
            LOADING_MESSAGE
        };
        let elapsed = now.saturating_duration_since(started).as_secs();
        Some(format!("{} Elapsed: {}", message, format_elapsed(elapsed)))
    }
}
