// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
use tracing::{info, warn};

/// Default priority for the streaming thread when none is configured.
const DEFAULT_STREAM_THREAD_PRIORITY: u8 = 70;

/// Priority the streaming thread asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPriority {
    /// Crossplatform priority, 0-99.
    pub priority: u8,
    /// Attempt SCHED_FIFO on unix.
    pub realtime: bool,
}

impl StreamPriority {
    /// Builds a priority from a configured 0-99 value. Out of range values fall back
    /// to the default.
    pub fn new(configured: Option<u8>, realtime: bool) -> StreamPriority {
        let priority = configured
            .filter(|n| *n < 100)
            .unwrap_or(DEFAULT_STREAM_THREAD_PRIORITY);
        StreamPriority { priority, realtime }
    }
}

impl Default for StreamPriority {
    fn default() -> Self {
        StreamPriority::new(None, false)
    }
}

/// Raises the priority of the calling thread. Failures are logged and otherwise
/// ignored; streaming still works at normal priority.
pub fn configure_stream_thread_priority(priority: StreamPriority) {
    let value = match ThreadPriorityValue::try_from(priority.priority) {
        Ok(value) => value,
        Err(e) => {
            warn!(priority = priority.priority, error = ?e, "Invalid streaming thread priority");
            return;
        }
    };
    let tp = ThreadPriority::Crossplatform(value);
    if let Err(e) = set_current_thread_priority(tp) {
        warn!(error = ?e, "Failed to raise streaming thread priority");
    }

    #[cfg(unix)]
    if priority.realtime {
        use thread_priority::unix::{
            set_thread_priority_and_policy, thread_native_id, RealtimeThreadSchedulePolicy,
            ThreadSchedulePolicy,
        };
        let tid = thread_native_id();
        match set_thread_priority_and_policy(
            tid,
            tp,
            ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
        ) {
            Ok(()) => {
                info!("Enabled RT SCHED_FIFO for streaming thread");
            }
            Err(e) => {
                warn!(
                    error = %e,
                    "Failed to set RT SCHED_FIFO for streaming thread"
                );
            }
        }
    }
}
