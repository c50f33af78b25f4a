// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol timing and per-endpoint engine attributes.
//!
//! The delays below are debounce windows, not protocol invariants: every one
//! of them may be zero. Writers and readers keep their timing in an
//! `arc_swap::ArcSwap` so it can be changed while the endpoint runs
//! (`update_times`), the same way runtime configuration is hot-swapped
//! elsewhere in HDDS.

#[cfg(feature = "qos-loaders")]
pub mod yaml;

use std::time::Duration;

/// Default heartbeat period (RTPS recommendation: 100ms).
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_millis(100);
/// Default delay before answering an ACKNACK with repairs.
pub const DEFAULT_NACK_RESPONSE_DELAY: Duration = Duration::from_millis(5);
/// Default window during which repeated requests for a just-sent change are ignored.
pub const DEFAULT_NACK_SUPPRESSION_DURATION: Duration = Duration::ZERO;
/// Default delay before answering a HEARTBEAT with an ACKNACK.
pub const DEFAULT_HEARTBEAT_RESPONSE_DELAY: Duration = Duration::from_millis(5);
/// Default delay of the preemptive ACKNACK sent after matching a writer.
pub const DEFAULT_INITIAL_ACKNACK_DELAY: Duration = Duration::from_millis(70);
/// Default idle time after which an incomplete fragmented sample is repaired.
pub const DEFAULT_FRAGMENT_REPAIR_DELAY: Duration = Duration::from_millis(50);
/// Default fragment size for DATA_FRAG (bytes).
pub const DEFAULT_FRAGMENT_SIZE: usize = 1024;
/// Default number of fragmented samples a reader reassembles concurrently per writer.
pub const DEFAULT_MAX_PENDING_FRAGMENTED: usize = 16;

/// Writer-side protocol timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterTimes {
    pub heartbeat_period: Duration,
    pub nack_response_delay: Duration,
    pub nack_suppression_duration: Duration,
}

impl Default for WriterTimes {
    fn default() -> Self {
        Self {
            heartbeat_period: DEFAULT_HEARTBEAT_PERIOD,
            nack_response_delay: DEFAULT_NACK_RESPONSE_DELAY,
            nack_suppression_duration: DEFAULT_NACK_SUPPRESSION_DURATION,
        }
    }
}

/// Reader-side protocol timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderTimes {
    pub heartbeat_response_delay: Duration,
    pub initial_acknack_delay: Duration,
    pub fragment_repair_delay: Duration,
}

impl Default for ReaderTimes {
    fn default() -> Self {
        Self {
            heartbeat_response_delay: DEFAULT_HEARTBEAT_RESPONSE_DELAY,
            initial_acknack_delay: DEFAULT_INITIAL_ACKNACK_DELAY,
            fragment_repair_delay: DEFAULT_FRAGMENT_REPAIR_DELAY,
        }
    }
}

/// Engine attributes of a local writer (not QoS, not on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterAttributes {
    /// Send new samples immediately instead of waiting for the ack cycle.
    pub push_mode: bool,
    /// Payloads larger than this are sent as DATA_FRAG.
    pub fragment_size: usize,
    pub times: WriterTimes,
}

impl Default for WriterAttributes {
    fn default() -> Self {
        Self {
            push_mode: true,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            times: WriterTimes::default(),
        }
    }
}

impl WriterAttributes {
    pub fn with_times(mut self, times: WriterTimes) -> Self {
        self.times = times;
        self
    }

    pub fn push_mode(mut self, enabled: bool) -> Self {
        self.push_mode = enabled;
        self
    }

    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = size;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.fragment_size == 0 || self.fragment_size > usize::from(u16::MAX) {
            return Err(format!(
                "fragment_size ({}) must be within 1..=65535",
                self.fragment_size
            ));
        }
        if self.times.heartbeat_period.is_zero() {
            return Err("heartbeat_period must be > 0".to_string());
        }
        Ok(())
    }
}

/// Engine attributes of a local reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderAttributes {
    pub times: ReaderTimes,
    pub max_pending_fragmented: usize,
}

impl Default for ReaderAttributes {
    fn default() -> Self {
        Self {
            times: ReaderTimes::default(),
            max_pending_fragmented: DEFAULT_MAX_PENDING_FRAGMENTED,
        }
    }
}

impl ReaderAttributes {
    pub fn with_times(mut self, times: ReaderTimes) -> Self {
        self.times = times;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_pending_fragmented == 0 {
            return Err("max_pending_fragmented must be > 0".to_string());
        }
        Ok(())
    }
}
