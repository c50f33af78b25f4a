// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Quality of Service (QoS) policies for reliable endpoints
//!
//! Only the policies that shape the reliable-delivery engine live here:
//! reliability, durability, history, resource limits, memory policy,
//! deadline, lifespan and liveliness lease.
//!
//! # Examples
//!
//! ```
//! use hdds_reliable::qos::{History, WriterQos};
//!
//! let qos = WriterQos::reliable().keep_all().max_samples(10);
//! assert_eq!(qos.history, History::KeepAll);
//! assert!(qos.validate().is_ok());
//! ```

pub mod deadline;
pub mod lifespan;

use std::time::Duration;

pub use deadline::Deadline;
pub use lifespan::Lifespan;

/// "No limit" sentinel for [`ResourceLimits`] fields.
pub const LENGTH_UNLIMITED: usize = usize::MAX;

/// Reliability policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Reliability {
    /// Fire-and-forget (no ACKs, no retransmission)
    #[default]
    BestEffort,
    /// Reliable delivery with ACKNACK-driven retransmission
    Reliable,
}

/// Durability policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Durability {
    /// Late joiners only see samples written after the match.
    #[default]
    Volatile,
    /// Writer replays its history to late-joining readers.
    TransientLocal,
}

/// History policy
///
/// Also the admission/eviction policy tag consumed by
/// [`crate::reliability::history::admission_decision`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum History {
    /// Keep last N samples per instance (oldest replaced).
    KeepLast(u32),
    /// Keep all samples within resource limits; inserts fail once full.
    KeepAll,
}

impl Default for History {
    fn default() -> Self {
        Self::KeepLast(10)
    }
}

/// Resource limits for a history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum total samples across all instances
    pub max_samples: usize,
    /// Maximum instances
    pub max_instances: usize,
    /// Maximum samples per instance
    pub max_samples_per_instance: usize,
    /// Maximum total payload bytes held by the history
    pub max_quota_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_samples: 5000,
            max_instances: 10,
            max_samples_per_instance: 400,
            max_quota_bytes: 100_000_000,
        }
    }
}

impl ResourceLimits {
    /// All limits set to [`LENGTH_UNLIMITED`].
    pub fn unlimited() -> Self {
        Self {
            max_samples: LENGTH_UNLIMITED,
            max_instances: LENGTH_UNLIMITED,
            max_samples_per_instance: LENGTH_UNLIMITED,
            max_quota_bytes: LENGTH_UNLIMITED,
        }
    }
}

/// How sample payload storage is provisioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MemoryPolicy {
    /// Fixed-size payload slots: payloads above `payload_max` are rejected.
    Preallocated { payload_max: usize },
    /// Slots are preallocated but may grow for larger payloads.
    PreallocatedWithRealloc,
    /// Allocate per sample.
    #[default]
    Dynamic,
}

impl MemoryPolicy {
    /// Largest payload accepted, if bounded.
    pub fn payload_limit(&self) -> Option<usize> {
        match self {
            MemoryPolicy::Preallocated { payload_max } => Some(*payload_max),
            MemoryPolicy::PreallocatedWithRealloc | MemoryPolicy::Dynamic => None,
        }
    }
}

// ============================================================================
// Writer QoS
// ============================================================================

/// QoS for a writer endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WriterQos {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history: History,
    pub resource_limits: ResourceLimits,
    pub memory_policy: MemoryPolicy,
    pub deadline: Deadline,
    pub lifespan: Lifespan,
    /// `None`: a full KEEP_ALL history rejects immediately.
    /// `Some(t)`: `write()` blocks up to `t` waiting for acknowledgements.
    pub max_blocking_time: Option<Duration>,
}

impl Default for WriterQos {
    fn default() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            history: History::default(),
            resource_limits: ResourceLimits::default(),
            memory_policy: MemoryPolicy::default(),
            deadline: Deadline::infinite(),
            lifespan: Lifespan::infinite(),
            max_blocking_time: None,
        }
    }
}

impl WriterQos {
    /// Reliable writer, KEEP_LAST(10), volatile.
    pub fn reliable() -> Self {
        Self {
            reliability: Reliability::Reliable,
            ..Self::default()
        }
    }

    /// Best-effort writer, KEEP_LAST(10), volatile.
    pub fn best_effort() -> Self {
        Self::default()
    }

    pub fn keep_last(mut self, depth: u32) -> Self {
        self.history = History::KeepLast(depth);
        self
    }

    pub fn keep_all(mut self) -> Self {
        self.history = History::KeepAll;
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }

    pub fn max_samples(mut self, max: usize) -> Self {
        self.resource_limits.max_samples = max;
        self.resource_limits.max_samples_per_instance =
            self.resource_limits.max_samples_per_instance.min(max);
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = policy;
        self
    }

    pub fn deadline(mut self, period: Duration) -> Self {
        self.deadline = Deadline::new(period);
        self
    }

    pub fn lifespan(mut self, duration: Duration) -> Self {
        self.lifespan = Lifespan::new(duration);
        self
    }

    /// Enable blocking writes when the KEEP_ALL history is full.
    pub fn blocking(mut self, max_blocking_time: Duration) -> Self {
        self.max_blocking_time = Some(max_blocking_time);
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    /// Validate policy consistency.
    pub fn validate(&self) -> Result<(), String> {
        validate_history(self.history, &self.resource_limits)
    }
}

// ============================================================================
// Reader QoS
// ============================================================================

/// QoS for a reader endpoint.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReaderQos {
    pub reliability: Reliability,
    pub durability: Durability,
    pub history: History,
    pub resource_limits: ResourceLimits,
    pub memory_policy: MemoryPolicy,
    pub deadline: Deadline,
    pub lifespan: Lifespan,
    /// Expected liveliness lease of matched writers (`None`: not tracked).
    pub liveliness_lease: Option<Duration>,
}

impl Default for ReaderQos {
    fn default() -> Self {
        Self {
            reliability: Reliability::BestEffort,
            durability: Durability::Volatile,
            history: History::default(),
            resource_limits: ResourceLimits::default(),
            memory_policy: MemoryPolicy::default(),
            deadline: Deadline::infinite(),
            lifespan: Lifespan::infinite(),
            liveliness_lease: None,
        }
    }
}

impl ReaderQos {
    pub fn reliable() -> Self {
        Self {
            reliability: Reliability::Reliable,
            ..Self::default()
        }
    }

    pub fn best_effort() -> Self {
        Self::default()
    }

    pub fn keep_last(mut self, depth: u32) -> Self {
        self.history = History::KeepLast(depth);
        self
    }

    pub fn keep_all(mut self) -> Self {
        self.history = History::KeepAll;
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }

    pub fn max_samples(mut self, max: usize) -> Self {
        self.resource_limits.max_samples = max;
        self.resource_limits.max_samples_per_instance =
            self.resource_limits.max_samples_per_instance.min(max);
        self
    }

    pub fn resource_limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn memory_policy(mut self, policy: MemoryPolicy) -> Self {
        self.memory_policy = policy;
        self
    }

    pub fn deadline(mut self, period: Duration) -> Self {
        self.deadline = Deadline::new(period);
        self
    }

    pub fn lifespan(mut self, duration: Duration) -> Self {
        self.lifespan = Lifespan::new(duration);
        self
    }

    pub fn liveliness_lease(mut self, lease: Duration) -> Self {
        self.liveliness_lease = Some(lease);
        self
    }

    pub fn is_reliable(&self) -> bool {
        self.reliability == Reliability::Reliable
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_history(self.history, &self.resource_limits)
    }
}

fn validate_history(history: History, limits: &ResourceLimits) -> Result<(), String> {
    if limits.max_samples == 0 {
        return Err("ResourceLimits.max_samples must be > 0".to_string());
    }
    if limits.max_instances == 0 || limits.max_samples_per_instance == 0 {
        return Err(
            "ResourceLimits.max_instances and max_samples_per_instance must be > 0".to_string(),
        );
    }
    if limits.max_samples_per_instance > limits.max_samples {
        return Err(format!(
            "max_samples_per_instance ({}) must be <= max_samples ({})",
            limits.max_samples_per_instance, limits.max_samples
        ));
    }
    match history {
        History::KeepLast(0) => Err("History::KeepLast(n) requires n > 0".to_string()),
        History::KeepLast(depth) if depth as usize > limits.max_samples_per_instance => {
            Err(format!(
                "History::KeepLast({}) exceeds max_samples_per_instance ({})",
                depth, limits.max_samples_per_instance
            ))
        }
        History::KeepLast(_) | History::KeepAll => Ok(()),
    }
}
