// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DEADLINE QoS policy (DDS v1.4 Sec.2.2.3.7)
//!
//! Longest silence tolerated per instance. Writers raise
//! `OfferedDeadlineMissed`, readers `RequestedDeadlineMissed`; the history's
//! deadline index does the per-instance bookkeeping.

use std::time::Duration;

/// DEADLINE QoS policy. Default: infinite (not enforced).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub period: Duration,
}

impl Default for Deadline {
    fn default() -> Self {
        Self::infinite()
    }
}

impl Deadline {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }

    pub fn infinite() -> Self {
        Self {
            period: Duration::MAX,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.period == Duration::MAX
    }

    /// Period to enforce, `None` when infinite.
    pub fn enforced_period(&self) -> Option<Duration> {
        (!self.is_infinite()).then_some(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_default_not_enforced() {
        assert!(Deadline::default().is_infinite());
        assert_eq!(Deadline::default().enforced_period(), None);
    }

    #[test]
    fn test_deadline_enforced_period() {
        let deadline = Deadline::new(Duration::from_millis(50));
        assert_eq!(deadline.enforced_period(), Some(Duration::from_millis(50)));
    }
}
