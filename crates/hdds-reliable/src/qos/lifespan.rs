// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! LIFESPAN QoS policy (DDS v1.4 Sec.2.2.3.9)
//!
//! Maximum duration a sample remains valid. Expired samples are purged from
//! the writer history (readers then receive GAP for them) and from the reader
//! history before the application takes them.
//!
//! - **DEADLINE**: time BETWEEN samples
//! - **LIFESPAN**: time FOR a sample

use std::time::{Duration, Instant, SystemTime};

/// LIFESPAN QoS policy. Default: infinite (samples never expire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifespan {
    pub duration: Duration,
}

impl Default for Lifespan {
    fn default() -> Self {
        Self {
            duration: Duration::MAX,
        }
    }
}

impl Lifespan {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }

    pub fn infinite() -> Self {
        Self::default()
    }

    pub fn is_infinite(&self) -> bool {
        self.duration == Duration::MAX
    }

    /// Expiry instant for a sample created at `created`.
    pub fn expires_at(&self, created: Instant) -> Option<Instant> {
        if self.is_infinite() {
            return None;
        }
        created.checked_add(self.duration)
    }

    /// Expiry instant for a received sample, accounting for the time already
    /// spent since its source timestamp.
    ///
    /// Clock skew making the source timestamp lie in the future counts as zero age.
    pub fn expires_at_received(&self, source: SystemTime, received: Instant) -> Option<Instant> {
        if self.is_infinite() {
            return None;
        }
        let age = SystemTime::now().duration_since(source).unwrap_or(Duration::ZERO);
        received.checked_add(self.duration.saturating_sub(age))
    }
}
