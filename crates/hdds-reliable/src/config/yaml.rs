// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML endpoint profile loader.
//!
//! # Example YAML
//!
//! ```yaml
//! profiles:
//!   reliable_sensor:
//!     reliability: RELIABLE
//!     durability: TRANSIENT_LOCAL
//!     history:
//!       kind: KEEP_LAST
//!       depth: 100
//!     resource_limits:
//!       max_samples: 1000
//!     writer_times:
//!       heartbeat_period_ms: 100
//!       nack_response_delay_ms: 0
//!     reader_times:
//!       heartbeat_response_delay_ms: 5
//!     push_mode: true
//!     fragment_size: 1024
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{ReaderAttributes, WriterAttributes};
use crate::dds::{Error, Result};
use crate::qos::{
    Durability, History, ReaderQos, Reliability, ResourceLimits, WriterQos, LENGTH_UNLIMITED,
};

/// Root YAML document.
#[derive(Debug, Deserialize)]
pub struct ProfileDocument {
    #[serde(default)]
    pub profiles: HashMap<String, EndpointProfile>,
}

/// One endpoint profile.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct EndpointProfile {
    /// RELIABLE or BEST_EFFORT
    pub reliability: Option<String>,
    /// VOLATILE or TRANSIENT_LOCAL
    pub durability: Option<String>,
    pub history: Option<YamlHistory>,
    pub resource_limits: Option<YamlResourceLimits>,
    pub deadline_ms: Option<u64>,
    pub lifespan_ms: Option<u64>,
    pub max_blocking_time_ms: Option<u64>,
    pub liveliness_lease_ms: Option<u64>,
    pub writer_times: Option<YamlWriterTimes>,
    pub reader_times: Option<YamlReaderTimes>,
    pub push_mode: Option<bool>,
    pub fragment_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct YamlHistory {
    /// KEEP_LAST or KEEP_ALL
    pub kind: String,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// Negative values mean LENGTH_UNLIMITED.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlResourceLimits {
    pub max_samples: Option<i64>,
    pub max_instances: Option<i64>,
    pub max_samples_per_instance: Option<i64>,
    pub max_quota_bytes: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlWriterTimes {
    pub heartbeat_period_ms: Option<u64>,
    pub nack_response_delay_ms: Option<u64>,
    pub nack_suppression_duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlReaderTimes {
    pub heartbeat_response_delay_ms: Option<u64>,
    pub initial_acknack_delay_ms: Option<u64>,
    pub fragment_repair_delay_ms: Option<u64>,
}

/// Parsed set of named profiles.
#[derive(Debug)]
pub struct ProfileSet {
    profiles: HashMap<String, EndpointProfile>,
}

impl ProfileSet {
    /// Parse profiles from a YAML string.
    pub fn from_yaml_str(yaml_content: &str) -> Result<Self> {
        let doc: ProfileDocument = serde_yaml::from_str(yaml_content)
            .map_err(|e| Error::InvalidQos(format!("Failed to parse YAML: {}", e)))?;
        Ok(Self {
            profiles: doc.profiles,
        })
    }

    /// Parse profiles from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::InvalidQos(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn get(&self, name: &str) -> Option<&EndpointProfile> {
        self.profiles.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}

impl EndpointProfile {
    /// Build the writer QoS described by this profile (defaults for missing keys).
    pub fn writer_qos(&self) -> Result<WriterQos> {
        let mut qos = WriterQos::default();
        if let Some(r) = &self.reliability {
            qos.reliability = parse_reliability(r)?;
        }
        if let Some(d) = &self.durability {
            qos.durability = parse_durability(d)?;
        }
        if let Some(h) = &self.history {
            qos.history = parse_history(h)?;
        }
        if let Some(rl) = &self.resource_limits {
            qos.resource_limits = apply_limits(qos.resource_limits, rl);
        }
        if let Some(ms) = self.deadline_ms {
            qos = qos.deadline(Duration::from_millis(ms));
        }
        if let Some(ms) = self.lifespan_ms {
            qos = qos.lifespan(Duration::from_millis(ms));
        }
        qos.max_blocking_time = self.max_blocking_time_ms.map(Duration::from_millis);
        qos.validate().map_err(Error::InvalidQos)?;
        Ok(qos)
    }

    /// Build the reader QoS described by this profile.
    pub fn reader_qos(&self) -> Result<ReaderQos> {
        let mut qos = ReaderQos::default();
        if let Some(r) = &self.reliability {
            qos.reliability = parse_reliability(r)?;
        }
        if let Some(d) = &self.durability {
            qos.durability = parse_durability(d)?;
        }
        if let Some(h) = &self.history {
            qos.history = parse_history(h)?;
        }
        if let Some(rl) = &self.resource_limits {
            qos.resource_limits = apply_limits(qos.resource_limits, rl);
        }
        if let Some(ms) = self.deadline_ms {
            qos = qos.deadline(Duration::from_millis(ms));
        }
        if let Some(ms) = self.lifespan_ms {
            qos = qos.lifespan(Duration::from_millis(ms));
        }
        qos.liveliness_lease = self.liveliness_lease_ms.map(Duration::from_millis);
        qos.validate().map_err(Error::InvalidQos)?;
        Ok(qos)
    }

    pub fn writer_attributes(&self) -> Result<WriterAttributes> {
        let mut attrs = WriterAttributes::default();
        if let Some(push) = self.push_mode {
            attrs.push_mode = push;
        }
        if let Some(size) = self.fragment_size {
            attrs.fragment_size = size;
        }
        if let Some(t) = &self.writer_times {
            if let Some(ms) = t.heartbeat_period_ms {
                attrs.times.heartbeat_period = Duration::from_millis(ms);
            }
            if let Some(ms) = t.nack_response_delay_ms {
                attrs.times.nack_response_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = t.nack_suppression_duration_ms {
                attrs.times.nack_suppression_duration = Duration::from_millis(ms);
            }
        }
        attrs.validate().map_err(Error::InvalidQos)?;
        Ok(attrs)
    }

    pub fn reader_attributes(&self) -> Result<ReaderAttributes> {
        let mut attrs = ReaderAttributes::default();
        if let Some(t) = &self.reader_times {
            if let Some(ms) = t.heartbeat_response_delay_ms {
                attrs.times.heartbeat_response_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = t.initial_acknack_delay_ms {
                attrs.times.initial_acknack_delay = Duration::from_millis(ms);
            }
            if let Some(ms) = t.fragment_repair_delay_ms {
                attrs.times.fragment_repair_delay = Duration::from_millis(ms);
            }
        }
        attrs.validate().map_err(Error::InvalidQos)?;
        Ok(attrs)
    }
}

fn parse_reliability(s: &str) -> Result<Reliability> {
    match s.to_uppercase().as_str() {
        "RELIABLE" => Ok(Reliability::Reliable),
        "BEST_EFFORT" => Ok(Reliability::BestEffort),
        other => Err(Error::InvalidQos(format!("Unknown reliability: {}", other))),
    }
}

fn parse_durability(s: &str) -> Result<Durability> {
    match s.to_uppercase().as_str() {
        "VOLATILE" => Ok(Durability::Volatile),
        "TRANSIENT_LOCAL" => Ok(Durability::TransientLocal),
        other => Err(Error::InvalidQos(format!("Unknown durability: {}", other))),
    }
}

fn parse_history(h: &YamlHistory) -> Result<History> {
    match h.kind.to_uppercase().as_str() {
        "KEEP_LAST" => Ok(History::KeepLast(h.depth.unwrap_or(1))),
        "KEEP_ALL" => Ok(History::KeepAll),
        other => Err(Error::InvalidQos(format!("Unknown history kind: {}", other))),
    }
}

fn apply_limits(mut limits: ResourceLimits, yaml: &YamlResourceLimits) -> ResourceLimits {
    let conv = |v: i64| usize::try_from(v).unwrap_or(LENGTH_UNLIMITED);
    if let Some(v) = yaml.max_samples {
        limits.max_samples = conv(v);
    }
    if let Some(v) = yaml.max_instances {
        limits.max_instances = conv(v);
    }
    if let Some(v) = yaml.max_samples_per_instance {
        limits.max_samples_per_instance = conv(v);
    }
    if let Some(v) = yaml.max_quota_bytes {
        limits.max_quota_bytes = conv(v);
    }
    limits
}
