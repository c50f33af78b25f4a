// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Test doubles shared by the engine unit tests.

use parking_lot::Mutex;

use crate::dds::Result;
use crate::reliability::messages::{AckNackMsg, GapMsg, HeartbeatMsg, NackFragMsg, Submessage};
use crate::transport::{Locator, RtpsMessage, Transport};

/// Transport that records every message instead of delivering it.
#[derive(Default)]
pub(crate) struct CaptureTransport {
    sent: Mutex<Vec<(Vec<Locator>, RtpsMessage)>>,
}

impl Transport for CaptureTransport {
    fn send(&self, locators: &[Locator], message: &RtpsMessage) -> Result<()> {
        self.sent.lock().push((locators.to_vec(), message.clone()));
        Ok(())
    }
}

impl CaptureTransport {
    /// Drain the captured messages.
    pub(crate) fn take(&self) -> Vec<RtpsMessage> {
        std::mem::take(&mut *self.sent.lock())
            .into_iter()
            .map(|(_, m)| m)
            .collect()
    }

    fn take_submessages(&self) -> Vec<Submessage> {
        self.take()
            .into_iter()
            .flat_map(|m| m.submessages.into_iter())
            .collect()
    }

    /// Sequence numbers of the DATA submessages in `messages`.
    pub(crate) fn seqs_of(messages: &[RtpsMessage]) -> Vec<u64> {
        messages
            .iter()
            .flat_map(|m| m.submessages.iter())
            .filter_map(|s| match s {
                Submessage::Data(d) => Some(d.seq),
                _ => None,
            })
            .collect()
    }

    /// Drain and return DATA sequence numbers.
    pub(crate) fn data_seqs(&self) -> Vec<u64> {
        Self::seqs_of(&self.take())
    }

    /// Drain and return `(seq, fragment_start)` of DATA_FRAG submessages.
    pub(crate) fn fragments(&self) -> Vec<(u64, u32)> {
        self.take_submessages()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::DataFrag(f) => Some((f.seq, f.fragment_start)),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn heartbeats(&self) -> Vec<HeartbeatMsg> {
        self.take_submessages()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::Heartbeat(h) => Some(h),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn acknacks(&self) -> Vec<AckNackMsg> {
        self.take_submessages()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::AckNack(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    /// Drain and return ACKNACKs and NACK_FRAGs sent together.
    pub(crate) fn repair_requests(&self) -> (Vec<AckNackMsg>, Vec<NackFragMsg>) {
        let mut acks = Vec::new();
        let mut nacks = Vec::new();
        for s in self.take_submessages() {
            match s {
                Submessage::AckNack(a) => acks.push(a),
                Submessage::NackFrag(n) => nacks.push(n),
                _ => {}
            }
        }
        (acks, nacks)
    }

    pub(crate) fn gaps(&self) -> Vec<GapMsg> {
        self.take_submessages()
            .into_iter()
            .filter_map(|s| match s {
                Submessage::Gap(g) => Some(g),
                _ => None,
            })
            .collect()
    }
}
