// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport seam for the reliability engines.
//!
//! Engines only ever see [`Transport::send`]; whatever moves bytes (UDP, SHM,
//! TCP, or the in-process [`IntraProcessNetwork`]) lives behind it. Incoming
//! messages enter through [`MessageReceiver::on_message`].
//!
//! # Contract
//!
//! Engines call `send` while holding their own lock, so a transport must
//! never call back into an engine synchronously from `send`. Queue the
//! message and deliver it from another call stack (receive thread,
//! dispatcher, or an explicit pump).

mod intra;
mod receiver;

use std::fmt;

pub use intra::{DropFilter, IntraProcessNetwork, IntraTransport, NetworkStats};
pub use receiver::MessageReceiver;

use crate::core::guid::GuidPrefix;
use crate::dds::Result;
use crate::reliability::messages::Submessage;

/// RTPS locator kind: UDPv4.
pub const LOCATOR_KIND_UDPV4: i32 = 1;
/// RTPS locator kind: UDPv6.
pub const LOCATOR_KIND_UDPV6: i32 = 2;
/// Vendor-specific kind used by the in-process network.
pub const LOCATOR_KIND_INTRA: i32 = 0x0100_0000;

/// RTPS locator (kind + port + 16-byte address).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    pub kind: i32,
    pub port: u32,
    pub address: [u8; 16],
}

impl Locator {
    pub const fn new(kind: i32, port: u32, address: [u8; 16]) -> Self {
        Self {
            kind,
            port,
            address,
        }
    }

    /// In-process endpoint number `id`.
    pub const fn intra(id: u32) -> Self {
        Self::new(LOCATOR_KIND_INTRA, id, [0; 16])
    }

    /// UDPv4 locator (address in the last 4 bytes).
    pub fn udpv4(ip: [u8; 4], port: u16) -> Self {
        let mut address = [0u8; 16];
        address[12..16].copy_from_slice(&ip);
        Self::new(LOCATOR_KIND_UDPV4, u32::from(port), address)
    }

    #[must_use]
    pub fn is_intra(&self) -> bool {
        self.kind == LOCATOR_KIND_INTRA
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            LOCATOR_KIND_INTRA => write!(f, "intra://{}", self.port),
            LOCATOR_KIND_UDPV4 => write!(
                f,
                "udpv4://{}.{}.{}.{}:{}",
                self.address[12], self.address[13], self.address[14], self.address[15], self.port
            ),
            kind => write!(f, "locator(kind={}, port={})", kind, self.port),
        }
    }
}

impl fmt::Debug for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Locator({})", self)
    }
}

/// One RTPS message: header prefix, optional INFO_DST, submessages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpsMessage {
    /// GUID prefix of the sending participant (RTPS header).
    pub source_prefix: GuidPrefix,
    /// INFO_DST destination prefix; `None` for every participant.
    pub destination: Option<GuidPrefix>,
    pub submessages: Vec<Submessage>,
}

impl RtpsMessage {
    pub fn new(source_prefix: GuidPrefix) -> Self {
        Self {
            source_prefix,
            destination: None,
            submessages: Vec::new(),
        }
    }

    /// Message to a single participant.
    pub fn to(source_prefix: GuidPrefix, destination: GuidPrefix) -> Self {
        Self {
            source_prefix,
            destination: Some(destination),
            submessages: Vec::new(),
        }
    }

    pub fn with(mut self, submessage: Submessage) -> Self {
        self.submessages.push(submessage);
        self
    }

    pub fn push(&mut self, submessage: Submessage) {
        self.submessages.push(submessage);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.submessages.is_empty()
    }
}

/// Outbound side of a transport.
pub trait Transport: Send + Sync {
    /// Send `message` to every locator. Must not re-enter engines.
    fn send(&self, locators: &[Locator], message: &RtpsMessage) -> Result<()>;
}
