//! Depots wire protocol: version, header, content descriptor, contact record.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Current protocol version. Receivers accept any packet declaring a version <= theirs.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum relay hop count.
pub const HOPS_MAX: u8 = 15;

/// In-memory placeholder for "NAT level not measured". Never valid on the wire.
pub const NAT_LEVEL_UNDEFINED: i32 = -1;

/// Measured NAT behavior, most reachable first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum NatLevel {
    /// Public address, UPnP mapping or full-cone NAT.
    Open = 0,
    RestrictedCone = 1,
    PortRestrictedCone = 2,
    /// Symmetric NAT or symmetric UDP firewall. Worst case.
    Symmetric = 3,
}

impl NatLevel {
    /// Exact conversion; `None` for anything outside 0..=3.
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            0 => Some(NatLevel::Open),
            1 => Some(NatLevel::RestrictedCone),
            2 => Some(NatLevel::PortRestrictedCone),
            3 => Some(NatLevel::Symmetric),
            _ => None,
        }
    }

    /// Conversion that coerces invalid values to `Symmetric`.
    pub fn coerce(value: i32) -> Self {
        Self::from_wire(value).unwrap_or(NatLevel::Symmetric)
    }

    pub fn to_wire(self) -> i32 {
        self as i32
    }
}

/// Per-message header ("base"): version, correlation ID, hops, sender NAT level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    /// Correlation ID; zero for Probe.
    pub id: u64,
    hops: u8,
    pub nat: NatLevel,
}

impl Header {
    /// Build a header. `nat` outside 0..=3 (including the undefined placeholder) becomes `Symmetric`.
    /// Fails if `hops` is already past `HOPS_MAX`.
    pub fn new(version: u8, id: u64, hops: u8, nat: i32) -> Result<Self, HopLimitExceeded> {
        if hops > HOPS_MAX {
            return Err(HopLimitExceeded);
        }
        Ok(Self {
            version,
            id,
            hops,
            nat: NatLevel::coerce(nat),
        })
    }

    /// Header for a locally originated packet at the current version.
    pub fn local(id: u64, nat: NatLevel) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            id,
            hops: 0,
            nat,
        }
    }

    pub fn hops(&self) -> u8 {
        self.hops
    }

    /// Add relay hops. Fails if the total would exceed `HOPS_MAX`; hops are left unchanged then.
    pub fn hop_add(&mut self, n: u8) -> Result<(), HopLimitExceeded> {
        match self.hops.checked_add(n) {
            Some(total) if total <= HOPS_MAX => {
                self.hops = total;
                Ok(())
            }
            _ => Err(HopLimitExceeded),
        }
    }

    /// True if a receiver supporting `supported` understands this header's version.
    pub fn version_ok(&self, supported: u8) -> bool {
        supported >= self.version
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("packet hop count exceeds {}", HOPS_MAX)]
pub struct HopLimitExceeded;

/// Content category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataKind {
    Archive = 0,
    Ledger = 1,
}

impl DataKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataKind::Archive),
            1 => Some(DataKind::Ledger),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// What a Probe advertises or a Quest asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDescriptor {
    pub kind: DataKind,
    /// Opaque content identifier.
    pub index: Vec<u8>,
    /// Declared size in bytes; 0 when unknown.
    pub size: u32,
}

impl DataDescriptor {
    pub fn new(kind: DataKind, index: impl Into<Vec<u8>>, size: u32) -> Self {
        Self {
            kind,
            index: index.into(),
            size,
        }
    }

    /// Canonical payload signed in a Probe.
    pub fn signing_payload(&self) -> Vec<u8> {
        data_message(self.kind.to_wire(), &self.index, self.size)
    }
}

/// Signing payload: 1 byte category, identifier bytes in order, then the size as 4 bytes
/// big-endian only when it is non-zero.
pub fn data_message(kind: u8, index: &[u8], size: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + index.len() + 4);
    out.push(kind);
    out.extend_from_slice(index);
    if size > 0 {
        out.extend_from_slice(&size.to_be_bytes());
    }
    out
}

/// Rendezvous (Findings) server helping with NAT traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendezvous {
    pub ip: IpAddr,
    pub port: u16,
    /// Category name the data holder registered under.
    pub kind: String,
}

/// How to reach the node holding the content. Carried encrypted in a Reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// Transport kind: websocket, dtls, tcp, udp.
    pub network: String,
    pub ip: IpAddr,
    pub port: u16,
    pub rendezvous: Option<Rendezvous>,
}
