//! Depots peer-exchange core.
//! Host-driven: no I/O; the host passes received packets and performs the returned actions.

pub mod config;
pub mod core;
pub mod crypto;
pub mod policy;
pub mod protocol;
pub mod wire;

pub use crate::core::{Action, DepotCore, MessageError};
pub use config::{load_policy_source, Config};
pub use crypto::{CryptoError, DhAlgorithm, KeyExchangeSession, SignAlgorithm, SignatureContext};
pub use policy::{AdmissionPolicy, PolicySource, Rule, RuleError, RuleLang, RuleLimits, RuleSource};
pub use protocol::{ContactInfo, DataDescriptor, DataKind, Header, NatLevel, HOPS_MAX, PROTOCOL_VERSION};
pub use wire::{PacketCodec, PacketError, Probe, Quest, Reply};
