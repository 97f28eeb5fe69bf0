//! Packet codec: 1 byte kind + 1 byte version + bincode body.
//! The version is checked before the body is parsed, so newer schemas are rejected cleanly.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn, Span};

use crate::crypto::{CryptoError, DhAlgorithm, KeyExchangeSession, SignAlgorithm, SignatureContext};
use crate::protocol::{
    data_message, ContactInfo, DataDescriptor, DataKind, Header, HopLimitExceeded, NatLevel,
    HOPS_MAX, NAT_LEVEL_UNDEFINED, PROTOCOL_VERSION,
};

const PREFIX_LEN: usize = 2;
const MAX_PACKET_LEN: usize = 64 * 1024;

/// Leading discriminant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Probe = 0,
    Quest = 1,
    Reply = 2,
}

impl TryFrom<u8> for PacketKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketKind::Probe),
            1 => Ok(PacketKind::Quest),
            2 => Ok(PacketKind::Reply),
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

/// Read the kind byte without decoding the rest.
pub fn packet_kind(bytes: &[u8]) -> Result<PacketKind, PacketError> {
    let first = *bytes.first().ok_or(PacketError::Truncated)?;
    PacketKind::try_from(first)
}

#[derive(Serialize, Deserialize)]
struct ProbeBody {
    hops: u8,
    seal: Option<SealBody>,
    kind: u8,
    index: Vec<u8>,
    size: u32,
}

#[derive(Serialize, Deserialize)]
struct SealBody {
    algorithm: u8,
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct QuestBody {
    id: u64,
    hops: u8,
    algorithm: u8,
    public_key: Vec<u8>,
    nat: i32,
    kind: u8,
    index: Vec<u8>,
    size: u32,
}

#[derive(Serialize, Deserialize)]
struct ReplyBody {
    id: u64,
    public_key: Vec<u8>,
    /// Encrypted `ContactBody`.
    contact: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct ContactBody {
    hops: u8,
    nat: i32,
    info: ContactInfo,
}

/// Signer of a verified Probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSeal {
    pub algorithm: SignAlgorithm,
    pub public_key: Vec<u8>,
}

/// Decoded content advertisement. `seal` is `None` for unauthenticated probes.
#[derive(Debug, Clone)]
pub struct Probe {
    pub header: Header,
    pub data: DataDescriptor,
    pub seal: Option<ProbeSeal>,
}

/// Decoded content request with the requester's ephemeral public key.
#[derive(Debug, Clone)]
pub struct Quest {
    pub header: Header,
    pub data: DataDescriptor,
    pub algorithm: DhAlgorithm,
    pub public_key: Vec<u8>,
}

/// Decoded and decrypted answer to a Quest.
#[derive(Debug, Clone)]
pub struct Reply {
    pub header: Header,
    pub contact: ContactInfo,
}

/// Encoder/decoder for the three packet kinds. Holds the receiver's supported version
/// and the span its log events are attached to.
pub struct PacketCodec {
    version: u8,
    span: Span,
}

impl PacketCodec {
    pub fn new(span: Span) -> Self {
        Self::with_version(PROTOCOL_VERSION, span)
    }

    pub fn with_version(version: u8, span: Span) -> Self {
        Self { version, span }
    }

    /// Highest protocol version this codec accepts.
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Encode a Probe. With a signer, the canonical data payload is signed and the public key attached.
    pub fn encode_probe(
        &self,
        header: &Header,
        data: &DataDescriptor,
        signer: Option<&SignatureContext>,
    ) -> Result<Vec<u8>, PacketError> {
        let seal = match signer {
            Some(ctx) => Some(SealBody {
                algorithm: ctx.algorithm().tag(),
                public_key: ctx.public_key_bytes()?,
                signature: ctx.sign(&data.signing_payload())?,
            }),
            None => None,
        };
        let body = ProbeBody {
            hops: header.hops(),
            seal,
            kind: data.kind.to_wire(),
            index: data.index.clone(),
            size: data.size,
        };
        seal_packet(PacketKind::Probe, header.version, &body)
    }

    /// Decode a Probe. A present signature must verify or decoding fails.
    pub fn decode_probe(&self, bytes: &[u8]) -> Result<Probe, PacketError> {
        let (version, body) = self.open_packet::<ProbeBody>(bytes, PacketKind::Probe)?;
        check_hops(body.hops)?;
        let kind = DataKind::from_wire(body.kind).ok_or(PacketError::UnknownCategory(body.kind))?;
        let seal = match body.seal {
            Some(seal) => {
                let algorithm = SignAlgorithm::try_from(seal.algorithm)?;
                let payload = data_message(body.kind, &body.index, body.size);
                if !algorithm.verify(&seal.public_key, &payload, &seal.signature) {
                    return Err(PacketError::SignatureVerificationFailed);
                }
                Some(ProbeSeal {
                    algorithm,
                    public_key: seal.public_key,
                })
            }
            None => None,
        };
        Ok(Probe {
            header: Header::new(version, 0, body.hops, NAT_LEVEL_UNDEFINED)?,
            data: DataDescriptor::new(kind, body.index, body.size),
            seal,
        })
    }

    /// Encode a Quest carrying `session`'s public key.
    pub fn encode_quest(
        &self,
        header: &Header,
        data: &DataDescriptor,
        session: &KeyExchangeSession,
    ) -> Result<Vec<u8>, PacketError> {
        let body = QuestBody {
            id: header.id,
            hops: header.hops(),
            algorithm: session.algorithm().tag(),
            public_key: session.public_key_bytes().to_vec(),
            nat: header.nat.to_wire(),
            kind: data.kind.to_wire(),
            index: data.index.clone(),
            size: data.size,
        };
        seal_packet(PacketKind::Quest, header.version, &body)
    }

    pub fn decode_quest(&self, bytes: &[u8]) -> Result<Quest, PacketError> {
        let (version, body) = self.open_packet::<QuestBody>(bytes, PacketKind::Quest)?;
        check_hops(body.hops)?;
        let algorithm = DhAlgorithm::try_from(body.algorithm)?;
        if body.public_key.len() != algorithm.public_key_len() {
            return Err(CryptoError::InvalidPeerKey.into());
        }
        let kind = DataKind::from_wire(body.kind).ok_or(PacketError::UnknownCategory(body.kind))?;
        Ok(Quest {
            header: Header::new(version, body.id, body.hops, self.checked_nat(body.nat))?,
            data: DataDescriptor::new(kind, body.index, body.size),
            algorithm,
            public_key: body.public_key,
        })
    }

    /// Encode a Reply. `contact` is encrypted with `session` (fresh, responder side)
    /// for the Quest's public key `peer_public`.
    pub fn encode_reply(
        &self,
        header: &Header,
        contact: &ContactInfo,
        session: &KeyExchangeSession,
        peer_public: &[u8],
    ) -> Result<Vec<u8>, PacketError> {
        let plain = bincode::serialize(&ContactBody {
            hops: header.hops(),
            nat: header.nat.to_wire(),
            info: contact.clone(),
        })?;
        let body = ReplyBody {
            id: header.id,
            public_key: session.public_key_bytes().to_vec(),
            contact: session.encrypt(peer_public, &plain)?,
        };
        seal_packet(PacketKind::Reply, header.version, &body)
    }

    /// Decode a Reply with the session that produced the matching Quest.
    pub fn decode_reply(
        &self,
        bytes: &[u8],
        session: &KeyExchangeSession,
    ) -> Result<Reply, PacketError> {
        let (version, body) = self.open_packet::<ReplyBody>(bytes, PacketKind::Reply)?;
        let plain = session.decrypt(&body.public_key, &body.contact)?;
        let contact: ContactBody = bincode::deserialize(&plain)?;
        check_hops(contact.hops)?;
        Ok(Reply {
            header: Header::new(version, body.id, contact.hops, self.checked_nat(contact.nat))?,
            contact: contact.info,
        })
    }

    /// Correlation ID of a Reply, read without decrypting; used to find the pending session.
    pub fn reply_id(&self, bytes: &[u8]) -> Result<u64, PacketError> {
        let (_, body) = self.open_packet::<ReplyBody>(bytes, PacketKind::Reply)?;
        Ok(body.id)
    }

    /// Re-encode a Probe or Quest with one more hop. Signature material is carried over unchanged.
    /// Fails with `HopLimitExceeded` when the packet must be dropped instead.
    pub fn relay(&self, bytes: &[u8]) -> Result<Vec<u8>, PacketError> {
        match packet_kind(bytes)? {
            PacketKind::Probe => {
                let (version, mut body) = self.open_packet::<ProbeBody>(bytes, PacketKind::Probe)?;
                body.hops = next_hop(body.hops)?;
                seal_packet(PacketKind::Probe, version, &body)
            }
            PacketKind::Quest => {
                let (version, mut body) = self.open_packet::<QuestBody>(bytes, PacketKind::Quest)?;
                body.hops = next_hop(body.hops)?;
                seal_packet(PacketKind::Quest, version, &body)
            }
            PacketKind::Reply => Err(PacketError::NotRelayable),
        }
    }

    fn open_packet<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        expected: PacketKind,
    ) -> Result<(u8, T), PacketError> {
        if bytes.len() > MAX_PACKET_LEN {
            return Err(PacketError::TooLarge);
        }
        if bytes.len() < PREFIX_LEN {
            return Err(PacketError::Truncated);
        }
        let found = PacketKind::try_from(bytes[0])?;
        if found != expected {
            return Err(PacketError::WrongKind { expected, found });
        }
        let declared = bytes[1];
        if !Header::new(declared, 0, 0, 0)?.version_ok(self.version) {
            debug!(parent: &self.span, declared, supported = self.version, "packet version not supported");
            return Err(PacketError::IncompatibleVersion {
                declared,
                supported: self.version,
            });
        }
        let body = bincode::deserialize(&bytes[PREFIX_LEN..])?;
        Ok((declared, body))
    }

    fn checked_nat(&self, nat: i32) -> i32 {
        if NatLevel::from_wire(nat).is_none() {
            warn!(parent: &self.span, nat, "invalid NAT level, treating as symmetric");
            return NatLevel::Symmetric.to_wire();
        }
        nat
    }
}

fn seal_packet<T: Serialize>(kind: PacketKind, version: u8, body: &T) -> Result<Vec<u8>, PacketError> {
    let payload = bincode::serialize(body)?;
    if PREFIX_LEN + payload.len() > MAX_PACKET_LEN {
        return Err(PacketError::TooLarge);
    }
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.push(kind as u8);
    out.push(version);
    out.extend_from_slice(&payload);
    Ok(out)
}

fn check_hops(hops: u8) -> Result<(), HopLimitExceeded> {
    if hops > HOPS_MAX {
        return Err(HopLimitExceeded);
    }
    Ok(())
}

fn next_hop(hops: u8) -> Result<u8, HopLimitExceeded> {
    let mut header = Header::new(PROTOCOL_VERSION, 0, hops, 0)?;
    header.hop_add(1)?;
    Ok(header.hops())
}

/// Error encoding or decoding a packet.
#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("packet too large")]
    TooLarge,
    #[error("packet truncated")]
    Truncated,
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("expected {expected:?} packet, found {found:?}")]
    WrongKind {
        expected: PacketKind,
        found: PacketKind,
    },
    #[error("unknown data category {0}")]
    UnknownCategory(u8),
    #[error("packet version {declared} is newer than supported version {supported}")]
    IncompatibleVersion { declared: u8, supported: u8 },
    #[error(transparent)]
    HopLimitExceeded(#[from] HopLimitExceeded),
    #[error("signature verification failed")]
    SignatureVerificationFailed,
    #[error("reply packets are not relayed")]
    NotRelayable,
    #[error("malformed packet: {0}")]
    Malformed(#[from] bincode::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}
