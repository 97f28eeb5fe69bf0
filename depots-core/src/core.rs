//! Host-driven API: DepotCore receives packets from the host, returns actions.

use std::collections::HashMap;

use tracing::{debug, info_span, Span};

use crate::config::{load_policy_source, Config};
use crate::crypto::{DhAlgorithm, KeyExchangeSession, SignatureContext};
use crate::policy::{AdmissionPolicy, RuleLimits};
use crate::protocol::{ContactInfo, DataDescriptor, DataKind, Header, NatLevel};
use crate::wire::{packet_kind, PacketCodec, PacketError, PacketKind, ProbeSeal, Quest};

const CATEGORIES: [DataKind; 2] = [DataKind::Archive, DataKind::Ledger];

/// Default lifetime of an unanswered Quest, in ticks.
pub const DEFAULT_QUEST_TIMEOUT_TICKS: u64 = 30;

/// Our side of an outstanding Quest.
struct PendingQuest {
    session: KeyExchangeSession,
    /// Tick when the Quest was sent.
    started: u64,
}

/// Main coordinator. Host passes packets; core returns actions.
pub struct DepotCore {
    codec: PacketCodec,
    policies: HashMap<DataKind, AdmissionPolicy>,
    nat: NatLevel,
    dh_algorithm: DhAlgorithm,
    /// Our outstanding Quests, keyed by correlation ID.
    pending: HashMap<u64, PendingQuest>,
    tick_count: u64,
    quest_timeout_ticks: u64,
    span: Span,
}

impl DepotCore {
    /// Core with empty (reject-all) policies, symmetric NAT and the default DH algorithm.
    pub fn new(span: Span) -> Self {
        let policies = CATEGORIES
            .into_iter()
            .map(|kind| (kind, AdmissionPolicy::new(policy_span(&span, kind))))
            .collect();
        Self {
            codec: PacketCodec::new(span.clone()),
            policies,
            nat: NatLevel::Symmetric,
            dh_algorithm: DhAlgorithm::Traditional,
            pending: HashMap::new(),
            tick_count: 0,
            quest_timeout_ticks: DEFAULT_QUEST_TIMEOUT_TICKS,
            span,
        }
    }

    /// Core with both category policies read from `config`'s policy directory.
    pub fn from_config(config: &Config, span: Span) -> anyhow::Result<Self> {
        let limits: RuleLimits = config.rule_limits();
        let mut core = Self::new(span);
        for kind in CATEGORIES {
            let source = load_policy_source(config, kind)?;
            let policy = AdmissionPolicy::from_source(&source, &limits, policy_span(&core.span, kind));
            core.policies.insert(kind, policy);
        }
        Ok(core)
    }

    pub fn nat(&self) -> NatLevel {
        self.nat
    }

    /// Record the node's measured NAT level; sent in Quests and Replies.
    pub fn set_nat(&mut self, nat: NatLevel) {
        self.nat = nat;
    }

    /// Algorithm used for Quests this node starts.
    pub fn set_dh_algorithm(&mut self, algorithm: DhAlgorithm) {
        self.dh_algorithm = algorithm;
    }

    pub fn codec(&self) -> &PacketCodec {
        &self.codec
    }

    pub fn set_policy(&mut self, kind: DataKind, policy: AdmissionPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn policy_mut(&mut self, kind: DataKind) -> Option<&mut AdmissionPolicy> {
        self.policies.get_mut(&kind)
    }

    /// True if the category's policy admits `data`. No policy means reject.
    pub fn wants(&self, data: &DataDescriptor) -> bool {
        self.policies
            .get(&data.kind)
            .is_some_and(|p| p.pass(&data.index, u64::from(data.size)))
    }

    /// Encode a Probe advertising `data`, signed when `signer` is given.
    pub fn advertise(
        &self,
        data: &DataDescriptor,
        signer: Option<&SignatureContext>,
    ) -> Result<Vec<u8>, PacketError> {
        self.codec
            .encode_probe(&Header::local(0, self.nat), data, signer)
    }

    /// Start a Quest for `data`. Returns the correlation ID and the packet to broadcast.
    pub fn start_quest(&mut self, data: &DataDescriptor) -> Result<(u64, Vec<u8>), PacketError> {
        let id = self.fresh_quest_id();
        let session = KeyExchangeSession::generate(self.dh_algorithm);
        let bytes = self
            .codec
            .encode_quest(&Header::local(id, self.nat), data, &session)?;
        self.pending.insert(
            id,
            PendingQuest {
                session,
                started: self.tick_count,
            },
        );
        debug!(parent: &self.span, id, "quest started");
        Ok((id, bytes))
    }

    /// Forget a pending Quest. Returns false if it was not pending.
    pub fn cancel_quest(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn pending_quests(&self) -> usize {
        self.pending.len()
    }

    /// Set how many ticks a Quest may wait for its Reply.
    pub fn set_quest_timeout(&mut self, ticks: u64) {
        self.quest_timeout_ticks = ticks;
    }

    /// Advance the clock by one tick and drop Quests that outlived the timeout.
    /// Returns the expired correlation IDs.
    pub fn tick(&mut self) -> Vec<u64> {
        self.tick_count += 1;
        let now = self.tick_count;
        let timeout = self.quest_timeout_ticks;
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, q)| now.saturating_sub(q.started) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending.remove(id);
            debug!(parent: &self.span, id, "quest expired");
        }
        expired
    }

    /// Answer a Quest this node can serve: `contact` encrypted for the requester.
    pub fn answer_quest(&self, quest: &Quest, contact: &ContactInfo) -> Result<Vec<u8>, PacketError> {
        let session = KeyExchangeSession::generate(quest.algorithm);
        self.codec.encode_reply(
            &Header::local(quest.header.id, self.nat),
            contact,
            &session,
            &quest.public_key,
        )
    }

    /// Process a received packet and return what the host should do next.
    pub fn on_message_received(&mut self, bytes: &[u8]) -> Result<Vec<Action>, MessageError> {
        let mut actions = Vec::new();
        match packet_kind(bytes)? {
            PacketKind::Probe => {
                let probe = self.codec.decode_probe(bytes)?;
                if self.wants(&probe.data) {
                    actions.push(Action::Fetch {
                        data: probe.data,
                        seal: probe.seal,
                    });
                }
                self.push_relay(bytes, &mut actions)?;
            }
            PacketKind::Quest => {
                let quest = self.codec.decode_quest(bytes)?;
                if self.pending.contains_key(&quest.header.id) {
                    debug!(parent: &self.span, id = quest.header.id, "own quest came back, dropping");
                    return Ok(actions);
                }
                actions.push(Action::Lookup(quest));
                self.push_relay(bytes, &mut actions)?;
            }
            PacketKind::Reply => {
                let id = self.codec.reply_id(bytes)?;
                let pending = self.pending.get(&id).ok_or(MessageError::UnknownQuest(id))?;
                // A Reply that fails to decrypt leaves the Quest pending for the genuine one.
                let reply = self.codec.decode_reply(bytes, &pending.session)?;
                self.pending.remove(&id);
                actions.push(Action::Contact {
                    id,
                    header: reply.header,
                    contact: reply.contact,
                });
            }
        }
        Ok(actions)
    }

    fn push_relay(&self, bytes: &[u8], actions: &mut Vec<Action>) -> Result<(), PacketError> {
        match self.codec.relay(bytes) {
            Ok(next) => actions.push(Action::Relay(next)),
            Err(PacketError::HopLimitExceeded(_)) => {
                debug!(parent: &self.span, "hop limit reached, not relaying");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn fresh_quest_id(&self) -> u64 {
        loop {
            let id = rand::random::<u64>();
            if id != 0 && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

fn policy_span(parent: &Span, kind: DataKind) -> Span {
    info_span!(parent: parent, "policy", kind = ?kind)
}

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("no pending quest with id {0}")]
    UnknownQuest(u64),
}

/// Action for host to perform.
#[derive(Debug)]
pub enum Action {
    /// Forward these bytes to the node's other neighbours.
    Relay(Vec<u8>),
    /// Advertised content passed the admission policy; fetch and store it.
    Fetch {
        data: DataDescriptor,
        seal: Option<ProbeSeal>,
    },
    /// Someone is looking for content; answer with `answer_quest` if we hold it.
    Lookup(Quest),
    /// Our Quest was answered.
    Contact {
        id: u64,
        header: Header,
        contact: ContactInfo,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SignAlgorithm;
    use crate::protocol::{HOPS_MAX, PROTOCOL_VERSION};
    use std::net::{IpAddr, Ipv4Addr};

    fn core() -> DepotCore {
        DepotCore::new(Span::none())
    }

    fn contact() -> ContactInfo {
        ContactInfo {
            network: "tcp".into(),
            ip: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7)),
            port: 4400,
            rendezvous: None,
        }
    }

    #[test]
    fn probe_admitted_and_relayed() {
        let sender = core();
        let mut receiver = core();
        receiver
            .policy_mut(DataKind::Archive)
            .unwrap()
            .whitelist(["^cat/"]);

        let signer = SignatureContext::generate(SignAlgorithm::Ed25519);
        let data = DataDescriptor::new(DataKind::Archive, b"cat/1".to_vec(), 2048);
        let bytes = sender.advertise(&data, Some(&signer)).unwrap();

        let actions = receiver.on_message_received(&bytes).unwrap();
        assert_eq!(actions.len(), 2);
        match &actions[0] {
            Action::Fetch { data: got, seal } => {
                assert_eq!(got, &data);
                let seal = seal.as_ref().unwrap();
                assert_eq!(seal.public_key, signer.public_key_bytes().unwrap());
            }
            other => panic!("expected Fetch, got {other:?}"),
        }
        let Action::Relay(next) = &actions[1] else {
            panic!("expected Relay");
        };
        assert_eq!(receiver.codec().decode_probe(next).unwrap().header.hops(), 1);
    }

    #[test]
    fn probe_rejected_by_policy_is_only_relayed() {
        let sender = core();
        let mut receiver = core();
        let data = DataDescriptor::new(DataKind::Ledger, b"cat/1".to_vec(), 0);
        assert!(!receiver.wants(&data));
        let bytes = sender.advertise(&data, None).unwrap();
        let actions = receiver.on_message_received(&bytes).unwrap();
        assert!(matches!(actions.as_slice(), [Action::Relay(_)]));
    }

    #[test]
    fn probe_at_hop_limit_not_relayed() {
        let mut receiver = core();
        let header = Header::new(PROTOCOL_VERSION, 0, HOPS_MAX, 0).unwrap();
        let data = DataDescriptor::new(DataKind::Archive, b"x".to_vec(), 1);
        let bytes = receiver.codec().encode_probe(&header, &data, None).unwrap();
        assert!(receiver.on_message_received(&bytes).unwrap().is_empty());
    }

    #[test]
    fn quest_reply_exchange() {
        for alg in [DhAlgorithm::X25519, DhAlgorithm::P256, DhAlgorithm::P384] {
            let mut seeker = core();
            seeker.set_dh_algorithm(alg);
            let mut holder = core();
            holder.set_nat(NatLevel::Open);

            let data = DataDescriptor::new(DataKind::Ledger, b"block/42".to_vec(), 0);
            let (id, quest_bytes) = seeker.start_quest(&data).unwrap();
            assert_eq!(seeker.pending_quests(), 1);

            let actions = holder.on_message_received(&quest_bytes).unwrap();
            let Some(Action::Lookup(quest)) = actions.first() else {
                panic!("expected Lookup");
            };
            assert_eq!(quest.header.id, id);
            assert_eq!(quest.data, data);
            assert!(matches!(actions.get(1), Some(Action::Relay(_))));

            let reply = holder.answer_quest(quest, &contact()).unwrap();
            let actions = seeker.on_message_received(&reply).unwrap();
            match actions.as_slice() {
                [Action::Contact {
                    id: got,
                    header,
                    contact: info,
                }] => {
                    assert_eq!(*got, id);
                    assert_eq!(header.nat, NatLevel::Open);
                    assert_eq!(info, &contact());
                }
                other => panic!("expected Contact, got {other:?}"),
            }
            assert_eq!(seeker.pending_quests(), 0);

            // Sessions are single use.
            assert!(matches!(
                seeker.on_message_received(&reply),
                Err(MessageError::UnknownQuest(got)) if got == id
            ));
        }
    }

    #[test]
    fn forged_reply_keeps_quest_pending() {
        let mut seeker = core();
        let holder = core();
        let data = DataDescriptor::new(DataKind::Archive, b"doc".to_vec(), 0);
        let (_, quest_bytes) = seeker.start_quest(&data).unwrap();
        let quest = holder.codec().decode_quest(&quest_bytes).unwrap();

        // Encrypted for a key that is not the seeker's.
        let mut wrong = quest.clone();
        wrong.public_key = KeyExchangeSession::generate(DhAlgorithm::X25519)
            .public_key_bytes()
            .to_vec();
        let forged = holder.answer_quest(&wrong, &contact()).unwrap();
        assert!(matches!(
            seeker.on_message_received(&forged),
            Err(MessageError::Packet(_))
        ));
        assert_eq!(seeker.pending_quests(), 1);

        let genuine = holder.answer_quest(&quest, &contact()).unwrap();
        assert_eq!(seeker.on_message_received(&genuine).unwrap().len(), 1);
    }

    #[test]
    fn own_quest_echo_dropped() {
        let mut seeker = core();
        let data = DataDescriptor::new(DataKind::Archive, b"doc".to_vec(), 0);
        let (_, quest_bytes) = seeker.start_quest(&data).unwrap();
        assert!(seeker.on_message_received(&quest_bytes).unwrap().is_empty());
    }

    #[test]
    fn cancelled_quest_ignores_reply() {
        let mut seeker = core();
        let holder = core();
        let data = DataDescriptor::new(DataKind::Archive, b"doc".to_vec(), 0);
        let (id, quest_bytes) = seeker.start_quest(&data).unwrap();
        let quest = holder.codec().decode_quest(&quest_bytes).unwrap();
        let reply = holder.answer_quest(&quest, &contact()).unwrap();

        assert!(seeker.cancel_quest(id));
        assert!(!seeker.cancel_quest(id));
        assert!(matches!(
            seeker.on_message_received(&reply),
            Err(MessageError::UnknownQuest(_))
        ));
    }

    #[test]
    fn unanswered_quests_expire() {
        let mut seeker = core();
        let holder = core();
        seeker.set_quest_timeout(2);
        let data = DataDescriptor::new(DataKind::Archive, b"doc".to_vec(), 0);
        let (old, quest_bytes) = seeker.start_quest(&data).unwrap();
        let quest = holder.codec().decode_quest(&quest_bytes).unwrap();
        let late_reply = holder.answer_quest(&quest, &contact()).unwrap();

        assert!(seeker.tick().is_empty());
        let (fresh, _) = seeker.start_quest(&data).unwrap();
        assert!(seeker.tick().is_empty());
        assert_eq!(seeker.tick(), vec![old]);
        assert_eq!(seeker.pending_quests(), 1);
        assert!(matches!(
            seeker.on_message_received(&late_reply),
            Err(MessageError::UnknownQuest(id)) if id == old
        ));

        assert_eq!(seeker.tick(), vec![fresh]);
        assert_eq!(seeker.pending_quests(), 0);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut c = core();
        assert!(matches!(
            c.on_message_received(&[]),
            Err(MessageError::Packet(_))
        ));
        assert!(matches!(
            c.on_message_received(&[0, 1, 0xff, 0xff]),
            Err(MessageError::Packet(_))
        ));
        assert!(c.on_message_received(&[9, 1]).is_err());
    }

    #[test]
    fn from_config_loads_category_policies() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            ploy_dir: root.path().to_path_buf(),
            ..Config::default()
        };
        let archive = config.category_dir(DataKind::Archive);
        std::fs::create_dir_all(&archive).unwrap();
        std::fs::write(archive.join("blacklist.json"), r#"["^tmp/"]"#).unwrap();
        std::fs::write(
            archive.join("ploy.lua"),
            "function ploy(id, size) return size < 100 end",
        )
        .unwrap();

        let c = DepotCore::from_config(&config, Span::none()).unwrap();
        assert!(c.wants(&DataDescriptor::new(DataKind::Archive, b"a".to_vec(), 10)));
        assert!(!c.wants(&DataDescriptor::new(DataKind::Archive, b"a".to_vec(), 500)));
        assert!(!c.wants(&DataDescriptor::new(DataKind::Archive, b"tmp/a".to_vec(), 10)));
        assert!(!c.wants(&DataDescriptor::new(DataKind::Ledger, b"a".to_vec(), 10)));
    }
}
