// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use super::antiflood::{AntiFlood, FloodRejection};
use super::blacklist::PeerBlacklist;
use super::envelope::SignedMessage;
use super::messenger::Messenger;
use super::signature_store::SignatureStore;
use super::{InboundMessage, PeerId, SignatureBroadcaster};
use crate::config::{AntifloodConfig, P2pConfig};
use crate::crypto::{
    ed25519_public_key_bytes, recover_eth_signer, verify_ed25519, ED25519_SIGNATURE_LENGTH,
    ETH_SIGNATURE_LENGTH,
};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use crate::types::{h256_from_slice, EthereumSignature};
use async_trait::async_trait;
use ethers::types::{Address as EthAddress, H256};
use fastcrypto::ed25519::Ed25519KeyPair;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const SIGN_TOPIC_SUFFIX: &str = "sign";
pub const JOIN_TOPIC_SUFFIX: &str = "join";
const JOIN_PAYLOAD: &[u8] = b"join";

#[derive(Clone, Debug)]
pub struct GossipConfig {
    pub topic: String,
    pub absolute_max_slice_size: usize,
    pub blacklist_ttl: Duration,
    pub antiflood: AntifloodConfig,
}

impl GossipConfig {
    pub fn from_config(p2p: &P2pConfig, antiflood: &AntifloodConfig) -> Self {
        Self {
            topic: p2p.topic.clone(),
            absolute_max_slice_size: p2p.absolute_max_slice_size,
            blacklist_ttl: Duration::from_secs(p2p.blacklist_ttl_s),
            antiflood: antiflood.clone(),
        }
    }

    pub fn sign_topic(&self) -> String {
        format!("{}_{}", self.topic, SIGN_TOPIC_SUFFIX)
    }

    pub fn join_topic(&self) -> String {
        format!("{}_{}", self.topic, JOIN_TOPIC_SUFFIX)
    }
}

/// Why an inbound message was dropped. Never leaves the ingest path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GossipRejection {
    #[error("peer is blacklisted")]
    Blacklisted,
    #[error("anti-flood: {0}")]
    Flooded(FloodRejection),
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("unmarshalable envelope: {0}")]
    Unmarshal(String),
    #[error("invalid envelope signature: {0}")]
    BadSignature(String),
    #[error("public key is not a whitelisted relayer")]
    NotWhitelisted,
    #[error("replayed nonce {nonce}, last seen {last_seen}")]
    Replay { nonce: u64, last_seen: u64 },
    #[error("invalid payload: {0}")]
    BadPayload(String),
    #[error("invalid signature over message hash: {0}")]
    BadMessageSignature(String),
    #[error("{0:?} is not a Chain-E relayer")]
    UnknownEthSigner(EthAddress),
    #[error("{0:?} already signs for another relayer")]
    EthSignerClaimed(EthAddress),
}

impl GossipRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            GossipRejection::Blacklisted => "blacklisted",
            GossipRejection::Flooded(_) => "flooded",
            GossipRejection::UnknownTopic(_) => "unknown_topic",
            GossipRejection::Unmarshal(_) => "unmarshal",
            GossipRejection::BadSignature(_) => "bad_signature",
            GossipRejection::NotWhitelisted => "not_whitelisted",
            GossipRejection::Replay { .. } => "replay",
            GossipRejection::BadPayload(_) => "bad_payload",
            GossipRejection::BadMessageSignature(_) => "bad_message_signature",
            GossipRejection::UnknownEthSigner(_) => "unknown_eth_signer",
            GossipRejection::EthSignerClaimed(_) => "eth_signer_claimed",
        }
    }
}

pub struct GossipOverlay {
    config: GossipConfig,
    sign_topic: String,
    join_topic: String,
    keypair: Arc<Ed25519KeyPair>,
    own_pubkey: Vec<u8>,
    whitelist: RwLock<BTreeSet<Vec<u8>>>,
    eth_signers: RwLock<BTreeSet<EthAddress>>,
    // Chain-E signer to the relayer key that first gossiped it
    eth_signer_owners: Mutex<HashMap<EthAddress, Vec<u8>>>,
    last_seen_nonces: Mutex<HashMap<Vec<u8>, u64>>,
    nonce: AtomicU64,
    antiflood: AntiFlood,
    blacklist: PeerBlacklist,
    store: Arc<SignatureStore>,
    messenger: Arc<dyn Messenger>,
    metrics: Arc<BridgeMetrics>,
}

impl GossipOverlay {
    pub fn new(
        config: GossipConfig,
        keypair: Arc<Ed25519KeyPair>,
        store: Arc<SignatureStore>,
        messenger: Arc<dyn Messenger>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        // Seeding from the wall clock keeps nonces increasing across restarts,
        // so peers holding our last nonce accept us again.
        let initial_nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            sign_topic: config.sign_topic(),
            join_topic: config.join_topic(),
            antiflood: AntiFlood::new(config.antiflood.clone()),
            blacklist: PeerBlacklist::new(config.blacklist_ttl),
            own_pubkey: ed25519_public_key_bytes(&keypair),
            config,
            keypair,
            whitelist: RwLock::new(BTreeSet::new()),
            eth_signers: RwLock::new(BTreeSet::new()),
            eth_signer_owners: Mutex::new(HashMap::new()),
            last_seen_nonces: Mutex::new(HashMap::new()),
            nonce: AtomicU64::new(initial_nonce),
            store,
            messenger,
            metrics,
        }
    }

    pub fn own_pubkey(&self) -> &[u8] {
        &self.own_pubkey
    }

    pub fn local_peer(&self) -> &PeerId {
        self.messenger.local_peer()
    }

    pub fn store(&self) -> &Arc<SignatureStore> {
        &self.store
    }

    pub fn topics(&self) -> [&str; 2] {
        [&self.sign_topic, &self.join_topic]
    }

    pub fn set_whitelist(&self, keys: impl IntoIterator<Item = Vec<u8>>) {
        let keys: BTreeSet<Vec<u8>> = keys.into_iter().collect();
        info!("[Gossip] Whitelist updated with {} relayers", keys.len());
        *self.whitelist.write().unwrap_or_else(|e| e.into_inner()) = keys;
    }

    pub fn is_whitelisted(&self, pubkey: &[u8]) -> bool {
        self.whitelist
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(pubkey)
    }

    /// Chain-E addresses whose signatures may count toward a Chain-E quorum.
    pub fn set_eth_signers(&self, signers: impl IntoIterator<Item = EthAddress>) {
        let signers: BTreeSet<EthAddress> = signers.into_iter().collect();
        info!("[Gossip] Chain-E signer set updated with {} relayers", signers.len());
        *self.eth_signers.write().unwrap_or_else(|e| e.into_inner()) = signers;
    }

    pub fn is_eth_signer(&self, address: &EthAddress) -> bool {
        self.eth_signers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address)
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.blacklist.is_blacklisted(peer)
    }

    /// Wraps `payload` into a signed envelope carrying a fresh nonce.
    pub fn create_message(&self, payload: Vec<u8>) -> BridgeResult<Vec<u8>> {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst) + 1;
        SignedMessage::sign(&self.keypair, payload, nonce).marshal()
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> BridgeResult<()> {
        let data = self.create_message(payload)?;
        self.messenger.broadcast(topic, data).await
    }

    pub async fn broadcast_join(&self) -> BridgeResult<()> {
        self.publish(&self.join_topic, JOIN_PAYLOAD.to_vec()).await
    }

    async fn publish_signature(&self, message_hash: H256, signature: Vec<u8>) -> BridgeResult<()> {
        let payload = bcs::to_bytes(&EthereumSignature {
            signature,
            message_hash: message_hash.as_bytes().to_vec(),
        })
        .map_err(|e| BridgeError::Generic(e.to_string()))?;
        self.publish(&self.sign_topic, payload).await
    }

    async fn rebroadcast_own_signatures(&self) -> BridgeResult<()> {
        let own = self.store.signed_by(&self.own_pubkey);
        debug!("[Gossip] Rebroadcasting {} own signatures", own.len());
        for (message_hash, signature) in own {
            self.publish_signature(message_hash, signature).await?;
        }
        Ok(())
    }

    // An ed25519 signature must come from the sender's own key. An ECDSA one must recover
    // to a Chain-E relayer that no other sender already relayed.
    fn check_message_signature(
        &self,
        pubkey: &[u8],
        message_hash: &H256,
        signature: &[u8],
    ) -> Result<(), GossipRejection> {
        match signature.len() {
            ED25519_SIGNATURE_LENGTH => verify_ed25519(pubkey, message_hash.as_bytes(), signature)
                .map_err(|e| GossipRejection::BadMessageSignature(e.to_string())),
            ETH_SIGNATURE_LENGTH => {
                let signer = recover_eth_signer(message_hash, signature)
                    .map_err(|e| GossipRejection::BadMessageSignature(e.to_string()))?;
                if !self.is_eth_signer(&signer) {
                    return Err(GossipRejection::UnknownEthSigner(signer));
                }
                self.bind_eth_signer(signer, pubkey)
            }
            len => Err(GossipRejection::BadMessageSignature(format!(
                "unexpected signature length {}",
                len
            ))),
        }
    }

    fn bind_eth_signer(&self, signer: EthAddress, pubkey: &[u8]) -> Result<(), GossipRejection> {
        let mut owners = self
            .eth_signer_owners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match owners.get(&signer) {
            Some(owner) if owner.as_slice() != pubkey => {
                Err(GossipRejection::EthSignerClaimed(signer))
            }
            Some(_) => Ok(()),
            None => {
                owners.insert(signer, pubkey.to_vec());
                Ok(())
            }
        }
    }

    fn accept_nonce(&self, pubkey: &[u8], nonce: u64) -> Result<(), GossipRejection> {
        let mut last_seen = self
            .last_seen_nonces
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(last) = last_seen.get(pubkey) {
            if nonce <= *last {
                return Err(GossipRejection::Replay {
                    nonce,
                    last_seen: *last,
                });
            }
        }
        last_seen.insert(pubkey.to_vec(), nonce);
        Ok(())
    }

    fn blacklist_peers(&self, message: &InboundMessage) {
        self.blacklist.add(&message.direct_peer);
        self.metrics.gossip_peers_blacklisted.inc();
        if message.origin_peer != message.direct_peer {
            self.blacklist.add(&message.origin_peer);
            self.metrics.gossip_peers_blacklisted.inc();
        }
    }

    /// Runs the inbound pipeline on one message. Only a message that passes every
    /// check advances the sender's last seen nonce and reaches the signature store.
    pub async fn process_received_message(
        &self,
        message: &InboundMessage,
    ) -> Result<(), GossipRejection> {
        if self.blacklist.is_blacklisted(&message.direct_peer)
            || self.blacklist.is_blacklisted(&message.origin_peer)
        {
            return Err(GossipRejection::Blacklisted);
        }

        self.antiflood
            .can_process(
                &message.direct_peer,
                &message.topic,
                message.data.len(),
                message.sequence,
            )
            .map_err(GossipRejection::Flooded)?;
        if message.origin_peer != message.direct_peer {
            self.antiflood
                .can_process(&message.origin_peer, &message.topic, message.data.len(), 0)
                .map_err(GossipRejection::Flooded)?;
        }

        let is_sign_topic = message.topic == self.sign_topic;
        if !is_sign_topic && message.topic != self.join_topic {
            return Err(GossipRejection::UnknownTopic(message.topic.clone()));
        }

        let envelope =
            match SignedMessage::unmarshal(&message.data, self.config.absolute_max_slice_size) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.blacklist_peers(message);
                    return Err(GossipRejection::Unmarshal(e.to_string()));
                }
            };

        if let Err(e) = envelope.verify() {
            self.blacklist_peers(message);
            return Err(GossipRejection::BadSignature(e.to_string()));
        }

        if !self.is_whitelisted(&envelope.pubkey) {
            return Err(GossipRejection::NotWhitelisted);
        }

        if !is_sign_topic {
            self.accept_nonce(&envelope.pubkey, envelope.nonce)?;
            if let Err(e) = self.rebroadcast_own_signatures().await {
                warn!("[Gossip] Failed to answer join from {}: {:?}", message.origin_peer, e);
            }
            return Ok(());
        }

        let inner: EthereumSignature = bcs::from_bytes(&envelope.payload)
            .map_err(|e| GossipRejection::BadPayload(e.to_string()))?;
        let message_hash = h256_from_slice(&inner.message_hash)
            .map_err(|e| GossipRejection::BadPayload(e.to_string()))?;
        if let Err(rejection) =
            self.check_message_signature(&envelope.pubkey, &message_hash, &inner.signature)
        {
            if matches!(rejection, GossipRejection::BadMessageSignature(_)) {
                self.blacklist_peers(message);
            }
            return Err(rejection);
        }
        self.accept_nonce(&envelope.pubkey, envelope.nonce)?;
        if self
            .store
            .add(message_hash, envelope.pubkey, inner.signature)
        {
            self.metrics.gossip_signatures_admitted.inc();
            debug!(
                "[Gossip] Admitted signature for {:?} from {}",
                message_hash, message.origin_peer
            );
        }
        Ok(())
    }

    /// Drains the transport's inbound queue until cancelled.
    pub fn spawn_ingest(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!("[Gossip] Ingest started on {}", self.sign_topic);
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                self.metrics
                    .gossip_messages_received
                    .with_label_values(&[&message.topic])
                    .inc();
                if let Err(rejection) = self.process_received_message(&message).await {
                    self.metrics
                        .gossip_messages_rejected
                        .with_label_values(&[rejection.reason()])
                        .inc();
                    debug!(
                        "[Gossip] Dropped message from {} (origin {}): {}",
                        message.direct_peer, message.origin_peer, rejection
                    );
                }
            }
            info!("[Gossip] Ingest stopped");
        })
    }
}

#[async_trait]
impl SignatureBroadcaster for GossipOverlay {
    async fn broadcast_signature(&self, message_hash: H256, signature: Vec<u8>) -> BridgeResult<()> {
        if signature.len() == ETH_SIGNATURE_LENGTH {
            if let Ok(signer) = recover_eth_signer(&message_hash, &signature) {
                let _ = self.bind_eth_signer(signer, &self.own_pubkey);
            }
        }
        self.store
            .add(message_hash, self.own_pubkey.clone(), signature.clone());
        self.publish_signature(message_hash, signature).await
    }
}
