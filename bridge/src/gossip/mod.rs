// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Signed pub/sub overlay used by relayers to exchange batch signatures.

use crate::error::BridgeResult;
use async_trait::async_trait;
use ethers::types::H256;
use std::fmt;

pub mod antiflood;
pub mod blacklist;
pub mod envelope;
pub mod messenger;
pub mod overlay;
pub mod server;
pub mod signature_store;

pub use envelope::SignedMessage;
pub use messenger::{HttpMessenger, InMemoryHub, Messenger};
pub use overlay::{GossipConfig, GossipOverlay, GossipRejection};
pub use signature_store::SignatureStore;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message as handed over by the transport. `direct_peer` delivered it,
/// `origin_peer` claims to have created it.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub topic: String,
    pub data: Vec<u8>,
    pub direct_peer: PeerId,
    pub origin_peer: PeerId,
    pub sequence: u64,
}

/// Fan-out of this relayer's own signatures to its peers.
#[async_trait]
pub trait SignatureBroadcaster: Send + Sync {
    async fn broadcast_signature(&self, message_hash: H256, signature: Vec<u8>) -> BridgeResult<()>;
}
