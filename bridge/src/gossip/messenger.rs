// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use super::{InboundMessage, PeerId};
use crate::error::{BridgeError, BridgeResult};
use crate::metrics::BridgeMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const ORIGIN_PEER_HEADER: &str = "x-origin-peer";
pub const SEQUENCE_HEADER: &str = "x-sequence";
pub const GOSSIP_PATH_PREFIX: &str = "/gossip";

/// Delivers raw envelope bytes to every other relayer on a topic.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn local_peer(&self) -> &PeerId;
    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> BridgeResult<()>;
}

/// Broadcasts by POSTing to each configured peer's gossip endpoint.
pub struct HttpMessenger {
    client: reqwest::Client,
    local_peer: PeerId,
    peers: Vec<String>,
    sequence: AtomicU64,
    metrics: Arc<BridgeMetrics>,
}

impl HttpMessenger {
    pub fn new(
        local_peer: PeerId,
        peers: Vec<String>,
        request_timeout: Duration,
        metrics: Arc<BridgeMetrics>,
    ) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| BridgeError::Generic(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            client,
            local_peer,
            peers: peers
                .into_iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect(),
            sequence: AtomicU64::new(0),
            metrics,
        })
    }

    pub fn gossip_url(peer: &str, topic: &str) -> String {
        format!("{}{}/{}", peer, GOSSIP_PATH_PREFIX, topic)
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> BridgeResult<()> {
        if self.peers.is_empty() {
            return Ok(());
        }
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let requests = self.peers.iter().map(|peer| {
            let url = Self::gossip_url(peer, topic);
            let request = self
                .client
                .post(&url)
                .header(ORIGIN_PEER_HEADER, self.local_peer.as_str())
                .header(SEQUENCE_HEADER, sequence.to_string())
                .body(data.clone());
            async move {
                match request.send().await.and_then(|r| r.error_for_status()) {
                    Ok(_) => true,
                    Err(e) => {
                        debug!("[Gossip] Failed to deliver to {}: {}", url, e);
                        false
                    }
                }
            }
        });
        let results = futures::future::join_all(requests).await;
        let failures = results.iter().filter(|ok| !**ok).count();
        if failures > 0 {
            self.metrics.gossip_broadcast_errors.inc_by(failures as u64);
            warn!(
                "[Gossip] Broadcast on {} reached {}/{} peers",
                topic,
                results.len() - failures,
                results.len()
            );
        }
        if failures == results.len() {
            return Err(BridgeError::TransientRpc(format!(
                "broadcast on {} reached no peer",
                topic
            )));
        }
        Ok(())
    }
}

/// In-process broadcast hub connecting several relayers, used by tests.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::Sender<InboundMessage>>>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, peer: PeerId) -> (InMemoryMessenger, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(1024);
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.clone(), tx);
        let messenger = InMemoryMessenger {
            hub: self.clone(),
            local_peer: peer,
            sequence: Arc::new(AtomicU64::new(0)),
        };
        (messenger, rx)
    }

    /// Delivers a message straight to one peer, as a misbehaving sender would.
    pub async fn inject(&self, to: &PeerId, message: InboundMessage) -> BridgeResult<()> {
        let sender = self
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(to)
            .cloned()
            .ok_or_else(|| BridgeError::Generic(format!("unknown peer {}", to)))?;
        sender
            .send(message)
            .await
            .map_err(|_| BridgeError::Generic(format!("peer {} is gone", to)))
    }
}

#[derive(Clone)]
pub struct InMemoryMessenger {
    hub: InMemoryHub,
    local_peer: PeerId,
    sequence: Arc<AtomicU64>,
}

#[async_trait]
impl Messenger for InMemoryMessenger {
    fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    async fn broadcast(&self, topic: &str, data: Vec<u8>) -> BridgeResult<()> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let targets: Vec<mpsc::Sender<InboundMessage>> = self
            .hub
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(peer, _)| **peer != self.local_peer)
            .map(|(_, tx)| tx.clone())
            .collect();
        for tx in targets {
            let message = InboundMessage {
                topic: topic.to_string(),
                data: data.clone(),
                direct_peer: self.local_peer.clone(),
                origin_peer: self.local_peer.clone(),
                sequence,
            };
            // A stopped relayer is not an error for the sender
            let _ = tx.send(message).await;
        }
        Ok(())
    }
}
