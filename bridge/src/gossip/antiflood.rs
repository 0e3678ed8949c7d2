// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-peer flood protection for inbound gossip.
//!
//! Each peer gets two token buckets, one counting messages and one counting bytes.
//! Recently seen `(topic, sequence)` pairs are remembered so a transport level
//! duplicate is rejected before it reaches the envelope decoder.

use super::PeerId;
use crate::config::AntifloodConfig;
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const RECENT_SEQUENCES_PER_PEER: usize = 256;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FloodRejection {
    #[error("message rate exceeded")]
    MessageRate,
    #[error("byte rate exceeded")]
    ByteRate,
    #[error("duplicate sequence {0}")]
    Duplicate(u64),
    #[error("too many tracked peers")]
    TooManyPeers,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(rate_per_sec: f64, burst_factor: u32) -> Self {
        let capacity = rate_per_sec * burst_factor.max(1) as f64;
        Self {
            tokens: capacity,
            capacity,
            refill_rate: rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_update = now;
    }

    fn has(&self, amount: f64) -> bool {
        self.tokens >= amount
    }

    fn consume(&mut self, amount: f64) {
        self.tokens -= amount;
    }
}

struct PeerState {
    messages: TokenBucket,
    bytes: TokenBucket,
    recent_sequences: LruCache<(String, u64), ()>,
    last_request: Instant,
}

impl PeerState {
    fn new(config: &AntifloodConfig) -> Self {
        Self {
            messages: TokenBucket::new(
                config.max_messages_per_peer_per_sec as f64,
                config.burst_factor,
            ),
            bytes: TokenBucket::new(config.max_bytes_per_peer_per_sec as f64, config.burst_factor),
            recent_sequences: LruCache::new(
                NonZeroUsize::new(RECENT_SEQUENCES_PER_PEER).unwrap_or(NonZeroUsize::MIN),
            ),
            last_request: Instant::now(),
        }
    }
}

struct FloodState {
    peers: HashMap<PeerId, PeerState>,
    last_cleanup: Instant,
}

pub struct AntiFlood {
    config: AntifloodConfig,
    state: Mutex<FloodState>,
}

impl AntiFlood {
    pub fn new(config: AntifloodConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FloodState {
                peers: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// Consults and charges the peer's budget for one message. Sequence 0 means the
    /// transport did not assign one and skips duplicate detection.
    pub fn can_process(
        &self,
        peer: &PeerId,
        topic: &str,
        size: usize,
        sequence: u64,
    ) -> Result<(), FloodRejection> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        if now.duration_since(state.last_cleanup) > CLEANUP_INTERVAL {
            let ttl = Duration::from_secs(self.config.peer_ttl_s);
            state
                .peers
                .retain(|_, peer| now.duration_since(peer.last_request) <= ttl);
            state.last_cleanup = now;
        }

        if !state.peers.contains_key(peer) && state.peers.len() >= self.config.max_tracked_peers {
            let oldest = state
                .peers
                .iter()
                .min_by_key(|(_, p)| p.last_request)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(oldest) => {
                    state.peers.remove(&oldest);
                }
                None => return Err(FloodRejection::TooManyPeers),
            }
        }

        let config = &self.config;
        let peer_state = state
            .peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState::new(config));
        peer_state.last_request = now;

        if sequence != 0 {
            let key = (topic.to_string(), sequence);
            if peer_state.recent_sequences.contains(&key) {
                return Err(FloodRejection::Duplicate(sequence));
            }
            peer_state.recent_sequences.put(key, ());
        }

        peer_state.messages.refill(now);
        peer_state.bytes.refill(now);
        if !peer_state.messages.has(1.0) {
            return Err(FloodRejection::MessageRate);
        }
        if !peer_state.bytes.has(size as f64) {
            return Err(FloodRejection::ByteRate);
        }
        peer_state.messages.consume(1.0);
        peer_state.bytes.consume(size as f64);
        Ok(())
    }

    pub fn tracked_peer_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .peers
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(messages: u32, bytes: u64) -> AntifloodConfig {
        AntifloodConfig {
            max_messages_per_peer_per_sec: messages,
            max_bytes_per_peer_per_sec: bytes,
            burst_factor: 1,
            max_tracked_peers: 2,
            peer_ttl_s: 300,
        }
    }

    fn peer(name: &str) -> PeerId {
        PeerId::new(name)
    }

    #[test]
    fn test_message_budget_exhausts_and_recovers() {
        let antiflood = AntiFlood::new(config(20, 1_000_000));
        let p = peer("a");
        for _ in 0..20 {
            antiflood.can_process(&p, "sign", 10, 0).unwrap();
        }
        assert_eq!(
            antiflood.can_process(&p, "sign", 10, 0),
            Err(FloodRejection::MessageRate)
        );
        // Other peers have their own budget
        antiflood.can_process(&peer("b"), "sign", 10, 0).unwrap();

        std::thread::sleep(Duration::from_millis(120));
        antiflood.can_process(&p, "sign", 10, 0).unwrap();
    }

    #[test]
    fn test_byte_budget() {
        let antiflood = AntiFlood::new(config(100, 1_000));
        let p = peer("a");
        antiflood.can_process(&p, "sign", 900, 0).unwrap();
        assert_eq!(
            antiflood.can_process(&p, "sign", 200, 0),
            Err(FloodRejection::ByteRate)
        );
        antiflood.can_process(&p, "sign", 50, 0).unwrap();
    }

    #[test]
    fn test_duplicate_sequence_rejected_per_topic() {
        let antiflood = AntiFlood::new(config(100, 1_000_000));
        let p = peer("a");
        antiflood.can_process(&p, "sign", 10, 5).unwrap();
        assert_eq!(
            antiflood.can_process(&p, "sign", 10, 5),
            Err(FloodRejection::Duplicate(5))
        );
        antiflood.can_process(&p, "join", 10, 5).unwrap();
        antiflood.can_process(&p, "sign", 10, 6).unwrap();
    }

    #[test]
    fn test_tracked_peers_bounded() {
        let antiflood = AntiFlood::new(config(100, 1_000_000));
        antiflood.can_process(&peer("a"), "sign", 1, 0).unwrap();
        antiflood.can_process(&peer("b"), "sign", 1, 0).unwrap();
        antiflood.can_process(&peer("c"), "sign", 1, 0).unwrap();
        assert_eq!(antiflood.tracked_peer_count(), 2);
    }
}
