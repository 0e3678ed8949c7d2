// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use super::PeerId;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Peers that sent malformed or forged envelopes, banned until their TTL expires.
pub struct PeerBlacklist {
    ttl: Duration,
    entries: RwLock<HashMap<PeerId, Instant>>,
}

impl PeerBlacklist {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, peer: &PeerId) {
        self.add_with_ttl(peer, self.ttl);
    }

    pub fn add_with_ttl(&self, peer: &PeerId, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let entry = entries.entry(peer.clone()).or_insert(expires_at);
        if *entry < expires_at {
            *entry = expires_at;
        }
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        let now = Instant::now();
        let expired = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(peer) {
                None => return false,
                Some(expires_at) if *expires_at > now => return true,
                Some(_) => true,
            }
        };
        if expired {
            self.entries
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|_, expires_at| *expires_at > now);
        }
        false
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|expires_at| **expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
