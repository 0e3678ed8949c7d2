// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use ethers::types::H256;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

type SignerSet = BTreeMap<Vec<u8>, Vec<u8>>;

/// Relayer signatures gathered per message hash.
///
/// Each message hash owns its own lock; the outer map is only write-locked to
/// create or drop an entry. Signers are kept ordered by public key so the
/// signature list handed to an execute call is reproducible across relayers.
#[derive(Default)]
pub struct SignatureStore {
    entries: RwLock<HashMap<H256, Arc<Mutex<SignerSet>>>>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, message_hash: &H256) -> Option<Arc<Mutex<SignerSet>>> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_hash)
            .cloned()
    }

    fn entry_or_create(&self, message_hash: &H256) -> Arc<Mutex<SignerSet>> {
        if let Some(entry) = self.entry(message_hash) {
            return entry;
        }
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(*message_hash)
            .or_default()
            .clone()
    }

    /// Returns true when the signer was not present yet. A signer that already
    /// signed this hash keeps its first signature.
    pub fn add(&self, message_hash: H256, pubkey: Vec<u8>, signature: Vec<u8>) -> bool {
        let entry = self.entry_or_create(&message_hash);
        let mut signers = entry.lock().unwrap_or_else(|e| e.into_inner());
        if signers.contains_key(&pubkey) {
            return false;
        }
        signers.insert(pubkey, signature);
        true
    }

    pub fn count(&self, message_hash: &H256) -> usize {
        self.entry(message_hash)
            .map(|entry| entry.lock().unwrap_or_else(|e| e.into_inner()).len())
            .unwrap_or(0)
    }

    /// `(pubkey, signature)` pairs by ascending public key.
    pub fn signatures(&self, message_hash: &H256) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.entry(message_hash)
            .map(|entry| {
                entry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .iter()
                    .map(|(pubkey, signature)| (pubkey.clone(), signature.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every `(message_hash, signature)` the given signer contributed.
    pub fn signed_by(&self, pubkey: &[u8]) -> Vec<(H256, Vec<u8>)> {
        let entries: Vec<(H256, Arc<Mutex<SignerSet>>)> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(hash, entry)| (*hash, entry.clone()))
            .collect();
        entries
            .into_iter()
            .filter_map(|(hash, entry)| {
                entry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(pubkey)
                    .map(|signature| (hash, signature.clone()))
            })
            .collect()
    }

    pub fn clear(&self, message_hash: &H256) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(message_hash);
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
