// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::crypto::{ed25519_public_key_bytes, sign_ed25519, verify_ed25519};
use crate::error::{BridgeError, BridgeResult};
use fastcrypto::ed25519::Ed25519KeyPair;
use serde::{Deserialize, Serialize};

// bcs overhead: three ULEB128 length prefixes plus the u64 nonce
const ENVELOPE_OVERHEAD: usize = 3 * 5 + 8;

/// Signed wrapper around every gossiped payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub payload: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
    pub nonce: u64,
}

impl SignedMessage {
    /// `payload || be64(nonce)`
    pub fn signing_bytes(payload: &[u8], nonce: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(payload.len() + 8);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes
    }

    pub fn sign(keypair: &Ed25519KeyPair, payload: Vec<u8>, nonce: u64) -> Self {
        let signature = sign_ed25519(keypair, &Self::signing_bytes(&payload, nonce));
        Self {
            payload,
            pubkey: ed25519_public_key_bytes(keypair),
            signature,
            nonce,
        }
    }

    pub fn marshal(&self) -> BridgeResult<Vec<u8>> {
        bcs::to_bytes(self).map_err(|e| BridgeError::Decode(e.to_string()))
    }

    /// Decodes an envelope, refusing any field longer than `max_slice_size`.
    pub fn unmarshal(data: &[u8], max_slice_size: usize) -> BridgeResult<Self> {
        if data.len() > max_slice_size.saturating_mul(3).saturating_add(ENVELOPE_OVERHEAD) {
            return Err(BridgeError::PeerProtocolViolation(format!(
                "envelope of {} bytes exceeds the size limit",
                data.len()
            )));
        }
        let message: SignedMessage = bcs::from_bytes(data)
            .map_err(|e| BridgeError::PeerProtocolViolation(format!("unmarshal: {}", e)))?;
        for (name, field) in [
            ("payload", &message.payload),
            ("pubkey", &message.pubkey),
            ("signature", &message.signature),
        ] {
            if field.len() > max_slice_size {
                return Err(BridgeError::PeerProtocolViolation(format!(
                    "{} of {} bytes exceeds {}",
                    name,
                    field.len(),
                    max_slice_size
                )));
            }
        }
        Ok(message)
    }

    pub fn verify(&self) -> BridgeResult<()> {
        verify_ed25519(
            &self.pubkey,
            &Self::signing_bytes(&self.payload, self.nonce),
            &self.signature,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_k_keypair;

    #[test]
    fn test_signing_bytes_layout() {
        let bytes = SignedMessage::signing_bytes(b"abc", 0x0102);
        assert_eq!(bytes, vec![b'a', b'b', b'c', 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_sign_verify_over_nonces() {
        let keypair = test_k_keypair(1);
        for nonce in [0u64, 1, 34, u64::MAX] {
            let message = SignedMessage::sign(&keypair, b"signature payload".to_vec(), nonce);
            message.verify().unwrap();
        }
    }

    #[test]
    fn test_tampered_nonce_fails_verification() {
        let keypair = test_k_keypair(1);
        let mut message = SignedMessage::sign(&keypair, b"payload".to_vec(), 34);
        message.nonce = 35;
        assert!(message.verify().is_err());
    }

    #[test]
    fn test_unmarshal_enforces_slice_cap() {
        let keypair = test_k_keypair(2);
        let message = SignedMessage::sign(&keypair, vec![7u8; 200], 1);
        let data = message.marshal().unwrap();

        assert_eq!(SignedMessage::unmarshal(&data, 256).unwrap(), message);
        assert!(matches!(
            SignedMessage::unmarshal(&data, 100),
            Err(BridgeError::PeerProtocolViolation(_))
        ));
    }

    #[test]
    fn test_unmarshal_garbage() {
        assert!(SignedMessage::unmarshal(&[0xff, 0xff, 0xff], 1024).is_err());
        assert!(SignedMessage::unmarshal(&[], 1024).is_err());
    }
}
