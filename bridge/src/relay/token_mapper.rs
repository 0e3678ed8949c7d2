// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{BridgeError, BridgeResult};
use crate::types::Direction;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::debug;

const TOKEN_CACHE_SIZE: usize = 256;

/// Source of the registered token pairs, kept by the Chain-K multisig.
#[async_trait]
pub trait TokenPairSource: Send + Sync {
    /// Counterpart of `source_token` on the destination of `direction`, if registered.
    async fn counterpart_token(
        &self,
        direction: Direction,
        source_token: &[u8],
    ) -> BridgeResult<Option<Vec<u8>>>;
}

/// Resolves deposit tokens into destination tokens for one direction.
pub struct TokenMapper {
    direction: Direction,
    source: Arc<dyn TokenPairSource>,
    cache: Mutex<LruCache<Vec<u8>, Vec<u8>>>,
}

impl TokenMapper {
    pub fn new(direction: Direction, source: Arc<dyn TokenPairSource>) -> Self {
        let size = NonZeroUsize::new(TOKEN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Self {
            direction,
            source,
            cache: Mutex::new(LruCache::new(size)),
        }
    }

    pub async fn convert_token(&self, source_token: &[u8]) -> BridgeResult<Vec<u8>> {
        if let Some(token) = self
            .cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_token)
        {
            return Ok(token.clone());
        }

        let token = self
            .source
            .counterpart_token(self.direction, source_token)
            .await?
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                BridgeError::UnknownToken(format!(
                    "{} has no counterpart for {}",
                    self.direction,
                    hex::encode(source_token)
                ))
            })?;
        debug!(
            "[{}] Mapped token {} to {}",
            self.direction,
            hex::encode(source_token),
            hex::encode(&token)
        );
        // Failed lookups are never cached; a pair registered later is picked up
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put(source_token.to_vec(), token.clone());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockTokenPairSource;

    #[tokio::test]
    async fn test_lookup_is_cached() {
        let source = Arc::new(MockTokenPairSource::default());
        source.add_pair(Direction::EthToK, b"erc20", b"USDC-abcdef");
        let mapper = TokenMapper::new(Direction::EthToK, source.clone());

        for _ in 0..3 {
            assert_eq!(mapper.convert_token(b"erc20").await.unwrap(), b"USDC-abcdef".to_vec());
        }
        assert_eq!(source.lookups(), 1);
    }

    #[tokio::test]
    async fn test_unknown_token_not_cached() {
        let source = Arc::new(MockTokenPairSource::default());
        let mapper = TokenMapper::new(Direction::KToEth, source.clone());

        assert!(matches!(
            mapper.convert_token(b"USDC-abcdef").await,
            Err(BridgeError::UnknownToken(_))
        ));
        source.add_pair(Direction::KToEth, b"USDC-abcdef", b"erc20");
        assert_eq!(mapper.convert_token(b"USDC-abcdef").await.unwrap(), b"erc20".to_vec());
        assert_eq!(source.lookups(), 2);
    }

    #[tokio::test]
    async fn test_directions_are_separate() {
        let source = Arc::new(MockTokenPairSource::default());
        source.add_pair(Direction::EthToK, b"a", b"b");
        let mapper = TokenMapper::new(Direction::KToEth, source);
        assert!(mapper.convert_token(b"a").await.is_err());
    }
}
