// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! Single value TTL cache for proxy data that changes rarely, such as the network config.

use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct TtlCache<T: Clone + Send + Sync> {
    entry: RwLock<Option<(T, Instant)>>,
    cache_duration: Duration,
}

impl<T: Clone + Send + Sync> TtlCache<T> {
    pub fn new(cache_duration: Duration) -> Self {
        Self {
            entry: RwLock::new(None),
            cache_duration,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    pub async fn get_if_valid(&self) -> Option<T> {
        let entry = self.entry.read().await;
        match &*entry {
            Some((value, updated_at)) if updated_at.elapsed() < self.cache_duration => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    pub async fn update(&self, value: T) {
        *self.entry.write().await = Some((value, Instant::now()));
    }

    /// Returns the cached value, or runs `fetch` and caches its successful result.
    pub async fn get_or_fetch<E, F, Fut>(&self, fetch: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get_if_valid().await {
            return Ok(value);
        }
        let value = fetch().await?;
        self.update(value.clone()).await;
        Ok(value)
    }
}
