// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::metrics::BridgeMetrics;
use ethers::providers::{Http, HttpClientError, JsonRpcClient, Provider};
use reqwest::Url;
use serde::{de::DeserializeOwned, Serialize};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Http transport that counts every JSON-RPC call and its failures per method.
#[derive(Debug, Clone)]
pub struct MeteredEthHttpProvider {
    inner: Http,
    metrics: Arc<BridgeMetrics>,
}

fn is_rate_limited(error: &HttpClientError) -> bool {
    let error = format!("{:?}", error).to_lowercase();
    error.contains("429") || error.contains("too many requests") || error.contains("-32005")
}

#[async_trait::async_trait]
impl JsonRpcClient for MeteredEthHttpProvider {
    type Error = HttpClientError;

    async fn request<T: Serialize + Send + Sync + Debug, R: DeserializeOwned + Send>(
        &self,
        method: &str,
        params: T,
    ) -> Result<R, HttpClientError> {
        self.metrics
            .eth_rpc_queries
            .with_label_values(&[method])
            .inc();

        let mut result = self.inner.request(method, &params).await;
        let mut retries = 0;
        while retries < MAX_RATE_LIMIT_RETRIES {
            match &result {
                Err(e) if is_rate_limited(e) => {}
                _ => break,
            }
            let delay = Duration::from_secs(1 << retries);
            tracing::warn!(
                "Rate limited on {}, retrying after {:?} (attempt {}/{})",
                method,
                delay,
                retries + 1,
                MAX_RATE_LIMIT_RETRIES
            );
            tokio::time::sleep(delay).await;
            result = self.inner.request(method, &params).await;
            retries += 1;
        }

        if result.is_err() {
            self.metrics
                .eth_rpc_errors
                .with_label_values(&[method])
                .inc();
        }
        result
    }
}

impl MeteredEthHttpProvider {
    pub fn new(url: Url, metrics: Arc<BridgeMetrics>) -> Self {
        Self {
            inner: Http::new(url),
            metrics,
        }
    }
}

pub fn new_metered_eth_provider(
    url: &str,
    metrics: Arc<BridgeMetrics>,
) -> anyhow::Result<Provider<MeteredEthHttpProvider>> {
    let url = Url::parse(url).map_err(|e| anyhow::anyhow!("invalid eth url {}: {}", url, e))?;
    Ok(Provider::new(MeteredEthHttpProvider::new(url, metrics)))
}
