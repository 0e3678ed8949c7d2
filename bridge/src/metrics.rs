// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Registry,
};

const LATENCY_SEC_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 0.75, 1.0, 1.5, 2.0, 3.0, 5.0, 7.5, 10., 15., 20., 30.,
    45., 60., 90., 120.,
];

#[derive(Clone, Debug)]
pub struct BridgeMetrics {
    pub(crate) relay_state: IntGaugeVec,
    pub(crate) relay_tick_errors: IntCounterVec,
    pub(crate) relay_batches_executed: IntCounterVec,
    pub(crate) relay_batches_rejected: IntCounterVec,
    pub(crate) relay_current_batch_id: IntGaugeVec,
    pub(crate) relay_signatures_broadcast: IntCounterVec,

    pub(crate) gossip_messages_received: IntCounterVec,
    pub(crate) gossip_messages_rejected: IntCounterVec,
    pub(crate) gossip_signatures_admitted: IntCounter,
    pub(crate) gossip_peers_blacklisted: IntCounter,
    pub(crate) gossip_broadcast_errors: IntCounter,

    pub(crate) sc_calls_executed: IntCounter,
    pub(crate) sc_calls_skipped: IntCounterVec,
    pub(crate) sc_calls_failed: IntCounter,
    pub(crate) sc_calls_pending: IntGauge,

    pub(crate) nonce_gaps: IntCounter,
    pub(crate) txs_resent: IntCounter,
    pub(crate) txs_sent: IntCounterVec,

    pub(crate) k_client_available: IntGauge,
    pub(crate) k_proxy_queries: IntCounterVec,
    pub(crate) k_proxy_errors: IntCounterVec,
    pub(crate) k_proxy_latency: HistogramVec,
    pub(crate) eth_rpc_queries: IntCounterVec,
    pub(crate) eth_rpc_errors: IntCounterVec,
}

impl BridgeMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            relay_state: register_int_gauge_vec_with_registry!(
                "bridge_relay_state",
                "Current state of the relay state machine, as an ordinal",
                &["direction"],
                registry,
            )
            .unwrap(),
            relay_tick_errors: register_int_counter_vec_with_registry!(
                "bridge_relay_tick_errors",
                "Total number of errors observed while ticking a relay state machine",
                &["direction", "error_type"],
                registry,
            )
            .unwrap(),
            relay_batches_executed: register_int_counter_vec_with_registry!(
                "bridge_relay_batches_executed",
                "Total number of actions confirmed as executed on the destination",
                &["direction", "kind"],
                registry,
            )
            .unwrap(),
            relay_batches_rejected: register_int_counter_vec_with_registry!(
                "bridge_relay_batches_rejected",
                "Total number of batches that entered the rejected state",
                &["direction", "reason"],
                registry,
            )
            .unwrap(),
            relay_current_batch_id: register_int_gauge_vec_with_registry!(
                "bridge_relay_current_batch_id",
                "Id of the batch currently handled by the relay state machine",
                &["direction"],
                registry,
            )
            .unwrap(),
            relay_signatures_broadcast: register_int_counter_vec_with_registry!(
                "bridge_relay_signatures_broadcast",
                "Total number of signatures this relayer broadcast",
                &["direction"],
                registry,
            )
            .unwrap(),
            gossip_messages_received: register_int_counter_vec_with_registry!(
                "bridge_gossip_messages_received",
                "Total number of gossip messages received, by topic",
                &["topic"],
                registry,
            )
            .unwrap(),
            gossip_messages_rejected: register_int_counter_vec_with_registry!(
                "bridge_gossip_messages_rejected",
                "Total number of gossip messages dropped, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            gossip_signatures_admitted: register_int_counter_with_registry!(
                "bridge_gossip_signatures_admitted",
                "Total number of peer signatures admitted to the signature store",
                registry,
            )
            .unwrap(),
            gossip_peers_blacklisted: register_int_counter_with_registry!(
                "bridge_gossip_peers_blacklisted",
                "Total number of peer blacklisting events",
                registry,
            )
            .unwrap(),
            gossip_broadcast_errors: register_int_counter_with_registry!(
                "bridge_gossip_broadcast_errors",
                "Total number of failed deliveries to gossip peers",
                registry,
            )
            .unwrap(),
            sc_calls_executed: register_int_counter_with_registry!(
                "bridge_sc_calls_executed",
                "Total number of SC-proxy calls submitted for execution",
                registry,
            )
            .unwrap(),
            sc_calls_skipped: register_int_counter_vec_with_registry!(
                "bridge_sc_calls_skipped",
                "Total number of SC-proxy calls skipped, by reason",
                &["reason"],
                registry,
            )
            .unwrap(),
            sc_calls_failed: register_int_counter_with_registry!(
                "bridge_sc_calls_failed",
                "Total number of SC-proxy calls whose execution failed",
                registry,
            )
            .unwrap(),
            sc_calls_pending: register_int_gauge_with_registry!(
                "bridge_sc_calls_pending",
                "Number of pending operations reported by the SC proxy in the last cycle",
                registry,
            )
            .unwrap(),
            nonce_gaps: register_int_counter_with_registry!(
                "bridge_nonce_gaps",
                "Total number of nonce gaps detected against the chain",
                registry,
            )
            .unwrap(),
            txs_resent: register_int_counter_with_registry!(
                "bridge_txs_resent",
                "Total number of Chain-K transactions rebroadcast",
                registry,
            )
            .unwrap(),
            txs_sent: register_int_counter_vec_with_registry!(
                "bridge_txs_sent",
                "Total number of transactions sent, by chain and function",
                &["chain", "function"],
                registry,
            )
            .unwrap(),
            k_client_available: register_int_gauge_with_registry!(
                "bridge_k_client_available",
                "1 if the Chain-K node keeps producing blocks, 0 otherwise",
                registry,
            )
            .unwrap(),
            k_proxy_queries: register_int_counter_vec_with_registry!(
                "bridge_k_proxy_queries",
                "Total number of Chain-K proxy requests, by endpoint",
                &["endpoint"],
                registry,
            )
            .unwrap(),
            k_proxy_errors: register_int_counter_vec_with_registry!(
                "bridge_k_proxy_errors",
                "Total number of failed Chain-K proxy requests, by endpoint",
                &["endpoint"],
                registry,
            )
            .unwrap(),
            k_proxy_latency: register_histogram_vec_with_registry!(
                "bridge_k_proxy_latency",
                "Latency of Chain-K proxy requests, by endpoint",
                &["endpoint"],
                LATENCY_SEC_BUCKETS.to_vec(),
                registry,
            )
            .unwrap(),
            eth_rpc_queries: register_int_counter_vec_with_registry!(
                "bridge_eth_rpc_queries",
                "Total number of Chain-E contract calls, by function",
                &["function"],
                registry,
            )
            .unwrap(),
            eth_rpc_errors: register_int_counter_vec_with_registry!(
                "bridge_eth_rpc_errors",
                "Total number of failed Chain-E contract calls, by function",
                &["function"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn new_for_testing() -> Self {
        let registry = Registry::new();
        Self::new(&registry)
    }
}
