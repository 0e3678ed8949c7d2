// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP endpoint of the gossip transport, plus health, ping and metrics routes.

use super::messenger::{GOSSIP_PATH_PREFIX, ORIGIN_PEER_HEADER, SEQUENCE_HEADER};
use super::{InboundMessage, PeerId};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PING_PATH: &str = "/ping";
pub const HEALTH_PATH: &str = "/health";
pub const METRICS_PATH: &str = "/metrics";

// Public metadata returned by `/ping`. Everything here is visible to anyone.
#[derive(Clone, Debug, serde::Serialize)]
pub struct BridgeNodePublicMetadata {
    pub version: &'static str,
    pub peer_id: String,
    pub pubkey: String,
}

impl BridgeNodePublicMetadata {
    pub fn new(version: &'static str, peer_id: &PeerId, pubkey: &[u8]) -> Self {
        Self {
            version,
            peer_id: peer_id.to_string(),
            pubkey: hex::encode(pubkey),
        }
    }

    pub fn empty_for_testing() -> Self {
        Self {
            version: "testing",
            peer_id: String::new(),
            pubkey: String::new(),
        }
    }
}

#[derive(Clone)]
struct ServerState {
    inbound: mpsc::Sender<InboundMessage>,
    registry: Registry,
    metadata: Arc<BridgeNodePublicMetadata>,
}

pub async fn run_server(
    socket_address: SocketAddr,
    inbound: mpsc::Sender<InboundMessage>,
    registry: Registry,
    metadata: Arc<BridgeNodePublicMetadata>,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(socket_address).await?;
    info!("[Gossip] Listening on {}", listener.local_addr()?);
    let router = make_router(inbound, registry, metadata);
    Ok(tokio::spawn(async move {
        let result = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await;
        if let Err(e) = result {
            warn!("[Gossip] Server stopped with error: {:?}", e);
        }
    }))
}

pub(crate) fn make_router(
    inbound: mpsc::Sender<InboundMessage>,
    registry: Registry,
    metadata: Arc<BridgeNodePublicMetadata>,
) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route(HEALTH_PATH, get(health_check))
        .route(PING_PATH, get(ping))
        .route(METRICS_PATH, get(metrics))
        .route(&format!("{}/:topic", GOSSIP_PATH_PREFIX), post(receive_gossip))
        .with_state(ServerState {
            inbound,
            registry,
            metadata,
        })
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn ping(State(state): State<ServerState>) -> Json<Arc<BridgeNodePublicMetadata>> {
    Json(state.metadata)
}

async fn metrics(State(state): State<ServerState>) -> (StatusCode, String) {
    encode_metrics(&state.registry)
}

async fn metrics_only(State(registry): State<Registry>) -> (StatusCode, String) {
    encode_metrics(&registry)
}

fn encode_metrics(registry: &Registry) -> (StatusCode, String) {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Standalone `/metrics` listener for scrapers kept off the gossip port.
pub async fn run_metrics_server(
    socket_address: SocketAddr,
    registry: Registry,
    cancel: CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(socket_address).await?;
    info!("Metrics server listening on {}", listener.local_addr()?);
    let router = Router::new()
        .route(METRICS_PATH, get(metrics_only))
        .with_state(registry);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!("Metrics server stopped with error: {:?}", e);
        }
    }))
}

async fn receive_gossip(
    State(state): State<ServerState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(topic): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let direct_peer = PeerId::new(remote.ip().to_string());
    let origin_peer = headers
        .get(ORIGIN_PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(PeerId::new)
        .unwrap_or_else(|| direct_peer.clone());
    let sequence = headers
        .get(SEQUENCE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let message = InboundMessage {
        topic,
        data: body.to_vec(),
        direct_peer,
        origin_peer,
        sequence,
    };
    // Never block the connection on a slow ingest loop
    match state.inbound.try_send(message) {
        Ok(()) => StatusCode::ACCEPTED,
        Err(mpsc::error::TrySendError::Full(message)) => {
            debug!(
                "[Gossip] Inbound queue full, dropping message from {}",
                message.direct_peer
            );
            StatusCode::TOO_MANY_REQUESTS
        }
        Err(mpsc::error::TrySendError::Closed(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
