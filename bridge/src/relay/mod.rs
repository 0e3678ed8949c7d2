// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod chain_client;
pub mod state_machine;
pub mod token_mapper;

pub use chain_client::BridgeChainClient;
pub use state_machine::{BatchRelayStateMachine, RelayState, SignerSet, StateMachineConfig};
pub use token_mapper::{TokenMapper, TokenPairSource};
