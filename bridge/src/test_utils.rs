// Copyright (c) Klever Bridge Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::balance_validator::{BalanceValidator, TokenBalanceSource, TokenSideInfo};
use crate::config::{
    AntifloodConfig, BridgeNodeConfig, EthConfig, GasStationConfig, KConfig, KGasMapConfig,
    KProxyConfig, P2pConfig, PendingOperationsFilterConfig, RelayerConfig, ScCallsConfig,
    TransactionChecksConfig,
};
use crate::crypto::{ed25519_public_key_bytes, EthMessageSigner, KMessageSigner};
use crate::error::{BridgeError, BridgeResult};
use crate::gossip::{GossipConfig, SignatureBroadcaster, SignatureStore};
use crate::k_proxy::{Account, KProxy, NetworkConfig, NodeOverview, VmQuery};
use crate::metrics::BridgeMetrics;
use crate::relay::{
    BatchRelayStateMachine, BridgeChainClient, SignerSet, StateMachineConfig, TokenMapper,
    TokenPairSource,
};
use crate::types::{
    Action, ActionKind, Batch, ChainKind, Deposit, DepositStatus, Direction, KAddress,
    KTransaction, TransactionStatus, TxFees,
};
use async_trait::async_trait;
use ethers::signers::LocalWallet;
use ethers::types::{H256, U256};
use fastcrypto::ed25519::Ed25519KeyPair;
use klever_bridge_keys::{eth_wallet_from_secret, k_keypair_from_secret};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_secret(seed: u8) -> [u8; 32] {
    let mut secret = [0x11; 32];
    secret[31] = seed;
    secret
}

pub fn test_eth_wallet(seed: u8) -> LocalWallet {
    eth_wallet_from_secret(&test_secret(seed)).expect("valid test secret")
}

pub fn test_k_keypair(seed: u8) -> Ed25519KeyPair {
    k_keypair_from_secret(&test_secret(seed)).expect("valid test secret")
}

pub fn test_k_address(seed: u8) -> KAddress {
    KAddress::new([seed; 32])
}

/// A node config that passes `check_values`. Key files do not exist.
pub fn test_config() -> BridgeNodeConfig {
    BridgeNodeConfig {
        metrics_port: 9184,
        eth: EthConfig {
            network_address: "http://127.0.0.1:8545".to_string(),
            safe_contract: "0x5FbDB2315678afecb367f032d93F642f64180aa3".to_string(),
            multisig_contract: "0xe7f1725E7734CE288F8367e1Bb143E90bb3F0512".to_string(),
            private_key_file: PathBuf::from("keys/ethereum.sk"),
            chain_id: 1337,
            gas_limit_base: 350_000,
            gas_limit_for_each: 30_000,
            gas_station: GasStationConfig::default(),
        },
        k: KConfig {
            network_address: "http://127.0.0.1:8085".to_string(),
            safe_contract: test_k_address(0xaa).to_bech32(),
            multisig_contract: test_k_address(0xbb).to_bech32(),
            private_key_file: PathBuf::from("keys/klever.sk"),
            chain_id: "local".to_string(),
            proxy: KProxyConfig::default(),
            gas_map: KGasMapConfig {
                sign: 8_000_000,
                propose_transfer_base: 11_000_000,
                propose_transfer_for_each: 5_500_000,
                propose_status_base: 10_000_000,
                propose_status_for_each: 7_000_000,
                perform_action_base: 40_000_000,
                perform_action_for_each: 5_500_000,
                sc_call_per_byte: 100_000,
                sc_call_perform_for_each: 10_000_000,
            },
            interval_to_resend_txs_s: 60,
            client_availability_allow_delta: 2,
        },
        sc_calls: ScCallsConfig {
            enabled: true,
            sc_proxy_address: test_k_address(0x33).to_bech32(),
            private_key_file: None,
            extra_gas_to_execute: 60_000_000,
            max_gas_limit_to_use: 249_999_999,
            gas_limit_for_out_of_gas_transactions: 30_000_000,
            polling_interval_ms: 6_000,
            filter: PendingOperationsFilterConfig {
                allowed_eth_addresses: vec!["*".to_string()],
                allowed_k_addresses: vec!["*".to_string()],
                allowed_tokens: vec!["*".to_string()],
                ..Default::default()
            },
            transaction_checks: TransactionChecksConfig {
                check_transaction_results: true,
                time_between_checks_s: 1,
                execution_timeout_s: 10,
                close_app_on_error: false,
                extra_delay_on_error_s: 0,
            },
        },
        relayer: RelayerConfig {
            tick_interval_ms: 100,
            quorum_timeout_ticks: 50,
            confirmation_timeout_ticks: 50,
            execution_timeout_s: 5,
            status_check_interval_s: 60,
            p2p: P2pConfig {
                listen_port: 10010,
                peers: vec![],
                topic: "EthereumToKlever".to_string(),
                absolute_max_slice_size: 1 << 20,
                blacklist_ttl_s: 300,
                whitelisted_relayers: vec![],
                peer_id: None,
            },
            antiflood: AntifloodConfig::default(),
        },
    }
}

pub fn test_gossip_config() -> GossipConfig {
    GossipConfig {
        topic: "EthereumToKlever".to_string(),
        absolute_max_slice_size: 1 << 20,
        blacklist_ttl: Duration::from_secs(300),
        antiflood: AntifloodConfig::default(),
    }
}

/// A deposit of `amount` with no fee, 32 byte sender and 20 byte recipient.
pub fn test_deposit(nonce: u64, token: &[u8], amount: u64) -> Deposit {
    Deposit {
        deposit_nonce: nonce,
        from: vec![0x01; 32],
        to: vec![0x22; 20],
        source_token: token.to_vec(),
        amount: U256::from(amount),
        display_from: hex::encode([0x01; 32]),
        display_to: hex::encode([0x22; 20]),
        display_token: String::from_utf8_lossy(token).to_string(),
        ..Default::default()
    }
}

pub struct TestRelayer {
    pub eth_wallet: LocalWallet,
    pub k_keypair: Arc<Ed25519KeyPair>,
    pub signers: SignerSet,
}

pub fn test_relayer(seed: u8) -> TestRelayer {
    let eth_wallet = test_eth_wallet(seed);
    let k_keypair = Arc::new(test_k_keypair(seed));
    TestRelayer {
        signers: SignerSet {
            eth: Arc::new(EthMessageSigner::new(eth_wallet.clone())),
            k: Arc::new(KMessageSigner::new(k_keypair.clone())),
        },
        eth_wallet,
        k_keypair,
    }
}

/// usdc on Chain-E is native with 1_000_000 locked; USDC-abcdef on Chain-K is
/// mint-burn with 10_000 minted.
pub fn test_token_sources() -> (
    Arc<MockTokenPairSource>,
    Arc<MockTokenBalanceSource>,
    Arc<MockTokenBalanceSource>,
) {
    let pairs = Arc::new(MockTokenPairSource::default());
    pairs.add_pair(Direction::EthToK, b"usdc", b"USDC-abcdef");
    pairs.add_pair(Direction::KToEth, b"USDC-abcdef", b"usdc");
    let eth_balances = Arc::new(MockTokenBalanceSource::new(ChainKind::Eth));
    eth_balances.set(
        b"usdc",
        TokenSideInfo {
            is_native: true,
            total: 1_000_000.into(),
            ..Default::default()
        },
    );
    let k_balances = Arc::new(MockTokenBalanceSource::new(ChainKind::K));
    k_balances.set(
        b"USDC-abcdef",
        TokenSideInfo {
            is_mint_burn: true,
            mint: 10_000.into(),
            ..Default::default()
        },
    );
    (pairs, eth_balances, k_balances)
}

pub fn test_state_machine_with(
    direction: Direction,
    eth: Arc<MockChainClient>,
    k: Arc<MockChainClient>,
    relayer: &TestRelayer,
    broadcaster: Arc<dyn SignatureBroadcaster>,
    store: Arc<SignatureStore>,
    config: StateMachineConfig,
) -> BatchRelayStateMachine {
    let (pairs, eth_balances, k_balances) = test_token_sources();
    let (source, destination): (Arc<dyn BridgeChainClient>, Arc<dyn BridgeChainClient>) =
        match direction {
            Direction::EthToK => (eth, k),
            Direction::KToEth => (k, eth),
        };
    BatchRelayStateMachine::new(
        direction,
        source,
        destination,
        Arc::new(TokenMapper::new(direction, pairs)),
        Arc::new(BalanceValidator::new(eth_balances, k_balances)),
        relayer.signers.clone(),
        broadcaster,
        store,
        config,
        Arc::new(BridgeMetrics::new_for_testing()),
    )
}

/// A machine for relayer `seed` that records its broadcasts into a private store.
pub fn test_state_machine(
    direction: Direction,
    eth: Arc<MockChainClient>,
    k: Arc<MockChainClient>,
    seed: u8,
) -> BatchRelayStateMachine {
    let relayer = test_relayer(seed);
    let store = Arc::new(SignatureStore::new());
    let broadcaster = Arc::new(RecordingBroadcaster::new(
        store.clone(),
        ed25519_public_key_bytes(&relayer.k_keypair),
    ));
    test_state_machine_with(
        direction,
        eth,
        k,
        &relayer,
        broadcaster,
        store,
        StateMachineConfig {
            quorum_timeout_ticks: 50,
            confirmation_timeout_ticks: 50,
        },
    )
}

/// Puts its own signatures straight into a local store and records the hashes.
pub struct RecordingBroadcaster {
    store: Arc<SignatureStore>,
    pubkey: Vec<u8>,
    broadcasts: Mutex<Vec<H256>>,
}

impl RecordingBroadcaster {
    pub fn new(store: Arc<SignatureStore>, pubkey: Vec<u8>) -> Self {
        Self {
            store,
            pubkey,
            broadcasts: Mutex::new(vec![]),
        }
    }

    pub fn broadcasts(&self) -> Vec<H256> {
        self.broadcasts.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignatureBroadcaster for RecordingBroadcaster {
    async fn broadcast_signature(&self, message_hash: H256, signature: Vec<u8>) -> BridgeResult<()> {
        self.store.add(message_hash, self.pubkey.clone(), signature);
        self.broadcasts.lock().unwrap().push(message_hash);
        Ok(())
    }
}

/// JSON-RPC transport answering `eth_call` by function selector and every other method
/// by name, so a test does not depend on the order requests are made in.
#[derive(Clone, Debug, Default)]
pub struct EthMockProvider {
    responses: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl EthMockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers calls to `signature`, e.g. `getBatch(uint256)`, with the ABI encoded `output`.
    pub fn add_call_response(&self, signature: &str, output: &[ethers::abi::Token]) {
        let key = format!("eth_call:0x{}", hex::encode(ethers::utils::id(signature)));
        let output = ethers::types::Bytes::from(ethers::abi::encode(output));
        self.responses
            .lock()
            .unwrap()
            .insert(key, serde_json::to_value(output).unwrap());
    }

    pub fn add_response<R: serde::Serialize>(&self, method: &str, response: R) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), serde_json::to_value(response).unwrap());
    }
}

#[async_trait]
impl ethers::providers::JsonRpcClient for EthMockProvider {
    type Error = ethers::providers::MockError;

    async fn request<T, R>(&self, method: &str, params: T) -> Result<R, Self::Error>
    where
        T: std::fmt::Debug + serde::Serialize + Send + Sync,
        R: serde::de::DeserializeOwned + Send,
    {
        let key = if method == "eth_call" {
            let params = serde_json::to_value(params)?;
            let data = params
                .get(0)
                .and_then(|tx| tx.get("data").or_else(|| tx.get("input")))
                .and_then(|data| data.as_str())
                .unwrap_or_default()
                .to_string();
            format!("eth_call:{}", &data[..data.len().min(10)])
        } else {
            method.to_string()
        };
        let response = self
            .responses
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(ethers::providers::MockError::EmptyResponses)?;
        Ok(serde_json::from_value(response)?)
    }
}

#[derive(Default)]
struct MockKProxyState {
    accounts: HashMap<KAddress, u64>,
    fees: TxFees,
    network_config: NetworkConfig,
    node_overview: NodeOverview,
    vm_responses: HashMap<String, Vec<Vec<u8>>>,
    vm_queries: Vec<VmQuery>,
    sent: Vec<KTransaction>,
    tx_statuses: HashMap<String, TransactionStatus>,
}

/// In-memory Chain-K proxy. Unknown VM functions return no data.
pub struct MockKProxy {
    state: Mutex<MockKProxyState>,
    default_tx_status: Mutex<Option<TransactionStatus>>,
}

impl Default for MockKProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKProxy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockKProxyState::default()),
            default_tx_status: Mutex::new(Some(TransactionStatus::Success)),
        }
    }

    pub fn set_account_nonce(&self, address: &KAddress, nonce: u64) {
        self.state.lock().unwrap().accounts.insert(*address, nonce);
    }

    pub fn set_fees(&self, fees: TxFees) {
        self.state.lock().unwrap().fees = fees;
    }

    pub fn set_network_config(&self, config: NetworkConfig) {
        self.state.lock().unwrap().network_config = config;
    }

    pub fn set_node_overview(&self, nonce: u64, highest_final_nonce: u64) {
        self.state.lock().unwrap().node_overview = NodeOverview {
            nonce,
            highest_final_nonce,
        };
    }

    pub fn set_vm_response(&self, function: &str, data: Vec<Vec<u8>>) {
        self.state
            .lock()
            .unwrap()
            .vm_responses
            .insert(function.to_string(), data);
    }

    pub fn vm_queries(&self) -> Vec<VmQuery> {
        self.state.lock().unwrap().vm_queries.clone()
    }

    pub fn sent_transactions(&self) -> Vec<KTransaction> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn sent_nonces(&self) -> Vec<u64> {
        self.sent_transactions().iter().map(|tx| tx.nonce).collect()
    }

    /// `None` makes every unknown hash look not found.
    pub fn set_default_tx_status(&self, status: Option<TransactionStatus>) {
        *self.default_tx_status.lock().unwrap() = status;
    }

    pub fn set_tx_status(&self, hash: &str, status: TransactionStatus) {
        self.state
            .lock()
            .unwrap()
            .tx_statuses
            .insert(hash.to_string(), status);
    }
}

#[async_trait]
impl KProxy for MockKProxy {
    async fn get_network_config(&self) -> BridgeResult<NetworkConfig> {
        Ok(self.state.lock().unwrap().network_config.clone())
    }

    async fn get_node_overview(&self) -> BridgeResult<NodeOverview> {
        Ok(self.state.lock().unwrap().node_overview.clone())
    }

    async fn get_account(&self, address: &KAddress) -> BridgeResult<Account> {
        let nonce = self
            .state
            .lock()
            .unwrap()
            .accounts
            .get(address)
            .copied()
            .unwrap_or_default();
        Ok(Account {
            address: address.to_bech32(),
            nonce,
            balance: 0,
        })
    }

    async fn get_kda_balance(&self, _address: &KAddress, _token: &str) -> BridgeResult<u128> {
        Ok(0)
    }

    async fn execute_vm_query(&self, query: &VmQuery) -> BridgeResult<Vec<Vec<u8>>> {
        let mut state = self.state.lock().unwrap();
        state.vm_queries.push(query.clone());
        Ok(state
            .vm_responses
            .get(&query.function)
            .cloned()
            .unwrap_or_default())
    }

    async fn estimate_transaction_fees(&self, _tx: &KTransaction) -> BridgeResult<TxFees> {
        Ok(self.state.lock().unwrap().fees)
    }

    async fn send_transaction(&self, tx: &KTransaction) -> BridgeResult<String> {
        let mut state = self.state.lock().unwrap();
        state.sent.push(tx.clone());
        Ok(format!("tx-{}", state.sent.len()))
    }

    async fn send_transactions(&self, txs: &[KTransaction]) -> BridgeResult<Vec<String>> {
        let mut hashes = vec![];
        for tx in txs {
            hashes.push(self.send_transaction(tx).await?);
        }
        Ok(hashes)
    }

    async fn get_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        if let Some(status) = self.state.lock().unwrap().tx_statuses.get(hash) {
            return Ok(*status);
        }
        (*self.default_tx_status.lock().unwrap()).ok_or(BridgeError::TxNotFound)
    }

    async fn process_transaction_status(&self, hash: &str) -> BridgeResult<TransactionStatus> {
        match self.get_transaction_status(hash).await? {
            TransactionStatus::Failed => Err(BridgeError::ExecutionFailed(format!(
                "transaction {} failed",
                hash
            ))),
            status => Ok(status),
        }
    }
}

/// Token balances of one chain's safe. Unknown tokens fail like the real contracts.
pub struct MockTokenBalanceSource {
    chain: ChainKind,
    tokens: Mutex<HashMap<Vec<u8>, TokenSideInfo>>,
}

impl MockTokenBalanceSource {
    pub fn new(chain: ChainKind) -> Self {
        Self {
            chain,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, token: &[u8], info: TokenSideInfo) {
        self.tokens.lock().unwrap().insert(token.to_vec(), info);
    }
}

#[async_trait]
impl TokenBalanceSource for MockTokenBalanceSource {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn token_side_info(&self, token: &[u8]) -> BridgeResult<TokenSideInfo> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| {
                BridgeError::UnknownToken(format!(
                    "{} is not whitelisted on {}",
                    hex::encode(token),
                    self.chain
                ))
            })
    }
}

#[derive(Default)]
pub struct MockTokenPairSource {
    pairs: Mutex<HashMap<(Direction, Vec<u8>), Vec<u8>>>,
    lookups: Mutex<usize>,
}

impl MockTokenPairSource {
    pub fn add_pair(&self, direction: Direction, source: &[u8], destination: &[u8]) {
        self.pairs
            .lock()
            .unwrap()
            .insert((direction, source.to_vec()), destination.to_vec());
    }

    pub fn lookups(&self) -> usize {
        *self.lookups.lock().unwrap()
    }
}

#[async_trait]
impl TokenPairSource for MockTokenPairSource {
    async fn counterpart_token(
        &self,
        direction: Direction,
        source_token: &[u8],
    ) -> BridgeResult<Option<Vec<u8>>> {
        *self.lookups.lock().unwrap() += 1;
        Ok(self
            .pairs
            .lock()
            .unwrap()
            .get(&(direction, source_token.to_vec()))
            .cloned())
    }
}

struct Proposal {
    kind: ActionKind,
    batch_id: u64,
    statuses: Vec<DepositStatus>,
    action_id: u64,
}

struct MockChainState {
    batches: HashMap<u64, Batch>,
    pending_batch: Option<Batch>,
    last_executed_batch_id: u64,
    quorum: usize,
    next_action_id: u64,
    proposals: Vec<Proposal>,
    proposed_transfers: Vec<u64>,
    proposed_statuses: Vec<(u64, Vec<DepositStatus>)>,
    onchain_signatures: HashMap<u64, BTreeSet<String>>,
    executed_actions: HashSet<u64>,
    executed_batches: HashSet<u64>,
    statuses_after_execution: HashMap<u64, Vec<DepositStatus>>,
    performed: Vec<(Action, Vec<Vec<u8>>)>,
    tx_count: u64,
    default_tx_status: TransactionStatus,
    execute_effective: bool,
    fail_next_calls: u32,
    fail_with: Option<BridgeError>,
    paused: bool,
    credited: HashMap<Vec<u8>, U256>,
    safe_fees: U256,
}

impl Default for MockChainState {
    fn default() -> Self {
        Self {
            batches: HashMap::new(),
            pending_batch: None,
            last_executed_batch_id: 0,
            quorum: 1,
            next_action_id: 1,
            proposals: vec![],
            proposed_transfers: vec![],
            proposed_statuses: vec![],
            onchain_signatures: HashMap::new(),
            executed_actions: HashSet::new(),
            executed_batches: HashSet::new(),
            statuses_after_execution: HashMap::new(),
            performed: vec![],
            tx_count: 0,
            default_tx_status: TransactionStatus::Success,
            execute_effective: true,
            fail_next_calls: 0,
            fail_with: None,
            paused: false,
            credited: HashMap::new(),
            safe_fees: U256::zero(),
        }
    }
}

impl MockChainState {
    fn next_tx_hash(&mut self) -> String {
        self.tx_count += 1;
        format!("tx-{}", self.tx_count)
    }
}

/// One side of the bridge kept in memory. Chain-E actions are keyed by batch id,
/// Chain-K actions get multisig ids starting at 1 when proposed. Handles made with
/// [`MockChainClient::for_signer`] share the chain but sign under their own name.
#[derive(Clone)]
pub struct MockChainClient {
    chain: ChainKind,
    signer: String,
    state: Arc<Mutex<MockChainState>>,
}

impl MockChainClient {
    pub fn new(chain: ChainKind) -> Self {
        Self {
            chain,
            signer: "self".to_string(),
            state: Arc::new(Mutex::new(MockChainState::default())),
        }
    }

    pub fn for_signer(&self, signer: &str) -> Self {
        Self {
            chain: self.chain,
            signer: signer.to_string(),
            state: self.state.clone(),
        }
    }

    pub fn add_batch(&self, batch_id: u64, deposits: Vec<Deposit>) {
        self.state
            .lock()
            .unwrap()
            .batches
            .insert(batch_id, Batch { batch_id, deposits });
    }

    pub fn set_pending_batch(&self, deposits: Vec<Deposit>, batch_id: u64) {
        self.state.lock().unwrap().pending_batch = Some(Batch { batch_id, deposits });
    }

    pub fn set_quorum(&self, quorum: usize) {
        self.state.lock().unwrap().quorum = quorum;
    }

    pub fn set_paused(&self, paused: bool) {
        self.state.lock().unwrap().paused = paused;
    }

    pub fn set_default_tx_status(&self, status: TransactionStatus) {
        self.state.lock().unwrap().default_tx_status = status;
    }

    /// When off, `perform_action` returns a hash but changes nothing on chain.
    pub fn set_execute_effective(&self, effective: bool) {
        self.state.lock().unwrap().execute_effective = effective;
    }

    pub fn fail_next_calls(&self, count: u32) {
        self.state.lock().unwrap().fail_next_calls = count;
    }

    pub fn fail_next_with(&self, error: BridgeError) {
        self.state.lock().unwrap().fail_with = Some(error);
    }

    pub fn add_onchain_signature(&self, action_id: u64, signer: &str) {
        self.state
            .lock()
            .unwrap()
            .onchain_signatures
            .entry(action_id)
            .or_default()
            .insert(signer.to_string());
    }

    pub fn was_signed_by_any(&self, action_id: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .onchain_signatures
            .get(&action_id)
            .is_some_and(|signers| !signers.is_empty())
    }

    pub fn proposed_transfers(&self) -> Vec<u64> {
        self.state.lock().unwrap().proposed_transfers.clone()
    }

    pub fn proposed_statuses(&self) -> Vec<(u64, Vec<DepositStatus>)> {
        self.state.lock().unwrap().proposed_statuses.clone()
    }

    pub fn performed(&self) -> Vec<(Action, Vec<Vec<u8>>)> {
        self.state.lock().unwrap().performed.clone()
    }

    pub fn last_executed_batch_id(&self) -> u64 {
        self.state.lock().unwrap().last_executed_batch_id
    }

    /// Total received by `to` through executed transfers.
    pub fn credited(&self, to: &[u8]) -> U256 {
        self.state
            .lock()
            .unwrap()
            .credited
            .get(to)
            .copied()
            .unwrap_or_default()
    }

    /// Fees kept by the safe once deposits are marked executed.
    pub fn safe_fees(&self) -> U256 {
        self.state.lock().unwrap().safe_fees
    }

    fn check_call(&self) -> BridgeResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.fail_with.take() {
            return Err(error);
        }
        if state.fail_next_calls > 0 {
            state.fail_next_calls -= 1;
            return Err(BridgeError::TransientRpc(format!(
                "injected failure on {}",
                self.chain
            )));
        }
        Ok(())
    }

    fn action_id(&self, state: &MockChainState, kind: ActionKind, batch_id: u64) -> u64 {
        match self.chain {
            ChainKind::Eth => batch_id,
            ChainKind::K => state
                .proposals
                .iter()
                .find(|p| p.kind == kind && p.batch_id == batch_id)
                .map(|p| p.action_id)
                .unwrap_or_default(),
        }
    }

    fn propose(&self, kind: ActionKind, batch_id: u64, statuses: &[DepositStatus]) -> String {
        let mut state = self.state.lock().unwrap();
        let action_id = state.next_action_id;
        state.next_action_id += 1;
        state.proposals.push(Proposal {
            kind,
            batch_id,
            statuses: statuses.to_vec(),
            action_id,
        });
        state.next_tx_hash()
    }
}

#[async_trait]
impl BridgeChainClient for MockChainClient {
    fn chain(&self) -> ChainKind {
        self.chain
    }

    async fn get_pending_batch(&self) -> BridgeResult<Option<Batch>> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().pending_batch.clone())
    }

    async fn get_batch(&self, batch_id: u64) -> BridgeResult<Option<Batch>> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().batches.get(&batch_id).cloned())
    }

    async fn get_last_executed_batch_id(&self) -> BridgeResult<u64> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().last_executed_batch_id)
    }

    async fn was_proposed_transfer(&self, batch: &Batch) -> BridgeResult<bool> {
        self.check_call()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .proposals
            .iter()
            .any(|p| p.kind == ActionKind::Transfer && p.batch_id == batch.batch_id))
    }

    async fn was_proposed_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<bool> {
        self.check_call()?;
        let state = self.state.lock().unwrap();
        Ok(state.proposals.iter().any(|p| {
            p.kind == ActionKind::SetStatus && p.batch_id == batch_id && p.statuses == statuses
        }))
    }

    async fn get_action_id_for(
        &self,
        kind: ActionKind,
        batch: &Batch,
        _statuses: &[DepositStatus],
    ) -> BridgeResult<u64> {
        self.check_call()?;
        let state = self.state.lock().unwrap();
        Ok(self.action_id(&state, kind, batch.batch_id))
    }

    async fn was_executed(&self, action: &Action) -> BridgeResult<bool> {
        self.check_call()?;
        let state = self.state.lock().unwrap();
        Ok(match self.chain {
            ChainKind::Eth => state.executed_batches.contains(&action.batch_id),
            ChainKind::K => {
                action.action_id != 0 && state.executed_actions.contains(&action.action_id)
            }
        })
    }

    async fn quorum_reached(&self, action_id: u64) -> BridgeResult<bool> {
        self.check_call()?;
        let state = self.state.lock().unwrap();
        let signed = state
            .onchain_signatures
            .get(&action_id)
            .map_or(0, |signers| signers.len());
        Ok(signed >= state.quorum)
    }

    async fn was_signed(&self, action_id: u64) -> BridgeResult<bool> {
        self.check_call()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .onchain_signatures
            .get(&action_id)
            .is_some_and(|signers| signers.contains(&self.signer)))
    }

    async fn get_quorum(&self) -> BridgeResult<usize> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().quorum)
    }

    async fn get_statuses_after_execution(
        &self,
        batch_id: u64,
    ) -> BridgeResult<Option<Vec<DepositStatus>>> {
        self.check_call()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .statuses_after_execution
            .get(&batch_id)
            .cloned())
    }

    async fn propose_transfer(&self, batch: &Batch) -> BridgeResult<String> {
        self.check_call()?;
        self.state
            .lock()
            .unwrap()
            .proposed_transfers
            .push(batch.batch_id);
        Ok(self.propose(ActionKind::Transfer, batch.batch_id, &[]))
    }

    async fn propose_set_status(
        &self,
        batch_id: u64,
        statuses: &[DepositStatus],
    ) -> BridgeResult<String> {
        self.check_call()?;
        self.state
            .lock()
            .unwrap()
            .proposed_statuses
            .push((batch_id, statuses.to_vec()));
        Ok(self.propose(ActionKind::SetStatus, batch_id, statuses))
    }

    async fn sign(&self, action_id: u64) -> BridgeResult<String> {
        self.check_call()?;
        let mut state = self.state.lock().unwrap();
        state
            .onchain_signatures
            .entry(action_id)
            .or_default()
            .insert(self.signer.clone());
        Ok(state.next_tx_hash())
    }

    async fn perform_action(
        &self,
        action: &Action,
        batch: &Batch,
        signatures: &[Vec<u8>],
    ) -> BridgeResult<String> {
        self.check_call()?;
        let mut state = self.state.lock().unwrap();
        state.performed.push((action.clone(), signatures.to_vec()));
        if state.execute_effective {
            if action.kind == ActionKind::Transfer {
                for deposit in &batch.deposits {
                    let credited = state.credited.entry(deposit.to.clone()).or_default();
                    *credited = credited.saturating_add(deposit.transfer_amount());
                }
            }
            match self.chain {
                ChainKind::Eth => {
                    state.executed_batches.insert(action.batch_id);
                    state.statuses_after_execution.insert(
                        action.batch_id,
                        vec![DepositStatus::Executed; batch.deposits.len()],
                    );
                }
                ChainKind::K => {
                    state.executed_actions.insert(action.action_id);
                    match action.kind {
                        ActionKind::Transfer => state.last_executed_batch_id = action.batch_id,
                        ActionKind::SetStatus => {
                            let statuses = state
                                .proposals
                                .iter()
                                .find(|p| p.action_id == action.action_id)
                                .map(|p| p.statuses.clone())
                                .unwrap_or_default();
                            for (deposit, status) in batch.deposits.iter().zip(statuses) {
                                if status == DepositStatus::Executed {
                                    state.safe_fees = state.safe_fees.saturating_add(deposit.fee);
                                }
                            }
                            if state
                                .pending_batch
                                .as_ref()
                                .is_some_and(|b| b.batch_id == action.batch_id)
                            {
                                state.pending_batch = None;
                            }
                        }
                    }
                }
            }
        }
        Ok(state.next_tx_hash())
    }

    async fn get_transaction_status(&self, _hash: &str) -> BridgeResult<TransactionStatus> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().default_tx_status)
    }

    async fn get_current_nonce(&self) -> BridgeResult<u64> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().tx_count)
    }

    async fn is_paused(&self) -> BridgeResult<bool> {
        self.check_call()?;
        Ok(self.state.lock().unwrap().paused)
    }
}
