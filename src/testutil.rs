// vortex-client-rs
// Copyright (C) 2023  Straylight <straylight_orbit@protonmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Mock collaborators and a ready-to-mix harness for the test suites.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::hashes::{hash160, sha256d, Hash};
use bitcoin::{
    EcdsaSighashType, Network, OutPoint, Script, Transaction, TxOut, Txid,
};

use crate::denoms::{self, Denom, COLLATERAL_AMOUNT, COIN};
use crate::manager::{Client, Manager};
use crate::messages::{ClientMessage, QueueOffer};
use crate::nodes::{NodeEntry, NodeId, NodeRegistry};
use crate::queue::QueueManager;
use crate::util;
use crate::{
    Balance, ChainSync, Context, DenomInput, FeeEstimator, InputCoin, Mempool, Options, PeerId,
    ReservedDestination, TallyItem, Transport, Wallet, WalletError,
};

/// A deterministic outpoint derived from `n`.
pub fn outpoint(n: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_hash(sha256d::Hash::hash(&n.to_le_bytes())),
        vout: 0,
    }
}

pub fn coin(outpoint: OutPoint, value: u64) -> InputCoin {
    InputCoin {
        outpoint,
        txout: TxOut { value, script_pubkey: p2pkh_script(0x42) },
    }
}

/// A distinct, well-formed P2PKH script.
pub fn p2pkh_script(tag: u8) -> Script {
    let mut bytes = [0u8; 20];
    bytes[0] = tag;
    Script::new_p2pkh(&bitcoin::PubkeyHash::from_hash(hash160::Hash::from_inner(bytes)))
}

fn p2pkh_script_for_key(key: u64) -> Script {
    let mut bytes = [0u8; 20];
    bytes[..8].copy_from_slice(&key.to_le_bytes());
    bytes[8] = 0xD5;
    Script::new_p2pkh(&bitcoin::PubkeyHash::from_hash(hash160::Hash::from_inner(bytes)))
}

#[derive(Default)]
struct WalletState {
    balance: Balance,
    anonymizable_all: u64,
    anonymizable_non_denom: u64,
    tally: Vec<TallyItem>,
    denominated_amounts: BTreeSet<u64>,
    denom_inputs: Vec<DenomInput>,
    counts: HashMap<u64, usize>,
    has_collateral_confirmed: bool,
    has_collateral_unconfirmed: bool,
    collateral_coins: Vec<InputCoin>,
    locked: Vec<OutPoint>,
    next_key: u64,
    reserved: HashSet<u64>,
    kept: usize,
    returned: usize,
    committed: Vec<(Vec<InputCoin>, Vec<TxOut>)>,
    wallet_locked: bool,
    keys_left: u32,
    fail_signing: bool,
}

pub struct MockWallet {
    state: Mutex<WalletState>,
}

impl Default for MockWallet {
    fn default() -> Self {
        let state = WalletState { next_key: 1, keys_left: 1_000, ..Default::default() };
        Self { state: Mutex::new(state) }
    }
}

impl MockWallet {
    pub fn set_balance(&self, balance: Balance) {
        self.state.lock().unwrap().balance = balance;
    }

    pub fn balance_config(&self) -> Balance {
        self.state.lock().unwrap().balance
    }

    pub fn set_anonymizable(&self, all: u64, non_denom: u64) {
        let mut state = self.state.lock().unwrap();
        state.anonymizable_all = all;
        state.anonymizable_non_denom = non_denom;
    }

    pub fn set_tally(&self, tally: Vec<TallyItem>) {
        self.state.lock().unwrap().tally = tally;
    }

    pub fn set_denominated_amounts(&self, amounts: impl IntoIterator<Item = u64>) {
        self.state.lock().unwrap().denominated_amounts = amounts.into_iter().collect();
    }

    pub fn set_denom_inputs(&self, inputs: Vec<DenomInput>) {
        self.state.lock().unwrap().denom_inputs = inputs;
    }

    pub fn denom_inputs(&self) -> Vec<DenomInput> {
        self.state.lock().unwrap().denom_inputs.clone()
    }

    pub fn set_count_with_amount(&self, amount: u64, count: usize) {
        self.state.lock().unwrap().counts.insert(amount, count);
    }

    pub fn set_has_collateral(&self, confirmed: bool, unconfirmed: bool) {
        let mut state = self.state.lock().unwrap();
        state.has_collateral_confirmed = confirmed;
        state.has_collateral_unconfirmed = unconfirmed;
    }

    pub fn set_collateral_coins(&self, coins: Vec<InputCoin>) {
        self.state.lock().unwrap().collateral_coins = coins;
    }

    pub fn set_keys_left(&self, keys_left: u32) {
        self.state.lock().unwrap().keys_left = keys_left;
    }

    pub fn set_wallet_locked(&self, locked: bool) {
        self.state.lock().unwrap().wallet_locked = locked;
    }

    pub fn set_fail_signing(&self, fail: bool) {
        self.state.lock().unwrap().fail_signing = fail;
    }

    pub fn locked_coins(&self) -> Vec<OutPoint> {
        self.state.lock().unwrap().locked.clone()
    }

    pub fn committed(&self) -> Vec<(Vec<InputCoin>, Vec<TxOut>)> {
        self.state.lock().unwrap().committed.clone()
    }

    pub fn reserved_count(&self) -> usize {
        self.state.lock().unwrap().reserved.len()
    }

    pub fn kept_count(&self) -> usize {
        self.state.lock().unwrap().kept
    }

    pub fn returned_count(&self) -> usize {
        self.state.lock().unwrap().returned
    }
}

impl Wallet for MockWallet {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn is_locked(&self) -> bool {
        self.state.lock().unwrap().wallet_locked
    }

    fn keys_left(&self) -> u32 {
        self.state.lock().unwrap().keys_left
    }

    fn balance(&self) -> Balance {
        self.state.lock().unwrap().balance
    }

    fn anonymizable_balance(&self, skip_denominated: bool) -> u64 {
        let state = self.state.lock().unwrap();
        if skip_denominated {
            state.anonymizable_non_denom
        } else {
            state.anonymizable_all
        }
    }

    fn select_coins_grouped_by_addresses(
        &self,
        _skip_denominated: bool,
        _anonymizable_only: bool,
        _skip_unconfirmed: bool,
        _max_inputs: usize,
    ) -> Vec<TallyItem> {
        self.state.lock().unwrap().tally.clone()
    }

    fn select_denominated_amounts(&self, _value_max: u64) -> BTreeSet<u64> {
        self.state.lock().unwrap().denominated_amounts.clone()
    }

    fn select_inputs_by_denomination(&self, denom: Denom, _value_max: u64) -> Vec<DenomInput> {
        let state = self.state.lock().unwrap();
        let amount = denom.amount();
        state
            .denom_inputs
            .iter()
            .filter(|input| Some(input.prev_txout.value) == amount)
            .cloned()
            .collect()
    }

    fn count_inputs_with_amount(&self, amount: u64) -> usize {
        self.state.lock().unwrap().counts.get(&amount).copied().unwrap_or(0)
    }

    fn has_collateral_inputs(&self, only_confirmed: bool) -> bool {
        let state = self.state.lock().unwrap();
        if only_confirmed {
            state.has_collateral_confirmed
        } else {
            state.has_collateral_confirmed || state.has_collateral_unconfirmed
        }
    }

    fn collateral_coins(&self) -> Vec<InputCoin> {
        self.state.lock().unwrap().collateral_coins.clone()
    }

    fn lock_coin(&self, outpoint: &OutPoint) {
        self.state.lock().unwrap().locked.push(*outpoint);
    }

    fn unlock_coin(&self, outpoint: &OutPoint) {
        self.state.lock().unwrap().locked.retain(|locked| locked != outpoint);
    }

    fn reserve_destination(&self) -> Option<ReservedDestination> {
        let mut state = self.state.lock().unwrap();
        if state.keys_left == 0 {
            return None;
        }
        let key = state.next_key;
        state.next_key += 1;
        state.reserved.insert(key);
        Some(ReservedDestination { key, script: p2pkh_script_for_key(key) })
    }

    fn keep_destination(&self, key: u64) {
        let mut state = self.state.lock().unwrap();
        if state.reserved.remove(&key) {
            state.kept += 1;
        }
    }

    fn return_destination(&self, key: u64) {
        let mut state = self.state.lock().unwrap();
        if state.reserved.remove(&key) {
            state.returned += 1;
        }
    }

    fn sign_inputs(
        &self,
        tx: &mut Transaction,
        own: &[OutPoint],
        _sighash: EcdsaSighashType,
    ) -> Result<Vec<usize>, WalletError> {
        if self.state.lock().unwrap().fail_signing {
            return Err("signing disabled".into());
        }
        let mut signed = Vec::new();
        for (i, txin) in tx.input.iter_mut().enumerate() {
            if own.contains(&txin.previous_output) {
                txin.script_sig = Script::new_op_return(&[0x01]);
                signed.push(i);
            }
        }
        Ok(signed)
    }

    fn sign_collateral(&self, tx: &mut Transaction) -> Result<(), WalletError> {
        if self.state.lock().unwrap().fail_signing {
            return Err("signing disabled".into());
        }
        for txin in tx.input.iter_mut() {
            txin.script_sig = Script::new_op_return(&[0x02]);
        }
        Ok(())
    }

    fn commit_transaction(
        &self,
        inputs: &[InputCoin],
        outputs: &[TxOut],
    ) -> Result<Txid, WalletError> {
        let mut state = self.state.lock().unwrap();
        state.committed.push((inputs.to_vec(), outputs.to_vec()));
        let n = state.committed.len() as u32;
        Ok(Txid::from_hash(sha256d::Hash::hash(&n.to_le_bytes())))
    }
}

pub struct MockRegistry {
    nodes: Mutex<Vec<Arc<NodeEntry>>>,
    weighted: Mutex<usize>,
    height: u32,
    verify: AtomicBool,
}

impl MockRegistry {
    pub fn with_nodes(n: usize) -> Self {
        let nodes = (0..n)
            .map(|i| {
                Arc::new(NodeEntry {
                    id: NodeId::from_hash(sha256d::Hash::hash(&format!("node {}", i).into_bytes())),
                    collateral: outpoint(1_000 + i as u32),
                    addr: format!("127.0.0.1:{}", 20_000 + i).parse().unwrap(),
                    operator_key: vec![i as u8; 48],
                    last_paid_height: 1,
                })
            })
            .collect();
        Self {
            nodes: Mutex::new(nodes),
            weighted: Mutex::new(100),
            height: 50,
            verify: AtomicBool::new(true),
        }
    }

    pub fn nodes(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes.lock().unwrap().clone()
    }

    pub fn set_verify(&self, verify: bool) {
        self.verify.store(verify, Ordering::Relaxed);
    }

    /// Turns `id` into an upcoming payment winner. Shrinks the weighted
    /// count, so only meaningful with the single-node harness.
    pub fn set_winner(&self, id: NodeId) {
        *self.weighted.lock().unwrap() = 1;
        let mut nodes = self.nodes.lock().unwrap();
        for node in nodes.iter_mut() {
            if node.id == id {
                let mut updated = (**node).clone();
                updated.last_paid_height = self.height - 10;
                *node = Arc::new(updated);
            }
        }
    }
}

impl NodeRegistry for MockRegistry {
    fn valid_nodes(&self) -> Vec<Arc<NodeEntry>> {
        self.nodes()
    }

    fn valid_count(&self) -> usize {
        self.nodes.lock().unwrap().len()
    }

    fn weighted_count(&self) -> usize {
        *self.weighted.lock().unwrap()
    }

    fn by_collateral(&self, outpoint: &OutPoint) -> Option<Arc<NodeEntry>> {
        self.nodes.lock().unwrap().iter().find(|node| node.collateral == *outpoint).cloned()
    }

    fn by_id(&self, id: &NodeId) -> Option<Arc<NodeEntry>> {
        self.nodes.lock().unwrap().iter().find(|node| node.id == *id).cloned()
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn verify_operator_sig(&self, _node: &NodeEntry, _payload: &[u8], _signature: &[u8]) -> bool {
        self.verify.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct MockTransport {
    connected: Mutex<HashSet<SocketAddr>>,
    pending: Mutex<HashSet<SocketAddr>>,
    sent: Mutex<Vec<(SocketAddr, &'static str)>>,
    relayed: AtomicUsize,
    misbehavior: Mutex<HashMap<PeerId, u32>>,
}

impl MockTransport {
    pub fn set_connected(&self, addr: SocketAddr, connected: bool) {
        let mut set = self.connected.lock().unwrap();
        if connected {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    pub fn sent_tags(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|(_, tag)| tag.to_string()).collect()
    }

    pub fn relayed_count(&self) -> usize {
        self.relayed.load(Ordering::Relaxed)
    }

    pub fn misbehavior_of(&self, peer: PeerId) -> u32 {
        self.misbehavior.lock().unwrap().get(&peer).copied().unwrap_or(0)
    }
}

impl Transport for MockTransport {
    fn send_to(&self, addr: &SocketAddr, msg: ClientMessage) -> bool {
        if !self.connected.lock().unwrap().contains(addr) {
            return false;
        }
        self.sent.lock().unwrap().push((*addr, msg.tag()));
        true
    }

    fn request_connection(&self, _node: &NodeEntry) {}

    fn is_pending_or_disconnecting(&self, addr: &SocketAddr) -> bool {
        self.pending.lock().unwrap().contains(addr)
    }

    fn relay_offer(&self, _offer: &QueueOffer) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    fn misbehaving(&self, peer: PeerId, score: u32) {
        *self.misbehavior.lock().unwrap().entry(peer).or_insert(0) += score;
    }
}

pub struct MockSync(pub bool);

impl ChainSync for MockSync {
    fn is_synced(&self) -> bool {
        self.0
    }
}

pub struct MockMempool(pub bool);

impl Mempool for MockMempool {
    fn accepts(&self, _tx: &Transaction) -> bool {
        self.0
    }
}

pub struct MockFeeEstimator(pub u64);

impl FeeEstimator for MockFeeEstimator {
    fn feerate_per_kb(&self) -> u64 {
        self.0
    }
}

/// A fully wired client with one wallet primed to mix the smallest
/// denomination against a registry of mock nodes.
pub struct Harness {
    pub ctx: Arc<Context>,
    pub wallet: Arc<MockWallet>,
    pub registry: Arc<MockRegistry>,
    pub transport: MockTransport,
    pub mempool: MockMempool,
    pub fee: MockFeeEstimator,
    pub client: Client,
    pub queue: Arc<QueueManager>,
    pub node: Arc<NodeEntry>,
    manager: Arc<Manager>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_nodes(1)
    }

    pub fn with_nodes(n: usize) -> Self {
        let registry = Arc::new(MockRegistry::with_nodes(n));
        let node = registry.nodes()[0].clone();

        let options = Arc::new(Options::default());
        options.set_enabled(true);

        let ctx = Arc::new(Context::new(
            Network::Bitcoin,
            options,
            registry.clone(),
            Arc::new(MockSync(true)),
        ));
        let client = Client::new(ctx.clone());
        let queue = client.queue_manager();

        let smallest = denoms::smallest_denomination();
        let wallet = Arc::new(MockWallet::default());
        wallet.set_balance(Balance {
            anonymized: 0,
            denominated_trusted: 11 * smallest,
            denominated_pending: 0,
        });
        wallet.set_anonymizable(100 * COIN, 0);
        wallet.set_has_collateral(true, true);
        wallet.set_collateral_coins(vec![coin(outpoint(900), COLLATERAL_AMOUNT)]);
        wallet.set_denominated_amounts([smallest]);
        wallet.set_denom_inputs(
            (0..11)
                .map(|i| DenomInput {
                    outpoint: outpoint(100 + i),
                    prev_txout: TxOut { value: smallest, script_pubkey: p2pkh_script(0x99) },
                    rounds: 1,
                })
                .collect(),
        );

        let manager = client.add_wallet(wallet.clone());
        manager.start_mixing();
        manager.updated_block_tip(registry.height());

        Self {
            ctx,
            wallet,
            registry,
            transport: MockTransport::default(),
            mempool: MockMempool(true),
            fee: MockFeeEstimator(1_000),
            client,
            queue,
            node,
            manager,
        }
    }

    pub fn manager(&self) -> Arc<Manager> {
        self.manager.clone()
    }

    /// Feeds an offer for the harness node through the queue manager.
    pub fn queue_offer_for_node(&self, ready: bool) {
        let offer = QueueOffer {
            denom: Denom::from_amount(denoms::smallest_denomination()).unwrap(),
            node_collateral: self.node.collateral,
            node_id: self.node.id,
            ready,
            timestamp: util::unix_time(),
            signature: vec![0xAA; 64],
            tried: false,
        };
        self.queue.process_offer(99, offer, &self.client, &self.transport, util::unix_time());
    }
}
