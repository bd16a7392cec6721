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

//! Client-side engine for the Vortex coin-mixing protocol.
//!
//! The crate drives one or more concurrent mixing sessions against remote
//! mixer nodes: it prepares the wallet by splitting funds into standardized
//! denominations and collateral outputs, joins or starts node-advertised
//! mixing queues, submits partial inputs/outputs, and cosigns the final
//! joint transaction only after verifying that its own contribution is
//! preserved. Wallet storage, signing primitives, networking, and chain
//! tracking stay with the embedding application and are reached through the
//! traits defined in this module.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use bitcoin::{EcdsaSighashType, Network, OutPoint, Script, Transaction, TxOut, Txid};

pub mod codec;
pub mod denoms;
pub mod manager;
pub mod messages;
pub mod nodes;
pub mod planner;
pub mod queue;
pub mod session;
pub mod util;

#[cfg(test)]
pub(crate) mod testutil;

pub use bitcoin;

use denoms::Denom;
use messages::{ClientMessage, QueueOffer};
use nodes::{NodeEntry, NodeMetaStore, NodeRegistry};

/// Maximum number of inputs a single mixing entry may contribute.
pub const ENTRY_MAX_SIZE: usize = 9;
/// Seconds an offer or a queued session stays valid.
pub const QUEUE_TIMEOUT_SECS: i64 = 40;
/// Seconds a session may stay in the signing state.
pub const SIGNING_TIMEOUT_SECS: u64 = 60;
/// Seconds a session stays in the error state before resetting.
pub const ERROR_RESET_SECS: u64 = 10;
/// Extra seconds granted to the server on top of each timeout.
pub const LAG_GRACE_SECS: u64 = 10;
/// Lower bound, in maintenance ticks, between automatic denomination runs.
pub const AUTO_TIMEOUT_MIN: u32 = 5;
/// Upper bound, in maintenance ticks, between automatic denomination runs.
pub const AUTO_TIMEOUT_MAX: u32 = 15;
/// Hard cap on denomination outputs created by a single planner transaction.
pub const DENOM_OUTPUTS_THRESHOLD: usize = 500;
/// Keypool depth below which a warning is surfaced.
pub const KEYS_THRESHOLD_WARNING: u32 = 100;
/// Keypool depth below which mixing is stopped entirely.
pub const KEYS_THRESHOLD_STOP: u32 = 50;
/// Seconds a pending session-open request may wait for a connection.
pub const PENDING_OPEN_TIMEOUT_SECS: u64 = 15;
/// Blocks to wait after a successful action in single-session mode.
pub const MIN_BLOCKS_TO_WAIT: u32 = 1;

/// Errors surfaced by an embedding wallet. The engine treats them as opaque.
pub type WalletError = Box<dyn std::error::Error + Send + Sync>;

/// Identifies a remote peer for misbehavior reporting.
pub type PeerId = u64;

/// A spendable coin known to the wallet.
#[derive(Debug, Clone)]
pub struct InputCoin {
    pub outpoint: OutPoint,
    pub txout: TxOut,
}

/// A denominated coin selected for mixing, together with its mixing depth.
#[derive(Debug, Clone)]
pub struct DenomInput {
    pub outpoint: OutPoint,
    pub prev_txout: TxOut,
    /// Number of mixing rounds this coin has already been through.
    pub rounds: i32,
}

/// Wallet coins grouped by destination address.
#[derive(Debug, Clone)]
pub struct TallyItem {
    pub amount: u64,
    pub inputs: Vec<InputCoin>,
}

/// Balance figures the engine bases its decisions on, in base currency units.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    /// Total in denominated outputs that reached the target round count.
    pub anonymized: u64,
    /// Confirmed denominated outputs.
    pub denominated_trusted: u64,
    /// Denominated outputs still waiting for confirmation.
    pub denominated_pending: u64,
}

/// A destination script reserved from the wallet keypool. The key stays
/// reserved until it is explicitly kept or returned.
#[derive(Debug, Clone)]
pub struct ReservedDestination {
    pub key: u64,
    pub script: Script,
}

/// Coin storage and signing primitives supplied by the embedding wallet.
///
/// Implementations carry their own interior locking; every call is atomic
/// on its own and the engine never requires two calls to be atomic together.
pub trait Wallet: Send + Sync {
    /// Wallet name used as a log prefix.
    fn name(&self) -> String;

    /// Whether spending is currently locked (encrypted and not unlocked).
    fn is_locked(&self) -> bool;

    /// Number of fresh keys left in the keypool.
    fn keys_left(&self) -> u32;

    fn balance(&self) -> Balance;

    /// Balance available for mixing. With `skip_denominated` only
    /// non-denominated funds are counted.
    fn anonymizable_balance(&self, skip_denominated: bool) -> u64;

    /// Groups spendable coins by destination address. `max_inputs` bounds the
    /// total number of inputs collected across all groups.
    fn select_coins_grouped_by_addresses(
        &self,
        skip_denominated: bool,
        anonymizable_only: bool,
        skip_unconfirmed: bool,
        max_inputs: usize,
    ) -> Vec<TallyItem>;

    /// Denomination amounts the wallet can currently contribute towards
    /// `value_max`, smallest first.
    fn select_denominated_amounts(&self, value_max: u64) -> BTreeSet<u64>;

    /// Selects coins of exactly the given denomination up to `value_max`,
    /// already shuffled.
    fn select_inputs_by_denomination(&self, denom: Denom, value_max: u64) -> Vec<DenomInput>;

    /// Number of unspent outputs whose value equals `amount` exactly.
    fn count_inputs_with_amount(&self, amount: u64) -> usize;

    /// Whether any collateral-sized coins exist. With `only_confirmed`,
    /// unconfirmed ones are ignored.
    fn has_collateral_inputs(&self, only_confirmed: bool) -> bool;

    /// All spendable collateral-sized coins.
    fn collateral_coins(&self) -> Vec<InputCoin>;

    fn lock_coin(&self, outpoint: &OutPoint);
    fn unlock_coin(&self, outpoint: &OutPoint);

    /// Reserves a fresh destination from the keypool.
    fn reserve_destination(&self) -> Option<ReservedDestination>;
    /// Marks a reserved destination as used for good.
    fn keep_destination(&self, key: u64);
    /// Returns a reserved destination to the keypool.
    fn return_destination(&self, key: u64);

    /// Signs the inputs of `tx` whose outpoints appear in `own` with the
    /// given sighash type. Returns the indices of the inputs signed.
    fn sign_inputs(
        &self,
        tx: &mut Transaction,
        own: &[OutPoint],
        sighash: EcdsaSighashType,
    ) -> Result<Vec<usize>, WalletError>;

    /// Fully signs a collateral spend owned by this wallet.
    fn sign_collateral(&self, tx: &mut Transaction) -> Result<(), WalletError>;

    /// Builds, signs and broadcasts a transaction spending exactly `inputs`
    /// into `outputs`. Any remainder beyond the fee goes back to the spent
    /// group's address as change.
    fn commit_transaction(
        &self,
        inputs: &[InputCoin],
        outputs: &[TxOut],
    ) -> Result<Txid, WalletError>;
}

/// Peer messaging supplied by the transport layer.
pub trait Transport: Send + Sync {
    /// Sends a message to the node at `addr` if a connection exists.
    /// Returns false when no connection is available.
    fn send_to(&self, addr: &SocketAddr, msg: ClientMessage) -> bool;

    /// Asks the transport to open a connection to a mixer node.
    fn request_connection(&self, node: &NodeEntry);

    /// Whether a connection to `addr` is being established or torn down.
    fn is_pending_or_disconnecting(&self, addr: &SocketAddr) -> bool;

    /// Gossips an admitted queue offer to peers.
    fn relay_offer(&self, offer: &QueueOffer);

    /// Reports peer misbehavior to the transport layer.
    fn misbehaving(&self, peer: PeerId, score: u32);
}

/// Chain synchronization state.
pub trait ChainSync: Send + Sync {
    fn is_synced(&self) -> bool;
}

/// Mempool acceptance probe used to re-validate collateral drafts.
pub trait Mempool: Send + Sync {
    fn accepts(&self, tx: &Transaction) -> bool;
}

/// Feerate source for planner transactions.
pub trait FeeEstimator: Send + Sync {
    /// Current feerate in base units per 1000 bytes.
    fn feerate_per_kb(&self) -> u64;
}

/// Runtime mixing configuration. All fields are atomics so that readers on
/// the message and maintenance threads never block each other.
#[derive(Debug)]
pub struct Options {
    enabled: AtomicBool,
    amount: AtomicU64,
    rounds: AtomicI32,
    random_rounds: AtomicI32,
    sessions: AtomicI32,
    multi_session: AtomicBool,
    denoms_goal: AtomicI32,
    denoms_hard_cap: AtomicI32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            amount: AtomicU64::new(1000),
            rounds: AtomicI32::new(4),
            random_rounds: AtomicI32::new(3),
            sessions: AtomicI32::new(4),
            multi_session: AtomicBool::new(false),
            denoms_goal: AtomicI32::new(50),
            denoms_hard_cap: AtomicI32::new(300),
        }
    }
}

impl Options {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Target amount to keep anonymized, in whole coins.
    pub fn amount(&self) -> u64 {
        self.amount.load(Ordering::Relaxed)
    }

    pub fn set_amount(&self, amount: u64) {
        self.amount.store(amount, Ordering::Relaxed);
    }

    /// Target mixing depth.
    pub fn rounds(&self) -> i32 {
        self.rounds.load(Ordering::Relaxed).max(1)
    }

    pub fn set_rounds(&self, rounds: i32) {
        self.rounds.store(rounds.max(1), Ordering::Relaxed);
    }

    /// Extra depth tried opportunistically on top of [`Options::rounds`].
    pub fn random_rounds(&self) -> i32 {
        self.random_rounds.load(Ordering::Relaxed).max(0)
    }

    pub fn set_random_rounds(&self, rounds: i32) {
        self.random_rounds.store(rounds.max(0), Ordering::Relaxed);
    }

    /// Maximum number of concurrent sessions.
    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::Relaxed).max(1) as usize
    }

    pub fn set_sessions(&self, sessions: i32) {
        self.sessions.store(sessions.max(1), Ordering::Relaxed);
    }

    pub fn is_multi_session(&self) -> bool {
        self.multi_session.load(Ordering::Relaxed)
    }

    pub fn set_multi_session(&self, multi: bool) {
        self.multi_session.store(multi, Ordering::Relaxed);
    }

    /// Per-denomination output fill target.
    pub fn denoms_goal(&self) -> usize {
        self.denoms_goal.load(Ordering::Relaxed).max(1) as usize
    }

    pub fn set_denoms_goal(&self, goal: i32) {
        self.denoms_goal.store(goal.max(1), Ordering::Relaxed);
    }

    /// Per-denomination output ceiling. Never below the goal.
    pub fn denoms_hard_cap(&self) -> usize {
        let goal = self.denoms_goal();
        (self.denoms_hard_cap.load(Ordering::Relaxed).max(1) as usize).max(goal)
    }

    pub fn set_denoms_hard_cap(&self, cap: i32) {
        self.denoms_hard_cap.store(cap.max(1), Ordering::Relaxed);
    }
}

/// Shared process-wide context handed to every component at construction.
/// There are no ambient globals; one `Context` is built at startup and
/// cloned into managers, sessions and the queue manager.
pub struct Context {
    pub network: Network,
    pub options: Arc<Options>,
    pub registry: Arc<dyn NodeRegistry>,
    pub sync: Arc<dyn ChainSync>,
    pub node_meta: Arc<NodeMetaStore>,
    pub shutdown: Arc<AtomicBool>,
}

impl Context {
    pub fn new(
        network: Network,
        options: Arc<Options>,
        registry: Arc<dyn NodeRegistry>,
        sync: Arc<dyn ChainSync>,
    ) -> Self {
        Self {
            network,
            options,
            registry,
            sync,
            node_meta: Arc::new(NodeMetaStore::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
