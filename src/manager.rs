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

//! Per-wallet session management and the process-wide driver.
//!
//! A [`Manager`] owns a bounded deque of sessions for one wallet and fans
//! peer messages and maintenance work out to them. The [`Client`] is the
//! root object: one manager per wallet, the shared queue manager, and the
//! 1 Hz maintenance tick that drives everything.
//!
//! Lock order: a manager's session deque is the outer lock; the queue
//! manager's locks and the used-node list nest inside it. The wallet locks
//! itself and is never called with any engine lock that it could reach back
//! into.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitcoin::OutPoint;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::messages::{QueueOffer, ServerMessage};
use crate::nodes::{NodeEntry, NodeRegistry};
use crate::queue::QueueManager;
use crate::session::Session;
use crate::util;
use crate::{
    ChainSync, Context, FeeEstimator, Mempool, PeerId, Transport, Wallet, AUTO_TIMEOUT_MAX,
    AUTO_TIMEOUT_MIN, KEYS_THRESHOLD_STOP, KEYS_THRESHOLD_WARNING, MIN_BLOCKS_TO_WAIT,
};

/// Drives mixing for one wallet.
pub struct Manager {
    ctx: Arc<Context>,
    wallet: Arc<dyn Wallet>,
    queue: Arc<QueueManager>,
    sessions: Mutex<VecDeque<Session>>,
    /// Insertion-ordered collaterals of nodes we recently mixed on.
    used_nodes: Mutex<Vec<OutPoint>>,
    cached_tip_height: AtomicU32,
    cached_last_success_height: AtomicU32,
    mixing: AtomicBool,
    status: Mutex<String>,
}

impl Manager {
    pub(crate) fn new(ctx: Arc<Context>, wallet: Arc<dyn Wallet>, queue: Arc<QueueManager>) -> Self {
        Self {
            ctx,
            wallet,
            queue,
            sessions: Mutex::new(VecDeque::new()),
            used_nodes: Mutex::new(Vec::new()),
            cached_tip_height: AtomicU32::new(0),
            cached_last_success_height: AtomicU32::new(0),
            mixing: AtomicBool::new(false),
            status: Mutex::new(String::new()),
        }
    }

    /// Flips the mixing flag on. Returns false when mixing already runs.
    pub fn start_mixing(&self) -> bool {
        self.mixing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn stop_mixing(&self) {
        self.mixing.store(false, Ordering::SeqCst);
    }

    pub fn is_mixing(&self) -> bool {
        self.mixing.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Discards all sessions and their resources. Safe to call repeatedly.
    pub fn reset_pool(&self) {
        self.cached_last_success_height.store(0, Ordering::Relaxed);
        self.used_nodes.lock().expect("used nodes lock").clear();
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            session.reset();
        }
        sessions.clear();
    }

    /// Fans a session-level server message to every session; each one
    /// filters by its own bound node and session id.
    pub fn process_message(
        &self,
        peer_addr: &SocketAddr,
        msg: &ServerMessage,
        transport: &dyn Transport,
        now: Instant,
    ) {
        if !self.ctx.options.is_enabled() {
            return;
        }
        if !self.ctx.sync.is_synced() {
            return;
        }
        if matches!(msg, ServerMessage::Offer(_)) {
            // offers belong to the queue manager
            return;
        }
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            session.process_message(self, transport, peer_addr, msg, now);
        }
    }

    /// The periodic mixing driver: trims the used-node set, keeps the
    /// session deque filled to the configured level, and gives every
    /// session one pass.
    pub fn do_auto_denominate(
        &self,
        transport: &dyn Transport,
        fee_estimator: &dyn FeeEstimator,
        mempool: &dyn Mempool,
        dry_run: bool,
        now: Instant,
    ) -> bool {
        if !self.ctx.options.is_enabled() || !self.is_mixing() {
            return false;
        }
        if !self.ctx.sync.is_synced() {
            self.set_status("Can't mix while sync is in progress.");
            return false;
        }
        if !dry_run && self.wallet.is_locked() {
            self.set_status("Wallet is locked.");
            return false;
        }

        self.trim_used_nodes();

        let mut sessions = self.sessions.lock().expect("session deque lock");
        if sessions.len() < self.ctx.options.sessions() {
            sessions.push_back(Session::new(self.ctx.clone(), self.wallet.clone()));
        }

        let mut result = true;
        for session in sessions.iter_mut() {
            if !self.check_keypool() {
                return false;
            }
            if self.wait_for_another_block() {
                self.set_status("Last successful action was too recent.");
                log::debug!("{}: auto denominate -- waiting for another block", self.wallet.name());
                return false;
            }
            result &= session.do_auto_denominate(self, transport, fee_estimator, mempool, dry_run, now);
        }
        result
    }

    /// Expires timed-out sessions.
    pub fn check_timeout(&self, now: Instant) {
        if !self.ctx.options.is_enabled() || !self.is_mixing() {
            return;
        }
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            if session.check_timeout(now) {
                self.set_status("Session timed out.");
            }
        }
    }

    /// Flushes every session's pending join request.
    pub fn process_pending_opens(&self, transport: &dyn Transport, now: Instant) {
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            if session.process_pending_open(transport, now) {
                self.set_status("Mixing in progress...");
            }
        }
    }

    /// Routes a ready queue to the session waiting on the node at `addr`.
    pub fn try_submit_denominate(&self, addr: &SocketAddr, transport: &dyn Transport, now: Instant) -> bool {
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            let queued = session.state() == crate::messages::PoolState::Queue;
            let bound_here = session.mixing_node().map(|node| node.addr == *addr).unwrap_or(false);
            if queued && bound_here {
                session.submit_denominate(transport, now);
                return true;
            }
        }
        false
    }

    /// Marks an offer as tried when one of our sessions already sits on its
    /// node.
    pub fn mark_already_joined_queue_as_tried(&self, offer: &mut QueueOffer) -> bool {
        let sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter() {
            let bound = session
                .mixing_node()
                .map(|node| node.collateral == offer.node_collateral)
                .unwrap_or(false);
            if bound {
                offer.tried = true;
                return true;
            }
        }
        false
    }

    /// Aggregate status line across all sessions.
    pub fn get_statuses(&self) -> String {
        let wait_for_block = self.wait_for_another_block();
        let mut out = String::new();
        let mut sessions = self.sessions.lock().expect("session deque lock");
        for session in sessions.iter_mut() {
            out.push_str(&session.get_status(wait_for_block));
            out.push_str("; ");
        }
        out
    }

    pub fn get_session_denoms(&self) -> String {
        let sessions = self.sessions.lock().expect("session deque lock");
        let mut out = String::new();
        for session in sessions.iter() {
            if let Some(denom) = session.denom() {
                out.push_str(&denom.to_string());
                out.push_str("; ");
            }
        }
        if out.is_empty() {
            "N/A".to_string()
        } else {
            out
        }
    }

    /// Nodes our sessions are currently bound to.
    pub fn get_mixing_nodes(&self) -> Vec<Arc<NodeEntry>> {
        self.sessions
            .lock()
            .expect("session deque lock")
            .iter()
            .filter_map(|session| session.mixing_node())
            .collect()
    }

    pub fn get_json_info(&self) -> serde_json::Value {
        #[derive(serde::Serialize)]
        struct ManagerInfo {
            running: bool,
            sessions: Vec<serde_json::Value>,
        }

        let sessions = self.sessions.lock().expect("session deque lock");
        let info = ManagerInfo {
            running: self.is_mixing(),
            sessions: sessions
                .iter()
                .filter(|session| session.state() != crate::messages::PoolState::Idle)
                .map(|session| session.get_json_info())
                .collect(),
        };
        serde_json::to_value(info).unwrap_or_default()
    }

    pub fn updated_block_tip(&self, height: u32) {
        self.cached_tip_height.store(height, Ordering::Relaxed);
        log::debug!("{}: new tip height {}", self.wallet.name(), height);
    }

    /// Pins the last-success height to the current tip. Called after any
    /// committed planner transaction or completed mix.
    pub(crate) fn updated_success_block(&self) {
        let tip = self.cached_tip_height.load(Ordering::Relaxed);
        self.cached_last_success_height.store(tip, Ordering::Relaxed);
    }

    pub fn tip_height(&self) -> u32 {
        self.cached_tip_height.load(Ordering::Relaxed)
    }

    pub fn last_success_height(&self) -> u32 {
        self.cached_last_success_height.load(Ordering::Relaxed)
    }

    /// In single-session mode, require a block between successful actions.
    pub fn wait_for_another_block(&self) -> bool {
        if !self.ctx.sync.is_synced() {
            return true;
        }
        if self.ctx.options.is_multi_session() {
            return false;
        }
        self.tip_height().saturating_sub(self.last_success_height()) < MIN_BLOCKS_TO_WAIT
    }

    pub(crate) fn add_used_node(&self, outpoint: &OutPoint) {
        self.used_nodes.lock().expect("used nodes lock").push(*outpoint);
    }

    /// Draws one random valid node we haven't recently used.
    pub(crate) fn get_random_not_used_node(&self) -> Option<Arc<NodeEntry>> {
        let used: HashSet<OutPoint> = {
            let used = self.used_nodes.lock().expect("used nodes lock");
            used.iter().copied().collect()
        };

        let mut nodes = self.ctx.registry.valid_nodes();
        let enabled = nodes.len();
        let not_excluded = enabled.saturating_sub(used.len());
        log::debug!(
            "{}: {} enabled nodes, {} to choose from",
            self.wallet.name(),
            enabled,
            not_excluded
        );
        if not_excluded < 1 {
            return None;
        }

        nodes.shuffle(&mut rand::thread_rng());
        nodes.into_iter().find(|node| !used.contains(&node.collateral))
    }

    /// Once 90% of the node list has been used, forget the oldest entries
    /// down to 63%.
    fn trim_used_nodes(&self) {
        let enabled = self.ctx.registry.valid_count();
        let threshold_high = (enabled as f64 * 0.9) as usize;
        let threshold_low = (threshold_high as f64 * 0.7) as usize;

        let mut used = self.used_nodes.lock().expect("used nodes lock");
        if used.len() > threshold_high {
            let drop_count = used.len() - threshold_low;
            used.drain(..drop_count);
            log::debug!(
                "{}: trimmed used node list to {} (threshold {})",
                self.wallet.name(),
                used.len(),
                threshold_high
            );
        }
    }

    /// Refuses to mix into an exhausted keypool; fresh destinations are what
    /// keeps mixed outputs unlinkable.
    fn check_keypool(&self) -> bool {
        if !self.ctx.options.is_enabled() || !self.is_mixing() {
            return false;
        }
        let keys_left = self.wallet.keys_left();
        if keys_left < KEYS_THRESHOLD_STOP {
            self.set_status(&format!(
                "Very low number of keys left: {}, no mixing available.",
                keys_left
            ));
            log::warn!("{}: {}", self.wallet.name(), self.get_status_string());
            self.stop_mixing();
            return false;
        }
        if keys_left < KEYS_THRESHOLD_WARNING {
            self.set_status(&format!("Very low number of keys left: {}", keys_left));
            log::warn!("{}: {}", self.wallet.name(), self.get_status_string());
        }
        true
    }

    fn set_status(&self, status: &str) {
        *self.status.lock().expect("status lock") = status.to_string();
    }

    pub fn get_status_string(&self) -> String {
        self.status.lock().expect("status lock").clone()
    }
}

/// Root of the engine: one manager per wallet, the shared queue manager and
/// the maintenance tick dispatcher.
pub struct Client {
    ctx: Arc<Context>,
    queue: Arc<QueueManager>,
    managers: Mutex<HashMap<String, Arc<Manager>>>,
    tick: AtomicU32,
    next_auto_tick: AtomicU32,
}

impl Client {
    pub fn new(ctx: Arc<Context>) -> Self {
        let queue = Arc::new(QueueManager::new(ctx.clone()));
        Self {
            ctx,
            queue,
            managers: Mutex::new(HashMap::new()),
            tick: AtomicU32::new(0),
            next_auto_tick: AtomicU32::new(AUTO_TIMEOUT_MIN),
        }
    }

    pub fn queue_manager(&self) -> Arc<QueueManager> {
        self.queue.clone()
    }

    /// Registers a wallet for mixing and returns its manager.
    pub fn add_wallet(&self, wallet: Arc<dyn Wallet>) -> Arc<Manager> {
        let manager = Arc::new(Manager::new(self.ctx.clone(), wallet.clone(), self.queue.clone()));
        self.managers
            .lock()
            .expect("manager map lock")
            .insert(wallet.name(), manager.clone());
        manager
    }

    pub fn manager_for(&self, wallet_name: &str) -> Option<Arc<Manager>> {
        self.managers.lock().expect("manager map lock").get(wallet_name).cloned()
    }

    pub fn managers(&self) -> Vec<Arc<Manager>> {
        self.managers.lock().expect("manager map lock").values().cloned().collect()
    }

    /// Entry point for all inbound peer messages.
    pub fn process_message(
        &self,
        peer: PeerId,
        peer_addr: SocketAddr,
        msg: ServerMessage,
        transport: &dyn Transport,
    ) {
        match msg {
            ServerMessage::Offer(offer) => {
                self.queue.process_offer(peer, offer, self, transport, util::unix_time());
            }
            other => {
                let now = Instant::now();
                for manager in self.managers() {
                    manager.process_message(&peer_addr, &other, transport, now);
                }
            }
        }
    }

    pub(crate) fn try_submit_denominate(&self, addr: &SocketAddr, transport: &dyn Transport) -> bool {
        let now = Instant::now();
        self.managers()
            .iter()
            .any(|manager| manager.try_submit_denominate(addr, transport, now))
    }

    pub(crate) fn mark_already_joined_queue_as_tried(&self, offer: &mut QueueOffer) -> bool {
        self.managers()
            .iter()
            .any(|manager| manager.mark_already_joined_queue_as_tried(offer))
    }

    pub fn updated_block_tip(&self, height: u32) {
        for manager in self.managers() {
            manager.updated_block_tip(height);
        }
    }

    /// The 1 Hz maintenance tick: expire sessions and offers, flush pending
    /// opens, and every few ticks run the automatic denomination driver.
    pub fn do_maintenance(
        &self,
        transport: &dyn Transport,
        fee_estimator: &dyn FeeEstimator,
        mempool: &dyn Mempool,
    ) {
        if self.ctx.shutdown_requested() {
            return;
        }
        if !self.ctx.sync.is_synced() {
            return;
        }

        self.queue.check_queue(util::unix_time());

        if !self.ctx.options.is_enabled() {
            return;
        }

        let now = Instant::now();
        let tick = self.tick.fetch_add(1, Ordering::Relaxed) + 1;

        for manager in self.managers() {
            manager.check_timeout(now);
            manager.process_pending_opens(transport, now);
        }

        if tick >= self.next_auto_tick.load(Ordering::Relaxed) {
            for manager in self.managers() {
                manager.do_auto_denominate(transport, fee_estimator, mempool, false, now);
            }
            let span = AUTO_TIMEOUT_MIN
                + rand::thread_rng().gen_range(0..AUTO_TIMEOUT_MAX - AUTO_TIMEOUT_MIN);
            self.next_auto_tick.store(tick + span, Ordering::Relaxed);
        }
    }

    /// The embedder observed resource exhaustion (e.g. disk full): drop all
    /// sessions and stop mixing until further notice.
    pub fn set_resource_exhausted(&self) {
        log::warn!("resource exhaustion reported, disabling mixing");
        for manager in self.managers() {
            manager.reset_pool();
            manager.stop_mixing();
        }
    }
}
