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

//! One in-flight mixing attempt against a single mixer node.
//!
//! A session walks a fixed state machine: idle, queued at a node, submitting
//! entries, cosigning the final transaction, back to idle. Server messages
//! only count when they come from the bound node, and the final transaction
//! is signed strictly after verifying that every own input and output
//! survived. Losing the collateral is preferred over signing a transaction
//! that doesn't look like what we submitted.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitcoin::{
    EcdsaSighashType, Network, OutPoint, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};
use rand::Rng;

use crate::denoms::{self, Denom, COLLATERAL_AMOUNT, MAX_COLLATERAL_AMOUNT, STANDARD_DENOMINATIONS};
use crate::manager::Manager;
use crate::messages::{
    ClientMessage, Complete, Entry, FinalTx, JoinRequest, PoolMessage, PoolState, PoolStatus,
    ServerMessage, SignedInputs, StatusUpdate,
};
use crate::nodes::{self, NodeEntry, NodeRegistry};
use crate::planner::{self, KeyHolderStorage};
use crate::util::{self, bip69};
use crate::{
    ChainSync, Context, DenomInput, FeeEstimator, Mempool, Transport, Wallet, ERROR_RESET_SECS,
    LAG_GRACE_SECS, PENDING_OPEN_TIMEOUT_SECS, QUEUE_TIMEOUT_SECS, SIGNING_TIMEOUT_SECS,
};

/// One partial contribution this session has committed to a mix.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub inputs: Vec<DenomInput>,
    pub outputs: Vec<TxOut>,
    pub collateral: Transaction,
}

/// A composed join request waiting for its peer connection to come up.
#[derive(Debug, Clone)]
struct PendingOpen {
    addr: SocketAddr,
    request: JoinRequest,
    deadline: Instant,
}

pub struct Session {
    ctx: Arc<Context>,
    wallet: Arc<dyn Wallet>,
    state: PoolState,
    session_id: u32,
    denom: Option<Denom>,
    mixing_node: Option<Arc<NodeEntry>>,
    collateral_tx: Option<Transaction>,
    entries: Vec<SessionEntry>,
    locked_outpoints: Vec<OutPoint>,
    key_holder: KeyHolderStorage,
    last_step_time: Instant,
    pending_open: Option<PendingOpen>,
    last_message: String,
    status: String,
    status_progress: u32,
}

impl Session {
    pub(crate) fn new(ctx: Arc<Context>, wallet: Arc<dyn Wallet>) -> Self {
        Self {
            ctx,
            wallet,
            state: PoolState::Idle,
            session_id: 0,
            denom: None,
            mixing_node: None,
            collateral_tx: None,
            entries: Vec::new(),
            locked_outpoints: Vec::new(),
            key_holder: KeyHolderStorage::default(),
            last_step_time: Instant::now(),
            pending_open: None,
            last_message: String::new(),
            status: String::new(),
            status_progress: 0,
        }
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn denom(&self) -> Option<Denom> {
        self.denom
    }

    pub fn mixing_node(&self) -> Option<Arc<NodeEntry>> {
        self.mixing_node.clone()
    }

    pub fn entries_count(&self) -> usize {
        self.entries.len()
    }

    /// Handles a server message already filtered to this wallet. Messages
    /// from anyone but the bound mixer node are dropped.
    pub(crate) fn process_message(
        &mut self,
        mgr: &Manager,
        transport: &dyn Transport,
        peer_addr: &SocketAddr,
        msg: &ServerMessage,
        now: Instant,
    ) {
        let bound_addr = match &self.mixing_node {
            Some(node) => node.addr,
            None => return,
        };
        if bound_addr != *peer_addr {
            return;
        }

        match msg {
            ServerMessage::Status(update) => self.process_status_update(update, now),
            ServerMessage::FinalTx(final_tx) => {
                self.sign_final_transaction(final_tx, peer_addr, transport, now);
            }
            ServerMessage::Complete(complete) => self.completed_transaction(mgr, complete),
            // queue offers are handled by the queue manager
            ServerMessage::Offer(_) => {}
        }
    }

    /// Applies a server progress report: adopts the assigned session id on
    /// acceptance, frees everything and backs off on rejection.
    fn process_status_update(&mut self, update: &StatusUpdate, now: Instant) {
        // state is not updated while idle or recovering from an error
        if self.state == PoolState::Idle || self.state == PoolState::Error {
            return;
        }

        let msg_state = match update.pool_state() {
            Some(state) => state,
            None => {
                log::debug!("{}: dssu -- state out of bounds: {}", self.wallet.name(), update.state);
                return;
            }
        };
        let message = match update.pool_message() {
            Some(message) => message,
            None => {
                log::debug!(
                    "{}: dssu -- message id out of bounds: {}",
                    self.wallet.name(),
                    update.message_id
                );
                return;
            }
        };

        self.status = format!("Mixer node: {}", message.text());

        match update.pool_status() {
            Some(PoolStatus::Rejected) => {
                log::info!("{}: dssu -- rejected by node: {}", self.wallet.name(), message.text());
                self.release_resources();
                self.set_state(PoolState::Error);
                self.last_step_time = now;
                self.last_message = message.text().to_string();
            }
            Some(PoolStatus::Accepted) => {
                if self.state == msg_state
                    && msg_state == PoolState::Queue
                    && self.session_id == 0
                    && update.session_id != 0
                {
                    // session ids are only ever assigned while queued
                    self.session_id = update.session_id;
                    self.last_step_time = now;
                    log::info!(
                        "{}: dssu -- accepted, session id {}",
                        self.wallet.name(),
                        self.session_id
                    );
                } else {
                    log::debug!("{}: dssu -- accepted: {}", self.wallet.name(), message.text());
                }
            }
            None => {
                log::debug!(
                    "{}: dssu -- status out of bounds: {}",
                    self.wallet.name(),
                    update.status
                );
            }
        }
    }

    /// Verifies the final joint transaction and cosigns our inputs.
    ///
    /// The received transaction must already be in canonical order, carry
    /// uniform denomination outputs, and contain every input and output this
    /// session submitted. Any deviation frees our resources and refuses to
    /// sign, accepting the collateral penalty.
    fn sign_final_transaction(
        &mut self,
        final_tx: &FinalTx,
        peer_addr: &SocketAddr,
        transport: &dyn Transport,
        now: Instant,
    ) -> bool {
        if !self.ctx.options.is_enabled() {
            return false;
        }
        if final_tx.session_id != self.session_id {
            log::debug!(
                "{}: dsf -- session mismatch: ours {}, theirs {}",
                self.wallet.name(),
                self.session_id,
                final_tx.session_id
            );
            return false;
        }

        let mut guard = FailGuard::new(self, now);

        // the server-sent ordering must be the canonical one
        let mut tx = final_tx.tx.clone();
        bip69::sort_transaction(&mut tx);
        if tx.txid() != final_tx.tx.txid() {
            log::warn!(
                "{}: dsf -- final tx is not canonically ordered, refusing to sign",
                guard.wallet.name()
            );
            return false;
        }

        if let Err(code) = guard.valid_in_outs(&tx) {
            log::warn!("{}: dsf -- invalid final tx: {}", guard.wallet.name(), code.text());
            return false;
        }

        // our own outputs and inputs must all have survived
        for entry in &guard.entries {
            for txout in &entry.outputs {
                let found = tx.output.iter().any(|out| *out == *txout);
                if !found {
                    log::warn!(
                        "{}: dsf -- an output of ours is missing, refusing to sign",
                        guard.wallet.name()
                    );
                    return false;
                }
            }
            for input in &entry.inputs {
                let found = tx.input.iter().any(|txin| txin.previous_output == input.outpoint);
                if !found {
                    log::warn!(
                        "{}: dsf -- an input of ours is missing, refusing to sign",
                        guard.wallet.name()
                    );
                    return false;
                }
            }
        }

        let own: Vec<OutPoint> = guard
            .entries
            .iter()
            .flat_map(|entry| entry.inputs.iter().map(|input| input.outpoint))
            .collect();

        let wallet = guard.wallet.clone();
        let signed = match wallet.sign_inputs(&mut tx, &own, EcdsaSighashType::AllPlusAnyoneCanPay) {
            Ok(signed) => signed,
            Err(e) => {
                log::warn!("{}: dsf -- signing failed: {}", wallet.name(), e);
                return false;
            }
        };
        if signed.is_empty() {
            log::warn!("{}: dsf -- can't sign anything", wallet.name());
            return false;
        }

        let inputs: Vec<TxIn> = signed.iter().filter_map(|i| tx.input.get(*i).cloned()).collect();
        log::info!("{}: dsf -- pushing {} signed inputs to the node", wallet.name(), inputs.len());
        if !transport.send_to(peer_addr, ClientMessage::Signatures(SignedInputs { inputs })) {
            log::warn!("{}: dsf -- node connection went away mid-signing", wallet.name());
        }

        guard.disarm();
        drop(guard);

        self.set_state(PoolState::Signing);
        self.last_step_time = now;
        true
    }

    /// Structural checks every final transaction must pass regardless of our
    /// own contribution.
    fn valid_in_outs(&self, tx: &Transaction) -> Result<(), PoolMessage> {
        if tx.input.len() != tx.output.len() {
            return Err(PoolMessage::SizeMismatch);
        }

        let denom_amount = self
            .denom
            .and_then(|denom| denom.amount())
            .ok_or(PoolMessage::InvalidDenom)?;

        let mut scripts = HashSet::new();
        for out in &tx.output {
            if out.value != denom_amount {
                return Err(PoolMessage::InvalidDenom);
            }
            if !out.script_pubkey.is_p2pkh() && !out.script_pubkey.is_v0_p2wpkh() {
                return Err(PoolMessage::InvalidScript);
            }
            if !scripts.insert(out.script_pubkey.clone()) {
                return Err(PoolMessage::AlreadyHave);
            }
        }

        let mut outpoints = HashSet::new();
        for txin in &tx.input {
            if txin.previous_output.is_null() {
                return Err(PoolMessage::InvalidInput);
            }
            if !outpoints.insert(txin.previous_output) {
                return Err(PoolMessage::AlreadyHave);
            }
        }

        Ok(())
    }

    /// The mix finished, successfully or not. Coins are unlocked either way;
    /// reserved destinations are kept only when the mix went through.
    fn completed_transaction(&mut self, mgr: &Manager, complete: &Complete) {
        if complete.session_id != self.session_id {
            log::debug!(
                "{}: dsc -- session mismatch: ours {}, theirs {}",
                self.wallet.name(),
                self.session_id,
                complete.session_id
            );
            return;
        }
        let message = match PoolMessage::from_raw(complete.message_id) {
            Some(message) => message,
            None => {
                log::debug!(
                    "{}: dsc -- message id out of bounds: {}",
                    self.wallet.name(),
                    complete.message_id
                );
                return;
            }
        };

        let wallet = self.wallet.clone();
        if message == PoolMessage::Success {
            log::info!("{}: dsc -- mix successful", wallet.name());
            mgr.updated_success_block();
            self.key_holder.keep_all(wallet.as_ref());
        } else {
            log::info!("{}: dsc -- mix failed: {}", wallet.name(), message.text());
            self.key_holder.return_all(wallet.as_ref());
        }
        self.unlock_coins();
        self.set_null();
        self.last_message = message.text().to_string();
    }

    /// Expires stuck sessions. Returns true when a timeout fired.
    pub(crate) fn check_timeout(&mut self, now: Instant) -> bool {
        match self.state {
            PoolState::Idle => return false,
            PoolState::Error => {
                if now.duration_since(self.last_step_time)
                    >= Duration::from_secs(ERROR_RESET_SECS)
                {
                    log::debug!(
                        "{}: resetting session {} after error cooldown",
                        self.wallet.name(),
                        self.session_id
                    );
                    self.set_null();
                }
                return false;
            }
            _ => {}
        }

        let timeout = if self.state == PoolState::Signing {
            SIGNING_TIMEOUT_SECS
        } else {
            QUEUE_TIMEOUT_SECS as u64
        };
        // give the server a few extra seconds before resetting
        let deadline = Duration::from_secs(timeout + LAG_GRACE_SECS);
        if now.duration_since(self.last_step_time) < deadline {
            return false;
        }

        log::info!(
            "{}: session {} timed out ({}s in {})",
            self.wallet.name(),
            self.session_id,
            timeout,
            self.state.name()
        );

        self.set_state(PoolState::Error);
        self.release_resources();
        self.last_step_time = now;
        self.last_message = PoolMessage::SessionMismatch.text().to_string();
        true
    }

    /// One pass of the automatic mixing driver: make sure the wallet is
    /// prepared, then join an existing queue or start a new one.
    pub(crate) fn do_auto_denominate(
        &mut self,
        mgr: &Manager,
        transport: &dyn Transport,
        fee_estimator: &dyn FeeEstimator,
        mempool: &dyn Mempool,
        dry_run: bool,
        now: Instant,
    ) -> bool {
        if self.state != PoolState::Idle {
            return false;
        }
        if !self.ctx.sync.is_synced() {
            self.status = "Can't mix while sync is in progress.".to_string();
            return false;
        }
        if !self.ctx.options.is_enabled() {
            return false;
        }
        if !dry_run && self.wallet.is_locked() {
            self.status = "Wallet is locked.".to_string();
            return false;
        }
        if !self.entries.is_empty() {
            self.status = "Mixing in progress...".to_string();
            return false;
        }
        if self.ctx.registry.valid_count() == 0 && self.ctx.network != Network::Regtest {
            self.status = "No mixer nodes detected.".to_string();
            log::debug!("{}: auto denominate -- {}", self.wallet.name(), self.status);
            return false;
        }

        let bal = self.wallet.balance();
        let target = (self.ctx.options.amount() * denoms::COIN) as i64;
        let mut needs_anonymized = target - bal.anonymized as i64;
        if needs_anonymized < 0 {
            log::debug!("{}: auto denominate -- nothing to do", self.wallet.name());
            return false;
        }

        let mut value_min = denoms::smallest_denomination();
        // no confirmed collateral inputs yet, have some extra for them
        if !self.wallet.has_collateral_inputs(true) {
            value_min += MAX_COLLATERAL_AMOUNT;
        }

        let anonymizable = self.wallet.anonymizable_balance(false);
        if anonymizable < value_min {
            self.status = "Not enough funds to mix.".to_string();
            log::debug!("{}: auto denominate -- {}", self.wallet.name(), self.status);
            return false;
        }

        let non_denom = self.wallet.anonymizable_balance(true);
        let denominated = bal.denominated_trusted + bal.denominated_pending;
        let balance_to_denominate = target - denominated as i64;

        // bump the target so the final increment consumes one full denom
        if denominated as i64 - bal.anonymized as i64 > needs_anonymized {
            let mut additional = 0i64;
            for denom in STANDARD_DENOMINATIONS {
                if needs_anonymized < denom as i64 {
                    additional = denom as i64;
                } else {
                    break;
                }
            }
            needs_anonymized += additional;
        }

        log::debug!(
            "{}: auto denominate -- anonymized: {}, needs: {}, non-denom: {}, to denominate: {}",
            self.wallet.name(),
            denoms::format_amount(bal.anonymized),
            needs_anonymized,
            denoms::format_amount(non_denom),
            balance_to_denominate,
        );

        if dry_run {
            return true;
        }

        // create more denominated outputs while funds and headroom remain
        if non_denom as i64 >= value_min as i64 + COLLATERAL_AMOUNT as i64
            && balance_to_denominate > 0
            && planner::create_denominated(
                self.wallet.as_ref(),
                fee_estimator,
                &self.ctx.options,
                balance_to_denominate,
            )
        {
            mgr.updated_success_block();
        }

        // make sure the collateral stockpile exists before anything else
        if !self.wallet.has_collateral_inputs(true) {
            if self.wallet.has_collateral_inputs(false) {
                // unconfirmed collateral exists, wait for it
                return false;
            }
            let made = planner::make_collateral_amounts(self.wallet.as_ref(), fee_estimator);
            if made {
                mgr.updated_success_block();
            }
            return made;
        }

        if self.session_id != 0 {
            self.status = "Mixing in progress...".to_string();
            return false;
        }

        // clean anything left over from the previous attempt
        self.release_resources();
        self.set_null();

        if !self.ctx.options.is_multi_session() && bal.denominated_pending > 0 {
            self.status =
                "Found unconfirmed denominated outputs, will wait till they confirm to continue."
                    .to_string();
            log::debug!("{}: auto denominate -- {}", self.wallet.name(), self.status);
            return false;
        }

        // check our collateral draft and create a new one if needed
        let needs_new_collateral = match &self.collateral_tx {
            None => true,
            Some(tx) => !planner::is_collateral_valid(tx, mempool),
        };
        if needs_new_collateral {
            match planner::create_collateral_transaction(self.wallet.as_ref()) {
                Ok(tx) => self.collateral_tx = Some(tx),
                Err(e) => {
                    log::debug!(
                        "{}: auto denominate -- cannot create collateral: {:?}",
                        self.wallet.name(),
                        e
                    );
                    return false;
                }
            }
        }

        // lock the funds backing our collateral
        let collateral_inputs: Vec<OutPoint> = self
            .collateral_tx
            .as_ref()
            .map(|tx| tx.input.iter().map(|txin| txin.previous_output).collect())
            .unwrap_or_default();
        for outpoint in collateral_inputs {
            self.wallet.lock_coin(&outpoint);
            self.locked_outpoints.push(outpoint);
        }

        let needed = needs_anonymized as u64;

        // always prefer joining an existing queue over starting one
        if self.join_existing_queue(mgr, transport, needed, now) {
            return true;
        }
        if self.start_new_queue(mgr, transport, needed, now) {
            return true;
        }

        self.status = "No compatible mixer node found.".to_string();
        false
    }

    /// Walks the gossiped offers front to back and binds to the first node
    /// we can serve with matching denomination inputs.
    fn join_existing_queue(
        &mut self,
        mgr: &Manager,
        transport: &dyn Transport,
        needed: u64,
        now: Instant,
    ) -> bool {
        let registry = self.ctx.registry.clone();
        let weighted = registry.weighted_count();
        let height = registry.height();

        while let Some(offer) = mgr.queue().get_and_try(util::unix_time()) {
            let node = match registry.by_collateral(&offer.node_collateral) {
                Some(node) => node,
                None => {
                    log::debug!(
                        "{}: join queue -- offer node not in valid list ({})",
                        self.wallet.name(),
                        offer
                    );
                    continue;
                }
            };

            // nodes about to be paid are busy elsewhere
            if nodes::is_next_winner(&node, weighted, height, self.ctx.network) {
                log::debug!("{}: join queue -- skipping winner {}", self.wallet.name(), node.id);
                continue;
            }

            // rate limiting was already enforced when the offer entered the
            // queue, no need to re-check it here

            log::debug!("{}: join queue -- trying offer: {}", self.wallet.name(), offer);

            let inputs = self.wallet.select_inputs_by_denomination(offer.denom, needed);
            if inputs.is_empty() {
                log::debug!(
                    "{}: join queue -- couldn't match denomination {}",
                    self.wallet.name(),
                    offer.denom
                );
                continue;
            }

            mgr.add_used_node(&offer.node_collateral);

            if transport.is_pending_or_disconnecting(&node.addr) {
                log::debug!(
                    "{}: join queue -- connection busy, addr={}",
                    self.wallet.name(),
                    node.addr
                );
                continue;
            }

            let collateral = match self.collateral_tx.clone() {
                Some(collateral) => collateral,
                None => return false,
            };

            self.denom = Some(offer.denom);
            self.mixing_node = Some(node.clone());
            self.pending_open = Some(PendingOpen {
                addr: node.addr,
                request: JoinRequest { denom: offer.denom, collateral_tx: collateral },
                deadline: now + Duration::from_secs(PENDING_OPEN_TIMEOUT_SECS),
            });
            transport.request_connection(&node);
            self.set_state(PoolState::Queue);
            self.last_step_time = now;
            self.status = "Trying to connect...".to_string();
            log::info!(
                "{}: join queue -- pending connection, denom {} addr {}",
                self.wallet.name(),
                offer.denom,
                node.addr
            );
            return true;
        }

        self.status = "Failed to find mixing queue to join".to_string();
        false
    }

    /// Asks a random unused node to open a fresh queue for a denomination we
    /// can serve.
    fn start_new_queue(
        &mut self,
        mgr: &Manager,
        transport: &dyn Transport,
        needed: u64,
        now: Instant,
    ) -> bool {
        if needed == 0 {
            return false;
        }

        let registry = self.ctx.registry.clone();
        let valid_count = registry.valid_count();
        let weighted = registry.weighted_count();
        let height = registry.height();

        // find denominations we could contribute
        let denom_choices: Vec<Denom> = self
            .wallet
            .select_denominated_amounts(needed)
            .iter()
            .rev() // largest first
            .filter_map(|amount| Denom::from_amount(*amount))
            .collect();
        if denom_choices.is_empty() {
            self.status = "Can't mix: no compatible inputs found!".to_string();
            log::debug!("{}: start queue -- {}", self.wallet.name(), self.status);
            return false;
        }

        let mut tries = 0;
        while tries < 10 {
            let node = match mgr.get_random_not_used_node() {
                Some(node) => node,
                None => {
                    self.status = "Can't find random mixer node.".to_string();
                    log::debug!("{}: start queue -- {}", self.wallet.name(), self.status);
                    return false;
                }
            };
            mgr.add_used_node(&node.collateral);

            if nodes::is_next_winner(&node, weighted, height, self.ctx.network) {
                log::debug!("{}: start queue -- skipping winner {}", self.wallet.name(), node.id);
                tries += 1;
                continue;
            }

            let meta = &self.ctx.node_meta;
            let last_dsq = meta.last_dsq(&node.id);
            let threshold = meta.dsq_threshold(&node.id, valid_count);
            if last_dsq != 0 && threshold > meta.dsq_count() {
                log::debug!(
                    "{}: start queue -- too early to mix on node {} (last {}, threshold {}, count {})",
                    self.wallet.name(),
                    node.id,
                    last_dsq,
                    threshold,
                    meta.dsq_count()
                );
                tries += 1;
                continue;
            }

            if transport.is_pending_or_disconnecting(&node.addr) {
                log::debug!(
                    "{}: start queue -- connection busy, addr={}",
                    self.wallet.name(),
                    node.addr
                );
                tries += 1;
                continue;
            }

            log::debug!(
                "{}: start queue -- attempt {} connecting to {}",
                self.wallet.name(),
                tries,
                node.addr
            );

            // sample one denomination, preferring larger ones
            let denom = loop {
                let mut chosen = None;
                for candidate in &denom_choices {
                    if denom_choices.len() > 1 && rand::thread_rng().gen_bool(0.5) {
                        continue;
                    }
                    chosen = Some(*candidate);
                    break;
                }
                if let Some(denom) = chosen {
                    break denom;
                }
            };

            let collateral = match self.collateral_tx.clone() {
                Some(collateral) => collateral,
                None => return false,
            };

            self.denom = Some(denom);
            self.mixing_node = Some(node.clone());
            transport.request_connection(&node);
            self.pending_open = Some(PendingOpen {
                addr: node.addr,
                request: JoinRequest { denom, collateral_tx: collateral },
                deadline: now + Duration::from_secs(PENDING_OPEN_TIMEOUT_SECS),
            });
            self.set_state(PoolState::Queue);
            self.last_step_time = now;
            self.status = "Trying to connect...".to_string();
            log::info!(
                "{}: start queue -- pending connection, denom {} addr {}",
                self.wallet.name(),
                denom,
                node.addr
            );
            return true;
        }

        self.status = "Failed to start a new mixing queue".to_string();
        false
    }

    /// Selects and prepares our entry for the bound queue and ships it.
    pub(crate) fn submit_denominate(&mut self, transport: &dyn Transport, now: Instant) -> bool {
        let inputs = match self.select_denominate() {
            Ok(inputs) => inputs,
            Err(reason) => {
                log::debug!("{}: submit -- selection failed: {}", self.wallet.name(), reason);
                return false;
            }
        };
        let denom = match self.denom {
            Some(denom) => denom,
            None => return false,
        };

        let rounds = self.ctx.options.rounds();
        let random_rounds = self.ctx.options.random_rounds();
        let wallet = self.wallet.clone();

        // dry-run each depth and prefer the one yielding the most inputs,
        // breaking ties towards fewer rounds
        let mut by_rounds: Vec<(i32, usize)> = Vec::new();
        for depth in 0..rounds + random_rounds {
            match planner::prepare_denominate(
                wallet.as_ref(),
                &mut self.key_holder,
                &mut self.locked_outpoints,
                denom,
                &inputs,
                depth,
                depth,
                true,
            ) {
                Ok(pairs) => by_rounds.push((depth, pairs.len())),
                Err(e) => {
                    log::debug!(
                        "{}: submit -- dry run for depth {} failed: {:?}",
                        wallet.name(),
                        depth,
                        e
                    );
                }
            }
        }
        by_rounds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        if let Some((depth, _)) = by_rounds.first().copied() {
            if let Ok(pairs) = planner::prepare_denominate(
                wallet.as_ref(),
                &mut self.key_holder,
                &mut self.locked_outpoints,
                denom,
                &inputs,
                depth,
                depth,
                false,
            ) {
                log::debug!("{}: submit -- prepared entry at depth {}", wallet.name(), depth);
                return self.send_denominate(pairs, transport, now);
            }
        }

        // strange, make a final attempt mixing across all depths
        match planner::prepare_denominate(
            wallet.as_ref(),
            &mut self.key_holder,
            &mut self.locked_outpoints,
            denom,
            &inputs,
            0,
            rounds - 1,
            false,
        ) {
            Ok(pairs) => {
                log::debug!("{}: submit -- prepared entry across all depths", wallet.name());
                self.send_denominate(pairs, transport, now)
            }
            Err(e) => {
                log::warn!("{}: submit -- cannot prepare entry: {:?}", wallet.name(), e);
                self.status = "Can't prepare current denominated outputs".to_string();
                false
            }
        }
    }

    fn select_denominate(&self) -> Result<Vec<DenomInput>, &'static str> {
        if self.wallet.is_locked() {
            return Err("wallet locked, unable to create transaction");
        }
        if !self.entries.is_empty() {
            return Err("already have pending entries in the mixing pool");
        }
        let denom = self.denom.ok_or("no session denomination")?;
        let inputs = self.wallet.select_inputs_by_denomination(denom, denoms::max_pool_amount());
        if inputs.is_empty() {
            return Err("can't select current denominated inputs");
        }
        Ok(inputs)
    }

    fn send_denominate(
        &mut self,
        pairs: Vec<(DenomInput, TxOut)>,
        transport: &dyn Transport,
        now: Instant,
    ) -> bool {
        let collateral = match &self.collateral_tx {
            Some(tx) if !tx.input.is_empty() => tx.clone(),
            _ => {
                log::warn!("{}: submit -- collateral not set", self.wallet.name());
                return false;
            }
        };

        // we should have been accepted into a queue by now
        if self.session_id == 0 {
            log::warn!("{}: submit -- no session id yet", self.wallet.name());
            self.release_resources();
            self.set_null();
            return false;
        }

        let node_addr = match &self.mixing_node {
            Some(node) => node.addr,
            None => return false,
        };

        self.set_state(PoolState::AcceptingEntries);
        self.last_message.clear();

        let entry_inputs: Vec<DenomInput> = pairs.iter().map(|(input, _)| input.clone()).collect();
        let outputs: Vec<TxOut> = pairs.into_iter().map(|(_, out)| out).collect();
        let wire_inputs: Vec<TxIn> = entry_inputs
            .iter()
            .map(|input| TxIn {
                previous_output: input.outpoint,
                script_sig: Script::new(),
                sequence: Sequence::MAX,
                witness: Witness::default(),
            })
            .collect();

        self.entries.push(SessionEntry {
            inputs: entry_inputs,
            outputs: outputs.clone(),
            collateral: collateral.clone(),
        });

        log::info!(
            "{}: submit -- sending entry with {} inputs to {}",
            self.wallet.name(),
            wire_inputs.len(),
            node_addr
        );
        let sent = transport.send_to(
            &node_addr,
            ClientMessage::Entry(Entry { inputs: wire_inputs, outputs, collateral }),
        );
        if !sent {
            log::warn!("{}: submit -- node connection not available", self.wallet.name());
        }
        self.last_step_time = now;
        true
    }

    /// Flushes a composed join request once the connection is up, or resets
    /// the session when the connection never came.
    pub(crate) fn process_pending_open(&mut self, transport: &dyn Transport, now: Instant) -> bool {
        let (addr, deadline, request) = match &self.pending_open {
            Some(pending) => (pending.addr, pending.deadline, pending.request.clone()),
            None => return false,
        };

        if transport.send_to(&addr, ClientMessage::Join(request)) {
            log::debug!("{}: sent join request to {}", self.wallet.name(), addr);
            self.last_step_time = now;
            self.pending_open = None;
            return true;
        }

        if now >= deadline {
            log::debug!("{}: failed to connect to {}", self.wallet.name(), addr);
            self.release_resources();
            self.set_null();
        }
        false
    }

    /// Discards the session completely, releasing every held resource.
    pub(crate) fn reset(&mut self) {
        self.collateral_tx = None;
        self.release_resources();
        self.set_null();
    }

    /// Unlocks coins and returns reserved destinations. Runs on every exit
    /// from a non-idle state except a successful completion.
    fn release_resources(&mut self) {
        self.unlock_coins();
        let wallet = self.wallet.clone();
        self.key_holder.return_all(wallet.as_ref());
    }

    fn unlock_coins(&mut self) {
        for outpoint in self.locked_outpoints.drain(..) {
            self.wallet.unlock_coin(&outpoint);
        }
    }

    fn set_null(&mut self) {
        self.state = PoolState::Idle;
        self.session_id = 0;
        self.denom = None;
        self.mixing_node = None;
        self.entries.clear();
        self.pending_open = None;
    }

    fn set_state(&mut self, state: PoolState) {
        log::debug!(
            "{}: session state {} -> {}",
            self.wallet.name(),
            self.state.name(),
            state.name()
        );
        self.state = state;
    }

    /// Human-readable progress line for the status surface.
    pub(crate) fn get_status(&mut self, wait_for_block: bool) -> String {
        self.status_progress = self.status_progress.wrapping_add(10);

        if wait_for_block || !self.ctx.sync.is_synced() {
            return self.status.clone();
        }

        let suffix = match self.status_progress % 70 {
            0..=30 => ".",
            31..=50 => "..",
            _ => "...",
        };
        match self.state {
            PoolState::Idle => "Vortex is idle.".to_string(),
            PoolState::Queue => {
                format!("Submitted to mixer node, waiting in queue {}", suffix)
            }
            PoolState::AcceptingEntries => self.status.clone(),
            PoolState::Signing => format!("Found enough participants, signing ( waiting {} )", suffix),
            PoolState::Error => {
                format!("Vortex request incomplete: {} Will retry...", self.last_message)
            }
        }
    }

    pub(crate) fn get_json_info(&self) -> serde_json::Value {
        let info = SessionInfo {
            node_id: self.mixing_node.as_ref().map(|node| node.id.to_string()),
            outpoint: self.mixing_node.as_ref().map(|node| node.collateral.to_string()),
            service: self.mixing_node.as_ref().map(|node| node.addr.to_string()),
            denomination: match self.denom {
                Some(denom) => denom.to_string(),
                None => "N/A".to_string(),
            },
            state: self.state.name(),
            entries_count: self.entries.len(),
        };
        serde_json::to_value(info).unwrap_or_default()
    }
}

#[derive(serde::Serialize)]
struct SessionInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<String>,
    denomination: String,
    state: &'static str,
    entries_count: usize,
}

/// Frees the session's locked coins and reserved destinations and parks it
/// in the error state unless explicitly disarmed. Covers every early return
/// and unwind inside the signing path.
struct FailGuard<'a> {
    session: &'a mut Session,
    now: Instant,
    armed: bool,
}

impl<'a> FailGuard<'a> {
    fn new(session: &'a mut Session, now: Instant) -> Self {
        Self { session, now, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FailGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.release_resources();
            self.session.set_state(PoolState::Error);
            self.session.last_step_time = self.now;
            self.session.last_message = PoolMessage::InvalidTx.text().to_string();
        }
    }
}

impl Deref for FailGuard<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for FailGuard<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::denoms::COIN;
    use crate::messages::PoolState;
    use crate::testutil::{p2pkh_script, Harness};

    const SESSION_ID: u32 = 512_312;

    fn status_update(session_id: u32, state: PoolState, status: PoolStatus) -> ServerMessage {
        ServerMessage::Status(StatusUpdate {
            session_id,
            state: state as u32,
            status: status as u32,
            message_id: PoolMessage::NoError as u32,
        })
    }

    /// Drives a fresh session up to the queue state against the harness
    /// node, with the join request flushed.
    fn queued_session(h: &Harness) -> Session {
        let now = Instant::now();
        let mut session = Session::new(h.ctx.clone(), h.wallet.clone());
        let mgr = h.manager();

        assert!(session.do_auto_denominate(&mgr, &h.transport, &h.fee, &h.mempool, false, now));
        assert_eq!(session.state(), PoolState::Queue);
        assert!(session.mixing_node().is_some());

        // the connection comes up and the join request goes out
        h.transport.set_connected(h.node.addr, true);
        assert!(session.process_pending_open(&h.transport, now));
        assert_eq!(h.transport.sent_tags(), vec!["dsa"]);

        // node accepts us into its queue and assigns a session id
        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &status_update(SESSION_ID, PoolState::Queue, PoolStatus::Accepted),
            now,
        );
        assert_eq!(session.session_id(), SESSION_ID);
        session
    }

    /// Builds the joint transaction for the session's entry plus one other
    /// participant, in canonical order.
    fn final_tx_for(session: &Session, denom_amount: u64) -> Transaction {
        let entry = &session.entries[0];
        let mut tx = Transaction {
            version: 2,
            lock_time: bitcoin::PackedLockTime::ZERO,
            input: entry
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.outpoint,
                    script_sig: Script::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::default(),
                })
                .collect(),
            output: entry.outputs.clone(),
        };
        // another participant
        tx.input.push(TxIn {
            previous_output: OutPoint {
                txid: bitcoin::Txid::from_hash(crate::util::hashes::sha256d(b"other participant")),
                vout: 0,
            },
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        });
        tx.output.push(TxOut { value: denom_amount, script_pubkey: p2pkh_script(0xEE) });
        bip69::sort_transaction(&mut tx);
        tx
    }

    #[test]
    fn full_mix_flow_keeps_destinations() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);
        let denom_amount = COIN / 1_000 + 1;

        // queue is ready, submit our entry
        assert!(session.submit_denominate(&h.transport, now));
        assert_eq!(session.state(), PoolState::AcceptingEntries);
        assert_eq!(session.entries_count(), 1);
        assert!(!session.locked_outpoints.is_empty());
        assert!(h.transport.sent_tags().contains(&"dsi".to_string()));

        // the final transaction arrives and we cosign
        let final_tx = final_tx_for(&session, denom_amount);
        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::FinalTx(FinalTx { session_id: SESSION_ID, tx: final_tx }),
            now,
        );
        assert_eq!(session.state(), PoolState::Signing);
        assert!(h.transport.sent_tags().contains(&"dss".to_string()));

        // completion: destinations kept, coins unlocked, back to idle
        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::Complete(Complete {
                session_id: SESSION_ID,
                message_id: PoolMessage::Success as u32,
            }),
            now,
        );
        assert_eq!(session.state(), PoolState::Idle);
        assert!(session.locked_outpoints.is_empty());
        assert!(h.wallet.locked_coins().is_empty());
        assert!(h.wallet.kept_count() > 0);
        assert_eq!(h.wallet.returned_count(), 0);
        assert_eq!(mgr.last_success_height(), h.registry.height());
    }

    #[test]
    fn misshapen_final_tx_refused() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);
        let denom_amount = COIN / 1_000 + 1;

        assert!(session.submit_denominate(&h.transport, now));
        let reserved = h.wallet.reserved_count();
        assert!(reserved > 0);

        // drop one of our outputs from the final transaction
        let mut tx = final_tx_for(&session, denom_amount);
        let own_script = session.entries[0].outputs[0].script_pubkey.clone();
        tx.output.retain(|out| out.script_pubkey != own_script);
        tx.input.remove(0);
        bip69::sort_transaction(&mut tx);

        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::FinalTx(FinalTx { session_id: SESSION_ID, tx }),
            now,
        );

        // refused: error state, everything released, no signatures sent
        assert_eq!(session.state(), PoolState::Error);
        assert!(session.locked_outpoints.is_empty());
        assert!(h.wallet.locked_coins().is_empty());
        assert_eq!(h.wallet.returned_count(), reserved);
        assert!(!h.transport.sent_tags().contains(&"dss".to_string()));
    }

    #[test]
    fn non_canonical_final_tx_refused() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);
        let denom_amount = COIN / 1_000 + 1;

        assert!(session.submit_denominate(&h.transport, now));

        let mut tx = final_tx_for(&session, denom_amount);
        // swap outputs out of canonical order; the re-sort changes the txid
        tx.output.reverse();

        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::FinalTx(FinalTx { session_id: SESSION_ID, tx }),
            now,
        );
        assert_eq!(session.state(), PoolState::Error);
        assert!(!h.transport.sent_tags().contains(&"dss".to_string()));
    }

    #[test]
    fn rejection_frees_resources() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);

        assert!(!session.locked_outpoints.is_empty());

        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &status_update(SESSION_ID, PoolState::Queue, PoolStatus::Rejected),
            now,
        );
        assert_eq!(session.state(), PoolState::Error);
        assert!(session.locked_outpoints.is_empty());
        assert!(h.wallet.locked_coins().is_empty());
    }

    #[test]
    fn messages_from_unbound_peers_ignored() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);

        let stranger: SocketAddr = "10.1.1.1:7777".parse().unwrap();
        session.process_message(
            &mgr,
            &h.transport,
            &stranger,
            &status_update(777, PoolState::Queue, PoolStatus::Rejected),
            now,
        );
        // nothing happened
        assert_eq!(session.state(), PoolState::Queue);
        assert_eq!(session.session_id(), SESSION_ID);
    }

    #[test]
    fn status_update_bounds_checked() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);

        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::Status(StatusUpdate {
                session_id: 999,
                state: 99,
                status: 1,
                message_id: 0,
            }),
            now,
        );
        // out-of-bounds state is dropped without touching the session
        assert_eq!(session.session_id(), SESSION_ID);
        assert_eq!(session.state(), PoolState::Queue);
    }

    #[test]
    fn queue_timeout_then_error_reset() {
        let h = Harness::new();
        let now = Instant::now();
        let mut session = queued_session(&h);

        // not yet: inside timeout plus grace
        let before = now + Duration::from_secs(QUEUE_TIMEOUT_SECS as u64 + LAG_GRACE_SECS - 1);
        assert!(!session.check_timeout(before));
        assert_eq!(session.state(), PoolState::Queue);

        // past the deadline the session parks in the error state
        let fired = now + Duration::from_secs(QUEUE_TIMEOUT_SECS as u64 + LAG_GRACE_SECS + 1);
        assert!(session.check_timeout(fired));
        assert_eq!(session.state(), PoolState::Error);
        assert!(session.locked_outpoints.is_empty());

        // and resets to idle after the cooldown
        let reset = fired + Duration::from_secs(ERROR_RESET_SECS);
        assert!(!session.check_timeout(reset));
        assert_eq!(session.state(), PoolState::Idle);
    }

    #[test]
    fn completion_failure_returns_destinations() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = queued_session(&h);

        assert!(session.submit_denominate(&h.transport, now));
        let reserved = h.wallet.reserved_count();

        session.process_message(
            &mgr,
            &h.transport,
            &h.node.addr,
            &ServerMessage::Complete(Complete {
                session_id: SESSION_ID,
                message_id: PoolMessage::InvalidTx as u32,
            }),
            now,
        );
        assert_eq!(session.state(), PoolState::Idle);
        assert_eq!(h.wallet.returned_count(), reserved);
        assert_eq!(h.wallet.kept_count(), 0);
        assert!(h.wallet.locked_coins().is_empty());
    }

    #[test]
    fn pending_open_expires_into_reset() {
        let h = Harness::new();
        let now = Instant::now();
        let mut session = queued_session_without_connection(&h, now);

        // connection never comes up; before the deadline nothing changes
        assert!(!session.process_pending_open(&h.transport, now));
        assert_eq!(session.state(), PoolState::Queue);

        let late = now + Duration::from_secs(PENDING_OPEN_TIMEOUT_SECS + 1);
        assert!(!session.process_pending_open(&h.transport, late));
        assert_eq!(session.state(), PoolState::Idle);
        assert!(session.locked_outpoints.is_empty());
        assert!(h.wallet.locked_coins().is_empty());
    }

    fn queued_session_without_connection(h: &Harness, now: Instant) -> Session {
        let mut session = Session::new(h.ctx.clone(), h.wallet.clone());
        let mgr = h.manager();
        assert!(session.do_auto_denominate(&mgr, &h.transport, &h.fee, &h.mempool, false, now));
        assert_eq!(session.state(), PoolState::Queue);
        session
    }

    #[test]
    fn dry_run_changes_nothing() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();
        let mut session = Session::new(h.ctx.clone(), h.wallet.clone());

        assert!(session.do_auto_denominate(&mgr, &h.transport, &h.fee, &h.mempool, true, now));
        assert_eq!(session.state(), PoolState::Idle);
        assert!(session.locked_outpoints.is_empty());
        assert!(h.wallet.locked_coins().is_empty());
        assert!(h.transport.sent_tags().is_empty());
    }

    #[test]
    fn nothing_to_do_when_target_reached() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();

        let mut bal = h.wallet.balance_config();
        bal.anonymized = (h.ctx.options.amount() + 1) * COIN;
        h.wallet.set_balance(bal);

        let mut session = Session::new(h.ctx.clone(), h.wallet.clone());
        assert!(!session.do_auto_denominate(&mgr, &h.transport, &h.fee, &h.mempool, false, now));
        assert_eq!(session.state(), PoolState::Idle);
    }

    #[test]
    fn reset_is_idempotent() {
        let h = Harness::new();
        let now = Instant::now();
        let mut session = queued_session(&h);
        assert!(session.submit_denominate(&h.transport, now));

        session.reset();
        let locked_after_first = h.wallet.locked_coins().len();
        let returned_after_first = h.wallet.returned_count();
        assert_eq!(session.state(), PoolState::Idle);
        assert!(session.collateral_tx.is_none());

        session.reset();
        assert_eq!(h.wallet.locked_coins().len(), locked_after_first);
        assert_eq!(h.wallet.returned_count(), returned_after_first);
        assert_eq!(session.state(), PoolState::Idle);
    }

    #[test]
    fn join_skips_offers_from_winner_nodes() {
        let h = Harness::new();
        let now = Instant::now();
        let mgr = h.manager();

        // make the only node an upcoming payment winner
        h.registry.set_winner(h.node.id);
        h.queue_offer_for_node(false);

        let mut session = Session::new(h.ctx.clone(), h.wallet.clone());
        // join fails, and the fallback start also skips the winner
        assert!(!session.do_auto_denominate(&mgr, &h.transport, &h.fee, &h.mempool, false, now));
        assert_eq!(session.state(), PoolState::Idle);
    }

    #[test]
    fn json_info_carries_node_and_denom() {
        let h = Harness::new();
        let session = queued_session(&h);

        let info = session.get_json_info();
        assert_eq!(info["state"], "QUEUE");
        assert_eq!(info["node_id"], h.node.id.to_string());
        assert_eq!(info["service"], h.node.addr.to_string());
        assert_ne!(info["denomination"], "N/A");
    }

    #[test]
    fn entry_size_randomization_uses_selected_inputs_only() {
        let h = Harness::new();
        let now = Instant::now();
        let mut session = queued_session(&h);

        assert!(session.submit_denominate(&h.transport, now));
        let entry = &session.entries[0];
        assert!(entry.inputs.len() <= crate::ENTRY_MAX_SIZE);
        let selected: Vec<_> = h.wallet.denom_inputs().iter().map(|i| i.outpoint).collect();
        for input in &entry.inputs {
            assert!(selected.contains(&input.outpoint));
        }
    }
}
