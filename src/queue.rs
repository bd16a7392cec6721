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

//! Ingestion point for gossiped queue offers.
//!
//! One queue manager exists per process and is shared by every wallet's
//! manager. Incoming offers are deduplicated, rate-limited, checked against
//! the valid-node list and the operator signature, and either routed to a
//! waiting session (ready offers) or parked for `join_existing_queue` to
//! consume.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::manager::Client;
use crate::messages::QueueOffer;
use crate::nodes::{NodeId, NodeRegistry};
use crate::{ChainSync, Context, PeerId, Transport};

use bitcoin::hashes::Hash;

pub struct QueueManager {
    ctx: Arc<Context>,
    /// Serializes whole-message processing. Held across the session probe,
    /// taken before the queue list lock and never after it.
    process_lock: Mutex<()>,
    queue: Mutex<Vec<QueueOffer>>,
}

impl QueueManager {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self { ctx, process_lock: Mutex::new(()), queue: Mutex::new(Vec::new()) }
    }

    fn queue_lock(&self) -> MutexGuard<'_, Vec<QueueOffer>> {
        self.queue.lock().expect("queue list lock")
    }

    pub fn queue_len(&self) -> usize {
        self.queue_lock().len()
    }

    /// Validates and admits one gossiped offer.
    pub fn process_offer(
        &self,
        peer: PeerId,
        mut offer: QueueOffer,
        client: &Client,
        transport: &dyn Transport,
        now: i64,
    ) {
        if !self.ctx.sync.is_synced() {
            return;
        }

        if offer.is_anonymous() {
            transport.misbehaving(peer, 100);
            return;
        }

        // resolve a bare registration hash to its collateral outpoint
        if offer.node_collateral.is_null() {
            match self.ctx.registry.by_id(&offer.node_id) {
                Some(node) => offer.node_collateral = node.collateral,
                None => {
                    transport.misbehaving(peer, 10);
                    return;
                }
            }
        }

        let _processing = self.process_lock.lock().expect("queue processing lock");

        {
            let queue = self.queue_lock();
            for existing in queue.iter() {
                // process every offer only once
                if *existing == offer {
                    return;
                }
                if existing.ready == offer.ready
                    && existing.node_collateral == offer.node_collateral
                {
                    // no way the same node legitimately advertises again
                    // with the same readiness this soon
                    log::debug!(
                        "dsq -- peer {} relays way too many offers for node collateral {}",
                        peer,
                        offer.node_collateral
                    );
                    transport.misbehaving(peer, 10);
                    return;
                }
            }
        }

        log::debug!("dsq -- new offer: {}", offer);

        if offer.is_time_out_of_bounds(now) {
            return;
        }

        let node = match self.ctx.registry.by_collateral(&offer.node_collateral) {
            Some(node) => node,
            None => return,
        };

        if offer.node_id == NodeId::all_zeros() {
            offer.node_id = node.id;
        }

        if !self
            .ctx
            .registry
            .verify_operator_sig(&node, &offer.signing_payload(), &offer.signature)
        {
            transport.misbehaving(peer, 10);
            return;
        }

        // a ready queue goes straight to the session waiting on it
        if offer.ready && client.try_submit_denominate(&node.addr, transport) {
            log::debug!("dsq -- queue ready on node {}", node.addr);
            return;
        }

        // don't allow a few nodes to dominate the queuing process
        let meta = &self.ctx.node_meta;
        let last_dsq = meta.last_dsq(&node.id);
        let threshold = meta.dsq_threshold(&node.id, self.ctx.registry.valid_count());
        if last_dsq != 0 && threshold > meta.dsq_count() {
            log::debug!(
                "dsq -- node {} advertises too often (last {}, threshold {}, count {})",
                node.id,
                last_dsq,
                threshold,
                meta.dsq_count()
            );
            return;
        }
        meta.allow_mixing(&node.id);

        log::debug!("dsq -- new queue on node {}", node.addr);

        // don't let join_existing_queue pick a node we already sit on
        client.mark_already_joined_queue_as_tried(&mut offer);

        self.queue_lock().push(offer.clone());
        drop(_processing);

        transport.relay_offer(&offer);
    }

    /// Pops the first un-tried offer in arrival order, marking it tried.
    /// Aged offers encountered on the way are discarded.
    pub fn get_and_try(&self, now: i64) -> Option<QueueOffer> {
        let mut queue = self.queue_lock();
        queue.retain(|offer| {
            let aged = offer.is_time_out_of_bounds(now);
            if aged {
                log::debug!("dsq -- removing aged offer: {}", offer);
            }
            !aged
        });
        let pos = queue.iter().position(|offer| !offer.tried)?;
        let mut offer = queue.remove(pos);
        offer.tried = true;
        Some(offer)
    }

    /// Drops aged offers. Runs once per maintenance tick.
    pub fn check_queue(&self, now: i64) {
        let mut queue = self.queue_lock();
        let before = queue.len();
        queue.retain(|offer| !offer.is_time_out_of_bounds(now));
        if queue.len() != before {
            log::debug!("dsq -- expired {} offers", before - queue.len());
        }
    }
}
