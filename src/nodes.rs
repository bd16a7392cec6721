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

//! Mixer-node views and per-node protocol metadata.
//!
//! The authoritative "valid node list at tip" lives with the embedding
//! application behind [`NodeRegistry`]; this module only holds the immutable
//! per-tip view of a node and the mutable rate-limit bookkeeping shared by
//! the queue manager and the sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use bitcoin::{Network, OutPoint, Txid};

/// Protocol registration hash identifying a mixer node.
pub type NodeId = Txid;

/// Immutable view of a mixer node within one chain tip.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NodeId,
    /// Outpoint of the registration collateral; unique per node.
    pub collateral: OutPoint,
    pub addr: SocketAddr,
    /// Operator public key in its registry encoding. Opaque to this crate;
    /// signature checks go through [`NodeRegistry::verify_operator_sig`].
    pub operator_key: Vec<u8>,
    /// Height at which the node last received a protocol payment.
    pub last_paid_height: u32,
}

/// The valid-node list at the current chain tip.
pub trait NodeRegistry: Send + Sync {
    fn valid_nodes(&self) -> Vec<Arc<NodeEntry>>;

    fn valid_count(&self) -> usize;

    /// Valid node count weighted by registration level. Used for the
    /// payment-winners window.
    fn weighted_count(&self) -> usize;

    fn by_collateral(&self, outpoint: &OutPoint) -> Option<Arc<NodeEntry>>;

    fn by_id(&self, id: &NodeId) -> Option<Arc<NodeEntry>>;

    /// Height of the tip this list was built at.
    fn height(&self) -> u32;

    /// Verifies an operator signature over `payload` for the given node.
    fn verify_operator_sig(&self, node: &NodeEntry, payload: &[u8], signature: &[u8]) -> bool;
}

/// Nodes about to receive a protocol payment are not available for mixing:
/// they are expected to be busy producing blocks shortly.
pub fn winners_to_skip(network: Network) -> u32 {
    match network {
        Network::Regtest | Network::Signet => 1,
        _ => 8,
    }
}

/// Whether `node` falls into the next-payment-winners window at `height`.
pub fn is_next_winner(node: &NodeEntry, weighted_count: usize, height: u32, network: Network) -> bool {
    (node.last_paid_height as u64 + weighted_count as u64)
        < height as u64 + winners_to_skip(network) as u64
}

/// Mutable per-node mixing metadata: the global offer counter and each
/// node's position in it. Shared between the queue manager and all sessions.
#[derive(Debug, Default)]
pub struct NodeMetaStore {
    dsq_counter: AtomicI64,
    last_dsq: Mutex<HashMap<NodeId, i64>>,
}

impl NodeMetaStore {
    /// Value of the global monotonic offer counter.
    pub fn dsq_count(&self) -> i64 {
        self.dsq_counter.load(Ordering::Relaxed)
    }

    /// The counter value at which `node` last advertised, 0 if never.
    pub fn last_dsq(&self, node: &NodeId) -> i64 {
        self.last_dsq
            .lock()
            .expect("node meta lock")
            .get(node)
            .copied()
            .unwrap_or(0)
    }

    /// The counter value the node must wait for before advertising again.
    /// Keeps a small set of nodes from dominating the queuing process.
    pub fn dsq_threshold(&self, node: &NodeId, valid_count: usize) -> i64 {
        self.last_dsq(node) + valid_count as i64 / 5
    }

    /// Records that `node` is now advertising: bumps the global counter and
    /// pins the node to it.
    pub fn allow_mixing(&self, node: &NodeId) {
        let count = self.dsq_counter.fetch_add(1, Ordering::Relaxed) + 1;
        self.last_dsq
            .lock()
            .expect("node meta lock")
            .insert(*node, count);
    }
}
