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

//! Protocol message types exchanged with mixer nodes, plus the pool state
//! and status enums they carry. The byte-level forms live in [`crate::codec`].

use bitcoin::consensus::Encodable;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Transaction, TxIn, TxOut};

use crate::denoms::Denom;
use crate::nodes::NodeId;
use crate::QUEUE_TIMEOUT_SECS;

/// Protocol state of a mixing pool as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Idle = 0,
    Queue = 1,
    AcceptingEntries = 2,
    Signing = 3,
    Error = 4,
}

impl PoolState {
    pub fn from_raw(raw: u32) -> Option<PoolState> {
        match raw {
            0 => Some(PoolState::Idle),
            1 => Some(PoolState::Queue),
            2 => Some(PoolState::AcceptingEntries),
            3 => Some(PoolState::Signing),
            4 => Some(PoolState::Error),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PoolState::Idle => "IDLE",
            PoolState::Queue => "QUEUE",
            PoolState::AcceptingEntries => "ACCEPTING_ENTRIES",
            PoolState::Signing => "SIGNING",
            PoolState::Error => "ERROR",
        }
    }
}

/// Accept/reject verdict inside a status update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Rejected = 0,
    Accepted = 1,
}

impl PoolStatus {
    pub fn from_raw(raw: u32) -> Option<PoolStatus> {
        match raw {
            0 => Some(PoolStatus::Rejected),
            1 => Some(PoolStatus::Accepted),
            _ => None,
        }
    }
}

/// Status codes attached to server messages. The numeric values are part of
/// the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMessage {
    AlreadyHave = 0,
    InvalidDenom = 1,
    EntriesFull = 2,
    ExistingTx = 3,
    FeesExceeded = 4,
    InvalidCollateral = 5,
    InvalidInput = 6,
    InvalidScript = 7,
    InvalidTx = 8,
    MaximumValue = 9,
    NodeList = 10,
    WrongMode = 11,
    QueueFull = 12,
    RecentlyMixed = 13,
    SessionMismatch = 14,
    MissingTx = 15,
    WrongVersion = 16,
    NoError = 17,
    Success = 18,
    EntriesAdded = 19,
    SizeMismatch = 20,
}

impl PoolMessage {
    pub fn from_raw(raw: u32) -> Option<PoolMessage> {
        use PoolMessage::*;
        Some(match raw {
            0 => AlreadyHave,
            1 => InvalidDenom,
            2 => EntriesFull,
            3 => ExistingTx,
            4 => FeesExceeded,
            5 => InvalidCollateral,
            6 => InvalidInput,
            7 => InvalidScript,
            8 => InvalidTx,
            9 => MaximumValue,
            10 => NodeList,
            11 => WrongMode,
            12 => QueueFull,
            13 => RecentlyMixed,
            14 => SessionMismatch,
            15 => MissingTx,
            16 => WrongVersion,
            17 => NoError,
            18 => Success,
            19 => EntriesAdded,
            20 => SizeMismatch,
            _ => return None,
        })
    }

    pub fn text(self) -> &'static str {
        use PoolMessage::*;
        match self {
            AlreadyHave => "Already have that input.",
            InvalidDenom => "No matching denominations found for mixing.",
            EntriesFull => "Entries are full.",
            ExistingTx => "Not compatible with existing transactions.",
            FeesExceeded => "Transaction fees are too high.",
            InvalidCollateral => "Collateral not valid.",
            InvalidInput => "Input is not valid.",
            InvalidScript => "Invalid script detected.",
            InvalidTx => "Transaction not valid.",
            MaximumValue => "Entry exceeds maximum size.",
            NodeList => "Not in the mixer node list.",
            WrongMode => "Incompatible mode.",
            QueueFull => "Queue is full.",
            RecentlyMixed => "Last queue was created too recently.",
            SessionMismatch => "Session not complete!",
            MissingTx => "Missing input transaction information.",
            WrongVersion => "Incompatible version.",
            NoError => "No errors detected.",
            Success => "Transaction created successfully.",
            EntriesAdded => "Your entries were added successfully.",
            SizeMismatch => "Inputs vs outputs size mismatch.",
        }
    }
}

/// A mixer-node advertisement of a new or ready mixing queue (`dsq`).
#[derive(Debug, Clone)]
pub struct QueueOffer {
    pub denom: Denom,
    /// Collateral outpoint registering the advertising node.
    pub node_collateral: OutPoint,
    /// Protocol registration hash of the advertising node.
    pub node_id: NodeId,
    /// True once the queue has enough participants and accepts entries.
    pub ready: bool,
    pub timestamp: i64,
    /// Operator signature over the canonical payload.
    pub signature: Vec<u8>,
    /// Local-only: set once a session has attempted this offer.
    pub tried: bool,
}

impl QueueOffer {
    /// The canonical byte string covered by the operator signature:
    /// `denom ‖ node_collateral ‖ node_id ‖ timestamp ‖ ready`.
    pub fn signing_payload(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(81);
        let _ = self.denom.to_bits().consensus_encode(&mut payload);
        let _ = self.node_collateral.consensus_encode(&mut payload);
        let _ = self.node_id.consensus_encode(&mut payload);
        let _ = self.timestamp.consensus_encode(&mut payload);
        let _ = self.ready.consensus_encode(&mut payload);
        payload
    }

    /// Whether the offer timestamp lies outside the acceptance window.
    pub fn is_time_out_of_bounds(&self, now: i64) -> bool {
        (now - self.timestamp).abs() >= QUEUE_TIMEOUT_SECS
    }

    /// Whether the node identity fields are both unset.
    pub fn is_anonymous(&self) -> bool {
        self.node_collateral.is_null() && self.node_id == NodeId::all_zeros()
    }
}

// Offers are considered identical regardless of who relayed them and
// whether a local session tried them already.
impl PartialEq for QueueOffer {
    fn eq(&self, other: &Self) -> bool {
        self.denom == other.denom
            && self.node_collateral == other.node_collateral
            && self.timestamp == other.timestamp
            && self.ready == other.ready
    }
}

impl Eq for QueueOffer {}

impl std::fmt::Display for QueueOffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.node_id.to_string();
        write!(
            f,
            "denom={}, node={}, ready={}, time={}, tried={}",
            self.denom,
            &node[..node.len().min(16)],
            self.ready,
            self.timestamp,
            self.tried
        )
    }
}

/// Request to join a node's queue (`dsa`): the chosen denomination plus a
/// signed collateral spend the node may broadcast if we misbehave.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub denom: Denom,
    pub collateral_tx: Transaction,
}

/// A client's partial contribution to the joint transaction (`dsi`).
#[derive(Debug, Clone)]
pub struct Entry {
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub collateral: Transaction,
}

/// Server progress report (`dssu`). Fields arrive raw and are bounds-checked
/// at the point of use.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub session_id: u32,
    pub state: u32,
    pub status: u32,
    pub message_id: u32,
}

impl StatusUpdate {
    pub fn pool_state(&self) -> Option<PoolState> {
        PoolState::from_raw(self.state)
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        PoolStatus::from_raw(self.status)
    }

    pub fn pool_message(&self) -> Option<PoolMessage> {
        PoolMessage::from_raw(self.message_id)
    }
}

/// The final joint transaction to verify and cosign (`dsf`).
#[derive(Debug, Clone)]
pub struct FinalTx {
    pub session_id: u32,
    pub tx: Transaction,
}

/// Our signed inputs shipped back to the node (`dss`).
#[derive(Debug, Clone)]
pub struct SignedInputs {
    pub inputs: Vec<TxIn>,
}

/// Mix completion notice (`dsc`).
#[derive(Debug, Clone)]
pub struct Complete {
    pub session_id: u32,
    pub message_id: u32,
}

/// Messages a mixer node (or the gossip network) sends to us.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    Offer(QueueOffer),
    Status(StatusUpdate),
    FinalTx(FinalTx),
    Complete(Complete),
}

impl ServerMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ServerMessage::Offer(_) => "dsq",
            ServerMessage::Status(_) => "dssu",
            ServerMessage::FinalTx(_) => "dsf",
            ServerMessage::Complete(_) => "dsc",
        }
    }
}

/// Messages we send to a mixer node.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Join(JoinRequest),
    Entry(Entry),
    Signatures(SignedInputs),
}

impl ClientMessage {
    pub fn tag(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "dsa",
            ClientMessage::Entry(_) => "dsi",
            ClientMessage::Signatures(_) => "dss",
        }
    }
}
