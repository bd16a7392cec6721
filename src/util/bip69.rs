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

//! BIP69-style canonical transaction ordering. Joint transactions are only
//! accepted in this ordering so that no party controls the input/output
//! permutation.

use std::cmp::Ordering;

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Transaction, TxIn, TxOut};

/// Orders outpoints by txid (big-endian byte order) and then output index.
pub struct ComparableOutpoint<'a>(pub &'a OutPoint);

impl Ord for ComparableOutpoint<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        // txids display and sort in reverse of their in-memory byte order
        let own = self.0.txid.into_inner();
        let their = other.0.txid.into_inner();
        own.iter()
            .rev()
            .cmp(their.iter().rev())
            .then(self.0.vout.cmp(&other.0.vout))
    }
}

impl PartialOrd for ComparableOutpoint<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ComparableOutpoint<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for ComparableOutpoint<'_> {}

/// Orders outputs by amount and then script bytes.
pub struct ComparableTxOut<'a>(pub &'a TxOut);

impl Ord for ComparableTxOut<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .value
            .cmp(&other.0.value)
            .then_with(|| self.0.script_pubkey.as_bytes().cmp(other.0.script_pubkey.as_bytes()))
    }
}

impl PartialOrd for ComparableTxOut<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ComparableTxOut<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0.value == other.0.value && self.0.script_pubkey == other.0.script_pubkey
    }
}

impl Eq for ComparableTxOut<'_> {}

/// Sorts the inputs and outputs of `tx` into canonical order in place.
pub fn sort_transaction(tx: &mut Transaction) {
    tx.input.sort_by(|a: &TxIn, b: &TxIn| {
        ComparableOutpoint(&a.previous_output).cmp(&ComparableOutpoint(&b.previous_output))
    });
    tx.output
        .sort_by(|a, b| ComparableTxOut(a).cmp(&ComparableTxOut(b)));
}
