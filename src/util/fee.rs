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

const P2PKH_IN_SIZE: usize = 148;
const P2PKH_OUT_SIZE: usize = 34;

/// Feerate applied when the estimator has no data yet.
pub const FALLBACK_FEERATE_PER_KB: u64 = 1_000;

/// Estimates the size in bytes of a planner transaction with the given
/// input and output counts. All planner outputs pay to P2PKH scripts.
pub fn estimate_tx_size(n_inputs: usize, n_outputs: usize) -> usize {
    4 // nVersion
        + sizeof_varint(n_inputs)
        + n_inputs * P2PKH_IN_SIZE
        + sizeof_varint(n_outputs)
        + n_outputs * P2PKH_OUT_SIZE
        + 4 // nLockTime
}

/// Fee in base units for a transaction of `size` bytes at `rate_per_kb`,
/// rounded up and never below one unit per started kilobyte.
pub fn fee_for(rate_per_kb: u64, size: usize) -> u64 {
    let rate = rate_per_kb.max(FALLBACK_FEERATE_PER_KB);
    (rate * size as u64 + 999) / 1_000
}

fn sizeof_varint(int: usize) -> usize {
    match int {
        0..=252 => 1,
        253..=65534 => 3,
        65535..=4294967294 => 5,
        _ => 9,
    }
}
