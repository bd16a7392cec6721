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

//! The denomination planner prepares a wallet for mixing: it splits
//! non-denominated funds into standard denomination outputs, maintains a
//! small stockpile of collateral-sized outputs, and turns selected
//! denominated coins into a partial mixing entry.

use bitcoin::{OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use rand::Rng;

use crate::denoms::{
    self, is_collateral_amount, is_denominated_amount, Denom, COLLATERAL_AMOUNT,
    MAX_COLLATERAL_AMOUNT, STANDARD_DENOMINATIONS,
};
use crate::util::fee;
use crate::{
    DenomInput, FeeEstimator, Mempool, Options, TallyItem, Wallet, WalletError,
    DENOM_OUTPUTS_THRESHOLD, ENTRY_MAX_SIZE,
};

/// Upper bound on inputs consumed by one planner transaction. Keeps the
/// transaction comfortably under the standardness size limit.
const MAX_PLANNER_INPUTS: usize = 400;

#[derive(Debug)]
pub enum Error {
    /// No collateral-sized coin is available to spend.
    NoCollateralInputs,
    /// The wallet keypool ran dry while reserving destinations.
    KeypoolExhausted,
    /// No inputs survived round filtering for the requested entry.
    CannotPrepare,
    /// The session denomination code is malformed.
    InvalidDenom,
    Signing(WalletError),
    Commit(WalletError),
}

/// Holds destinations reserved from the wallet keypool until the engine
/// knows whether the transaction they were reserved for went through.
#[derive(Debug, Default)]
pub struct KeyHolderStorage {
    keys: Vec<u64>,
}

impl KeyHolderStorage {
    /// Reserves a fresh destination and remembers it.
    pub fn add_key(&mut self, wallet: &dyn Wallet) -> Option<Script> {
        let dest = wallet.reserve_destination()?;
        self.keys.push(dest.key);
        Some(dest.script)
    }

    /// Marks every held destination as spent for good.
    pub fn keep_all(&mut self, wallet: &dyn Wallet) {
        let n = self.keys.len();
        for key in self.keys.drain(..) {
            wallet.keep_destination(key);
        }
        if n > 0 {
            log::debug!("{}: kept {} reserved destinations", wallet.name(), n);
        }
    }

    /// Returns every held destination to the keypool.
    pub fn return_all(&mut self, wallet: &dyn Wallet) {
        let n = self.keys.len();
        for key in self.keys.drain(..) {
            wallet.return_destination(key);
        }
        if n > 0 {
            log::debug!("{}: returned {} reserved destinations", wallet.name(), n);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Incrementally builds a planner transaction that spends one address group
/// in full. Output amounts are collected first; destinations are reserved
/// and the transaction committed in one step at the end. Fee accounting
/// always includes the change output the wallet adds on commit.
pub struct TxBuilder<'a> {
    wallet: &'a dyn Wallet,
    tally: &'a TallyItem,
    feerate: u64,
    outputs: Vec<u64>,
}

impl<'a> TxBuilder<'a> {
    pub fn new(wallet: &'a dyn Wallet, tally: &'a TallyItem, fee_estimator: &dyn FeeEstimator) -> Self {
        Self { wallet, tally, feerate: fee_estimator.feerate_per_kb(), outputs: Vec::new() }
    }

    fn fee_with(&self, n_outputs: usize) -> u64 {
        // one extra output slot for change
        fee::fee_for(self.feerate, fee::estimate_tx_size(self.tally.inputs.len(), n_outputs + 1))
    }

    fn used(&self) -> u64 {
        self.outputs.iter().sum()
    }

    /// Value still unassigned after all current outputs and fees.
    pub fn amount_left(&self) -> u64 {
        self.tally.amount.saturating_sub(self.used() + self.fee_with(self.outputs.len()))
    }

    pub fn could_add_output(&self, amount: u64) -> bool {
        self.could_add_outputs(&[amount])
    }

    pub fn could_add_outputs(&self, amounts: &[u64]) -> bool {
        let extra: u64 = amounts.iter().sum();
        self.tally.amount >= self.used() + extra + self.fee_with(self.outputs.len() + amounts.len())
    }

    /// Appends an output of `amount` (possibly 0 as a placeholder to be
    /// sized later). Returns its index, or `None` if it does not fit.
    pub fn add_output(&mut self, amount: u64) -> Option<usize> {
        if !self.could_add_output(amount) {
            return None;
        }
        self.outputs.push(amount);
        Some(self.outputs.len() - 1)
    }

    /// Resizes a previously added output.
    pub fn update_amount(&mut self, index: usize, amount: u64) -> bool {
        let old = match self.outputs.get(index) {
            Some(old) => *old,
            None => return false,
        };
        let others = self.used() - old;
        if self.tally.amount < others + amount + self.fee_with(self.outputs.len()) {
            return false;
        }
        self.outputs[index] = amount;
        true
    }

    pub fn count_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Reserves a destination per output, then hands the transaction to the
    /// wallet for signing and broadcast. Destinations are kept on success
    /// and returned on failure.
    pub fn commit(self) -> Result<Txid, Error> {
        debug_assert!(self.outputs.iter().all(|amount| *amount > 0));

        let mut keys = KeyHolderStorage::default();
        let mut outs = Vec::with_capacity(self.outputs.len());
        for amount in &self.outputs {
            match keys.add_key(self.wallet) {
                Some(script) => outs.push(TxOut { value: *amount, script_pubkey: script }),
                None => {
                    keys.return_all(self.wallet);
                    return Err(Error::KeypoolExhausted);
                }
            }
        }

        match self.wallet.commit_transaction(&self.tally.inputs, &outs) {
            Ok(txid) => {
                keys.keep_all(self.wallet);
                Ok(txid)
            }
            Err(e) => {
                keys.return_all(self.wallet);
                Err(Error::Commit(e))
            }
        }
    }
}

impl std::fmt::Display for TxBuilder<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TxBuilder(inputs: {}, initial: {}, outputs: {}, left: {})",
            self.tally.inputs.len(),
            denoms::format_amount(self.tally.amount),
            self.outputs.len(),
            denoms::format_amount(self.amount_left()),
        )
    }
}

/// Creates collateral-sized outputs by breaking up address groups, smallest
/// balances first. Non-denominated funds are preferred; denominated coins
/// are only broken when nothing else is left.
pub fn make_collateral_amounts(wallet: &dyn Wallet, fee_estimator: &dyn FeeEstimator) -> bool {
    let mut tally = wallet.select_coins_grouped_by_addresses(false, false, true, MAX_PLANNER_INPUTS);
    if tally.is_empty() {
        log::debug!("{}: make_collateral_amounts -- no inputs to work with", wallet.name());
        return false;
    }

    // smallest first to consume tiny amounts and clean up the UTXO set a bit
    tally.sort_by_key(|item| item.amount);

    for item in &tally {
        if make_collateral_from_tally(wallet, fee_estimator, item, false) {
            return true;
        }
    }

    // nothing non-denominated worked, break denominated funds as a last resort
    for item in &tally {
        if make_collateral_from_tally(wallet, fee_estimator, item, true) {
            return true;
        }
    }

    log::warn!("{}: make_collateral_amounts -- failed, no group fits", wallet.name());
    false
}

fn make_collateral_from_tally(
    wallet: &dyn Wallet,
    fee_estimator: &dyn FeeEstimator,
    item: &TallyItem,
    try_denominated: bool,
) -> bool {
    // a denominated input is always a single one, check its amount directly
    if !try_denominated && item.inputs.len() == 1 && is_denominated_amount(item.amount) {
        return false;
    }

    // skip single inputs that can be used as collateral already
    if item.inputs.len() == 1 && is_collateral_amount(item.amount) {
        return false;
    }

    let mut builder = TxBuilder::new(wallet, item, fee_estimator);

    // skip amounts too tiny to fit even one collateral output
    if !builder.could_add_output(COLLATERAL_AMOUNT) {
        return false;
    }

    let case;
    if builder.could_add_outputs(&[MAX_COLLATERAL_AMOUNT, COLLATERAL_AMOUNT]) {
        case = 1;
        builder.add_output(MAX_COLLATERAL_AMOUNT);
        let idx = match builder.add_output(0) {
            Some(idx) => idx,
            None => return false,
        };
        let left = builder.amount_left();
        // never leave an accidental denomination behind
        let amount = if is_denominated_amount(left) { left - 1 } else { left };
        builder.update_amount(idx, amount);
    } else if builder.could_add_outputs(&[COLLATERAL_AMOUNT, COLLATERAL_AMOUNT]) {
        case = 2;
        let (first, second) = match (builder.add_output(0), builder.add_output(0)) {
            (Some(first), Some(second)) => (first, second),
            _ => return false,
        };
        // split in half, the odd unit goes to fees
        let half = builder.amount_left() / 2;
        debug_assert!(is_collateral_amount(half));
        builder.update_amount(first, half);
        builder.update_amount(second, half);
    } else {
        case = 3;
        let idx = match builder.add_output(0) {
            Some(idx) => idx,
            None => return false,
        };
        let left = builder.amount_left();
        debug_assert!(is_collateral_amount(left));
        builder.update_amount(idx, left);
    }

    log::debug!("{}: make_collateral_amounts -- case {}: {}", wallet.name(), case, builder);

    match builder.commit() {
        Ok(txid) => {
            log::info!("{}: make_collateral_amounts -- txid: {}", wallet.name(), txid);
            true
        }
        Err(e) => {
            log::warn!("{}: make_collateral_amounts -- commit failed: {:?}", wallet.name(), e);
            false
        }
    }
}

/// Populates the wallet with standard denomination outputs, up to the
/// configured goal per denomination and never past the hard cap (except for
/// the largest denomination).
pub fn create_denominated(
    wallet: &dyn Wallet,
    fee_estimator: &dyn FeeEstimator,
    options: &Options,
    balance_to_denominate: i64,
) -> bool {
    let mut tally = wallet.select_coins_grouped_by_addresses(true, true, true, MAX_PLANNER_INPUTS);
    if tally.is_empty() {
        log::debug!("{}: create_denominated -- no inputs to work with", wallet.name());
        return false;
    }

    // largest first so transactions with the biggest denoms come out early
    tally.sort_by(|a, b| b.amount.cmp(&a.amount));

    let create_collaterals = !wallet.has_collateral_inputs(true);

    for item in &tally {
        if create_denominated_from_tally(
            wallet,
            fee_estimator,
            options,
            balance_to_denominate,
            item,
            create_collaterals,
        ) {
            return true;
        }
    }

    log::debug!("{}: create_denominated -- failed", wallet.name());
    false
}

fn create_denominated_from_tally(
    wallet: &dyn Wallet,
    fee_estimator: &dyn FeeEstimator,
    options: &Options,
    balance_to_denominate: i64,
    item: &TallyItem,
    create_collaterals: bool,
) -> bool {
    // a denominated input is always a single one, nothing to split here
    if item.inputs.len() == 1 && is_denominated_amount(item.amount) {
        return false;
    }

    let mut builder = TxBuilder::new(wallet, item, fee_estimator);
    log::debug!("{}: create_denominated -- start {}", wallet.name(), builder);

    // replenish the collateral stockpile within the same transaction
    if create_collaterals && builder.add_output(MAX_COLLATERAL_AMOUNT).is_none() {
        log::debug!("{}: create_denominated -- failed to add collateral output", wallet.name());
        return false;
    }

    let goal = options.denoms_goal();
    let hard_cap = options.denoms_hard_cap();
    let smallest = denoms::smallest_denomination();
    let largest = STANDARD_DENOMINATIONS[0];

    let mut counts: Vec<(u64, usize)> = STANDARD_DENOMINATIONS
        .iter()
        .map(|denom| (*denom, wallet.count_inputs_with_amount(*denom)))
        .collect();

    let mut balance = balance_to_denominate;
    let mut add_final = true;

    // Phase 1: round-robin over the denominations, largest first, filling
    // each towards the goal a few outputs at a time.
    while builder.could_add_output(smallest) && builder.count_outputs() < DENOM_OUTPUTS_THRESHOLD {
        for entry in counts.iter_mut() {
            let (denom_value, count) = (entry.0, &mut entry.1);
            let mut outputs_this_pass = 0;

            loop {
                let fits = builder.could_add_output(denom_value);
                let final_output = fits && add_final && balance > 0 && balance < denom_value as i64;
                let need_more = final_output || (fits && balance >= denom_value as i64);
                if !need_more || outputs_this_pass > 10 || *count >= goal {
                    break;
                }
                if final_output {
                    // the one overshoot output that consumes the tail
                    add_final = false;
                    log::debug!(
                        "{}: create_denominated -- final output, denom: {}, balance: {}",
                        wallet.name(),
                        denoms::format_amount(denom_value),
                        balance,
                    );
                }
                if builder.add_output(denom_value).is_none() {
                    log::warn!("{}: create_denominated -- add_output failed, {}", wallet.name(), builder);
                    return false;
                }
                outputs_this_pass += 1;
                *count += 1;
                balance -= denom_value as i64;
            }

            if builder.amount_left() == 0 || balance <= 0 {
                break;
            }
        }

        let finished = counts
            .iter()
            .all(|(denom, count)| !(*count < goal && builder.could_add_output(*denom) && balance > 0));
        if finished {
            break;
        }
    }

    // Phase 2: absorb the remainder, largest first, preferring to overshoot
    // with one extra large output over many small ones.
    if builder.could_add_output(smallest)
        && balance >= smallest as i64
        && builder.count_outputs() < DENOM_OUTPUTS_THRESHOLD
    {
        log::debug!("{}: create_denominated -- absorbing remainder: {}", wallet.name(), builder);

        for entry in counts.iter_mut() {
            if balance <= 0 {
                break;
            }
            let (denom_value, count) = (entry.0, &mut entry.1);

            // how many outputs of this denom still fit by value
            let fit_by_value = {
                let mut amounts = Vec::new();
                loop {
                    amounts.push(denom_value);
                    if !builder.could_add_outputs(&amounts)
                        || builder.count_outputs() + amounts.len() > DENOM_OUTPUTS_THRESHOLD
                    {
                        amounts.pop();
                        break;
                    }
                }
                amounts.len()
            };
            // `+ 1` so the target is reachable even when the tail is smaller
            // than this denom
            let fit_by_balance = (balance as u64 / denom_value + 1) as usize;
            let to_create = fit_by_value.min(fit_by_balance);

            for _ in 0..to_create {
                // never go above the cap unless it's the largest denom
                if denom_value != largest && *count >= hard_cap {
                    break;
                }
                if builder.add_output(denom_value).is_none() {
                    break;
                }
                *count += 1;
                balance -= denom_value as i64;
                if builder.count_outputs() >= DENOM_OUTPUTS_THRESHOLD {
                    break;
                }
            }
            if builder.count_outputs() >= DENOM_OUTPUTS_THRESHOLD {
                break;
            }
        }
    }

    // no reason to create a lone collateral if no denoms came out of this
    let only_collateral = create_collaterals && builder.count_outputs() == 1;
    if only_collateral || builder.count_outputs() == 0 {
        return false;
    }

    log::debug!("{}: create_denominated -- done: {}", wallet.name(), builder);

    match builder.commit() {
        Ok(txid) => {
            log::info!("{}: create_denominated -- txid: {}", wallet.name(), txid);
            true
        }
        Err(e) => {
            log::warn!("{}: create_denominated -- commit failed: {:?}", wallet.name(), e);
            false
        }
    }
}

/// Builds and signs a collateral spend: one collateral-sized input whose
/// missing value pays the penalty fee if the node ever broadcasts it.
pub fn create_collateral_transaction(wallet: &dyn Wallet) -> Result<Transaction, Error> {
    let coins = wallet.collateral_coins();
    if coins.is_empty() {
        return Err(Error::NoCollateralInputs);
    }
    let coin = &coins[rand::thread_rng().gen_range(0..coins.len())];

    let mut tx = Transaction {
        version: 2,
        lock_time: PackedLockTime::ZERO,
        input: vec![TxIn {
            previous_output: coin.outpoint,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::default(),
        }],
        output: Vec::new(),
    };

    if coin.txout.value >= COLLATERAL_AMOUNT * 2 {
        // pay the collateral charge in fees and return the rest
        let dest = wallet.reserve_destination().ok_or(Error::KeypoolExhausted)?;
        wallet.keep_destination(dest.key);
        tx.output.push(TxOut {
            value: coin.txout.value - COLLATERAL_AMOUNT,
            script_pubkey: dest.script,
        });
    } else {
        // burn everything into a data output
        tx.output.push(TxOut { value: 0, script_pubkey: Script::new_op_return(&[]) });
    }

    wallet.sign_collateral(&mut tx).map_err(Error::Signing)?;

    Ok(tx)
}

/// Whether a collateral draft is still spendable.
pub fn is_collateral_valid(tx: &Transaction, mempool: &dyn Mempool) -> bool {
    if tx.input.is_empty() || tx.output.is_empty() {
        return false;
    }
    mempool.accepts(tx)
}

/// Turns pre-selected denominated coins into `(input, fresh output)` pairs
/// for a mixing entry, filtering by mixing depth and randomizing the entry
/// size. In dry-run mode nothing is reserved or locked and the output
/// scripts stay empty.
pub fn prepare_denominate(
    wallet: &dyn Wallet,
    key_holder: &mut KeyHolderStorage,
    locked: &mut Vec<OutPoint>,
    denom: Denom,
    inputs: &[DenomInput],
    min_rounds: i32,
    max_rounds: i32,
    dry_run: bool,
) -> Result<Vec<(DenomInput, TxOut)>, Error> {
    let denom_amount = denom.amount().ok_or(Error::InvalidDenom)?;

    // inputs arrive pre-shuffled from the wallet, no need to randomize order
    let mut steps = 0usize;
    let mut pairs = Vec::new();

    for input in inputs {
        if steps >= ENTRY_MAX_SIZE {
            break;
        }
        if input.rounds < min_rounds || input.rounds > max_rounds {
            continue;
        }

        let script = if dry_run {
            Script::new()
        } else {
            // randomly skip some inputs, still counting the skip as a step,
            // so entry sizes differ between participants
            if steps >= 1 && rand::thread_rng().gen_range(0..5) == 0 {
                steps += 1;
                continue;
            }
            match key_holder.add_key(wallet) {
                Some(script) => script,
                None => {
                    key_holder.return_all(wallet);
                    return Err(Error::KeypoolExhausted);
                }
            }
        };

        pairs.push((input.clone(), TxOut { value: denom_amount, script_pubkey: script }));
        steps += 1;
    }

    if pairs.is_empty() {
        key_holder.return_all(wallet);
        return Err(Error::CannotPrepare);
    }

    if dry_run {
        return Ok(pairs);
    }

    for (input, _) in &pairs {
        wallet.lock_coin(&input.outpoint);
        locked.push(input.outpoint);
    }

    Ok(pairs)
}
