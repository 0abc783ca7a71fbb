//! Transaction projection: turning raw transactions into wallet-relative
//! output, spend, and payment records.
//!
//! The projector owns no storage. It matches a transaction against the
//! interest indexes of the current batch, appends records to the batch
//! buffers, and keeps the address lookahead topped up as receipts land.

use hdsync_chain::{DestinationReader, ScriptDeriver};
use hdsync_types::{AddressType, BlockHeader, HashHeight, OutPoint, Script, Transaction, Txid};

use crate::account::{AddressIdentifier, TopUpTracker};
use crate::interest::{AddressLookup, OutpointLookup};
use crate::schema::AddressRow;

/// One tracked output discovered during projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub address: AddressIdentifier,
    pub script_pub_key: Script,
    /// `None` while the transaction is unconfirmed.
    pub block: Option<HashHeight>,
    pub txid: Txid,
    pub output_index: u32,
    pub value: i64,
    pub is_coinbase: bool,
    pub creation_time: i64,
}

/// One spend of a tracked output discovered during projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRecord {
    pub address: AddressIdentifier,
    pub spent_outpoint: OutPoint,
    pub block: Option<HashHeight>,
    pub spend_txid: Txid,
    pub is_coinstake: bool,
    pub spend_time: i64,
    pub total_out: i64,
}

/// One destination of a transaction that spends tracked outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub spend_txid: Txid,
    pub output_index: u32,
    pub dest_script: Script,
    pub value: i64,
    pub is_change: bool,
}

/// Mutable per-batch projection state: interest indexes, lookahead tracker,
/// and the record buffers drained at flush time.
pub struct ProjectionState {
    pub addresses: AddressLookup,
    pub outpoints: OutpointLookup,
    pub tracker: TopUpTracker,
    pub outputs: Vec<OutputRecord>,
    pub spends: Vec<SpendRecord>,
    pub payments: Vec<PaymentRecord>,
    /// Addresses derived by top-up during this batch, persisted before the
    /// records that reference them.
    pub new_addresses: Vec<AddressRow>,
    payment_txids: std::collections::HashSet<Txid>,
}

impl ProjectionState {
    pub fn new(tracker: TopUpTracker) -> Self {
        ProjectionState {
            addresses: AddressLookup::new(),
            outpoints: OutpointLookup::new(),
            tracker,
            outputs: Vec::new(),
            spends: Vec::new(),
            payments: Vec::new(),
            new_addresses: Vec::new(),
            payment_txids: std::collections::HashSet::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.outputs.len() + self.spends.len()
    }

    pub fn clear_buffers(&mut self) {
        self.outputs.clear();
        self.spends.clear();
        self.payments.clear();
        self.new_addresses.clear();
        self.payment_txids.clear();
    }
}

pub struct TxProjector<'a> {
    destination_reader: &'a dyn DestinationReader,
    deriver: &'a dyn ScriptDeriver,
}

impl<'a> TxProjector<'a> {
    pub fn new(
        destination_reader: &'a dyn DestinationReader,
        deriver: &'a dyn ScriptDeriver,
    ) -> Self {
        TxProjector { destination_reader, deriver }
    }

    /// Projects one transaction against the batch state.
    ///
    /// `block` is `None` for mempool transactions. `fixed_txid` substitutes
    /// the id under which records are keyed, used when a known id must be
    /// preserved across malleation. Returns whether anything of interest
    /// was found.
    pub fn project(
        &self,
        tx: &Transaction,
        block: Option<&BlockHeader>,
        fixed_txid: Option<Txid>,
        state: &mut ProjectionState,
    ) -> bool {
        let txid = fixed_txid.unwrap_or(tx.txid);
        let position = block.map(|b| b.position());
        let mut of_interest = false;

        // Spends of tracked outpoints.
        if !tx.is_coinbase {
            for input in &tx.inputs {
                let Some(owners) = state.outpoints.owners(&input.prev_out) else {
                    continue;
                };
                of_interest = true;
                for owner in owners {
                    state.spends.push(SpendRecord {
                        address: owner,
                        spent_outpoint: input.prev_out,
                        block: position,
                        spend_txid: txid,
                        is_coinstake: tx.is_coinstake,
                        spend_time: block.map(|b| b.time).unwrap_or(tx.time),
                        total_out: tx.total_out(),
                    });
                }
                if state.payment_txids.insert(txid) {
                    self.record_payments(tx, txid, state);
                }
            }
        }

        // Receipts to tracked destinations. The raw script stands in when
        // the reader cannot decode it, so plain-script tracking still works.
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.is_empty() || output.script_pub_key.is_op_return() {
                continue;
            }
            let mut destinations =
                self.destination_reader.destinations(&output.script_pub_key);
            if destinations.is_empty() {
                destinations.push(output.script_pub_key.clone());
            }
            let outpoint = OutPoint::new(txid, vout as u32);
            for dest in destinations {
                let Some(owners) = state.addresses.owners(&dest) else {
                    continue;
                };
                of_interest = true;
                for owner in owners {
                    state.outputs.push(OutputRecord {
                        address: owner,
                        script_pub_key: dest.clone(),
                        block: position,
                        txid,
                        output_index: vout as u32,
                        value: output.value,
                        is_coinbase: tx.is_coinbase || tx.is_coinstake,
                        creation_time: block.map(|b| b.time).unwrap_or(tx.time),
                    });
                    state.outpoints.add_tentative(outpoint, owner);
                    self.top_up(&owner, state);
                }
            }
        }

        of_interest
    }

    /// Expands every output of a spending transaction into destination
    /// payment records. Change is any destination the batch scope owns.
    fn record_payments(&self, tx: &Transaction, txid: Txid, state: &mut ProjectionState) {
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.is_empty() {
                continue;
            }
            for dest in self.destination_reader.destinations(&output.script_pub_key) {
                let is_change = state.addresses.contains(&dest);
                state.payments.push(PaymentRecord {
                    spend_txid: txid,
                    output_index: vout as u32,
                    dest_script: dest,
                    value: output.value,
                    is_change,
                });
            }
        }
    }

    fn top_up(&self, used: &AddressIdentifier, state: &mut ProjectionState) {
        let created = state.tracker.mark_used(used, self.deriver);
        for row in created {
            let id = AddressIdentifier {
                wallet_id: row.wallet_id,
                account_index: row.account_index,
                address_type: row.address_type,
                address_index: row.address_index,
            };
            if let Ok(script) = row.script() {
                state.addresses.add_tentative(script, id);
            }
            state.new_addresses.push(row);
        }
    }
}
