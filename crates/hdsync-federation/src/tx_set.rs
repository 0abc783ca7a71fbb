//! The multisig transaction set and its derived indexes.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use hdsync_types::{OutPoint, Txid};

use crate::transaction_data::TransactionData;

// ─── Inner state ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    records: HashMap<OutPoint, TransactionData>,
    /// Outpoints with no spending details.
    spendable: HashSet<OutPoint>,
    /// Withdrawal spends grouped by the deposit they pay out.
    withdrawals: HashMap<Txid, Vec<OutPoint>>,
}

impl Inner {
    /// Adds `data`'s key to the derived indexes it qualifies for.
    fn admit(&mut self, data: &TransactionData) {
        if data.is_spendable() {
            self.spendable.insert(data.outpoint);
        }
        if let Some(deposit_id) = data.deposit_id() {
            self.withdrawals.entry(deposit_id).or_default().push(data.outpoint);
        }
    }

    /// Removes `data`'s key from the derived indexes.
    fn evict(&mut self, data: &TransactionData) {
        self.spendable.remove(&data.outpoint);
        if let Some(deposit_id) = data.deposit_id() {
            if let Some(list) = self.withdrawals.get_mut(&deposit_id) {
                list.retain(|o| *o != data.outpoint);
                if list.is_empty() {
                    self.withdrawals.remove(&deposit_id);
                }
            }
        }
    }
}

// ─── Public set ──────────────────────────────────────────────────────────────

/// Observed multisig outputs keyed by outpoint, with a spendable index and
/// a withdrawals-by-deposit index.
///
/// The derived indexes are consistent with the primary map the moment any
/// mutating call returns; everything serializes under one coarse lock.
/// Spending details are only ever changed through [`update`], which does
/// the index bookkeeping around the mutation.
///
/// [`update`]: MultiSigTransactionSet::update
#[derive(Default)]
pub struct MultiSigTransactionSet {
    inner: Mutex<Inner>,
}

impl MultiSigTransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, returning the one it replaced, if any.
    pub fn insert(&self, data: TransactionData) -> Option<TransactionData> {
        let mut inner = self.inner.lock().expect("set lock");
        let previous = inner.records.remove(&data.outpoint);
        if let Some(old) = &previous {
            inner.evict(old);
        }
        inner.admit(&data);
        inner.records.insert(data.outpoint, data);
        previous
    }

    pub fn remove(&self, outpoint: &OutPoint) -> Option<TransactionData> {
        let mut inner = self.inner.lock().expect("set lock");
        let removed = inner.records.remove(outpoint)?;
        inner.evict(&removed);
        Some(removed)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<TransactionData> {
        self.inner.lock().expect("set lock").records.get(outpoint).cloned()
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.inner.lock().expect("set lock").records.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("set lock").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("set lock");
        inner.records.clear();
        inner.spendable.clear();
        inner.withdrawals.clear();
    }

    /// Mutates one record's spending details in place.
    ///
    /// The record is evicted from the derived indexes before `f` runs and
    /// re-admitted afterwards, all under the same lock acquisition, so a
    /// reader can never observe an index entry that disagrees with the
    /// record. Returns whether the outpoint was present.
    pub fn update<F>(&self, outpoint: &OutPoint, f: F) -> bool
    where
        F: FnOnce(&mut TransactionData),
    {
        let mut inner = self.inner.lock().expect("set lock");
        let Some(mut data) = inner.records.remove(outpoint) else {
            return false;
        };
        inner.evict(&data);
        f(&mut data);
        inner.admit(&data);
        inner.records.insert(data.outpoint, data);
        true
    }

    /// All records, in no particular order.
    pub fn snapshot(&self) -> Vec<TransactionData> {
        self.inner.lock().expect("set lock").records.values().cloned().collect()
    }

    /// All records with no observed spend.
    pub fn unspent(&self) -> Vec<TransactionData> {
        let inner = self.inner.lock().expect("set lock");
        inner
            .spendable
            .iter()
            .filter_map(|o| inner.records.get(o).cloned())
            .collect()
    }

    /// Withdrawal spends grouped by deposit id.
    ///
    /// With a specific `deposit_id` the result always holds exactly one
    /// entry, empty when nothing matches.
    pub fn withdrawals_by_deposit(
        &self,
        deposit_id: Option<&Txid>,
    ) -> Vec<(Txid, Vec<TransactionData>)> {
        let inner = self.inner.lock().expect("set lock");
        let collect = |outpoints: &[OutPoint]| -> Vec<TransactionData> {
            outpoints.iter().filter_map(|o| inner.records.get(o).cloned()).collect()
        };

        match deposit_id {
            Some(id) => {
                let records =
                    inner.withdrawals.get(id).map(|list| collect(list)).unwrap_or_default();
                vec![(*id, records)]
            }
            None => inner
                .withdrawals
                .iter()
                .map(|(id, list)| (*id, collect(list)))
                .collect(),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use hdsync_types::Script;

    use super::*;
    use crate::transaction_data::{SpendingDetails, WithdrawalDetails};

    fn record(tag: u8) -> TransactionData {
        TransactionData {
            outpoint: OutPoint::new(Txid::from_bytes([tag; 32]), 0),
            amount: 50,
            script_pub_key: Script::new(vec![0xa9, tag]),
            block: None,
            creation_time: 1_600_000_000,
            is_coinbase: false,
            spending_details: None,
        }
    }

    fn spend(deposit: Option<u8>) -> SpendingDetails {
        SpendingDetails {
            spend_txid: Txid::from_bytes([0xee; 32]),
            block: None,
            creation_time: 1_600_000_100,
            payments: vec![],
            withdrawal: deposit.map(|d| WithdrawalDetails {
                matching_deposit_id: Txid::from_bytes([d; 32]),
                target_address: "target".to_string(),
                amount: 49,
            }),
        }
    }

    #[test]
    fn test_insert_indexes_spendable() {
        let set = MultiSigTransactionSet::new();
        set.insert(record(1));
        let mut spent = record(2);
        spent.spending_details = Some(spend(None));
        set.insert(spent);

        assert_eq!(set.len(), 2);
        let unspent = set.unspent();
        assert_eq!(unspent.len(), 1);
        assert_eq!(unspent[0].outpoint, record(1).outpoint);
    }

    #[test]
    fn test_update_moves_record_between_indexes() {
        let set = MultiSigTransactionSet::new();
        set.insert(record(1));
        assert_eq!(set.unspent().len(), 1);

        // First phase of a withdrawal: the spend is attached.
        assert!(set.update(&record(1).outpoint, |data| {
            data.spending_details = Some(spend(Some(9)));
        }));
        assert!(set.unspent().is_empty());
        let groups = set.withdrawals_by_deposit(None);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, Txid::from_bytes([9; 32]));
        assert_eq!(groups[0].1.len(), 1);

        // Rewind: clearing the spend restores spendability and drops the
        // withdrawal entry.
        assert!(set.update(&record(1).outpoint, |data| {
            data.spending_details = None;
        }));
        assert_eq!(set.unspent().len(), 1);
        assert!(set.withdrawals_by_deposit(None).is_empty());
    }

    #[test]
    fn test_update_unknown_outpoint() {
        let set = MultiSigTransactionSet::new();
        assert!(!set.update(&record(1).outpoint, |_| panic!("must not run")));
    }

    #[test]
    fn test_remove_cleans_all_indexes() {
        let set = MultiSigTransactionSet::new();
        let mut data = record(1);
        data.spending_details = Some(spend(Some(9)));
        set.insert(data);

        let removed = set.remove(&record(1).outpoint).unwrap();
        assert_eq!(removed.deposit_id(), Some(Txid::from_bytes([9; 32])));
        assert!(set.is_empty());
        assert!(set.withdrawals_by_deposit(None).is_empty());
        assert!(set.remove(&record(1).outpoint).is_none());
    }

    #[test]
    fn test_insert_replaces_and_reindexes() {
        let set = MultiSigTransactionSet::new();
        let mut spent = record(1);
        spent.spending_details = Some(spend(Some(9)));
        set.insert(spent);

        // Replacing with an unspent copy of the same outpoint.
        let previous = set.insert(record(1)).unwrap();
        assert!(!previous.is_spendable());
        assert_eq!(set.len(), 1);
        assert_eq!(set.unspent().len(), 1);
        assert!(set.withdrawals_by_deposit(None).is_empty());
    }

    #[test]
    fn test_withdrawals_query_by_specific_deposit() {
        let set = MultiSigTransactionSet::new();
        let mut a = record(1);
        a.spending_details = Some(spend(Some(9)));
        let mut b = record(2);
        b.spending_details = Some(spend(Some(9)));
        set.insert(a);
        set.insert(b);

        let deposit = Txid::from_bytes([9; 32]);
        let groups = set.withdrawals_by_deposit(Some(&deposit));
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1.len(), 2);

        // An unknown deposit still gets exactly one, empty entry.
        let missing = Txid::from_bytes([8; 32]);
        let groups = set.withdrawals_by_deposit(Some(&missing));
        assert_eq!(groups.len(), 1);
        assert!(groups[0].1.is_empty());
    }
}
