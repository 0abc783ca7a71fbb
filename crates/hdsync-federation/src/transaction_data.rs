//! Observed multisig output records.

use hdsync_types::{HashHeight, OutPoint, Script, Txid};
use serde::{Deserialize, Serialize};

/// One destination paid by a spending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub dest_script: Script,
    pub amount: i64,
    pub is_change: bool,
}

/// Cross-chain correlation attached to a withdrawal spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalDetails {
    /// Id of the deposit on the source chain this withdrawal pays out.
    pub matching_deposit_id: Txid,
    pub target_address: String,
    pub amount: i64,
}

/// How, and in which block, an output was spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingDetails {
    pub spend_txid: Txid,
    /// Present once the spend is confirmed.
    pub block: Option<HashHeight>,
    /// Unix seconds of the spending transaction.
    pub creation_time: i64,
    pub payments: Vec<PaymentDetails>,
    pub withdrawal: Option<WithdrawalDetails>,
}

impl SpendingDetails {
    pub fn is_confirmed(&self) -> bool {
        self.block.is_some()
    }
}

/// An output observed on a federation multisig address.
///
/// Created when the output is first seen, mutated in place when it is
/// spent or the spend is rewound. Mutation of `spending_details` must go
/// through [`MultiSigTransactionSet::update`] so the derived indexes stay
/// consistent.
///
/// [`MultiSigTransactionSet::update`]: crate::tx_set::MultiSigTransactionSet::update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionData {
    pub outpoint: OutPoint,
    pub amount: i64,
    pub script_pub_key: Script,
    /// Present once the output is confirmed.
    pub block: Option<HashHeight>,
    /// Unix seconds of the funding transaction.
    pub creation_time: i64,
    pub is_coinbase: bool,
    pub spending_details: Option<SpendingDetails>,
}

impl TransactionData {
    /// An output is spendable exactly when no spend has been observed.
    pub fn is_spendable(&self) -> bool {
        self.spending_details.is_none()
    }

    pub fn is_confirmed(&self) -> bool {
        self.block.is_some()
    }

    /// The deposit this output's spend pays out, when it is a withdrawal.
    pub fn deposit_id(&self) -> Option<Txid> {
        self.spending_details
            .as_ref()
            .and_then(|s| s.withdrawal.as_ref())
            .map(|w| w.matching_deposit_id)
    }
}
