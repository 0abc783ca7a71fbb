//! Transaction and block primitives.
//!
//! Wire serialization and hashing are external concerns; a transaction
//! carries the id assigned to it by whatever produced it.

use serde::{Deserialize, Serialize};

use crate::hashes::{BlockHash, OutPoint, Txid};
use crate::script::Script;

/// A transaction input, reduced to the outpoint it consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prev_out: OutPoint,
}

impl TxIn {
    pub fn new(prev_out: OutPoint) -> Self {
        TxIn { prev_out }
    }
}

/// A transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: i64,
    pub script_pub_key: Script,
}

impl TxOut {
    pub fn new(value: i64, script_pub_key: Script) -> Self {
        TxOut { value, script_pub_key }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pub_key.is_empty()
    }
}

/// A transaction as seen by the projection engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: Txid,
    /// Unix seconds.
    pub time: i64,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
}

impl Transaction {
    /// Sum of all output values.
    pub fn total_out(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

/// A block header with its chain position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub prev_hash: BlockHash,
    pub height: i64,
    /// Unix seconds.
    pub time: i64,
}

impl BlockHeader {
    pub fn position(&self) -> crate::hashes::HashHeight {
        crate::hashes::HashHeight::new(self.hash, self.height)
    }

    /// Position of the parent block, or the pre-genesis start position.
    pub fn prev_position(&self) -> crate::hashes::HashHeight {
        crate::hashes::HashHeight::new(self.prev_hash, self.height - 1)
    }
}

/// A block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}
