//! Cross-chain deposits and their extraction from blocks.

use std::fmt;

use hdsync_types::script::OP_RETURN;
use hdsync_types::{Block, BlockHash, Script, Txid, TxIn};
use serde::{Serialize, Serializer};

fn hex_txid<S: Serializer>(id: &Txid, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&id.to_hex())
}

fn hex_block_hash<S: Serializer>(hash: &BlockHash, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hash.to_hex())
}

/// A deposit observed on the source chain: value paid into the federation
/// address together with the target address it should be released to.
#[derive(Debug, Clone, Serialize)]
pub struct Deposit {
    /// Id of the funding transaction; doubles as the cross-chain
    /// correlation id.
    #[serde(serialize_with = "hex_txid")]
    pub id: Txid,
    pub amount: i64,
    pub target_address: String,
    /// Filled in by refund address resolution, when enabled.
    pub sender_address: Option<String>,
    /// First input of the funding transaction, kept for refund resolution.
    #[serde(skip)]
    pub first_input: Option<TxIn>,
    pub block_height: i64,
    #[serde(serialize_with = "hex_block_hash")]
    pub block_hash: BlockHash,
}

impl fmt::Display for Deposit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string_pretty(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

/// The deposits of one mature block, empty when the block carries none.
#[derive(Debug, Clone, Serialize)]
pub struct MaturedBlockDeposits {
    #[serde(serialize_with = "hex_block_hash")]
    pub block_hash: BlockHash,
    pub block_height: i64,
    pub block_time: i64,
    pub deposits: Vec<Deposit>,
}

/// Extracts the deposits of a block.
///
/// `minimum_confirmations` is the maturity floor the provider enforces
/// before the extractor ever sees a block.
pub trait DepositExtractor: Send + Sync {
    fn minimum_confirmations(&self) -> i64;

    fn extract(&self, block: &Block) -> MaturedBlockDeposits;
}

/// Data payload of an `OP_RETURN <push> <data>` script.
pub fn op_return_payload(script: &Script) -> Option<&[u8]> {
    let bytes = script.as_bytes();
    if bytes.len() > 2 && bytes[0] == OP_RETURN {
        Some(&bytes[2..])
    } else {
        None
    }
}

/// Extractor for the standard deposit shape: value paid to the federation
/// script alongside one `OP_RETURN` output carrying the UTF-8 target
/// address.
pub struct OpReturnDepositExtractor {
    deposit_script: Script,
    minimum_confirmations: i64,
}

impl OpReturnDepositExtractor {
    pub fn new(deposit_script: Script, minimum_confirmations: i64) -> Self {
        OpReturnDepositExtractor { deposit_script, minimum_confirmations }
    }
}

impl DepositExtractor for OpReturnDepositExtractor {
    fn minimum_confirmations(&self) -> i64 {
        self.minimum_confirmations
    }

    fn extract(&self, block: &Block) -> MaturedBlockDeposits {
        let mut deposits = Vec::new();
        for tx in &block.transactions {
            if tx.is_coinbase || tx.is_coinstake {
                continue;
            }
            let amount: i64 = tx
                .outputs
                .iter()
                .filter(|o| o.script_pub_key == self.deposit_script)
                .map(|o| o.value)
                .sum();
            if amount <= 0 {
                continue;
            }
            let target = tx.outputs.iter().find_map(|o| {
                let payload = op_return_payload(&o.script_pub_key)?;
                std::str::from_utf8(payload).ok()
            });
            let Some(target_address) = target else {
                continue;
            };
            deposits.push(Deposit {
                id: tx.txid,
                amount,
                target_address: target_address.to_string(),
                sender_address: None,
                first_input: tx.inputs.first().cloned(),
                block_height: block.header.height,
                block_hash: block.header.hash,
            });
        }

        MaturedBlockDeposits {
            block_hash: block.header.hash,
            block_height: block.header.height,
            block_time: block.header.time,
            deposits,
        }
    }
}
