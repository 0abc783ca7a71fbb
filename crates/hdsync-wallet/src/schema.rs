//! SQLite schema and row models for the wallet store.

use std::str::FromStr;

use hdsync_types::{AddressType, BlockHash, BlockLocator, HashHeight, OutPoint, Script, Txid};
use serde::{Deserialize, Serialize};

use crate::error::WalletError;

pub const SCHEMA_DDL: &str = "
CREATE TABLE IF NOT EXISTS wallet (
  wallet_id                 INTEGER PRIMARY KEY AUTOINCREMENT,
  name                      TEXT NOT NULL UNIQUE,
  encrypted_seed            TEXT,
  chain_code                TEXT,
  creation_time             INTEGER NOT NULL,
  last_block_synced_hash    TEXT,
  last_block_synced_height  INTEGER NOT NULL DEFAULT -1,
  block_locator             TEXT NOT NULL DEFAULT ''
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_seed
  ON wallet(encrypted_seed) WHERE encrypted_seed IS NOT NULL;

CREATE TABLE IF NOT EXISTS account (
  wallet_id      INTEGER NOT NULL,
  account_index  INTEGER NOT NULL,
  account_name   TEXT NOT NULL,
  ext_pub_key    TEXT,
  creation_time  INTEGER NOT NULL,
  PRIMARY KEY (wallet_id, account_index)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_account_name ON account(wallet_id, account_name);

CREATE TABLE IF NOT EXISTS address (
  wallet_id      INTEGER NOT NULL,
  account_index  INTEGER NOT NULL,
  address_type   INTEGER NOT NULL,
  address_index  INTEGER NOT NULL,
  script_pub_key TEXT NOT NULL,
  PRIMARY KEY (wallet_id, account_index, address_type, address_index)
);
CREATE INDEX IF NOT EXISTS idx_address_script ON address(script_pub_key);

CREATE TABLE IF NOT EXISTS tx_data (
  wallet_id            INTEGER NOT NULL,
  account_index        INTEGER NOT NULL,
  address_type         INTEGER NOT NULL,
  address_index        INTEGER NOT NULL,
  script_pub_key       TEXT NOT NULL,
  output_txid          TEXT NOT NULL,
  output_index         INTEGER NOT NULL,
  value                INTEGER NOT NULL,
  is_coinbase          INTEGER NOT NULL DEFAULT 0,
  output_block_hash    TEXT,
  output_block_height  INTEGER,
  output_tx_time       INTEGER NOT NULL,
  spend_txid           TEXT,
  spend_block_hash     TEXT,
  spend_block_height   INTEGER,
  spend_is_coinstake   INTEGER,
  spend_tx_time        INTEGER,
  spend_total_out      INTEGER,
  PRIMARY KEY (wallet_id, output_txid, output_index, script_pub_key)
);
CREATE INDEX IF NOT EXISTS idx_tx_data_height ON tx_data(wallet_id, output_block_height);
CREATE INDEX IF NOT EXISTS idx_tx_data_spend ON tx_data(wallet_id, spend_txid);
CREATE INDEX IF NOT EXISTS idx_tx_data_address
  ON tx_data(wallet_id, account_index, address_type, address_index);

CREATE TABLE IF NOT EXISTS payment (
  wallet_id      INTEGER NOT NULL,
  spend_txid     TEXT NOT NULL,
  output_index   INTEGER NOT NULL,
  dest_script    TEXT NOT NULL,
  value          INTEGER NOT NULL,
  is_change      INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (wallet_id, spend_txid, output_index, dest_script)
);
";

/// A `wallet` table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletRow {
    pub wallet_id: i64,
    pub name: String,
    pub encrypted_seed: Option<String>,
    pub chain_code: Option<String>,
    pub creation_time: i64,
    pub last_block_synced_hash: Option<String>,
    pub last_block_synced_height: i64,
    pub block_locator: String,
}

impl WalletRow {
    /// The wallet's synced position, if it has ever synced a block.
    pub fn last_synced(&self) -> Result<Option<HashHeight>, WalletError> {
        match &self.last_block_synced_hash {
            None => Ok(None),
            Some(h) => {
                let hash = BlockHash::from_str(h)?;
                Ok(Some(HashHeight::new(hash, self.last_block_synced_height)))
            }
        }
    }

    pub fn locator(&self) -> Result<BlockLocator, WalletError> {
        Ok(BlockLocator::from_text(&self.block_locator)?)
    }

    /// Whether `position` is plausibly within this wallet's synced range.
    ///
    /// Only the current tip and recorded locator ancestors qualify; anything
    /// else is rejected so a "rewind" can never silently fast-forward.
    pub fn contains_block(&self, position: &HashHeight) -> Result<bool, WalletError> {
        let Some(tip) = self.last_synced()? else {
            return Ok(false);
        };
        if position.height > tip.height {
            return Ok(false);
        }
        if *position == tip {
            return Ok(true);
        }
        Ok(self.locator()?.contains(position))
    }
}

/// An `account` table row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    pub wallet_id: i64,
    pub account_index: u32,
    pub account_name: String,
    pub ext_pub_key: Option<String>,
    pub creation_time: i64,
}

impl AccountRow {
    pub fn is_watch_only(&self) -> bool {
        self.ext_pub_key.is_none()
    }
}

/// An `address` table row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRow {
    pub wallet_id: i64,
    pub account_index: u32,
    pub address_type: AddressType,
    pub address_index: u32,
    pub script_pub_key: String,
}

impl AddressRow {
    pub fn script(&self) -> Result<Script, WalletError> {
        Script::from_hex(&self.script_pub_key)
            .map_err(|e| WalletError::Corrupt(format!("address script: {e}")))
    }
}

/// A `tx_data` table row: one tracked output, optionally spent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDataRow {
    pub wallet_id: i64,
    pub account_index: u32,
    pub address_type: AddressType,
    pub address_index: u32,
    pub script_pub_key: String,
    pub output_txid: String,
    pub output_index: u32,
    pub value: i64,
    pub is_coinbase: bool,
    pub output_block_hash: Option<String>,
    pub output_block_height: Option<i64>,
    pub output_tx_time: i64,
    pub spend_txid: Option<String>,
    pub spend_block_hash: Option<String>,
    pub spend_block_height: Option<i64>,
    pub spend_is_coinstake: Option<bool>,
    pub spend_tx_time: Option<i64>,
    pub spend_total_out: Option<i64>,
}

impl TxDataRow {
    pub fn outpoint(&self) -> Result<OutPoint, WalletError> {
        Ok(OutPoint::new(Txid::from_str(&self.output_txid)?, self.output_index))
    }

    pub fn is_spent(&self) -> bool {
        self.spend_txid.is_some()
    }

    /// Confirmation count against `current_height`, zero while unconfirmed.
    pub fn confirmations(&self, current_height: i64) -> i64 {
        match self.output_block_height {
            Some(h) => (current_height + 1 - h).max(0),
            None => 0,
        }
    }
}

/// A `payment` table row: one destination of a spending transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRow {
    pub wallet_id: i64,
    pub spend_txid: String,
    pub output_index: u32,
    pub dest_script: String,
    pub value: i64,
    pub is_change: bool,
}

// ── Row mapping helpers ─────────────────────────────────────────────────

pub(crate) fn row_to_wallet(r: &rusqlite::Row<'_>) -> rusqlite::Result<WalletRow> {
    Ok(WalletRow {
        wallet_id: r.get(0)?,
        name: r.get(1)?,
        encrypted_seed: r.get(2)?,
        chain_code: r.get(3)?,
        creation_time: r.get(4)?,
        last_block_synced_hash: r.get(5)?,
        last_block_synced_height: r.get(6)?,
        block_locator: r.get(7)?,
    })
}

pub(crate) fn row_to_account(r: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRow> {
    Ok(AccountRow {
        wallet_id: r.get(0)?,
        account_index: r.get::<_, i64>(1)? as u32,
        account_name: r.get(2)?,
        ext_pub_key: r.get(3)?,
        creation_time: r.get(4)?,
    })
}

pub(crate) fn row_to_address(r: &rusqlite::Row<'_>) -> rusqlite::Result<AddressRow> {
    let address_type: i64 = r.get(2)?;
    Ok(AddressRow {
        wallet_id: r.get(0)?,
        account_index: r.get::<_, i64>(1)? as u32,
        address_type: AddressType::from_i64(address_type).unwrap_or(AddressType::External),
        address_index: r.get::<_, i64>(3)? as u32,
        script_pub_key: r.get(4)?,
    })
}

pub(crate) fn row_to_tx_data(r: &rusqlite::Row<'_>) -> rusqlite::Result<TxDataRow> {
    let address_type: i64 = r.get(2)?;
    Ok(TxDataRow {
        wallet_id: r.get(0)?,
        account_index: r.get::<_, i64>(1)? as u32,
        address_type: AddressType::from_i64(address_type).unwrap_or(AddressType::External),
        address_index: r.get::<_, i64>(3)? as u32,
        script_pub_key: r.get(4)?,
        output_txid: r.get(5)?,
        output_index: r.get::<_, i64>(6)? as u32,
        value: r.get(7)?,
        is_coinbase: r.get::<_, i64>(8)? != 0,
        output_block_hash: r.get(9)?,
        output_block_height: r.get(10)?,
        output_tx_time: r.get(11)?,
        spend_txid: r.get(12)?,
        spend_block_hash: r.get(13)?,
        spend_block_height: r.get(14)?,
        spend_is_coinstake: r.get::<_, Option<i64>>(15)?.map(|v| v != 0),
        spend_tx_time: r.get(16)?,
        spend_total_out: r.get(17)?,
    })
}

pub(crate) fn row_to_payment(r: &rusqlite::Row<'_>) -> rusqlite::Result<PaymentRow> {
    Ok(PaymentRow {
        wallet_id: r.get(0)?,
        spend_txid: r.get(1)?,
        output_index: r.get::<_, i64>(2)? as u32,
        dest_script: r.get(3)?,
        value: r.get(4)?,
        is_change: r.get::<_, i64>(5)? != 0,
    })
}

/// Column list matching `row_to_tx_data`, for reuse across queries.
pub(crate) const TX_DATA_COLUMNS: &str = "wallet_id, account_index, address_type, address_index, \
     script_pub_key, output_txid, output_index, value, is_coinbase, \
     output_block_hash, output_block_height, output_tx_time, \
     spend_txid, spend_block_hash, spend_block_height, spend_is_coinstake, \
     spend_tx_time, spend_total_out";

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_row(tip: Option<HashHeight>, locator: &BlockLocator) -> WalletRow {
        WalletRow {
            wallet_id: 1,
            name: "w".into(),
            encrypted_seed: None,
            chain_code: None,
            creation_time: 0,
            last_block_synced_hash: tip.map(|t| t.hash.to_hex()),
            last_block_synced_height: tip.map(|t| t.height).unwrap_or(-1),
            block_locator: locator.to_text(),
        }
    }

    fn pos(tag: u8, height: i64) -> HashHeight {
        HashHeight::new(BlockHash::from_bytes([tag; 32]), height)
    }

    #[test]
    fn test_contains_block_tip_and_locator() {
        let locator = BlockLocator(vec![pos(3, 3), pos(2, 2), pos(1, 1)]);
        let row = wallet_row(Some(pos(3, 3)), &locator);

        assert!(row.contains_block(&pos(3, 3)).unwrap());
        assert!(row.contains_block(&pos(1, 1)).unwrap());
        // Unknown ancestor hash at a plausible height.
        assert!(!row.contains_block(&pos(9, 1)).unwrap());
        // Ahead of the tip.
        assert!(!row.contains_block(&pos(4, 4)).unwrap());
    }

    #[test]
    fn test_contains_block_unsynced_wallet() {
        let row = wallet_row(None, &BlockLocator::default());
        assert!(!row.contains_block(&pos(1, 1)).unwrap());
    }

    #[test]
    fn test_confirmations() {
        let mut row = TxDataRow {
            wallet_id: 1,
            account_index: 0,
            address_type: AddressType::External,
            address_index: 0,
            script_pub_key: String::new(),
            output_txid: "aa".repeat(32),
            output_index: 0,
            value: 5,
            is_coinbase: false,
            output_block_hash: None,
            output_block_height: Some(10),
            output_tx_time: 0,
            spend_txid: None,
            spend_block_hash: None,
            spend_block_height: None,
            spend_is_coinstake: None,
            spend_tx_time: None,
            spend_total_out: None,
        };
        assert_eq!(row.confirmations(10), 1);
        assert_eq!(row.confirmations(14), 5);

        row.output_block_height = None;
        assert_eq!(row.confirmations(14), 0);
        assert!(!row.is_spent());
    }
}
