//! SQLite-backed wallet store.
//!
//! One `WalletStore` owns one database connection. A database holds one or
//! many wallets; callers serialize access through the surrounding locks, so
//! the store itself is single-threaded and uses plain explicit transactions.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension};

use hdsync_types::{AddressType, BlockLocator, HashHeight, OutPoint, Script, Txid};

use crate::account::AddressIdentifier;
use crate::error::WalletError;
use crate::projector::{OutputRecord, PaymentRecord, SpendRecord};
use crate::schema::{
    row_to_account, row_to_address, row_to_payment, row_to_tx_data, row_to_wallet, AccountRow,
    AddressRow, PaymentRow, TxDataRow, WalletRow, SCHEMA_DDL, TX_DATA_COLUMNS,
};

/// Deferred side effect recorded during a store transaction and executed by
/// the caller once the transaction's fate is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensatingAction {
    /// Drop the named wallet's in-memory state.
    ForgetWallet(String),
    /// Delete a staged file.
    RemoveFile(PathBuf),
    /// Move a staged file back into place.
    RestoreFile { from: PathBuf, to: PathBuf },
}

/// Balance summary for a wallet or account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Balance {
    /// All unspent value, confirmed or not.
    pub total: i64,
    /// Unspent value with at least one confirmation.
    pub confirmed: i64,
    /// Confirmed value meeting the confirmation and maturity thresholds.
    pub spendable: i64,
}

/// An address together with its observed usage.
#[derive(Debug, Clone)]
pub struct AddressUsage {
    pub address: AddressRow,
    /// Unspent value currently held by the address.
    pub balance: i64,
    /// Total value ever received by the address.
    pub total_received: i64,
}

pub struct WalletStore {
    conn: Connection,
    path: Option<PathBuf>,
    on_commit: Vec<CompensatingAction>,
    on_rollback: Vec<CompensatingAction>,
}

impl WalletStore {
    pub fn open(path: &Path) -> Result<Self, WalletError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(WalletStore {
            conn,
            path: Some(path.to_path_buf()),
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
        })
    }

    pub fn open_in_memory() -> Result<Self, WalletError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_DDL)?;
        Ok(WalletStore { conn, path: None, on_commit: Vec::new(), on_rollback: Vec::new() })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ── Transactions ────────────────────────────────────────────────────

    pub fn begin(&mut self) -> Result<(), WalletError> {
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        Ok(())
    }

    /// Commits and returns the actions to run now that the transaction is
    /// durable. Pending rollback actions are discarded.
    pub fn commit(&mut self) -> Result<Vec<CompensatingAction>, WalletError> {
        self.conn.execute_batch("COMMIT;")?;
        self.on_rollback.clear();
        Ok(std::mem::take(&mut self.on_commit))
    }

    /// Rolls back and returns the actions compensating for side effects the
    /// transaction took outside the database.
    pub fn rollback(&mut self) -> Result<Vec<CompensatingAction>, WalletError> {
        self.conn.execute_batch("ROLLBACK;")?;
        self.on_commit.clear();
        Ok(std::mem::take(&mut self.on_rollback))
    }

    pub fn defer_on_commit(&mut self, action: CompensatingAction) {
        self.on_commit.push(action);
    }

    pub fn defer_on_rollback(&mut self, action: CompensatingAction) {
        self.on_rollback.push(action);
    }

    // ── Wallet Operations ───────────────────────────────────────────────

    pub fn create_wallet(
        &mut self,
        name: &str,
        encrypted_seed: Option<&str>,
        chain_code: Option<&str>,
        creation_time: i64,
    ) -> Result<WalletRow, WalletError> {
        if self.get_wallet(name)?.is_some() {
            return Err(WalletError::DuplicateWallet(name.to_string()));
        }
        if let Some(seed) = encrypted_seed {
            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT wallet_id FROM wallet WHERE encrypted_seed = ?1",
                    params![seed],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(WalletError::DuplicateSeed);
            }
        }

        self.conn.execute(
            "INSERT INTO wallet (name, encrypted_seed, chain_code, creation_time,
                                 last_block_synced_hash, last_block_synced_height, block_locator)
             VALUES (?1, ?2, ?3, ?4, NULL, -1, '')",
            params![name, encrypted_seed, chain_code, creation_time],
        )?;
        let wallet_id = self.conn.last_insert_rowid();
        self.on_rollback.push(CompensatingAction::ForgetWallet(name.to_string()));
        self.get_wallet_by_id(wallet_id)
    }

    pub fn get_wallet(&self, name: &str) -> Result<Option<WalletRow>, WalletError> {
        let row = self
            .conn
            .query_row(
                "SELECT wallet_id, name, encrypted_seed, chain_code, creation_time,
                        last_block_synced_hash, last_block_synced_height, block_locator
                 FROM wallet WHERE name = ?1",
                params![name],
                row_to_wallet,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_wallet_required(&self, name: &str) -> Result<WalletRow, WalletError> {
        self.get_wallet(name)?.ok_or_else(|| WalletError::UnknownWallet(name.to_string()))
    }

    pub fn get_wallet_by_id(&self, wallet_id: i64) -> Result<WalletRow, WalletError> {
        let row = self
            .conn
            .query_row(
                "SELECT wallet_id, name, encrypted_seed, chain_code, creation_time,
                        last_block_synced_hash, last_block_synced_height, block_locator
                 FROM wallet WHERE wallet_id = ?1",
                params![wallet_id],
                row_to_wallet,
            )
            .optional()?;
        row.ok_or_else(|| WalletError::Corrupt(format!("missing wallet row {wallet_id}")))
    }

    pub fn list_wallets(&self) -> Result<Vec<WalletRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT wallet_id, name, encrypted_seed, chain_code, creation_time,
                    last_block_synced_hash, last_block_synced_height, block_locator
             FROM wallet ORDER BY wallet_id",
        )?;
        let rows = stmt.query_map([], row_to_wallet)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn delete_wallet(&mut self, wallet_id: i64) -> Result<(), WalletError> {
        for table in ["payment", "tx_data", "address", "account", "wallet"] {
            self.conn
                .execute(&format!("DELETE FROM {table} WHERE wallet_id = ?1"), params![wallet_id])?;
        }
        Ok(())
    }

    // ── Account Operations ──────────────────────────────────────────────

    pub fn create_account(
        &mut self,
        wallet_id: i64,
        account_index: u32,
        account_name: &str,
        ext_pub_key: Option<&str>,
        creation_time: i64,
    ) -> Result<AccountRow, WalletError> {
        if self.get_account(wallet_id, account_index)?.is_some() {
            return Err(WalletError::DuplicateAccountIndex(account_index));
        }
        if let Some(xpub) = ext_pub_key {
            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT wallet_id FROM account WHERE ext_pub_key = ?1",
                    params![xpub],
                    |r| r.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Err(WalletError::DuplicateExtPubKey);
            }
        }

        self.conn.execute(
            "INSERT INTO account (wallet_id, account_index, account_name, ext_pub_key, creation_time)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![wallet_id, account_index as i64, account_name, ext_pub_key, creation_time],
        )?;
        Ok(AccountRow {
            wallet_id,
            account_index,
            account_name: account_name.to_string(),
            ext_pub_key: ext_pub_key.map(str::to_string),
            creation_time,
        })
    }

    pub fn get_account(
        &self,
        wallet_id: i64,
        account_index: u32,
    ) -> Result<Option<AccountRow>, WalletError> {
        let row = self
            .conn
            .query_row(
                "SELECT wallet_id, account_index, account_name, ext_pub_key, creation_time
                 FROM account WHERE wallet_id = ?1 AND account_index = ?2",
                params![wallet_id, account_index as i64],
                row_to_account,
            )
            .optional()?;
        Ok(row)
    }

    pub fn get_account_by_name(
        &self,
        wallet_id: i64,
        account_name: &str,
    ) -> Result<Option<AccountRow>, WalletError> {
        let row = self
            .conn
            .query_row(
                "SELECT wallet_id, account_index, account_name, ext_pub_key, creation_time
                 FROM account WHERE wallet_id = ?1 AND account_name = ?2",
                params![wallet_id, account_name],
                row_to_account,
            )
            .optional()?;
        Ok(row)
    }

    /// Ordinary accounts below `below_index`, in index order.
    pub fn list_accounts(
        &self,
        wallet_id: i64,
        below_index: u32,
    ) -> Result<Vec<AccountRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT wallet_id, account_index, account_name, ext_pub_key, creation_time
             FROM account WHERE wallet_id = ?1 AND account_index < ?2 ORDER BY account_index",
        )?;
        let rows = stmt.query_map(params![wallet_id, below_index as i64], row_to_account)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn all_accounts(&self, wallet_id: i64) -> Result<Vec<AccountRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT wallet_id, account_index, account_name, ext_pub_key, creation_time
             FROM account WHERE wallet_id = ?1 ORDER BY account_index",
        )?;
        let rows = stmt.query_map(params![wallet_id], row_to_account)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Address Operations ──────────────────────────────────────────────

    pub fn insert_addresses(&mut self, rows: &[AddressRow]) -> Result<(), WalletError> {
        let mut stmt = self.conn.prepare(
            "INSERT OR IGNORE INTO address
                 (wallet_id, account_index, address_type, address_index, script_pub_key)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for row in rows {
            stmt.execute(params![
                row.wallet_id,
                row.account_index as i64,
                row.address_type.as_i64(),
                row.address_index as i64,
                row.script_pub_key,
            ])?;
        }
        Ok(())
    }

    /// Next free address index on the given chain.
    pub fn next_address_index(
        &self,
        wallet_id: i64,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<u32, WalletError> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(address_index) FROM address
             WHERE wallet_id = ?1 AND account_index = ?2 AND address_type = ?3",
            params![wallet_id, account_index as i64, address_type.as_i64()],
            |r| r.get(0),
        )?;
        Ok(max.map(|m| m as u32 + 1).unwrap_or(0))
    }

    pub fn addresses(
        &self,
        wallet_id: i64,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<Vec<AddressRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT wallet_id, account_index, address_type, address_index, script_pub_key
             FROM address WHERE wallet_id = ?1 AND account_index = ?2 AND address_type = ?3
             ORDER BY address_index",
        )?;
        let rows = stmt.query_map(
            params![wallet_id, account_index as i64, address_type.as_i64()],
            row_to_address,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// First `count` addresses on the chain that have never received funds.
    pub fn unused_addresses(
        &self,
        wallet_id: i64,
        account_index: u32,
        address_type: AddressType,
        count: usize,
    ) -> Result<Vec<AddressRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.wallet_id, a.account_index, a.address_type, a.address_index, a.script_pub_key
             FROM address a
             WHERE a.wallet_id = ?1 AND a.account_index = ?2 AND a.address_type = ?3
               AND NOT EXISTS (
                 SELECT 1 FROM tx_data t
                 WHERE t.wallet_id = a.wallet_id AND t.account_index = a.account_index
                   AND t.address_type = a.address_type AND t.address_index = a.address_index)
             ORDER BY a.address_index LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![wallet_id, account_index as i64, address_type.as_i64(), count as i64],
            row_to_address,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Addresses that have received funds, with their balances.
    pub fn used_addresses(
        &self,
        wallet_id: i64,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<Vec<AddressUsage>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT a.wallet_id, a.account_index, a.address_type, a.address_index, a.script_pub_key,
                    COALESCE(SUM(CASE WHEN t.spend_txid IS NULL THEN t.value ELSE 0 END), 0),
                    COALESCE(SUM(t.value), 0)
             FROM address a
             JOIN tx_data t
               ON t.wallet_id = a.wallet_id AND t.account_index = a.account_index
              AND t.address_type = a.address_type AND t.address_index = a.address_index
             WHERE a.wallet_id = ?1 AND a.account_index = ?2 AND a.address_type = ?3
             GROUP BY a.address_index ORDER BY a.address_index",
        )?;
        let rows = stmt.query_map(
            params![wallet_id, account_index as i64, address_type.as_i64()],
            |r| {
                Ok(AddressUsage {
                    address: row_to_address(r)?,
                    balance: r.get(5)?,
                    total_received: r.get(6)?,
                })
            },
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ── Interest Loading ────────────────────────────────────────────────

    /// All known address scripts of the given wallets, for seeding an
    /// address lookup.
    pub fn address_entries(
        &self,
        wallet_ids: &[i64],
    ) -> Result<Vec<(Script, AddressIdentifier)>, WalletError> {
        if wallet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(wallet_ids.len());
        let sql = format!(
            "SELECT wallet_id, account_index, address_type, address_index, script_pub_key
             FROM address WHERE wallet_id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(wallet_ids.iter()), row_to_address)?;

        let mut out = Vec::new();
        for row in rows {
            let row = row?;
            let id = AddressIdentifier {
                wallet_id: row.wallet_id,
                account_index: row.account_index,
                address_type: row.address_type,
                address_index: row.address_index,
            };
            out.push((row.script()?, id));
        }
        Ok(out)
    }

    /// All tracked outpoints of the given wallets, for seeding an outpoint
    /// lookup.
    pub fn outpoint_entries(
        &self,
        wallet_ids: &[i64],
    ) -> Result<Vec<(OutPoint, AddressIdentifier)>, WalletError> {
        if wallet_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = placeholders(wallet_ids.len());
        let sql = format!(
            "SELECT wallet_id, account_index, address_type, address_index, output_txid, output_index
             FROM tx_data WHERE wallet_id IN ({placeholders})"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(wallet_ids.iter()), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)? as u32,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)? as u32,
                r.get::<_, String>(4)?,
                r.get::<_, i64>(5)? as u32,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (wallet_id, account_index, address_type, address_index, txid, vout) = row?;
            let id = AddressIdentifier {
                wallet_id,
                account_index,
                address_type: AddressType::from_i64(address_type)
                    .ok_or_else(|| WalletError::Corrupt(format!("address type {address_type}")))?,
                address_index,
            };
            out.push((OutPoint::new(Txid::from_str(&txid)?, vout), id));
        }
        Ok(out)
    }

    // ── Projection Writes ───────────────────────────────────────────────

    /// Applies a drained batch of projection records.
    ///
    /// Output rows upsert: a confirmed record overwrites the block fields of
    /// an existing unconfirmed row without touching its spend fields, while
    /// an unconfirmed record never downgrades a confirmed row. Spend fields
    /// follow the same rule.
    pub fn apply_projection(
        &mut self,
        outputs: &[OutputRecord],
        spends: &[SpendRecord],
        payments: &[PaymentRecord],
    ) -> Result<(), WalletError> {
        {
            let mut stmt = self.conn.prepare(
                "INSERT INTO tx_data (wallet_id, account_index, address_type, address_index,
                     script_pub_key, output_txid, output_index, value, is_coinbase,
                     output_block_hash, output_block_height, output_tx_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(wallet_id, output_txid, output_index, script_pub_key) DO UPDATE SET
                     output_block_hash = excluded.output_block_hash,
                     output_block_height = excluded.output_block_height,
                     output_tx_time = excluded.output_tx_time
                 WHERE excluded.output_block_height IS NOT NULL",
            )?;
            for record in outputs {
                stmt.execute(params![
                    record.address.wallet_id,
                    record.address.account_index as i64,
                    record.address.address_type.as_i64(),
                    record.address.address_index as i64,
                    record.script_pub_key.to_hex(),
                    record.txid.to_hex(),
                    record.output_index as i64,
                    record.value,
                    record.is_coinbase as i64,
                    record.block.map(|b| b.hash.to_hex()),
                    record.block.map(|b| b.height),
                    record.creation_time,
                ])?;
            }
        }

        {
            let mut stmt = self.conn.prepare(
                "UPDATE tx_data SET
                     spend_txid = ?1, spend_block_hash = ?2, spend_block_height = ?3,
                     spend_is_coinstake = ?4, spend_tx_time = ?5, spend_total_out = ?6
                 WHERE wallet_id = ?7 AND output_txid = ?8 AND output_index = ?9
                   AND (spend_txid IS NULL OR ?3 IS NOT NULL)",
            )?;
            for record in spends {
                stmt.execute(params![
                    record.spend_txid.to_hex(),
                    record.block.map(|b| b.hash.to_hex()),
                    record.block.map(|b| b.height),
                    record.is_coinstake as i64,
                    record.spend_time,
                    record.total_out,
                    record.address.wallet_id,
                    record.spent_outpoint.txid.to_hex(),
                    record.spent_outpoint.vout as i64,
                ])?;
            }
        }

        {
            // Payment rows fan out to every wallet that saw the spend.
            let mut stmt = self.conn.prepare(
                "INSERT OR IGNORE INTO payment
                     (wallet_id, spend_txid, output_index, dest_script, value, is_change)
                 SELECT DISTINCT t.wallet_id, ?1, ?2, ?3, ?4, ?5
                 FROM tx_data t WHERE t.spend_txid = ?1",
            )?;
            for record in payments {
                stmt.execute(params![
                    record.spend_txid.to_hex(),
                    record.output_index as i64,
                    record.dest_script.to_hex(),
                    record.value,
                    record.is_change as i64,
                ])?;
            }
        }

        Ok(())
    }

    // ── Sync State ──────────────────────────────────────────────────────

    /// Moves a wallet's tip to `new_tip`, provided its current tip hash is
    /// still `expected.hash`. The block locator is advanced alongside.
    pub fn advance_tip(
        &mut self,
        wallet_id: i64,
        expected: &HashHeight,
        new_tip: HashHeight,
    ) -> Result<(), WalletError> {
        let row = self.get_wallet_by_id(wallet_id)?;
        let tip = row.last_synced()?.unwrap_or_else(HashHeight::start);
        if tip.hash != expected.hash {
            return Err(WalletError::TipMismatch {
                wallet: row.name,
                expected: expected.to_string(),
            });
        }
        let locator = row.locator()?.advanced_to(new_tip);
        self.conn.execute(
            "UPDATE wallet SET last_block_synced_hash = ?1, last_block_synced_height = ?2,
                               block_locator = ?3
             WHERE wallet_id = ?4",
            params![new_tip.hash.to_hex(), new_tip.height, locator.to_text(), wallet_id],
        )?;
        Ok(())
    }

    /// Rewinds a wallet to `target` and returns the `(txid, creation_time)`
    /// pairs of transactions that dropped out of the confirmed chain.
    ///
    /// `target` must be the wallet's current tip, a recorded locator
    /// ancestor, or the pre-genesis start position; anything else fails so
    /// the projection can never be detached from an unknown point.
    pub fn rewind_to(
        &mut self,
        wallet_id: i64,
        target: &HashHeight,
    ) -> Result<Vec<(Txid, i64)>, WalletError> {
        let row = self.get_wallet_by_id(wallet_id)?;
        if *target != HashHeight::start() && !row.contains_block(target)? {
            return Err(WalletError::InvalidRewind {
                wallet: row.name,
                target: target.to_string(),
            });
        }

        // Outputs confirmed above the target drop out entirely.
        let mut unconfirmed: Vec<(Txid, i64)> = Vec::new();
        let mut seen: HashSet<Txid> = HashSet::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT output_txid, output_tx_time FROM tx_data
                 WHERE wallet_id = ?1 AND output_block_height > ?2",
            )?;
            let rows = stmt.query_map(params![wallet_id, target.height], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (txid, time) = row?;
                let txid = Txid::from_str(&txid)?;
                if seen.insert(txid) {
                    unconfirmed.push((txid, time));
                }
            }
        }

        // Spends confirmed above the target revert to unspent.
        let mut cleared_spends: Vec<String> = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT spend_txid, spend_tx_time FROM tx_data
                 WHERE wallet_id = ?1 AND spend_block_height > ?2",
            )?;
            let rows = stmt.query_map(params![wallet_id, target.height], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (txid_hex, time) = row?;
                let txid = Txid::from_str(&txid_hex)?;
                if seen.insert(txid) {
                    unconfirmed.push((txid, time));
                }
                cleared_spends.push(txid_hex);
            }
        }

        self.conn.execute(
            "DELETE FROM tx_data WHERE wallet_id = ?1 AND output_block_height > ?2",
            params![wallet_id, target.height],
        )?;
        self.conn.execute(
            "UPDATE tx_data SET spend_txid = NULL, spend_block_hash = NULL,
                 spend_block_height = NULL, spend_is_coinstake = NULL,
                 spend_tx_time = NULL, spend_total_out = NULL
             WHERE wallet_id = ?1 AND spend_block_height > ?2",
            params![wallet_id, target.height],
        )?;
        for txid in &cleared_spends {
            self.conn.execute(
                "DELETE FROM payment WHERE wallet_id = ?1 AND spend_txid = ?2",
                params![wallet_id, txid],
            )?;
        }

        let (hash, locator) = if *target == HashHeight::start() {
            (None, BlockLocator::default())
        } else {
            (Some(target.hash.to_hex()), row.locator()?.truncated_to(target.height))
        };
        self.conn.execute(
            "UPDATE wallet SET last_block_synced_hash = ?1, last_block_synced_height = ?2,
                               block_locator = ?3
             WHERE wallet_id = ?4",
            params![hash, target.height, locator.to_text(), wallet_id],
        )?;

        Ok(unconfirmed)
    }

    // ── Unconfirmed Maintenance ─────────────────────────────────────────

    /// Removes one unconfirmed transaction: its unconfirmed outputs are
    /// deleted and any unconfirmed spends it made are reverted. Confirmed
    /// rows are left untouched.
    pub fn remove_unconfirmed_transaction(
        &mut self,
        wallet_id: i64,
        txid: &Txid,
    ) -> Result<bool, WalletError> {
        let hex = txid.to_hex();
        let deleted = self.conn.execute(
            "DELETE FROM tx_data
             WHERE wallet_id = ?1 AND output_txid = ?2 AND output_block_height IS NULL",
            params![wallet_id, hex],
        )?;
        let cleared = self.conn.execute(
            "UPDATE tx_data SET spend_txid = NULL, spend_block_hash = NULL,
                 spend_block_height = NULL, spend_is_coinstake = NULL,
                 spend_tx_time = NULL, spend_total_out = NULL
             WHERE wallet_id = ?1 AND spend_txid = ?2 AND spend_block_height IS NULL",
            params![wallet_id, hex],
        )?;
        if cleared > 0 {
            self.conn.execute(
                "DELETE FROM payment WHERE wallet_id = ?1 AND spend_txid = ?2",
                params![wallet_id, hex],
            )?;
        }
        Ok(deleted > 0 || cleared > 0)
    }

    /// Removes every unconfirmed transaction of a wallet and returns their
    /// `(txid, creation_time)` pairs.
    pub fn remove_all_unconfirmed(
        &mut self,
        wallet_id: i64,
    ) -> Result<Vec<(Txid, i64)>, WalletError> {
        let mut removed: Vec<(Txid, i64)> = Vec::new();
        let mut seen: HashSet<Txid> = HashSet::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT output_txid, output_tx_time FROM tx_data
                 WHERE wallet_id = ?1 AND output_block_height IS NULL
                 UNION
                 SELECT DISTINCT spend_txid, spend_tx_time FROM tx_data
                 WHERE wallet_id = ?1 AND spend_txid IS NOT NULL AND spend_block_height IS NULL",
            )?;
            let rows = stmt.query_map(params![wallet_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (txid, time) = row?;
                let txid = Txid::from_str(&txid)?;
                if seen.insert(txid) {
                    removed.push((txid, time));
                }
            }
        }

        for (txid, _) in &removed {
            self.remove_unconfirmed_transaction(wallet_id, txid)?;
        }
        Ok(removed)
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn balance(
        &self,
        wallet_id: i64,
        account_index: Option<u32>,
        current_height: i64,
        min_confirmations: i64,
        coinbase_maturity: i64,
    ) -> Result<Balance, WalletError> {
        let max_confirmed_height = current_height + 1 - min_confirmations.max(1);
        let max_coinbase_height = current_height + 1 - coinbase_maturity;
        let account_filter = account_index.map(|a| a as i64).unwrap_or(-1);

        let balance = self.conn.query_row(
            "SELECT COALESCE(SUM(value), 0),
                    COALESCE(SUM(CASE WHEN output_block_height IS NOT NULL
                                      THEN value ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN output_block_height IS NOT NULL
                                       AND output_block_height <= ?3
                                       AND (is_coinbase = 0 OR output_block_height <= ?4)
                                      THEN value ELSE 0 END), 0)
             FROM tx_data
             WHERE wallet_id = ?1 AND spend_txid IS NULL AND (?2 < 0 OR account_index = ?2)",
            params![wallet_id, account_filter, max_confirmed_height, max_coinbase_height],
            |r| {
                Ok(Balance { total: r.get(0)?, confirmed: r.get(1)?, spendable: r.get(2)? })
            },
        )?;
        Ok(balance)
    }

    /// Unspent outputs meeting the confirmation and coinbase maturity
    /// thresholds, oldest first.
    pub fn spendable_outputs(
        &self,
        wallet_id: i64,
        account_index: u32,
        current_height: i64,
        min_confirmations: i64,
        coinbase_maturity: i64,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        let max_confirmed_height = current_height + 1 - min_confirmations.max(1);
        let max_coinbase_height = current_height + 1 - coinbase_maturity;
        let sql = format!(
            "SELECT {TX_DATA_COLUMNS} FROM tx_data
             WHERE wallet_id = ?1 AND account_index = ?2 AND spend_txid IS NULL
               AND output_block_height IS NOT NULL AND output_block_height <= ?3
               AND (is_coinbase = 0 OR output_block_height <= ?4)
             ORDER BY output_block_height, output_txid, output_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![wallet_id, account_index as i64, max_confirmed_height, max_coinbase_height],
            row_to_tx_data,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tracked output rows of an account, newest first.
    pub fn transaction_history(
        &self,
        wallet_id: i64,
        account_index: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        let account_filter = account_index.map(|a| a as i64).unwrap_or(-1);
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let sql = format!(
            "SELECT {TX_DATA_COLUMNS} FROM tx_data
             WHERE wallet_id = ?1 AND (?2 < 0 OR account_index = ?2)
             ORDER BY output_tx_time DESC, output_txid, output_index
             LIMIT ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows =
            stmt.query_map(params![wallet_id, account_filter, limit], row_to_tx_data)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tracked outputs consumed by the given transaction.
    pub fn transaction_inputs(
        &self,
        wallet_id: i64,
        txid: &Txid,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        let sql = format!(
            "SELECT {TX_DATA_COLUMNS} FROM tx_data
             WHERE wallet_id = ?1 AND spend_txid = ?2
             ORDER BY output_txid, output_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![wallet_id, txid.to_hex()], row_to_tx_data)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Tracked outputs created by the given transaction.
    pub fn transaction_outputs(
        &self,
        wallet_id: i64,
        txid: &Txid,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        let sql = format!(
            "SELECT {TX_DATA_COLUMNS} FROM tx_data
             WHERE wallet_id = ?1 AND output_txid = ?2
             ORDER BY output_index"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![wallet_id, txid.to_hex()], row_to_tx_data)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn payments_for(
        &self,
        wallet_id: i64,
        spend_txid: &Txid,
    ) -> Result<Vec<PaymentRow>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT wallet_id, spend_txid, output_index, dest_script, value, is_change
             FROM payment WHERE wallet_id = ?1 AND spend_txid = ?2
             ORDER BY output_index, dest_script",
        )?;
        let rows = stmt.query_map(params![wallet_id, spend_txid.to_hex()], row_to_payment)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// `(spend_txid, script)` pairs for every spent output of a wallet,
    /// used to cluster addresses that were spent together.
    pub fn spent_script_pairs(
        &self,
        wallet_id: i64,
    ) -> Result<Vec<(String, String)>, WalletError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT spend_txid, script_pub_key FROM tx_data
             WHERE wallet_id = ?1 AND spend_txid IS NOT NULL",
        )?;
        let rows = stmt.query_map(params![wallet_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn placeholders(count: usize) -> String {
    (1..=count).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdsync_types::BlockHash;

    fn store() -> WalletStore {
        WalletStore::open_in_memory().unwrap()
    }

    fn pos(tag: u8, height: i64) -> HashHeight {
        HashHeight::new(BlockHash::from_bytes([tag; 32]), height)
    }

    fn ident(wallet_id: i64, index: u32) -> AddressIdentifier {
        AddressIdentifier {
            wallet_id,
            account_index: 0,
            address_type: AddressType::External,
            address_index: index,
        }
    }

    fn output(
        wallet_id: i64,
        txid_tag: u8,
        value: i64,
        block: Option<HashHeight>,
    ) -> OutputRecord {
        OutputRecord {
            address: ident(wallet_id, 0),
            script_pub_key: Script::new(vec![txid_tag]),
            block,
            txid: Txid::from_bytes([txid_tag; 32]),
            output_index: 0,
            value,
            is_coinbase: false,
            creation_time: 100,
        }
    }

    #[test]
    fn test_create_wallet_duplicate_checks() {
        let mut store = store();
        store.create_wallet("w1", Some("seed-1"), None, 0).unwrap();

        let err = store.create_wallet("w1", None, None, 0).unwrap_err();
        assert!(matches!(err, WalletError::DuplicateWallet(_)));

        let err = store.create_wallet("w2", Some("seed-1"), None, 0).unwrap_err();
        assert!(matches!(err, WalletError::DuplicateSeed));
    }

    #[test]
    fn test_create_wallet_registers_rollback_action() {
        let mut store = store();
        store.begin().unwrap();
        store.create_wallet("w1", None, None, 0).unwrap();
        let actions = store.rollback().unwrap();
        assert_eq!(actions, vec![CompensatingAction::ForgetWallet("w1".into())]);
        assert!(store.get_wallet("w1").unwrap().is_none());
    }

    #[test]
    fn test_commit_discards_rollback_actions() {
        let mut store = store();
        store.begin().unwrap();
        store.create_wallet("w1", None, None, 0).unwrap();
        store.defer_on_commit(CompensatingAction::RemoveFile("w1.bak".into()));
        let actions = store.commit().unwrap();
        assert_eq!(actions, vec![CompensatingAction::RemoveFile("w1.bak".into())]);
        assert!(store.get_wallet("w1").unwrap().is_some());
    }

    #[test]
    fn test_account_duplicate_checks() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store.create_account(w.wallet_id, 0, "account 0", Some("xpub-a"), 0).unwrap();

        let err = store.create_account(w.wallet_id, 0, "other", None, 0).unwrap_err();
        assert!(matches!(err, WalletError::DuplicateAccountIndex(0)));

        let w2 = store.create_wallet("w2", None, None, 0).unwrap();
        let err = store.create_account(w2.wallet_id, 0, "account 0", Some("xpub-a"), 0).unwrap_err();
        assert!(matches!(err, WalletError::DuplicateExtPubKey));
    }

    #[test]
    fn test_confirmed_output_overwrites_unconfirmed() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();

        store.apply_projection(&[output(w.wallet_id, 1, 500, None)], &[], &[]).unwrap();
        let rows = store.transaction_outputs(w.wallet_id, &Txid::from_bytes([1; 32])).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].output_block_height.is_none());

        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(9, 5)))], &[], &[])
            .unwrap();
        let rows = store.transaction_outputs(w.wallet_id, &Txid::from_bytes([1; 32])).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].output_block_height, Some(5));

        // A late mempool sighting never downgrades the confirmed row.
        store.apply_projection(&[output(w.wallet_id, 1, 500, None)], &[], &[]).unwrap();
        let rows = store.transaction_outputs(w.wallet_id, &Txid::from_bytes([1; 32])).unwrap();
        assert_eq!(rows[0].output_block_height, Some(5));
    }

    #[test]
    fn test_spend_and_balance() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();

        store
            .apply_projection(
                &[
                    output(w.wallet_id, 1, 500, Some(pos(9, 5))),
                    output(w.wallet_id, 2, 300, None),
                ],
                &[],
                &[],
            )
            .unwrap();

        let balance = store.balance(w.wallet_id, None, 10, 1, 100).unwrap();
        assert_eq!(balance.total, 800);
        assert_eq!(balance.confirmed, 500);
        assert_eq!(balance.spendable, 500);

        let spend = SpendRecord {
            address: ident(w.wallet_id, 0),
            spent_outpoint: OutPoint::new(Txid::from_bytes([1; 32]), 0),
            block: Some(pos(10, 6)),
            spend_txid: Txid::from_bytes([3; 32]),
            is_coinstake: false,
            spend_time: 200,
            total_out: 450,
        };
        store.apply_projection(&[], &[spend], &[]).unwrap();

        let balance = store.balance(w.wallet_id, None, 10, 1, 100).unwrap();
        assert_eq!(balance.total, 300);
        assert_eq!(balance.confirmed, 0);

        let inputs = store.transaction_inputs(w.wallet_id, &Txid::from_bytes([3; 32])).unwrap();
        assert_eq!(inputs.len(), 1);
        assert_eq!(inputs[0].value, 500);
    }

    #[test]
    fn test_coinbase_maturity_gates_spendable() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        let mut coinbase = output(w.wallet_id, 1, 50, Some(pos(9, 5)));
        coinbase.is_coinbase = true;
        store.apply_projection(&[coinbase], &[], &[]).unwrap();

        // Height 10: only 6 confirmations, maturity of 10 not met.
        let balance = store.balance(w.wallet_id, None, 10, 1, 10).unwrap();
        assert_eq!(balance.confirmed, 50);
        assert_eq!(balance.spendable, 0);

        let balance = store.balance(w.wallet_id, None, 14, 1, 10).unwrap();
        assert_eq!(balance.spendable, 50);
        assert_eq!(store.spendable_outputs(w.wallet_id, 0, 14, 1, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_advance_tip_requires_matching_parent() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();

        store.advance_tip(w.wallet_id, &HashHeight::start(), pos(1, 0)).unwrap();
        store.advance_tip(w.wallet_id, &pos(1, 0), pos(2, 1)).unwrap();

        let err = store.advance_tip(w.wallet_id, &pos(1, 0), pos(3, 2)).unwrap_err();
        assert!(matches!(err, WalletError::TipMismatch { .. }));

        let row = store.get_wallet("w1").unwrap().unwrap();
        assert_eq!(row.last_synced().unwrap(), Some(pos(2, 1)));
        assert!(row.locator().unwrap().contains(&pos(1, 0)));
    }

    #[test]
    fn test_rewind_fail_closed() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store.advance_tip(w.wallet_id, &HashHeight::start(), pos(1, 0)).unwrap();
        store.advance_tip(w.wallet_id, &pos(1, 0), pos(2, 1)).unwrap();

        let err = store.rewind_to(w.wallet_id, &pos(9, 1)).unwrap_err();
        assert!(matches!(err, WalletError::InvalidRewind { .. }));
    }

    #[test]
    fn test_rewind_drops_and_reverts() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        for h in 0..6 {
            let prev = if h == 0 { HashHeight::start() } else { pos(h as u8, h - 1) };
            store.advance_tip(w.wallet_id, &prev, pos(h as u8 + 1, h)).unwrap();
        }

        // Output at height 2, spent at height 5; second output at height 5.
        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(3, 2)))], &[], &[])
            .unwrap();
        let spend = SpendRecord {
            address: ident(w.wallet_id, 0),
            spent_outpoint: OutPoint::new(Txid::from_bytes([1; 32]), 0),
            block: Some(pos(6, 5)),
            spend_txid: Txid::from_bytes([3; 32]),
            is_coinstake: false,
            spend_time: 200,
            total_out: 450,
        };
        store
            .apply_projection(&[output(w.wallet_id, 4, 80, Some(pos(6, 5)))], &[spend], &[])
            .unwrap();

        let removed = store.rewind_to(w.wallet_id, &pos(4, 3)).unwrap();
        let txids: HashSet<Txid> = removed.iter().map(|(t, _)| *t).collect();
        assert!(txids.contains(&Txid::from_bytes([3; 32])));
        assert!(txids.contains(&Txid::from_bytes([4; 32])));

        // The old output is unspent again; the height-5 output is gone.
        let rows = store.transaction_outputs(w.wallet_id, &Txid::from_bytes([1; 32])).unwrap();
        assert!(!rows[0].is_spent());
        assert!(store
            .transaction_outputs(w.wallet_id, &Txid::from_bytes([4; 32]))
            .unwrap()
            .is_empty());

        let row = store.get_wallet("w1").unwrap().unwrap();
        assert_eq!(row.last_synced().unwrap(), Some(pos(4, 3)));
    }

    #[test]
    fn test_rewind_to_start_clears_everything() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store.advance_tip(w.wallet_id, &HashHeight::start(), pos(1, 0)).unwrap();
        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(1, 0)))], &[], &[])
            .unwrap();

        store.rewind_to(w.wallet_id, &HashHeight::start()).unwrap();
        let row = store.get_wallet("w1").unwrap().unwrap();
        assert_eq!(row.last_synced().unwrap(), None);
        assert_eq!(row.last_block_synced_height, -1);
    }

    #[test]
    fn test_remove_unconfirmed_transaction() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(1, 0)))], &[], &[])
            .unwrap();
        let spend = SpendRecord {
            address: ident(w.wallet_id, 0),
            spent_outpoint: OutPoint::new(Txid::from_bytes([1; 32]), 0),
            block: None,
            spend_txid: Txid::from_bytes([3; 32]),
            is_coinstake: false,
            spend_time: 200,
            total_out: 450,
        };
        store
            .apply_projection(&[output(w.wallet_id, 3, 90, None)], &[spend], &[])
            .unwrap();

        assert!(store
            .remove_unconfirmed_transaction(w.wallet_id, &Txid::from_bytes([3; 32]))
            .unwrap());

        let rows = store.transaction_outputs(w.wallet_id, &Txid::from_bytes([1; 32])).unwrap();
        assert!(!rows[0].is_spent());
        assert!(store
            .transaction_outputs(w.wallet_id, &Txid::from_bytes([3; 32]))
            .unwrap()
            .is_empty());

        // Confirmed rows are not eligible.
        assert!(!store
            .remove_unconfirmed_transaction(w.wallet_id, &Txid::from_bytes([1; 32]))
            .unwrap());
    }

    #[test]
    fn test_remove_all_unconfirmed() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store
            .apply_projection(
                &[
                    output(w.wallet_id, 1, 500, Some(pos(1, 0))),
                    output(w.wallet_id, 2, 300, None),
                ],
                &[],
                &[],
            )
            .unwrap();

        let removed = store.remove_all_unconfirmed(w.wallet_id).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, Txid::from_bytes([2; 32]));
        assert_eq!(store.balance(w.wallet_id, None, 10, 1, 100).unwrap().total, 500);
    }

    #[test]
    fn test_unused_and_used_addresses() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        let rows: Vec<AddressRow> = (0..5)
            .map(|i| AddressRow {
                wallet_id: w.wallet_id,
                account_index: 0,
                address_type: AddressType::External,
                address_index: i,
                script_pub_key: format!("{i:02x}"),
            })
            .collect();
        store.insert_addresses(&rows).unwrap();
        assert_eq!(store.next_address_index(w.wallet_id, 0, AddressType::External).unwrap(), 5);

        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(1, 0)))], &[], &[])
            .unwrap();

        let unused = store.unused_addresses(w.wallet_id, 0, AddressType::External, 3).unwrap();
        let indexes: Vec<u32> = unused.iter().map(|a| a.address_index).collect();
        assert_eq!(indexes, vec![1, 2, 3]);

        let used = store.used_addresses(w.wallet_id, 0, AddressType::External).unwrap();
        assert_eq!(used.len(), 1);
        assert_eq!(used[0].address.address_index, 0);
        assert_eq!(used[0].balance, 500);
        assert_eq!(used[0].total_received, 500);
    }

    #[test]
    fn test_interest_loading_round_trip() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store.insert_addresses(&[AddressRow {
            wallet_id: w.wallet_id,
            account_index: 0,
            address_type: AddressType::External,
            address_index: 0,
            script_pub_key: "aa".into(),
        }]).unwrap();
        store
            .apply_projection(&[output(w.wallet_id, 1, 500, Some(pos(1, 0)))], &[], &[])
            .unwrap();

        let scripts = store.address_entries(&[w.wallet_id]).unwrap();
        assert_eq!(scripts.len(), 1);
        assert_eq!(scripts[0].0, Script::new(vec![0xaa]));

        let outpoints = store.outpoint_entries(&[w.wallet_id]).unwrap();
        assert_eq!(outpoints.len(), 1);
        assert_eq!(outpoints[0].0, OutPoint::new(Txid::from_bytes([1; 32]), 0));
        assert!(store.address_entries(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_wallet_removes_all_rows() {
        let mut store = store();
        let w = store.create_wallet("w1", None, None, 0).unwrap();
        store.create_account(w.wallet_id, 0, "account 0", None, 0).unwrap();
        store
            .apply_projection(&[output(w.wallet_id, 1, 500, None)], &[], &[])
            .unwrap();

        store.delete_wallet(w.wallet_id).unwrap();
        assert!(store.get_wallet("w1").unwrap().is_none());
        assert!(store.outpoint_entries(&[w.wallet_id]).unwrap().is_empty());
    }
}
