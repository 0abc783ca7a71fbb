//! The wallet repository facade.
//!
//! One repository manages any number of wallets, either sharing a single
//! database file or, with `database_per_wallet`, giving each wallet its own
//! file so block processing can run one round per wallet in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use hdsync_chain::{ChainSource, DestinationReader, ScriptDeriver};
use hdsync_types::constants::SPECIAL_ACCOUNT_BASE;
use hdsync_types::{AddressType, Block, HashHeight, Script, Transaction, Txid};

use crate::account::{AddressIdentifier, WalletSnapshot};
use crate::error::WalletError;
use crate::projector::OutputRecord;
use crate::round::{RoundContext, RoundState, WalletContainer};
use crate::schema::{AccountRow, AddressRow, PaymentRow, TxDataRow, WalletRow};
use crate::store::{AddressUsage, Balance, CompensatingAction, WalletStore};

const SHARED_DB_NAME: &str = "wallets.db";

/// Access to the reserved account range.
///
/// Account indexes at or above `SPECIAL_ACCOUNT_BASE` never appear in the
/// ordinary account listing and can only be reached through this trait, so
/// a caller holding only the plain repository surface cannot touch them.
pub trait SpecialAccounts {
    /// Returns the special account at `account_index`, creating it with the
    /// given name and key on first use.
    fn ensure_special_account(
        &self,
        wallet_name: &str,
        account_index: u32,
        account_name: &str,
        ext_pub_key: Option<&str>,
    ) -> Result<AccountRow, WalletError>;

    fn special_account(
        &self,
        wallet_name: &str,
        account_index: u32,
    ) -> Result<Option<AccountRow>, WalletError>;
}

pub struct WalletRepository {
    dir: PathBuf,
    database_per_wallet: bool,
    lookahead: u32,
    destination_reader: Box<dyn DestinationReader>,
    deriver: Box<dyn ScriptDeriver>,
    test_mode: bool,
    containers: RwLock<HashMap<String, Arc<WalletContainer>>>,
    shared_round: Option<Arc<RoundState>>,
    /// Serializes whole block-processing passes.
    process_lock: Mutex<()>,
}

impl WalletRepository {
    /// Opens the repository rooted at `dir`, loading every wallet already
    /// present there.
    pub fn open(
        dir: &Path,
        database_per_wallet: bool,
        lookahead: u32,
        destination_reader: Box<dyn DestinationReader>,
        deriver: Box<dyn ScriptDeriver>,
    ) -> Result<Self, WalletError> {
        std::fs::create_dir_all(dir)?;
        let repo = WalletRepository {
            dir: dir.to_path_buf(),
            database_per_wallet,
            lookahead,
            destination_reader,
            deriver,
            test_mode: false,
            containers: RwLock::new(HashMap::new()),
            shared_round: None,
            process_lock: Mutex::new(()),
        };

        let mut containers = HashMap::new();
        let shared_round = if database_per_wallet {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map(|e| e == "db").unwrap_or(false) {
                    let store = WalletStore::open(&path)?;
                    let rows = store.list_wallets()?;
                    let round = RoundState::new(store);
                    for row in rows {
                        let container = Self::container_for(&row, Arc::clone(&round))?;
                        containers.insert(row.name.clone(), container);
                    }
                }
            }
            None
        } else {
            let store = WalletStore::open(&dir.join(SHARED_DB_NAME))?;
            let rows = store.list_wallets()?;
            let round = RoundState::new(store);
            for row in rows {
                let container = Self::container_for(&row, Arc::clone(&round))?;
                containers.insert(row.name.clone(), container);
            }
            Some(round)
        };

        *repo.containers.write().expect("containers lock") = containers;
        Ok(WalletRepository { shared_round, ..repo })
    }

    /// Lifts the watch-only restriction on address and transaction imports.
    /// Test fixtures use this to seed keyed accounts with external data.
    pub fn set_test_mode(&mut self, enabled: bool) {
        self.test_mode = enabled;
    }

    fn container_for(
        row: &WalletRow,
        round: Arc<RoundState>,
    ) -> Result<Arc<WalletContainer>, WalletError> {
        let tip = row.last_synced()?.unwrap_or_else(HashHeight::start);
        Ok(Arc::new(WalletContainer::new(
            WalletSnapshot { wallet_id: row.wallet_id, name: row.name.clone(), tip },
            round,
        )))
    }

    fn ctx(&self) -> RoundContext<'_> {
        RoundContext {
            destination_reader: self.destination_reader.as_ref(),
            deriver: self.deriver.as_ref(),
            lookahead: self.lookahead,
        }
    }

    fn container(&self, name: &str) -> Result<Arc<WalletContainer>, WalletError> {
        self.containers
            .read()
            .expect("containers lock")
            .get(name)
            .cloned()
            .ok_or_else(|| WalletError::UnknownWallet(name.to_string()))
    }

    /// Containers grouped by the round (and so the database) they share.
    fn rounds(&self) -> Vec<(Arc<RoundState>, Vec<Arc<WalletContainer>>)> {
        let containers = self.containers.read().expect("containers lock");
        let mut groups: Vec<(Arc<RoundState>, Vec<Arc<WalletContainer>>)> = Vec::new();
        for container in containers.values() {
            let round = Arc::clone(&container.round);
            match groups.iter_mut().find(|(r, _)| Arc::ptr_eq(r, &round)) {
                Some((_, group)) => group.push(Arc::clone(container)),
                None => groups.push((round, vec![Arc::clone(container)])),
            }
        }
        groups
    }

    fn round_members(&self, round: &Arc<RoundState>) -> Vec<Arc<WalletContainer>> {
        self.containers
            .read()
            .expect("containers lock")
            .values()
            .filter(|c| Arc::ptr_eq(&c.round, round))
            .cloned()
            .collect()
    }

    fn run_actions(&self, actions: Vec<CompensatingAction>) {
        for action in actions {
            match action {
                CompensatingAction::ForgetWallet(name) => {
                    self.containers.write().expect("containers lock").remove(&name);
                }
                CompensatingAction::RemoveFile(path) => {
                    if let Err(e) = std::fs::remove_file(&path) {
                        log::warn!("could not remove {}: {e}", path.display());
                    }
                }
                CompensatingAction::RestoreFile { from, to } => {
                    if let Err(e) = std::fs::rename(&from, &to) {
                        log::warn!("could not restore {}: {e}", to.display());
                    }
                }
            }
        }
    }

    /// Flushes any open batch on the wallet's round, takes the wallet's
    /// update lock, and runs `f` against the store. The snapshot is
    /// refreshed afterwards.
    fn exclusive<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut WalletStore, &WalletRow) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let container = self.container(name)?;
        let members = self.round_members(&container.round);
        container.round.process_block(None, &members, &self.ctx())?;

        container.update_lock.acquire();
        let result = (|| {
            let mut store = container.round.store().lock().expect("store lock");
            let row = store.get_wallet_required(name)?;
            let result = f(&mut store, &row)?;
            // The wallet may no longer exist, e.g. after deletion.
            if let Some(row) = store.get_wallet(name)? {
                let tip = row.last_synced()?.unwrap_or_else(HashHeight::start);
                container.set_snapshot(WalletSnapshot {
                    wallet_id: row.wallet_id,
                    name: row.name,
                    tip,
                });
            }
            Ok(result)
        })();
        container.update_lock.release();
        result
    }

    fn with_read<R>(
        &self,
        name: &str,
        f: impl FnOnce(&WalletStore, &WalletRow) -> Result<R, WalletError>,
    ) -> Result<R, WalletError> {
        let container = self.container(name)?;
        let _guard = container.read();
        let store = container.round.store().lock().expect("store lock");
        let row = store.get_wallet_required(name)?;
        f(&store, &row)
    }

    // ── Wallet Lifecycle ────────────────────────────────────────────────

    pub fn create_wallet(
        &self,
        name: &str,
        encrypted_seed: Option<&str>,
        chain_code: Option<&str>,
        creation_time: i64,
    ) -> Result<WalletRow, WalletError> {
        if self.containers.read().expect("containers lock").contains_key(name) {
            return Err(WalletError::DuplicateWallet(name.to_string()));
        }
        // A same-seed wallet may live in another database file.
        if let Some(seed) = encrypted_seed {
            for (round, _) in self.rounds() {
                let store = round.store().lock().expect("store lock");
                if store.list_wallets()?.iter().any(|w| {
                    w.encrypted_seed.as_deref() == Some(seed)
                }) {
                    return Err(WalletError::DuplicateSeed);
                }
            }
        }

        let round = if self.database_per_wallet {
            let path = self.wallet_db_path(name);
            RoundState::new(WalletStore::open(&path)?)
        } else {
            Arc::clone(self.shared_round.as_ref().expect("shared round"))
        };

        let mut store = round.store().lock().expect("store lock");
        store.begin()?;
        let row = match store.create_wallet(name, encrypted_seed, chain_code, creation_time) {
            Ok(row) => row,
            Err(e) => {
                let actions = store.rollback()?;
                drop(store);
                self.run_actions(actions);
                if self.database_per_wallet {
                    let _ = std::fs::remove_file(self.wallet_db_path(name));
                }
                return Err(e);
            }
        };
        let actions = store.commit()?;
        drop(store);
        self.run_actions(actions);

        let container = Self::container_for(&row, round)?;
        self.containers
            .write()
            .expect("containers lock")
            .insert(name.to_string(), container);
        log::info!("created wallet '{name}'");
        Ok(row)
    }

    /// Deletes a wallet and everything it tracks.
    ///
    /// With `database_per_wallet` the database file is first staged to a
    /// `.bak` name; the stage is removed once the row deletion commits and
    /// moved back if it rolls back.
    pub fn delete_wallet(&self, name: &str) -> Result<(), WalletError> {
        let actions = self.exclusive(name, |store, row| {
            if self.database_per_wallet {
                if let Some(path) = store.path().map(Path::to_path_buf) {
                    let staged = path.with_extension("db.bak");
                    std::fs::rename(&path, &staged)?;
                    store.defer_on_commit(CompensatingAction::RemoveFile(staged.clone()));
                    store.defer_on_rollback(CompensatingAction::RestoreFile {
                        from: staged,
                        to: path,
                    });
                }
            }
            store.begin()?;
            match store.delete_wallet(row.wallet_id) {
                Ok(()) => {
                    store.defer_on_commit(CompensatingAction::ForgetWallet(
                        row.name.clone(),
                    ));
                    store.commit()
                }
                Err(e) => {
                    let actions = store.rollback()?;
                    self.run_actions(actions);
                    Err(e)
                }
            }
        });
        match actions {
            Ok(actions) => {
                self.run_actions(actions);
                log::info!("deleted wallet '{name}'");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn wallet_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.containers.read().expect("containers lock").keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_wallet(&self, name: &str) -> Result<WalletRow, WalletError> {
        self.with_read(name, |_, row| Ok(row.clone()))
    }

    /// The wallet's published sync position.
    pub fn wallet_tip(&self, name: &str) -> Result<HashHeight, WalletError> {
        Ok(self.container(name)?.snapshot().tip)
    }

    // ── Accounts and Addresses ──────────────────────────────────────────

    /// Creates an ordinary account. With key material present the first
    /// lookahead window of addresses is generated for both chains.
    pub fn create_account(
        &self,
        wallet_name: &str,
        account_index: u32,
        account_name: &str,
        ext_pub_key: Option<&str>,
        creation_time: i64,
    ) -> Result<AccountRow, WalletError> {
        if account_index >= SPECIAL_ACCOUNT_BASE {
            return Err(WalletError::ReservedAccountIndex(account_index));
        }
        self.create_account_unchecked(
            wallet_name,
            account_index,
            account_name,
            ext_pub_key,
            creation_time,
        )
    }

    fn create_account_unchecked(
        &self,
        wallet_name: &str,
        account_index: u32,
        account_name: &str,
        ext_pub_key: Option<&str>,
        creation_time: i64,
    ) -> Result<AccountRow, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            store.begin()?;
            let result = (|| {
                let account = store.create_account(
                    row.wallet_id,
                    account_index,
                    account_name,
                    ext_pub_key,
                    creation_time,
                )?;
                if let Some(xpub) = ext_pub_key {
                    let initial = self.derive_rows(
                        row.wallet_id,
                        account_index,
                        xpub,
                        AddressType::External,
                        0..self.lookahead,
                    );
                    store.insert_addresses(&initial)?;
                    let initial = self.derive_rows(
                        row.wallet_id,
                        account_index,
                        xpub,
                        AddressType::Internal,
                        0..self.lookahead,
                    );
                    store.insert_addresses(&initial)?;
                }
                Ok(account)
            })();
            match result {
                Ok(account) => {
                    store.commit()?;
                    Ok(account)
                }
                Err(e) => {
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }

    fn derive_rows(
        &self,
        wallet_id: i64,
        account_index: u32,
        xpub: &str,
        address_type: AddressType,
        indexes: std::ops::Range<u32>,
    ) -> Vec<AddressRow> {
        indexes
            .map(|index| AddressRow {
                wallet_id,
                account_index,
                address_type,
                address_index: index,
                script_pub_key: self.deriver.derive(xpub, address_type, index).to_hex(),
            })
            .collect()
    }

    /// Ordinary accounts of a wallet; the special range is not listed.
    pub fn get_accounts(&self, wallet_name: &str) -> Result<Vec<AccountRow>, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.list_accounts(row.wallet_id, SPECIAL_ACCOUNT_BASE)
        })
    }

    pub fn get_account(
        &self,
        wallet_name: &str,
        account_index: u32,
    ) -> Result<AccountRow, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.get_account(row.wallet_id, account_index)?.ok_or_else(|| {
                WalletError::UnknownAccount {
                    wallet: wallet_name.to_string(),
                    account: account_index.to_string(),
                }
            })
        })
    }

    /// Registers externally-derived scripts on a watch-only account.
    pub fn add_watch_only_addresses(
        &self,
        wallet_name: &str,
        account_index: u32,
        address_type: AddressType,
        scripts: &[Script],
    ) -> Result<(), WalletError> {
        self.exclusive(wallet_name, |store, row| {
            let account = store.get_account(row.wallet_id, account_index)?.ok_or_else(|| {
                WalletError::UnknownAccount {
                    wallet: wallet_name.to_string(),
                    account: account_index.to_string(),
                }
            })?;
            if !account.is_watch_only() && !self.test_mode {
                return Err(WalletError::WatchOnly("addresses"));
            }
            let mut next = store.next_address_index(row.wallet_id, account_index, address_type)?;
            let rows: Vec<AddressRow> = scripts
                .iter()
                .map(|script| {
                    let address_index = next;
                    next += 1;
                    AddressRow {
                        wallet_id: row.wallet_id,
                        account_index,
                        address_type,
                        address_index,
                        script_pub_key: script.to_hex(),
                    }
                })
                .collect();
            store.insert_addresses(&rows)
        })
    }

    /// Records externally-observed transactions against a watch-only
    /// account.
    ///
    /// Outputs paying one of the account's registered scripts are stored as
    /// unconfirmed records; everything else in the transactions is ignored.
    /// Returns the number of records stored.
    pub fn add_watch_only_transactions(
        &self,
        wallet_name: &str,
        account_index: u32,
        txs: &[Transaction],
    ) -> Result<usize, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            let account = store.get_account(row.wallet_id, account_index)?.ok_or_else(|| {
                WalletError::UnknownAccount {
                    wallet: wallet_name.to_string(),
                    account: account_index.to_string(),
                }
            })?;
            if !account.is_watch_only() && !self.test_mode {
                return Err(WalletError::WatchOnly("transactions"));
            }

            let mut by_script: HashMap<String, AddressIdentifier> = HashMap::new();
            for address_type in [AddressType::External, AddressType::Internal] {
                for address in store.addresses(row.wallet_id, account_index, address_type)? {
                    by_script.insert(
                        address.script_pub_key.clone(),
                        AddressIdentifier {
                            wallet_id: row.wallet_id,
                            account_index,
                            address_type,
                            address_index: address.address_index,
                        },
                    );
                }
            }

            let mut outputs = Vec::new();
            for tx in txs {
                for (index, out) in tx.outputs.iter().enumerate() {
                    if out.is_empty() || out.script_pub_key.is_op_return() {
                        continue;
                    }
                    let Some(address) = by_script.get(&out.script_pub_key.to_hex()) else {
                        continue;
                    };
                    outputs.push(OutputRecord {
                        address: *address,
                        script_pub_key: out.script_pub_key.clone(),
                        block: None,
                        txid: tx.txid,
                        output_index: index as u32,
                        value: out.value,
                        is_coinbase: tx.is_coinbase || tx.is_coinstake,
                        creation_time: tx.time,
                    });
                }
            }
            if outputs.is_empty() {
                return Ok(0);
            }

            store.begin()?;
            match store.apply_projection(&outputs, &[], &[]) {
                Ok(()) => {
                    store.commit()?;
                    Ok(outputs.len())
                }
                Err(e) => {
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }

    /// First `count` never-used addresses, topping the chain up so the full
    /// lookahead window extends past the last one returned.
    pub fn get_unused_addresses(
        &self,
        wallet_name: &str,
        account_index: u32,
        address_type: AddressType,
        count: usize,
    ) -> Result<Vec<AddressRow>, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            let account = store.get_account(row.wallet_id, account_index)?.ok_or_else(|| {
                WalletError::UnknownAccount {
                    wallet: wallet_name.to_string(),
                    account: account_index.to_string(),
                }
            })?;

            let mut unused =
                store.unused_addresses(row.wallet_id, account_index, address_type, count)?;
            if let Some(xpub) = &account.ext_pub_key {
                if unused.len() < count {
                    let next =
                        store.next_address_index(row.wallet_id, account_index, address_type)?;
                    let missing = (count - unused.len()) as u32;
                    let rows = self.derive_rows(
                        row.wallet_id,
                        account_index,
                        xpub,
                        address_type,
                        next..next + missing,
                    );
                    store.insert_addresses(&rows)?;
                    unused = store.unused_addresses(
                        row.wallet_id,
                        account_index,
                        address_type,
                        count,
                    )?;
                }
                if let Some(last) = unused.last() {
                    let next =
                        store.next_address_index(row.wallet_id, account_index, address_type)?;
                    let target = last.address_index + self.lookahead;
                    if next <= target {
                        let rows = self.derive_rows(
                            row.wallet_id,
                            account_index,
                            xpub,
                            address_type,
                            next..target + 1,
                        );
                        store.insert_addresses(&rows)?;
                    }
                }
            }
            Ok(unused)
        })
    }

    pub fn get_used_addresses(
        &self,
        wallet_name: &str,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<Vec<AddressUsage>, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.used_addresses(row.wallet_id, account_index, address_type)
        })
    }

    pub fn get_addresses(
        &self,
        wallet_name: &str,
        account_index: u32,
        address_type: AddressType,
    ) -> Result<Vec<AddressRow>, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.addresses(row.wallet_id, account_index, address_type)
        })
    }

    // ── Ingestion ───────────────────────────────────────────────────────

    pub fn process_block(&self, block: &Block) -> Result<(), WalletError> {
        self.process_blocks(std::slice::from_ref(block))
    }

    /// Processes an ordered run of blocks against every wallet.
    ///
    /// Wallets in separate databases are handled by separate rounds, one
    /// thread per round. Each round admits the wallets whose tip matches a
    /// block's parent and flushes its batch as triggers fire; an
    /// end-of-stream sentinel flushes whatever remains.
    pub fn process_blocks(&self, blocks: &[Block]) -> Result<(), WalletError> {
        let _serial = self.process_lock.lock().expect("process lock");
        let groups = self.rounds();
        let ctx = self.ctx();

        if groups.len() <= 1 {
            for (round, members) in &groups {
                for block in blocks {
                    round.process_block(Some(block), members, &ctx)?;
                }
                round.process_block(None, members, &ctx)?;
            }
            return Ok(());
        }

        std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for (round, members) in &groups {
                let ctx = &ctx;
                handles.push(scope.spawn(move || -> Result<(), WalletError> {
                    for block in blocks {
                        round.process_block(Some(block), members, ctx)?;
                    }
                    round.process_block(None, members, ctx)
                }));
            }
            let mut first_error = None;
            for handle in handles {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        first_error.get_or_insert(WalletError::Lock(
                            "block processing thread panicked".to_string(),
                        ));
                    }
                }
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    /// Projects one mempool transaction against a single wallet.
    pub fn process_transaction(
        &self,
        wallet_name: &str,
        tx: &Transaction,
        fixed_txid: Option<Txid>,
    ) -> Result<bool, WalletError> {
        let container = self.container(wallet_name)?;
        container.round.process_transaction(&container, tx, fixed_txid, &self.ctx())
    }

    /// Rewinds a wallet to `target` and returns the `(txid, creation_time)`
    /// pairs of transactions that fell out of the confirmed chain.
    pub fn rewind_wallet(
        &self,
        wallet_name: &str,
        target: &HashHeight,
    ) -> Result<Vec<(Txid, i64)>, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            store.begin()?;
            match store.rewind_to(row.wallet_id, target) {
                Ok(removed) => {
                    store.commit()?;
                    log::info!(
                        "rewound wallet '{wallet_name}' to height {}",
                        target.height
                    );
                    Ok(removed)
                }
                Err(e) => {
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }

    /// Walks the wallet's block locator against the chain and returns the
    /// most recent position both still agree on.
    pub fn find_fork(
        &self,
        wallet_name: &str,
        chain: &dyn ChainSource,
    ) -> Result<Option<HashHeight>, WalletError> {
        let locator = self.with_read(wallet_name, |_, row| row.locator())?;
        for entry in &locator.0 {
            if let Some(header) = chain.ancestor(entry.height) {
                if header.hash == entry.hash {
                    return Ok(Some(*entry));
                }
            }
        }
        Ok(None)
    }

    pub fn remove_unconfirmed_transaction(
        &self,
        wallet_name: &str,
        txid: &Txid,
    ) -> Result<bool, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            store.begin()?;
            match store.remove_unconfirmed_transaction(row.wallet_id, txid) {
                Ok(removed) => {
                    store.commit()?;
                    Ok(removed)
                }
                Err(e) => {
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }

    pub fn remove_all_unconfirmed_transactions(
        &self,
        wallet_name: &str,
    ) -> Result<Vec<(Txid, i64)>, WalletError> {
        self.exclusive(wallet_name, |store, row| {
            store.begin()?;
            match store.remove_all_unconfirmed(row.wallet_id) {
                Ok(removed) => {
                    store.commit()?;
                    Ok(removed)
                }
                Err(e) => {
                    let _ = store.rollback();
                    Err(e)
                }
            }
        })
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn get_wallet_balance(
        &self,
        wallet_name: &str,
        current_height: i64,
        min_confirmations: i64,
        coinbase_maturity: i64,
    ) -> Result<Balance, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.balance(row.wallet_id, None, current_height, min_confirmations, coinbase_maturity)
        })
    }

    pub fn get_account_balance(
        &self,
        wallet_name: &str,
        account_index: u32,
        current_height: i64,
        min_confirmations: i64,
        coinbase_maturity: i64,
    ) -> Result<Balance, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.balance(
                row.wallet_id,
                Some(account_index),
                current_height,
                min_confirmations,
                coinbase_maturity,
            )
        })
    }

    pub fn get_spendable_transactions(
        &self,
        wallet_name: &str,
        account_index: u32,
        current_height: i64,
        min_confirmations: i64,
        coinbase_maturity: i64,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.spendable_outputs(
                row.wallet_id,
                account_index,
                current_height,
                min_confirmations,
                coinbase_maturity,
            )
        })
    }

    pub fn get_history(
        &self,
        wallet_name: &str,
        account_index: Option<u32>,
        limit: Option<usize>,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        self.with_read(wallet_name, |store, row| {
            store.transaction_history(row.wallet_id, account_index, limit)
        })
    }

    pub fn get_transaction_inputs(
        &self,
        wallet_name: &str,
        txid: &Txid,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        self.with_read(wallet_name, |store, row| store.transaction_inputs(row.wallet_id, txid))
    }

    pub fn get_transaction_outputs(
        &self,
        wallet_name: &str,
        txid: &Txid,
    ) -> Result<Vec<TxDataRow>, WalletError> {
        self.with_read(wallet_name, |store, row| store.transaction_outputs(row.wallet_id, txid))
    }

    pub fn get_payments(
        &self,
        wallet_name: &str,
        spend_txid: &Txid,
    ) -> Result<Vec<PaymentRow>, WalletError> {
        self.with_read(wallet_name, |store, row| store.payments_for(row.wallet_id, spend_txid))
    }

    /// Clusters the wallet's scripts into groups that provably belong to
    /// the same owner because they were spent by the same transaction.
    pub fn get_address_groupings(
        &self,
        wallet_name: &str,
    ) -> Result<Vec<Vec<Script>>, WalletError> {
        let pairs =
            self.with_read(wallet_name, |store, row| store.spent_script_pairs(row.wallet_id))?;

        let mut scripts: Vec<String> = Vec::new();
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut parent: Vec<usize> = Vec::new();

        fn find(parent: &mut Vec<usize>, i: usize) -> usize {
            if parent[i] != i {
                let root = find(parent, parent[i]);
                parent[i] = root;
            }
            parent[i]
        }

        let mut by_tx: HashMap<String, Vec<usize>> = HashMap::new();
        for (txid, script) in pairs {
            let index = *index_of.entry(script.clone()).or_insert_with(|| {
                scripts.push(script);
                parent.push(scripts.len() - 1);
                scripts.len() - 1
            });
            by_tx.entry(txid).or_default().push(index);
        }
        for members in by_tx.values() {
            for window in members.windows(2) {
                let a = find(&mut parent, window[0]);
                let b = find(&mut parent, window[1]);
                if a != b {
                    parent[a] = b;
                }
            }
        }

        let mut groups: HashMap<usize, Vec<Script>> = HashMap::new();
        for i in 0..scripts.len() {
            let root = find(&mut parent, i);
            let script = Script::from_hex(&scripts[i])
                .map_err(|e| WalletError::Corrupt(format!("grouping script: {e}")))?;
            groups.entry(root).or_default().push(script);
        }
        let mut out: Vec<Vec<Script>> = groups.into_values().collect();
        for group in &mut out {
            group.sort();
        }
        out.sort();
        Ok(out)
    }

    fn wallet_db_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.db"))
    }
}

impl SpecialAccounts for WalletRepository {
    fn ensure_special_account(
        &self,
        wallet_name: &str,
        account_index: u32,
        account_name: &str,
        ext_pub_key: Option<&str>,
    ) -> Result<AccountRow, WalletError> {
        if account_index < SPECIAL_ACCOUNT_BASE {
            return Err(WalletError::NotSpecialAccountIndex(account_index));
        }
        if let Some(existing) = self.special_account(wallet_name, account_index)? {
            return Ok(existing);
        }
        self.create_account_unchecked(wallet_name, account_index, account_name, ext_pub_key, 0)
    }

    fn special_account(
        &self,
        wallet_name: &str,
        account_index: u32,
    ) -> Result<Option<AccountRow>, WalletError> {
        if account_index < SPECIAL_ACCOUNT_BASE {
            return Err(WalletError::NotSpecialAccountIndex(account_index));
        }
        self.with_read(wallet_name, |store, row| store.get_account(row.wallet_id, account_index))
    }
}
