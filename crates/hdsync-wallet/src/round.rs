//! Batch rounds: admission, projection, and flushing.
//!
//! Wallets sharing a database share a `RoundState`. Blocks are projected
//! into an in-memory batch that is flushed to the store as one transaction;
//! between flushes, readers see the snapshot taken at the last flush.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use hdsync_chain::{DestinationReader, ScriptDeriver};
use hdsync_types::constants::{BATCH_CATCHUP_SECS, BATCH_HIGH_WATER};
use hdsync_types::{Block, BlockHeader, HashHeight, Transaction, Txid};

use crate::account::{TopUpTracker, WalletSnapshot};
use crate::error::WalletError;
use crate::lock::BatchLock;
use crate::projector::{ProjectionState, TxProjector};
use crate::store::WalletStore;

/// Dependencies the projection needs but does not own.
pub struct RoundContext<'a> {
    pub destination_reader: &'a dyn DestinationReader,
    pub deriver: &'a dyn ScriptDeriver,
    pub lookahead: u32,
}

/// Per-wallet shared state: the published snapshot plus the locks gating
/// updates and reads.
pub struct WalletContainer {
    snapshot: RwLock<WalletSnapshot>,
    pub(crate) update_lock: BatchLock,
    reader_count: AtomicUsize,
    pub(crate) round: Arc<RoundState>,
}

impl WalletContainer {
    pub fn new(snapshot: WalletSnapshot, round: Arc<RoundState>) -> Self {
        WalletContainer {
            snapshot: RwLock::new(snapshot),
            update_lock: BatchLock::new(),
            reader_count: AtomicUsize::new(0),
            round,
        }
    }

    pub fn snapshot(&self) -> WalletSnapshot {
        self.snapshot.read().expect("snapshot lock").clone()
    }

    pub fn set_snapshot(&self, snapshot: WalletSnapshot) {
        *self.snapshot.write().expect("snapshot lock") = snapshot;
    }

    pub fn readers(&self) -> usize {
        self.reader_count.load(Ordering::SeqCst)
    }

    /// Marks a query in flight; while any guard is alive the wallet cannot
    /// be admitted to a batch.
    pub fn read(self: &Arc<Self>) -> ReadGuard {
        self.reader_count.fetch_add(1, Ordering::SeqCst);
        ReadGuard { container: Arc::clone(self) }
    }
}

pub struct ReadGuard {
    container: Arc<WalletContainer>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.container.reader_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One open batch.
struct ProcessRound {
    participants: Vec<Arc<WalletContainer>>,
    /// Each participant's tip at admission, indexed like `participants`.
    prev_tips: Vec<HashHeight>,
    new_tip: Option<HashHeight>,
    state: ProjectionState,
    deadline: Instant,
}

/// Shared per-database round state. All wallets stored in the same database
/// funnel their block processing through one of these.
pub struct RoundState {
    pub(crate) lock: BatchLock,
    pub(crate) store: Mutex<WalletStore>,
    inner: Mutex<Option<ProcessRound>>,
}

impl RoundState {
    pub fn new(store: WalletStore) -> Arc<Self> {
        Arc::new(RoundState {
            lock: BatchLock::new(),
            store: Mutex::new(store),
            inner: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &Mutex<WalletStore> {
        &self.store
    }

    /// Feeds one block (or the end-of-stream sentinel) into the round.
    ///
    /// `containers` is every wallet container backed by this round's store.
    /// A batch is opened lazily for the wallets whose tip is the block's
    /// parent and flushed when a trigger fires.
    pub fn process_block(
        &self,
        block: Option<&Block>,
        containers: &[Arc<WalletContainer>],
        ctx: &RoundContext<'_>,
    ) -> Result<(), WalletError> {
        self.lock.acquire();
        let result = self.process_block_locked(block, containers, ctx);
        self.lock.release();
        result
    }

    fn process_block_locked(
        &self,
        block: Option<&Block>,
        containers: &[Arc<WalletContainer>],
        ctx: &RoundContext<'_>,
    ) -> Result<(), WalletError> {
        let mut inner = self.inner.lock().expect("round lock");

        let Some(block) = block else {
            if inner.is_some() {
                self.flush(&mut inner, containers, "end of stream")?;
            }
            return Ok(());
        };

        // A wallet waiting at the block's parent but outside the batch can
        // only join after a flush.
        if let Some(round) = inner.as_ref() {
            let joining = containers.iter().any(|c| {
                !round.participants.iter().any(|p| Arc::ptr_eq(p, c))
                    && c.snapshot().tip.hash == block.header.prev_hash
            });
            let chains = round
                .new_tip
                .map(|tip| tip.hash == block.header.prev_hash)
                .unwrap_or(false);
            if joining || !chains {
                let reason = if joining { "wallet joining" } else { "chain break" };
                self.flush(&mut inner, containers, reason)?;
            }
        }

        if inner.is_none() {
            *inner = self.start_batch(&block.header, containers, ctx)?;
            if inner.is_none() {
                return Ok(());
            }
        }

        let round = inner.as_mut().expect("open batch");
        let projector = TxProjector::new(ctx.destination_reader, ctx.deriver);
        for tx in &block.transactions {
            projector.project(tx, Some(&block.header), None, &mut round.state);
        }
        round.new_tip = Some(block.header.position());

        if let Some(reason) = self.flush_trigger(round) {
            self.flush(&mut inner, containers, reason)?;
        }
        Ok(())
    }

    /// Admits exactly the containers whose tip is the header's parent, then
    /// loads the batch's interest indexes for that scope.
    ///
    /// Admission is all-or-nothing: if any candidate's update lock cannot
    /// be taken, or a candidate has readers in flight, every lock acquired
    /// so far is released and no batch starts. Returns `None` when no
    /// batch started; the caller postpones rather than retries.
    fn start_batch(
        &self,
        header: &BlockHeader,
        containers: &[Arc<WalletContainer>],
        ctx: &RoundContext<'_>,
    ) -> Result<Option<ProcessRound>, WalletError> {
        let mut participants: Vec<Arc<WalletContainer>> = Vec::new();
        let mut prev_tips = Vec::new();
        for container in containers {
            let snapshot = container.snapshot();
            if snapshot.tip.hash != header.prev_hash {
                continue;
            }
            let admitted = container.update_lock.try_acquire() && {
                if container.readers() > 0 {
                    container.update_lock.release();
                    false
                } else {
                    true
                }
            };
            if !admitted {
                log::debug!("wallet '{}' busy, batch not started", snapshot.name);
                for acquired in &participants {
                    acquired.update_lock.release();
                }
                return Ok(None);
            }
            participants.push(Arc::clone(container));
            prev_tips.push(snapshot.tip);
        }
        if participants.is_empty() {
            return Ok(None);
        }

        let wallet_ids: Vec<i64> =
            participants.iter().map(|c| c.snapshot().wallet_id).collect();
        let state = {
            let store = self.store.lock().expect("store lock");
            let mut state = ProjectionState::new(self.load_tracker(&store, &wallet_ids, ctx)?);
            for (script, id) in store.address_entries(&wallet_ids)? {
                state.addresses.add_confirmed(script, id);
            }
            for (outpoint, id) in store.outpoint_entries(&wallet_ids)? {
                state.outpoints.add_confirmed(outpoint, id);
            }
            state
        };

        log::debug!(
            "batch opened at height {} with {} wallet(s)",
            header.height,
            participants.len()
        );
        Ok(Some(ProcessRound {
            participants,
            prev_tips,
            new_tip: None,
            state,
            deadline: Instant::now() + Duration::from_secs(BATCH_CATCHUP_SECS),
        }))
    }

    fn load_tracker(
        &self,
        store: &WalletStore,
        wallet_ids: &[i64],
        ctx: &RoundContext<'_>,
    ) -> Result<TopUpTracker, WalletError> {
        let mut tracker = TopUpTracker::new(ctx.lookahead);
        for &wallet_id in wallet_ids {
            for account in store.all_accounts(wallet_id)? {
                let next_external = store.next_address_index(
                    wallet_id,
                    account.account_index,
                    hdsync_types::AddressType::External,
                )?;
                let next_internal = store.next_address_index(
                    wallet_id,
                    account.account_index,
                    hdsync_types::AddressType::Internal,
                )?;
                tracker.register_account(
                    wallet_id,
                    account.account_index,
                    account.ext_pub_key,
                    next_external,
                    next_internal,
                );
            }
        }
        Ok(tracker)
    }

    fn flush_trigger(&self, round: &ProcessRound) -> Option<&'static str> {
        if self.lock.waiting() > 0 {
            return Some("round lock contended");
        }
        if round.participants.iter().any(|p| p.update_lock.waiting() > 0) {
            return Some("wallet lock contended");
        }
        if round.state.record_count() >= BATCH_HIGH_WATER {
            return Some("record high water");
        }
        if Instant::now() >= round.deadline {
            return Some("catch-up deadline");
        }
        None
    }

    /// Writes the batch to the store in one transaction and publishes fresh
    /// wallet snapshots. Participant locks are released whatever happens;
    /// on failure the store is rolled back and the tentative interest
    /// entries are discarded.
    fn flush(
        &self,
        inner: &mut Option<ProcessRound>,
        containers: &[Arc<WalletContainer>],
        reason: &str,
    ) -> Result<(), WalletError> {
        let Some(mut round) = inner.take() else {
            return Ok(());
        };
        log::debug!(
            "flushing batch ({reason}): {} output(s), {} spend(s)",
            round.state.outputs.len(),
            round.state.spends.len()
        );

        let result = self.flush_to_store(&mut round, containers);

        match result {
            Ok(()) => {
                round.state.addresses.confirm_tentative();
                round.state.outpoints.confirm_tentative();
            }
            Err(_) => {
                round.state.addresses.discard_tentative();
                round.state.outpoints.discard_tentative();
            }
        }
        for participant in &round.participants {
            participant.update_lock.release();
        }
        result
    }

    fn flush_to_store(
        &self,
        round: &mut ProcessRound,
        containers: &[Arc<WalletContainer>],
    ) -> Result<(), WalletError> {
        let mut store = self.store.lock().expect("store lock");
        store.begin()?;
        let result = (|| -> Result<(), WalletError> {
            store.insert_addresses(&round.state.new_addresses)?;
            store.apply_projection(
                &round.state.outputs,
                &round.state.spends,
                &round.state.payments,
            )?;
            if let Some(new_tip) = round.new_tip {
                for (participant, prev_tip) in
                    round.participants.iter().zip(&round.prev_tips)
                {
                    let wallet_id = participant.snapshot().wallet_id;
                    store.advance_tip(wallet_id, prev_tip, new_tip)?;
                }
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                store.commit()?;
                round.state.clear_buffers();
                // Every wallet of this store, not just participants: a
                // shared database means non-participants can observe the
                // committed writes too.
                let extras = containers
                    .iter()
                    .filter(|c| !round.participants.iter().any(|p| Arc::ptr_eq(p, *c)));
                for container in round.participants.iter().chain(extras) {
                    let wallet_id = container.snapshot().wallet_id;
                    let row = store.get_wallet_by_id(wallet_id)?;
                    let tip = row.last_synced()?.unwrap_or_else(HashHeight::start);
                    container.set_snapshot(WalletSnapshot {
                        wallet_id,
                        name: row.name,
                        tip,
                    });
                }
                Ok(())
            }
            Err(e) => {
                let _ = store.rollback();
                round.state.clear_buffers();
                Err(e)
            }
        }
    }

    /// Projects one mempool transaction against a single wallet and commits
    /// immediately. Any open batch is flushed first so the wallet's view is
    /// current. Returns whether the transaction was of interest.
    pub fn process_transaction(
        &self,
        container: &Arc<WalletContainer>,
        tx: &Transaction,
        fixed_txid: Option<Txid>,
        ctx: &RoundContext<'_>,
    ) -> Result<bool, WalletError> {
        container.update_lock.acquire();
        self.lock.acquire();
        let result = self.process_transaction_locked(container, tx, fixed_txid, ctx);
        self.lock.release();
        container.update_lock.release();
        result
    }

    fn process_transaction_locked(
        &self,
        container: &Arc<WalletContainer>,
        tx: &Transaction,
        fixed_txid: Option<Txid>,
        ctx: &RoundContext<'_>,
    ) -> Result<bool, WalletError> {
        {
            let mut inner = self.inner.lock().expect("round lock");
            if inner.is_some() {
                self.flush(&mut inner, std::slice::from_ref(container), "mempool transaction")?;
            }
        }

        let wallet_id = container.snapshot().wallet_id;
        let wallet_ids = [wallet_id];
        let mut state = {
            let store = self.store.lock().expect("store lock");
            let mut state = ProjectionState::new(self.load_tracker(&store, &wallet_ids, ctx)?);
            for (script, id) in store.address_entries(&wallet_ids)? {
                state.addresses.add_confirmed(script, id);
            }
            for (outpoint, id) in store.outpoint_entries(&wallet_ids)? {
                state.outpoints.add_confirmed(outpoint, id);
            }
            state
        };

        let projector = TxProjector::new(ctx.destination_reader, ctx.deriver);
        let of_interest = projector.project(tx, None, fixed_txid, &mut state);
        if !of_interest {
            return Ok(false);
        }

        let mut store = self.store.lock().expect("store lock");
        store.begin()?;
        let result = (|| -> Result<(), WalletError> {
            store.insert_addresses(&state.new_addresses)?;
            store.apply_projection(&state.outputs, &state.spends, &state.payments)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                store.commit()?;
                state.clear_buffers();
                Ok(true)
            }
            Err(e) => {
                let _ = store.rollback();
                state.clear_buffers();
                Err(e)
            }
        }
    }

    /// Whether a batch is currently open. Test and diagnostic hook.
    pub fn batch_open(&self) -> bool {
        self.inner.lock().expect("round lock").is_some()
    }
}
