//! Collection of matured block deposits from a chain source.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use hdsync_chain::{ChainSource, TransactionIndex};
use hdsync_types::constants::DEPOSIT_PAGE_SIZE;
use hdsync_types::{BlockHash, Txid};

use crate::deposit::{DepositExtractor, MaturedBlockDeposits};
use crate::error::FederationError;

/// Walks the chain forward from a height and collects the deposits of
/// every block that has reached the maturity floor.
///
/// Deposits are only reported `minimum_confirmations` blocks below the
/// tip, so a short reorg cannot retract a deposit that has already been
/// handed to the target chain.
pub struct MaturedBlocksProvider<'a> {
    chain: &'a dyn ChainSource,
    extractor: &'a dyn DepositExtractor,
    tx_index: Option<&'a dyn TransactionIndex>,
}

impl<'a> MaturedBlocksProvider<'a> {
    pub fn new(chain: &'a dyn ChainSource, extractor: &'a dyn DepositExtractor) -> Self {
        MaturedBlocksProvider { chain, extractor, tx_index: None }
    }

    /// Enables refund address resolution through `index`.
    pub fn with_transaction_index(mut self, index: &'a dyn TransactionIndex) -> Self {
        self.tx_index = Some(index);
        self
    }

    /// Collects deposits for up to `max_blocks` mature blocks starting at
    /// `from_height`.
    ///
    /// Collection also stops once `max_deposits` deposits have
    /// accumulated, or once half of `request_timeout` has elapsed; both
    /// return the partial result successfully, since partial progress is
    /// useful to the caller. Only the maturity gate itself fails, and it
    /// fails before any block is fetched.
    pub fn matured_deposits(
        &self,
        from_height: i64,
        max_blocks: usize,
        max_deposits: usize,
        request_timeout: Duration,
    ) -> Result<Vec<MaturedBlockDeposits>, FederationError> {
        let tip = self.chain.tip().ok_or(FederationError::NoChainTip)?;
        let mature_tip = tip.height - self.extractor.minimum_confirmations();
        if from_height > mature_tip {
            return Err(FederationError::NotMature { requested: from_height, mature_tip });
        }

        // Half the caller's budget; the rest is theirs for serialization
        // and transfer.
        let deadline = Instant::now() + request_timeout / 2;
        let stop_height = mature_tip.min(from_height + max_blocks as i64 - 1);

        let mut collected: Vec<MaturedBlockDeposits> = Vec::new();
        let mut deposit_count = 0usize;
        let mut height = from_height;

        'pages: while height <= stop_height {
            let page_end = stop_height.min(height + i64::from(DEPOSIT_PAGE_SIZE) - 1);
            let headers = self.chain.headers_after(height - 1, (page_end - height + 1) as u32);
            if headers.is_empty() {
                break;
            }
            let hashes: Vec<BlockHash> = headers.iter().map(|h| h.hash).collect();
            let blocks = self.chain.blocks(&hashes);

            for (header, block) in headers.iter().zip(blocks) {
                let Some(block) = block else {
                    log::warn!(
                        "no block data at height {}, sending what was collected",
                        header.height
                    );
                    break 'pages;
                };
                let matured = self.extractor.extract(&block);
                deposit_count += matured.deposits.len();
                collected.push(matured);

                if deposit_count >= max_deposits {
                    break 'pages;
                }
                if Instant::now() >= deadline && !collected.is_empty() {
                    log::debug!(
                        "matured block collection out of time at height {}, \
                         sending what was collected",
                        header.height
                    );
                    break 'pages;
                }
            }
            height = page_end + 1;
        }

        if self.tx_index.is_some() {
            self.resolve_refund_addresses(&mut collected)?;
        }
        Ok(collected)
    }

    /// Resolves, for every deposit, the script that funded its first input
    /// as the refund destination.
    fn resolve_refund_addresses(
        &self,
        collected: &mut [MaturedBlockDeposits],
    ) -> Result<(), FederationError> {
        let index = self.tx_index.expect("transaction index");

        let mut source_txids: HashSet<Txid> = HashSet::new();
        for matured in collected.iter() {
            for deposit in &matured.deposits {
                if let Some(input) = &deposit.first_input {
                    source_txids.insert(input.prev_out.txid);
                }
            }
        }
        if source_txids.is_empty() {
            return Ok(());
        }

        let txids: Vec<Txid> = source_txids.into_iter().collect();
        let transactions =
            index.transactions_by_id(&txids).ok_or(FederationError::MissingTxIndex)?;
        let by_id: HashMap<Txid, _> =
            transactions.into_iter().map(|tx| (tx.txid, tx)).collect();

        for matured in collected.iter_mut() {
            for deposit in &mut matured.deposits {
                let Some(input) = &deposit.first_input else {
                    continue;
                };
                let prev = input.prev_out;
                let source = by_id
                    .get(&prev.txid)
                    .ok_or(FederationError::MissingSourceTransaction(prev.txid))?;
                let out = source
                    .outputs
                    .get(prev.vout as usize)
                    .ok_or(FederationError::MissingSourceTransaction(prev.txid))?;
                deposit.sender_address = Some(out.script_pub_key.to_hex());
            }
        }
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hdsync_chain::{BlockBuilder, MemoryChain};
    use hdsync_types::script::OP_RETURN;
    use hdsync_types::{Block, BlockHeader, OutPoint, Script, Transaction};

    use super::*;
    use crate::deposit::OpReturnDepositExtractor;

    fn fed_script() -> Script {
        Script::new(vec![0xa9, 0x14, 0x42])
    }

    fn op_return_script(data: &[u8]) -> Script {
        let mut bytes = vec![OP_RETURN, data.len() as u8];
        bytes.extend_from_slice(data);
        Script::new(bytes)
    }

    fn deposit_tx(time: i64, salt: u64, amount: i64, target: &[u8]) -> Transaction {
        BlockBuilder::transaction(time)
            .salt(salt)
            .pay(amount, fed_script())
            .pay(0, op_return_script(target))
            .build()
    }

    /// Builds `count` blocks, one deposit each, preceded by `empty`
    /// deposit-free blocks.
    fn chain_with_deposits(empty: usize, count: usize) -> MemoryChain {
        let chain = MemoryChain::new();
        for i in 0..empty {
            chain.add_block(
                vec![BlockBuilder::transaction(1_000 + i as i64).salt(1_000 + i as u64).build()],
                1_000 + i as i64,
            );
        }
        for i in 0..count {
            chain.add_block(
                vec![deposit_tx(2_000 + i as i64, i as u64, 25, b"Starget")],
                2_000 + i as i64,
            );
        }
        chain
    }

    /// Chain source wrapper that counts body fetches and can refuse one
    /// block.
    struct CountingChain<'a> {
        inner: &'a MemoryChain,
        fetches: AtomicUsize,
        refuse: Option<BlockHash>,
    }

    impl<'a> CountingChain<'a> {
        fn new(inner: &'a MemoryChain) -> Self {
            CountingChain { inner, fetches: AtomicUsize::new(0), refuse: None }
        }
    }

    impl ChainSource for CountingChain<'_> {
        fn tip(&self) -> Option<BlockHeader> {
            self.inner.tip()
        }

        fn ancestor(&self, height: i64) -> Option<BlockHeader> {
            self.inner.ancestor(height)
        }

        fn block(&self, hash: &BlockHash) -> Option<Block> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.refuse == Some(*hash) {
                return None;
            }
            self.inner.block(hash)
        }

        fn headers_after(&self, after_height: i64, limit: u32) -> Vec<BlockHeader> {
            self.inner.headers_after(after_height, limit)
        }
    }

    #[test]
    fn test_no_chain_tip_is_soft() {
        let chain = MemoryChain::new();
        let extractor = OpReturnDepositExtractor::new(fed_script(), 10);
        let provider = MaturedBlocksProvider::new(&chain, &extractor);
        let err = provider.matured_deposits(0, 10, 100, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, FederationError::NoChainTip));
        assert!(err.is_transient());
    }

    #[test]
    fn test_maturity_gate_fails_before_any_fetch() {
        let chain = chain_with_deposits(0, 5);
        let counting = CountingChain::new(&chain);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 10);
        let provider = MaturedBlocksProvider::new(&counting, &extractor);

        // Tip height 4, floor 10 confirmations: nothing is mature.
        let err = provider.matured_deposits(0, 10, 100, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(
            err,
            FederationError::NotMature { requested: 0, mature_tip: -6 }
        ));
        assert!(err.is_transient());
        assert_eq!(counting.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_collects_only_mature_blocks() {
        // 8 deposit blocks at heights 0-7, 2 confirmations floor: tip is
        // height 7, mature through height 5.
        let chain = chain_with_deposits(0, 8);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 2);
        let provider = MaturedBlocksProvider::new(&chain, &extractor);

        let collected = provider.matured_deposits(0, 100, 1_000, Duration::from_secs(10)).unwrap();
        assert_eq!(collected.len(), 6);
        assert_eq!(collected.last().unwrap().block_height, 5);
        assert!(collected.iter().all(|m| m.deposits.len() == 1));
        assert_eq!(collected[0].deposits[0].amount, 25);
        assert_eq!(collected[0].deposits[0].target_address, "Starget");
    }

    #[test]
    fn test_max_blocks_bounds_the_walk() {
        let chain = chain_with_deposits(0, 8);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 0);
        let provider = MaturedBlocksProvider::new(&chain, &extractor);

        let collected = provider.matured_deposits(2, 3, 1_000, Duration::from_secs(10)).unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].block_height, 2);
        assert_eq!(collected[2].block_height, 4);
    }

    #[test]
    fn test_max_deposits_stops_early_with_partial_result() {
        let chain = chain_with_deposits(0, 8);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 0);
        let provider = MaturedBlocksProvider::new(&chain, &extractor);

        let collected = provider.matured_deposits(0, 100, 3, Duration::from_secs(10)).unwrap();
        assert_eq!(collected.len(), 3);
    }

    #[test]
    fn test_missing_block_truncates_instead_of_failing() {
        let chain = chain_with_deposits(0, 6);
        let mut counting = CountingChain::new(&chain);
        counting.refuse = Some(chain.ancestor(3).unwrap().hash);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 0);
        let provider = MaturedBlocksProvider::new(&counting, &extractor);

        let collected = provider.matured_deposits(0, 100, 1_000, Duration::from_secs(10)).unwrap();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected.last().unwrap().block_height, 2);
    }

    #[test]
    fn test_refund_addresses_resolved_from_index() {
        let chain = MemoryChain::new();
        let funding_script = Script::new(vec![0x76, 0x51]);
        let funding = BlockBuilder::transaction(900).pay(30, funding_script.clone()).build();
        chain.add_block(vec![funding.clone()], 900);

        let deposit = BlockBuilder::transaction(1_000)
            .spend(OutPoint::new(funding.txid, 0))
            .pay(25, fed_script())
            .pay(0, op_return_script(b"Starget"))
            .build();
        chain.add_block(vec![deposit], 1_000);

        let extractor = OpReturnDepositExtractor::new(fed_script(), 0);
        let provider =
            MaturedBlocksProvider::new(&chain, &extractor).with_transaction_index(&chain);

        let collected = provider.matured_deposits(1, 10, 100, Duration::from_secs(10)).unwrap();
        assert_eq!(collected.len(), 1);
        let resolved = &collected[0].deposits[0];
        assert_eq!(resolved.sender_address.as_deref(), Some(funding_script.to_hex().as_str()));
    }

    #[test]
    fn test_missing_transaction_index_is_fatal() {
        struct NoIndex;
        impl TransactionIndex for NoIndex {
            fn transactions_by_id(&self, _txids: &[Txid]) -> Option<Vec<Transaction>> {
                None
            }
        }

        let chain = chain_with_deposits(0, 2);
        let extractor = OpReturnDepositExtractor::new(fed_script(), 0);
        let no_index = NoIndex;
        let provider =
            MaturedBlocksProvider::new(&chain, &extractor).with_transaction_index(&no_index);

        let err = provider.matured_deposits(0, 10, 100, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, FederationError::MissingTxIndex));
        assert!(!err.is_transient());
    }
}
