//! In-memory best chain used by tests and tooling.

use std::collections::HashMap;
use std::sync::Mutex;

use hdsync_types::{
    Block, BlockHash, BlockHeader, OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use sha2::{Digest, Sha256};

use crate::source::{ChainSource, TransactionIndex};

/// A single best chain held in memory.
///
/// Blocks are appended in height order; hashes are derived from the block
/// contents so distinct chains never collide in tests.
pub struct MemoryChain {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    blocks: Vec<Block>,
    by_hash: HashMap<BlockHash, usize>,
    tx_index: HashMap<Txid, Transaction>,
}

impl MemoryChain {
    pub fn new() -> Self {
        MemoryChain { inner: Mutex::new(Inner::default()) }
    }

    /// Appends a block containing `transactions` and returns its header.
    pub fn add_block(&self, transactions: Vec<Transaction>, time: i64) -> BlockHeader {
        let mut inner = self.inner.lock().expect("chain lock poisoned");

        let height = inner.blocks.len() as i64;
        let prev_hash = inner
            .blocks
            .last()
            .map(|b| b.header.hash)
            .unwrap_or(BlockHash::ZERO);

        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(height.to_le_bytes());
        hasher.update(time.to_le_bytes());
        for tx in &transactions {
            hasher.update(tx.txid.as_bytes());
        }
        let hash = BlockHash::from_bytes(hasher.finalize().into());

        let header = BlockHeader { hash, prev_hash, height, time };
        for tx in &transactions {
            inner.tx_index.insert(tx.txid, tx.clone());
        }
        let index = inner.blocks.len();
        inner.by_hash.insert(hash, index);
        inner.blocks.push(Block { header, transactions });

        header
    }

    /// Drops all blocks above `height`, simulating a reorg.
    pub fn truncate(&self, height: i64) {
        let mut inner = self.inner.lock().expect("chain lock poisoned");
        while inner.blocks.len() as i64 > height + 1 {
            if let Some(block) = inner.blocks.pop() {
                inner.by_hash.remove(&block.header.hash);
                for tx in &block.transactions {
                    inner.tx_index.remove(&tx.txid);
                }
            }
        }
    }

    pub fn height(&self) -> i64 {
        self.inner.lock().expect("chain lock poisoned").blocks.len() as i64 - 1
    }
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainSource for MemoryChain {
    fn tip(&self) -> Option<BlockHeader> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        inner.blocks.last().map(|b| b.header)
    }

    fn ancestor(&self, height: i64) -> Option<BlockHeader> {
        if height < 0 {
            return None;
        }
        let inner = self.inner.lock().expect("chain lock poisoned");
        inner.blocks.get(height as usize).map(|b| b.header)
    }

    fn block(&self, hash: &BlockHash) -> Option<Block> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        inner.by_hash.get(hash).map(|&i| inner.blocks[i].clone())
    }

    fn headers_after(&self, after_height: i64, limit: u32) -> Vec<BlockHeader> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        let start = (after_height + 1).max(0) as usize;
        inner
            .blocks
            .iter()
            .skip(start)
            .take(limit as usize)
            .map(|b| b.header)
            .collect()
    }
}

impl TransactionIndex for MemoryChain {
    fn transactions_by_id(&self, txids: &[Txid]) -> Option<Vec<Transaction>> {
        let inner = self.inner.lock().expect("chain lock poisoned");
        txids
            .iter()
            .map(|id| inner.tx_index.get(id).cloned())
            .collect()
    }
}

/// Builds transactions with content-derived ids.
pub struct BlockBuilder {
    time: i64,
    inputs: Vec<TxIn>,
    outputs: Vec<TxOut>,
    is_coinbase: bool,
    is_coinstake: bool,
    salt: u64,
}

impl BlockBuilder {
    pub fn transaction(time: i64) -> Self {
        BlockBuilder {
            time,
            inputs: Vec::new(),
            outputs: Vec::new(),
            is_coinbase: false,
            is_coinstake: false,
            salt: 0,
        }
    }

    pub fn coinbase(mut self) -> Self {
        self.is_coinbase = true;
        self
    }

    pub fn coinstake(mut self) -> Self {
        self.is_coinstake = true;
        self
    }

    pub fn spend(mut self, prev_out: OutPoint) -> Self {
        self.inputs.push(TxIn::new(prev_out));
        self
    }

    pub fn pay(mut self, value: i64, script: Script) -> Self {
        self.outputs.push(TxOut::new(value, script));
        self
    }

    /// Extra entropy for constructing otherwise-identical transactions.
    pub fn salt(mut self, salt: u64) -> Self {
        self.salt = salt;
        self
    }

    pub fn build(self) -> Transaction {
        let mut hasher = Sha256::new();
        hasher.update(self.time.to_le_bytes());
        hasher.update(self.salt.to_le_bytes());
        hasher.update([self.is_coinbase as u8, self.is_coinstake as u8]);
        for input in &self.inputs {
            hasher.update(input.prev_out.txid.as_bytes());
            hasher.update(input.prev_out.vout.to_le_bytes());
        }
        for output in &self.outputs {
            hasher.update(output.value.to_le_bytes());
            hasher.update(output.script_pub_key.as_bytes());
        }
        let txid = Txid::from_bytes(hasher.finalize().into());

        Transaction {
            txid,
            time: self.time,
            inputs: self.inputs,
            outputs: self.outputs,
            is_coinbase: self.is_coinbase,
            is_coinstake: self.is_coinstake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(tag: u8) -> Script {
        Script::new(vec![0x76, 0xa9, 0x14, tag, 0x88, 0xac])
    }

    #[test]
    fn test_add_block_links_chain() {
        let chain = MemoryChain::new();
        let h0 = chain.add_block(vec![], 100);
        let h1 = chain.add_block(vec![], 101);

        assert_eq!(h0.height, 0);
        assert_eq!(h0.prev_hash, BlockHash::ZERO);
        assert_eq!(h1.prev_hash, h0.hash);
        assert_eq!(chain.tip().unwrap(), h1);
    }

    #[test]
    fn test_ancestor_and_headers_after() {
        let chain = MemoryChain::new();
        let headers: Vec<_> = (0..5).map(|i| chain.add_block(vec![], i)).collect();

        assert_eq!(chain.ancestor(2).unwrap(), headers[2]);
        assert!(chain.ancestor(9).is_none());
        assert!(chain.ancestor(-1).is_none());

        let after = chain.headers_after(1, 2);
        assert_eq!(after, vec![headers[2], headers[3]]);
    }

    #[test]
    fn test_block_lookup_and_tx_index() {
        let chain = MemoryChain::new();
        let tx = BlockBuilder::transaction(50).coinbase().pay(10, script(1)).build();
        let header = chain.add_block(vec![tx.clone()], 50);

        let block = chain.block(&header.hash).unwrap();
        assert_eq!(block.transactions.len(), 1);

        let found = chain.transactions_by_id(&[tx.txid]).unwrap();
        assert_eq!(found[0], tx);
    }

    #[test]
    fn test_truncate_reorg() {
        let chain = MemoryChain::new();
        for i in 0..4 {
            chain.add_block(vec![], i);
        }
        chain.truncate(1);
        assert_eq!(chain.height(), 1);
        assert_eq!(chain.tip().unwrap().height, 1);
    }

    #[test]
    fn test_builder_ids_depend_on_content() {
        let a = BlockBuilder::transaction(1).pay(5, script(1)).build();
        let b = BlockBuilder::transaction(1).pay(5, script(2)).build();
        let c = BlockBuilder::transaction(1).pay(5, script(1)).salt(9).build();
        assert_ne!(a.txid, b.txid);
        assert_ne!(a.txid, c.txid);
    }
}
