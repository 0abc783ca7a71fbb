//! Batch round semantics: admission, flushing, snapshot publication.

use std::sync::Arc;

use hdsync_chain::{
    BlockBuilder, ChainSource, MemoryChain, ScriptDeriver, Sha256Deriver,
    StandardDestinationReader,
};
use hdsync_types::{AddressType, Block, BlockHash, HashHeight};
use hdsync_wallet::account::WalletSnapshot;
use hdsync_wallet::round::{RoundContext, RoundState, WalletContainer};
use hdsync_wallet::WalletStore;

fn ctx<'a>(reader: &'a StandardDestinationReader, deriver: &'a Sha256Deriver) -> RoundContext<'a> {
    RoundContext { destination_reader: reader, deriver, lookahead: 20 }
}

fn two_wallet_round() -> (Arc<RoundState>, Arc<WalletContainer>, Arc<WalletContainer>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut store = WalletStore::open_in_memory().unwrap();
    let w1 = store.create_wallet("w1", None, None, 0).unwrap();
    let w2 = store.create_wallet("w2", None, None, 0).unwrap();
    let round = RoundState::new(store);
    let c1 = Arc::new(WalletContainer::new(
        WalletSnapshot { wallet_id: w1.wallet_id, name: w1.name, tip: HashHeight::start() },
        Arc::clone(&round),
    ));
    let c2 = Arc::new(WalletContainer::new(
        WalletSnapshot { wallet_id: w2.wallet_id, name: w2.name, tip: HashHeight::start() },
        Arc::clone(&round),
    ));
    (round, c1, c2)
}

fn one_block() -> Block {
    let chain = MemoryChain::new();
    let script = Sha256Deriver.derive("xpub-nobody", AddressType::External, 0);
    let header = chain.add_block(
        vec![BlockBuilder::transaction(1_000).pay(1, script).build()],
        1_000,
    );
    chain.block(&header.hash).unwrap()
}

#[test]
fn busy_reader_fails_the_whole_admission() {
    let (round, c1, c2) = two_wallet_round();
    let reader = StandardDestinationReader;
    let deriver = Sha256Deriver;
    let ctx = ctx(&reader, &deriver);
    let block = one_block();
    let containers = [Arc::clone(&c1), Arc::clone(&c2)];

    // A query in flight against one wallet vetoes the batch for all of
    // them, even though the other is idle.
    let guard = c2.read();
    round.process_block(Some(&block), &containers, &ctx).unwrap();
    assert!(!round.batch_open());
    assert_eq!(c1.snapshot().tip, HashHeight::start());
    assert_eq!(c2.snapshot().tip, HashHeight::start());
    drop(guard);

    // With the reader gone, the same block admits both wallets.
    round.process_block(Some(&block), &containers, &ctx).unwrap();
    assert!(round.batch_open());
    round.process_block(None, &containers, &ctx).unwrap();
    assert_eq!(c1.snapshot().tip, block.header.position());
    assert_eq!(c2.snapshot().tip, block.header.position());
}

#[test]
fn batch_stays_open_until_sentinel() {
    let (round, c1, c2) = two_wallet_round();
    let reader = StandardDestinationReader;
    let deriver = Sha256Deriver;
    let ctx = ctx(&reader, &deriver);

    let chain = MemoryChain::new();
    let script = Sha256Deriver.derive("xpub-nobody", AddressType::External, 0);
    let h0 = chain.add_block(
        vec![BlockBuilder::transaction(1_000).pay(1, script.clone()).build()],
        1_000,
    );
    let h1 = chain.add_block(
        vec![BlockBuilder::transaction(1_100).pay(2, script).build()],
        1_100,
    );
    let b0 = chain.block(&h0.hash).unwrap();
    let b1 = chain.block(&h1.hash).unwrap();
    let containers = [Arc::clone(&c1), Arc::clone(&c2)];

    round.process_block(Some(&b0), &containers, &ctx).unwrap();
    assert!(round.batch_open());
    // Snapshots are published only at flush.
    assert_eq!(c1.snapshot().tip, HashHeight::start());

    round.process_block(Some(&b1), &containers, &ctx).unwrap();
    assert!(round.batch_open());

    round.process_block(None, &containers, &ctx).unwrap();
    assert!(!round.batch_open());
    assert_eq!(c1.snapshot().tip, h1.position());
    assert_eq!(c2.snapshot().tip, h1.position());
}

#[test]
fn chain_break_flushes_the_open_batch() {
    let (round, c1, c2) = two_wallet_round();
    let reader = StandardDestinationReader;
    let deriver = Sha256Deriver;
    let ctx = ctx(&reader, &deriver);
    let block = one_block();
    let containers = [Arc::clone(&c1), Arc::clone(&c2)];

    round.process_block(Some(&block), &containers, &ctx).unwrap();
    assert!(round.batch_open());

    // Replaying a block that no longer connects forces the flush; nothing
    // new is admitted because no wallet sits at its parent.
    round.process_block(Some(&block), &containers, &ctx).unwrap();
    assert!(!round.batch_open());
    assert_eq!(c1.snapshot().tip, block.header.position());
    assert_eq!(c2.snapshot().tip, block.header.position());
}

#[test]
fn flush_republishes_every_wallet_of_the_store() {
    let (round, c1, c2) = two_wallet_round();
    let reader = StandardDestinationReader;
    let deriver = Sha256Deriver;
    let ctx = ctx(&reader, &deriver);
    let block = one_block();
    let containers = [Arc::clone(&c1), Arc::clone(&c2)];

    // Wedge the second wallet's published snapshot away from store truth.
    let stale = HashHeight::new(BlockHash::from_bytes([9; 32]), 5);
    let mut snapshot = c2.snapshot();
    snapshot.tip = stale;
    c2.set_snapshot(snapshot);

    // With its tip off the block's parent, w2 is not admitted; the flush
    // still refreshes it from the shared store.
    round.process_block(Some(&block), &containers, &ctx).unwrap();
    round.process_block(None, &containers, &ctx).unwrap();
    assert_eq!(c1.snapshot().tip, block.header.position());
    assert_eq!(c2.snapshot().tip, HashHeight::start());
}

#[test]
fn mempool_transaction_flushes_open_batch_first() {
    let (round, c1, c2) = two_wallet_round();
    let reader = StandardDestinationReader;
    let deriver = Sha256Deriver;
    let ctx = ctx(&reader, &deriver);
    let block = one_block();
    let containers = [Arc::clone(&c1), Arc::clone(&c2)];

    // Keep w2 out of the batch so its update lock stays free.
    let stale = HashHeight::new(BlockHash::from_bytes([9; 32]), 5);
    let mut snapshot = c2.snapshot();
    snapshot.tip = stale;
    c2.set_snapshot(snapshot);

    round.process_block(Some(&block), &containers, &ctx).unwrap();
    assert!(round.batch_open());

    let tx = BlockBuilder::transaction(2_000)
        .pay(3, Sha256Deriver.derive("xpub-nobody", AddressType::External, 1))
        .build();
    let of_interest = round.process_transaction(&c2, &tx, None, &ctx).unwrap();
    assert!(!of_interest);
    assert!(!round.batch_open());
    assert_eq!(c1.snapshot().tip, block.header.position());
}
