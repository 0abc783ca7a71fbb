//! Source-chain deposits feeding target-chain withdrawal tracking.

use std::time::Duration;

use hdsync_chain::{BlockBuilder, MemoryChain};
use hdsync_federation::{
    MaturedBlocksProvider, MultiSigTransactionSet, OpReturnDepositExtractor, SpendingDetails,
    TransactionData, WithdrawalDetails,
};
use hdsync_types::script::OP_RETURN;
use hdsync_types::{OutPoint, Script, Txid};

fn fed_script() -> Script {
    Script::new(vec![0xa9, 0x14, 0x42])
}

fn op_return_script(data: &[u8]) -> Script {
    let mut bytes = vec![OP_RETURN, data.len() as u8];
    bytes.extend_from_slice(data);
    Script::new(bytes)
}

#[test]
fn matured_deposit_drives_withdrawal_lifecycle() {
    let _ = env_logger::builder().is_test(true).try_init();

    // Source chain: one deposit, buried under two confirmations.
    let chain = MemoryChain::new();
    let deposit_tx = BlockBuilder::transaction(1_000)
        .pay(25, fed_script())
        .pay(0, op_return_script(b"Starget"))
        .build();
    chain.add_block(vec![deposit_tx], 1_000);
    for i in 0..2 {
        chain.add_block(vec![BlockBuilder::transaction(1_100 + i).salt(i as u64).build()], 1_100 + i);
    }

    let extractor = OpReturnDepositExtractor::new(fed_script(), 2);
    let provider = MaturedBlocksProvider::new(&chain, &extractor);
    let collected = provider.matured_deposits(0, 10, 100, Duration::from_secs(10)).unwrap();
    assert_eq!(collected.len(), 1);
    let deposit = &collected[0].deposits[0];
    assert_eq!(deposit.amount, 25);

    // Target chain side: a multisig output is reserved and spent to honor
    // the deposit.
    let set = MultiSigTransactionSet::new();
    let reserve = OutPoint::new(Txid::from_bytes([7; 32]), 1);
    set.insert(TransactionData {
        outpoint: reserve,
        amount: 30,
        script_pub_key: fed_script(),
        block: None,
        creation_time: 1_200,
        is_coinbase: false,
        spending_details: None,
    });
    assert_eq!(set.unspent().len(), 1);

    set.update(&reserve, |data| {
        data.spending_details = Some(SpendingDetails {
            spend_txid: Txid::from_bytes([8; 32]),
            block: None,
            creation_time: 1_300,
            payments: vec![],
            withdrawal: Some(WithdrawalDetails {
                matching_deposit_id: deposit.id,
                target_address: deposit.target_address.clone(),
                amount: deposit.amount,
            }),
        });
    });

    // The reserve is no longer spendable and the withdrawal is findable by
    // the deposit id reported by the provider.
    assert!(set.unspent().is_empty());
    let groups = set.withdrawals_by_deposit(Some(&deposit.id));
    assert_eq!(groups[0].1.len(), 1);
    assert_eq!(groups[0].1[0].outpoint, reserve);
}
