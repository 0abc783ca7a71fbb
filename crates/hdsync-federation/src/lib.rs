//! Federation peg support on top of the hdsync chain traits.
//!
//! Two pieces: an in-memory multisig transaction set with derived
//! spendability and withdrawal indexes, and a matured-blocks provider
//! that collects cross-chain deposits once they are safely buried.

pub mod deposit;
pub mod error;
pub mod matured;
pub mod transaction_data;
pub mod tx_set;

pub use deposit::{Deposit, DepositExtractor, MaturedBlockDeposits, OpReturnDepositExtractor};
pub use error::FederationError;
pub use matured::MaturedBlocksProvider;
pub use transaction_data::{PaymentDetails, SpendingDetails, TransactionData, WithdrawalDetails};
pub use tx_set::MultiSigTransactionSet;
