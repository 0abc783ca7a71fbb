//! Multi-wallet UTXO ledger projection over SQLite.
//!
//! The engine keeps any number of deterministic wallets synced against a
//! single best chain: blocks are projected into per-wallet output, spend,
//! and payment records inside batched store transactions, with lookahead
//! address generation, reorg rewind, and mempool overlay handling.
//!
//! Entry point is [`WalletRepository`]; everything else is the machinery
//! behind it.

pub mod account;
pub mod error;
pub mod interest;
pub mod lock;
pub mod projector;
pub mod repository;
pub mod round;
pub mod schema;
pub mod store;

pub use account::{AddressIdentifier, TopUpTracker, WalletSnapshot};
pub use error::WalletError;
pub use repository::{SpecialAccounts, WalletRepository};
pub use schema::{AccountRow, AddressRow, PaymentRow, TxDataRow, WalletRow};
pub use store::{AddressUsage, Balance, CompensatingAction, WalletStore};
