//! Core types and constants for the hdsync wallet engine.
//!
//! This crate provides the foundational types used across all hdsync crates:
//! hashes and outpoints, pubkey scripts, transaction and block primitives,
//! block locators, and engine-wide constants.

pub mod constants;
pub mod hashes;
pub mod script;
pub mod transaction;

pub use constants::{AddressType, DEFAULT_LOOKAHEAD, SPECIAL_ACCOUNT_BASE};
pub use hashes::{BlockHash, BlockLocator, HashHeight, OutPoint, Txid};
pub use script::Script;
pub use transaction::{Block, BlockHeader, Transaction, TxIn, TxOut};
