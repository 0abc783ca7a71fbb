//! Chain supplier traits and an in-memory chain harness.
//!
//! The wallet engine never talks to a network or a consensus database
//! directly. It consumes chain data through `ChainSource`, expands output
//! scripts through `DestinationReader`, derives address scripts through
//! `ScriptDeriver` and resolves arbitrary transactions through
//! `TransactionIndex`. `MemoryChain` implements the chain-facing traits for
//! tests and tooling.

pub mod memory;
pub mod source;

pub use memory::{BlockBuilder, MemoryChain};
pub use source::{
    ChainSource, DestinationReader, ScriptDeriver, Sha256Deriver, StandardDestinationReader,
    TransactionIndex,
};
