//! Engine-wide constants and small enums.

use serde::{Deserialize, Serialize};

/// Number of unused trailing addresses kept per address chain.
///
/// Whenever an address within this window of the end of the pre-generated
/// range is used, the chain is topped up so at least this many unused
/// addresses remain.
pub const DEFAULT_LOOKAHEAD: u32 = 20;

/// First account index reserved for special-purpose accounts.
///
/// Ordinary accounts live below this value; accounts at or above it are
/// only reachable through the `SpecialAccounts` capability.
pub const SPECIAL_ACCOUNT_BASE: u32 = 100_000_000;

/// Reserved index of the cold-side special account.
pub const COLD_ACCOUNT_INDEX: u32 = SPECIAL_ACCOUNT_BASE;

/// Reserved index of the hot-side special account.
pub const HOT_ACCOUNT_INDEX: u32 = SPECIAL_ACCOUNT_BASE + 1;

/// Combined output + spend record count that forces a batch flush.
pub const BATCH_HIGH_WATER: usize = 10_000;

/// Seconds between forced catch-up flushes of a long-running batch.
pub const BATCH_CATCHUP_SECS: u64 = 10;

/// Header page size used when walking a confirmed chain range.
pub const DEPOSIT_PAGE_SIZE: u32 = 100;

/// Address chain selector within an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddressType {
    /// Receiving chain.
    External = 0,
    /// Change chain.
    Internal = 1,
}

impl AddressType {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(AddressType::External),
            1 => Some(AddressType::Internal),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }
}
