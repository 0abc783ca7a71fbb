//! Wallet engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("wallet with name '{0}' already exists")]
    DuplicateWallet(String),

    #[error("cannot create this wallet as a wallet with the same private key already exists")]
    DuplicateSeed,

    #[error("no wallet with name '{0}' could be found")]
    UnknownWallet(String),

    #[error("account '{account}' of wallet '{wallet}' does not exist")]
    UnknownAccount { wallet: String, account: String },

    #[error("there is already an account in this wallet with index {0}")]
    DuplicateAccountIndex(u32),

    #[error("there is already an account in this wallet with this xpubkey")]
    DuplicateExtPubKey,

    #[error("{0} can only be added to watch-only accounts")]
    WatchOnly(&'static str),

    #[error("wallet '{wallet}' tip no longer matches the batch; expected parent {expected}")]
    TipMismatch { wallet: String, expected: String },

    #[error("account index {0} is reserved for special accounts")]
    ReservedAccountIndex(u32),

    #[error("account index {0} is not in the special account range")]
    NotSpecialAccountIndex(u32),

    #[error("wallet '{wallet}' cannot rewind to {target}: not the tip or a recorded ancestor")]
    InvalidRewind { wallet: String, target: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt wallet row: {0}")]
    Corrupt(String),

    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl From<hdsync_types::hashes::HashParseError> for WalletError {
    fn from(e: hdsync_types::hashes::HashParseError) -> Self {
        WalletError::Corrupt(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let e = WalletError::UnknownWallet("w1".into());
        assert_eq!(e.to_string(), "no wallet with name 'w1' could be found");

        let e = WalletError::WatchOnly("addresses");
        assert!(e.to_string().contains("watch-only"));
    }
}
