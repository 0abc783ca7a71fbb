//! Account and address bookkeeping shared by the projector and the store.

use std::collections::HashMap;

use hdsync_chain::ScriptDeriver;
use hdsync_types::{AddressType, HashHeight};

use crate::schema::AddressRow;

/// Fully-qualified position of an address within the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressIdentifier {
    pub wallet_id: i64,
    pub account_index: u32,
    pub address_type: AddressType,
    pub address_index: u32,
}

/// Immutable point-in-time view of a wallet, refreshed after each flush.
#[derive(Debug, Clone)]
pub struct WalletSnapshot {
    pub wallet_id: i64,
    pub name: String,
    pub tip: HashHeight,
}

struct AccountTopUp {
    ext_pub_key: Option<String>,
    // Next free index per address type, External then Internal.
    next_index: [u32; 2],
}

/// Keeps the address gap ahead of usage during projection.
///
/// When a receipt lands on address index `i`, every index up to
/// `i + lookahead` must exist so later transactions in the same batch can
/// still match. Watch-only accounts carry no key material and are never
/// topped up.
pub struct TopUpTracker {
    lookahead: u32,
    accounts: HashMap<(i64, u32), AccountTopUp>,
}

impl TopUpTracker {
    pub fn new(lookahead: u32) -> Self {
        TopUpTracker { lookahead, accounts: HashMap::new() }
    }

    pub fn register_account(
        &mut self,
        wallet_id: i64,
        account_index: u32,
        ext_pub_key: Option<String>,
        next_external: u32,
        next_internal: u32,
    ) {
        self.accounts.insert(
            (wallet_id, account_index),
            AccountTopUp { ext_pub_key, next_index: [next_external, next_internal] },
        );
    }

    /// Records that `used` received funds and derives any addresses needed
    /// to restore the lookahead gap. Returned rows are new and must be
    /// persisted by the caller.
    pub fn mark_used(
        &mut self,
        used: &AddressIdentifier,
        deriver: &dyn ScriptDeriver,
    ) -> Vec<AddressRow> {
        let Some(account) = self.accounts.get_mut(&(used.wallet_id, used.account_index)) else {
            return Vec::new();
        };
        let Some(xpub) = account.ext_pub_key.clone() else {
            return Vec::new();
        };

        let slot = used.address_type as usize;
        let mut created = Vec::new();
        while account.next_index[slot] <= used.address_index.saturating_add(self.lookahead) {
            let index = account.next_index[slot];
            let script = deriver.derive(&xpub, used.address_type, index);
            created.push(AddressRow {
                wallet_id: used.wallet_id,
                account_index: used.account_index,
                address_type: used.address_type,
                address_index: index,
                script_pub_key: script.to_hex(),
            });
            account.next_index[slot] = index + 1;
        }
        created
    }
}
