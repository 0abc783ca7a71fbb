//! Interest indexes: which scripts and outpoints belong to the wallets of a
//! batch round.
//!
//! Both indexes keep a confirmed map mirroring the store and a tentative
//! overlay for entries created during the current batch. A flush either
//! promotes the overlay into the confirmed map or discards it, so a failed
//! batch never leaves phantom interest behind.

use std::collections::HashMap;
use std::sync::RwLock;

use hdsync_types::{OutPoint, Script};

use crate::account::AddressIdentifier;

struct Overlay<K> {
    confirmed: HashMap<K, Vec<AddressIdentifier>>,
    tentative: HashMap<K, Vec<AddressIdentifier>>,
}

impl<K: std::hash::Hash + Eq + Clone> Overlay<K> {
    fn new() -> Self {
        Overlay { confirmed: HashMap::new(), tentative: HashMap::new() }
    }

    fn add_confirmed(&mut self, key: K, id: AddressIdentifier) {
        let entry = self.confirmed.entry(key).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
    }

    fn add_tentative(&mut self, key: K, id: AddressIdentifier) {
        let already_confirmed =
            self.confirmed.get(&key).map(|v| v.contains(&id)).unwrap_or(false);
        debug_assert!(!already_confirmed, "tentative entry already confirmed");
        let entry = self.tentative.entry(key).or_default();
        if !entry.contains(&id) {
            entry.push(id);
        }
    }

    fn lookup(&self, key: &K) -> Option<Vec<AddressIdentifier>> {
        let mut out: Vec<AddressIdentifier> =
            self.confirmed.get(key).cloned().unwrap_or_default();
        if let Some(tentative) = self.tentative.get(key) {
            for id in tentative {
                if !out.contains(id) {
                    out.push(*id);
                }
            }
        }
        if out.is_empty() { None } else { Some(out) }
    }

    fn confirm(&mut self) {
        let tentative = std::mem::take(&mut self.tentative);
        for (key, ids) in tentative {
            for id in ids {
                self.add_confirmed(key.clone(), id);
            }
        }
    }

    fn discard(&mut self) {
        self.tentative.clear();
    }
}

/// Script-to-owning-addresses index for one batch scope.
pub struct AddressLookup {
    inner: RwLock<Overlay<Script>>,
}

impl AddressLookup {
    pub fn new() -> Self {
        AddressLookup { inner: RwLock::new(Overlay::new()) }
    }

    pub fn add_confirmed(&self, script: Script, id: AddressIdentifier) {
        self.inner.write().expect("interest lock").add_confirmed(script, id);
    }

    /// Registers a script created during the current batch; visible to
    /// lookups immediately, durable only after `confirm`.
    pub fn add_tentative(&self, script: Script, id: AddressIdentifier) {
        self.inner.write().expect("interest lock").add_tentative(script, id);
    }

    pub fn owners(&self, script: &Script) -> Option<Vec<AddressIdentifier>> {
        self.inner.read().expect("interest lock").lookup(script)
    }

    pub fn contains(&self, script: &Script) -> bool {
        self.owners(script).is_some()
    }

    pub fn confirm_tentative(&self) {
        self.inner.write().expect("interest lock").confirm();
    }

    pub fn discard_tentative(&self) {
        self.inner.write().expect("interest lock").discard();
    }
}

impl Default for AddressLookup {
    fn default() -> Self {
        Self::new()
    }
}

/// Outpoint-to-owning-addresses index for one batch scope.
pub struct OutpointLookup {
    inner: RwLock<Overlay<OutPoint>>,
}

impl OutpointLookup {
    pub fn new() -> Self {
        OutpointLookup { inner: RwLock::new(Overlay::new()) }
    }

    pub fn add_confirmed(&self, outpoint: OutPoint, id: AddressIdentifier) {
        self.inner.write().expect("interest lock").add_confirmed(outpoint, id);
    }

    /// Registers an output created during the current batch so a later
    /// transaction in the same batch can be seen to spend it.
    pub fn add_tentative(&self, outpoint: OutPoint, id: AddressIdentifier) {
        self.inner.write().expect("interest lock").add_tentative(outpoint, id);
    }

    pub fn owners(&self, outpoint: &OutPoint) -> Option<Vec<AddressIdentifier>> {
        self.inner.read().expect("interest lock").lookup(outpoint)
    }

    pub fn confirm_tentative(&self) {
        self.inner.write().expect("interest lock").confirm();
    }

    pub fn discard_tentative(&self) {
        self.inner.write().expect("interest lock").discard();
    }
}

impl Default for OutpointLookup {
    fn default() -> Self {
        Self::new()
    }
}
