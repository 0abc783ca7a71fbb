//! Traits the wallet engine consumes chain data and script logic through.

use hdsync_types::{AddressType, Block, BlockHash, BlockHeader, Script, Transaction, Txid};
use sha2::{Digest, Sha256};

/// Supplier of headers and blocks for a single best chain.
///
/// Implementations are expected to answer from already-validated data;
/// `None` results signal data that is genuinely missing or unavailable,
/// not errors.
pub trait ChainSource: Send + Sync {
    /// Current best header, if any chain data exists yet.
    fn tip(&self) -> Option<BlockHeader>;

    /// Header of the best-chain ancestor at `height`.
    fn ancestor(&self, height: i64) -> Option<BlockHeader>;

    /// Block body for `hash`.
    fn block(&self, hash: &BlockHash) -> Option<Block>;

    /// Block bodies for several hashes; entries are `None` where the
    /// underlying store has no data.
    fn blocks(&self, hashes: &[BlockHash]) -> Vec<Option<Block>> {
        hashes.iter().map(|h| self.block(h)).collect()
    }

    /// Headers strictly after `after_height`, ascending, up to `limit`.
    fn headers_after(&self, after_height: i64, limit: u32) -> Vec<BlockHeader>;
}

/// Expands an output script into zero or more canonical destination scripts.
///
/// Destination scripts are what the wallet address table is keyed by, so
/// this is the seam that brings exotic script shapes (multisig, script-hash
/// wrapping) into plain script matching.
pub trait DestinationReader: Send + Sync {
    fn destinations(&self, script: &Script) -> Vec<Script>;
}

/// Destination reader for the two standard single-destination shapes.
///
/// Pay-to-pubkey-hash and pay-to-script-hash scripts are their own
/// canonical destination; anything else yields nothing. Federation
/// deployments substitute a reader that understands their multisig shapes.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardDestinationReader;

impl DestinationReader for StandardDestinationReader {
    fn destinations(&self, script: &Script) -> Vec<Script> {
        let b = script.as_bytes();
        let p2pkh = b.len() == 25
            && b[0] == 0x76
            && b[1] == 0xa9
            && b[2] == 0x14
            && b[23] == 0x88
            && b[24] == 0xac;
        let p2sh = b.len() == 23 && b[0] == 0xa9 && b[1] == 0x14 && b[22] == 0x87;

        if p2pkh || p2sh {
            vec![script.clone()]
        } else {
            Vec::new()
        }
    }
}

/// Derives the pubkey script for an address chain position.
///
/// Real key derivation is a collaborator outside this engine; the only
/// property the engine relies on is that the mapping from
/// `(xpub, chain, index)` to a script is deterministic and injective.
pub trait ScriptDeriver: Send + Sync {
    fn derive(&self, ext_pub_key: &str, address_type: AddressType, index: u32) -> Script;
}

/// Deterministic stand-in deriver: a pay-to-pubkey-hash shaped script whose
/// hash payload is SHA-256 of the derivation path, truncated to 20 bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Deriver;

impl ScriptDeriver for Sha256Deriver {
    fn derive(&self, ext_pub_key: &str, address_type: AddressType, index: u32) -> Script {
        let mut hasher = Sha256::new();
        hasher.update(ext_pub_key.as_bytes());
        hasher.update([address_type.as_i64() as u8]);
        hasher.update(index.to_le_bytes());
        let digest = hasher.finalize();

        let mut bytes = Vec::with_capacity(25);
        bytes.extend_from_slice(&[0x76, 0xa9, 0x14]);
        bytes.extend_from_slice(&digest[..20]);
        bytes.extend_from_slice(&[0x88, 0xac]);
        Script::new(bytes)
    }
}

/// Lookup of arbitrary transactions by id.
///
/// Returns `None` when the backing store has no transaction index at all;
/// callers that depend on resolution treat that as fatal.
pub trait TransactionIndex: Send + Sync {
    fn transactions_by_id(&self, txids: &[Txid]) -> Option<Vec<Transaction>>;
}
