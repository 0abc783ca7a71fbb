use hdsync_types::Txid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FederationError {
    /// The chain source has no tip yet; retry once headers arrive.
    #[error("no chain tip available yet")]
    NoChainTip,

    /// The requested height is above the maturity floor; retry later.
    #[error("height {requested} is not mature yet, mature tip is {mature_tip}")]
    NotMature { requested: i64, mature_tip: i64 },

    /// The chain source cannot look transactions up by id. Refund address
    /// resolution cannot proceed without it.
    #[error("transaction indexing must be enabled")]
    MissingTxIndex,

    /// A deposit's funding transaction could not be resolved.
    #[error("source transaction {0} not found")]
    MissingSourceTransaction(Txid),
}

impl FederationError {
    /// Whether the condition is expected and recoverable, as opposed to a
    /// deployment or data integrity problem.
    pub fn is_transient(&self) -> bool {
        matches!(self, FederationError::NoChainTip | FederationError::NotMature { .. })
    }
}
