use bitcoin::{OutPoint, Txid};

/// Error taxonomy for the Chroma core.
///
/// Input errors are rejected before any provider interaction, resource
/// errors after a cache-consistent check, protocol errors on decode, and
/// ledger errors are propagated to the caller without retrying.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("transaction not found: {0}")]
    TxNotFound(Txid),

    #[error("invalid provider data: {0}")]
    InvalidData(String),

    #[error("invalid address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid asset id `{0}`")]
    InvalidAssetId(String),

    #[error("script is not a supported issuance script")]
    InvalidScript,

    #[error("asset quantity {0} exceeds the maximum encodable value")]
    QuantityOverflow(u64),

    #[error("script is not an Open Assets marker output")]
    NotAMarker,

    #[error("malformed marker payload: {0}")]
    MalformedMarker(String),

    #[error("insufficient funds: needed {needed} satoshis, only {available} available")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("insufficient asset units of {asset_id}: needed {needed}, only {available} available")]
    InsufficientAssets {
        asset_id: String,
        needed: u64,
        available: u64,
    },

    #[error("colored inputs exhausted while assigning asset units to output {output_index}")]
    InsufficientColor { output_index: usize },

    #[error("output value {value} is below the dust limit of {dust_limit}")]
    OutputBelowDust { value: u64, dust_limit: u64 },

    #[error("output {0} is reserved by another draft; retry with a fresh snapshot")]
    ReservationConflict(OutPoint),

    #[error(
        "operation `{operation}` requires a provider that can {capability}; \
         available operations: {available}"
    )]
    Unsupported {
        operation: String,
        capability: String,
        available: String,
    },

    #[error("asset reserve of sale `{sale_id}` cannot cover {owed} units ({remaining} remaining)")]
    InsufficientReserve {
        sale_id: String,
        owed: u64,
        remaining: u64,
    },

    #[error("invalid price schedule: {0}")]
    InvalidPriceSchedule(String),

    #[error("transaction could not be fully signed by the provider")]
    IncompleteSignature,

    #[error("cache store error: {0}")]
    Store(#[from] sled::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures at the ledger-client boundary.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("RPC transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("ledger returned an error (code {code}): {message}")]
    ServerError { code: i64, message: String },

    #[error("transaction rejected by the ledger: {0}")]
    RejectedByLedger(String),

    #[error("invalid RPC response: {0}")]
    InvalidResponse(String),

    #[error("batch response missing item with id {id}")]
    MissingBatchItem { id: u64 },
}
