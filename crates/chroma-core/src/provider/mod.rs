//! Ledger provider abstraction.
//!
//! Defines the [`ChainProvider`] trait and two implementations: a Bitcoin
//! Core JSON-RPC client ([`CoreRpcProvider`]) and a read-only REST API
//! client ([`ApiProvider`]) that can delegate signing and broadcast to a
//! fallback provider. A test mock lives in `mock`.

pub mod api;
pub mod bitcoind;
#[cfg(test)]
pub mod mock;

pub use api::ApiProvider;
pub use bitcoind::CoreRpcProvider;

use async_trait::async_trait;
use bitcoin::{Address, Transaction, Txid, OutPoint};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ==============================================================================
// Provider Types
// ==============================================================================

/// What a provider can do beyond reading the ledger. Operations degrade
/// gracefully: a read-only provider still supports previews and unsigned
/// drafts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub can_sign: bool,
    pub can_broadcast: bool,
}

impl Capabilities {
    pub fn full() -> Self {
        Self {
            can_sign: true,
            can_broadcast: true,
        }
    }

    pub fn read_only() -> Self {
        Self {
            can_sign: false,
            can_broadcast: false,
        }
    }

    /// The output modes these capabilities allow, for error messages.
    pub fn describe(&self) -> String {
        match (self.can_sign, self.can_broadcast) {
            (true, true) => "preview, unsigned, signed, broadcast".into(),
            (true, false) => "preview, unsigned, signed".into(),
            (false, _) => "preview, unsigned".into(),
        }
    }
}

/// A reference to an unspent output as reported by the provider. The
/// coloring engine resolves the full output separately so cached entries
/// are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnspentRef {
    pub outpoint: OutPoint,
    pub confirmations: u32,
}

/// The result of a signing round trip. `complete` is false when the
/// wallet could not produce all required signatures.
#[derive(Debug, Clone)]
pub struct SignedTransaction {
    pub transaction: Transaction,
    pub complete: bool,
}

/// Basic chain identification, checked once at startup so a client
/// configured for one network never builds transactions against another.
#[derive(Debug, Clone, Deserialize)]
pub struct ChainInfo {
    pub chain: String,
    pub blocks: u64,
}

// ==============================================================================
// Provider Trait
// ==============================================================================

/// The ledger operations the rest of the crate is written against.
///
/// Implementations handle authentication, transport, and response
/// decoding internally, and must be shareable across tasks.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Enumerate unspent outputs with confirmations in
    /// `min_conf..=max_conf`, optionally restricted to a set of
    /// addresses. `None` means the provider's own wallet, where it has
    /// one.
    async fn list_unspent(
        &self,
        addresses: Option<&[Address]>,
        min_conf: u32,
        max_conf: u32,
    ) -> Result<Vec<UnspentRef>, CoreError>;

    /// Fetch a raw transaction by txid.
    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, CoreError>;

    /// Fetch many raw transactions. Implementations may batch these into
    /// fewer round trips.
    async fn get_transactions(&self, txids: &[Txid]) -> Result<Vec<Transaction>, CoreError> {
        let mut results = Vec::with_capacity(txids.len());
        for txid in txids {
            results.push(self.get_transaction(txid).await?);
        }
        Ok(results)
    }

    /// Ask the provider's wallet to sign an unsigned transaction.
    async fn sign_transaction(&self, tx: &Transaction) -> Result<SignedTransaction, CoreError>;

    /// Submit a fully signed transaction to the network.
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, CoreError>;

    /// Fetch basic chain info (network name, block count).
    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError>;
}
