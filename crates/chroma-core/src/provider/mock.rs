//! A mock provider for tests. Returns canned transactions and unspent
//! outputs populated via the builder pattern, records broadcasts, and
//! "signs" by echoing the transaction back.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bitcoin::{Address, Transaction, Txid};

use crate::error::CoreError;

use super::{Capabilities, ChainInfo, ChainProvider, SignedTransaction, UnspentRef};

pub struct MockProvider {
    transactions: HashMap<Txid, Transaction>,
    unspents: Vec<UnspentRef>,
    capabilities: Capabilities,
    sign_complete: bool,
    chain_info: ChainInfo,
    broadcasts: Mutex<Vec<Transaction>>,
}

impl MockProvider {
    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder {
            transactions: HashMap::new(),
            unspents: Vec::new(),
            capabilities: Capabilities::full(),
            sign_complete: true,
            chain_info: ChainInfo {
                chain: "regtest".into(),
                blocks: 100,
            },
        }
    }

    /// Transactions submitted via `broadcast_transaction`, in order.
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.broadcasts
            .lock()
            .expect("mock broadcast lock is never poisoned")
            .clone()
    }
}

pub struct MockProviderBuilder {
    transactions: HashMap<Txid, Transaction>,
    unspents: Vec<UnspentRef>,
    capabilities: Capabilities,
    sign_complete: bool,
    chain_info: ChainInfo,
}

impl MockProviderBuilder {
    pub fn with_transaction(mut self, tx: Transaction) -> Self {
        self.transactions.insert(tx.compute_txid(), tx);
        self
    }

    pub fn with_unspent(mut self, unspent: UnspentRef) -> Self {
        self.unspents.push(unspent);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_incomplete_signatures(mut self) -> Self {
        self.sign_complete = false;
        self
    }

    pub fn with_chain_info(mut self, info: ChainInfo) -> Self {
        self.chain_info = info;
        self
    }

    pub fn build(self) -> MockProvider {
        MockProvider {
            transactions: self.transactions,
            unspents: self.unspents,
            capabilities: self.capabilities,
            sign_complete: self.sign_complete,
            chain_info: self.chain_info,
            broadcasts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn list_unspent(
        &self,
        _addresses: Option<&[Address]>,
        min_conf: u32,
        max_conf: u32,
    ) -> Result<Vec<UnspentRef>, CoreError> {
        Ok(self
            .unspents
            .iter()
            .filter(|unspent| {
                unspent.confirmations >= min_conf && unspent.confirmations <= max_conf
            })
            .copied()
            .collect())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        self.transactions
            .get(txid)
            .cloned()
            .ok_or(CoreError::TxNotFound(*txid))
    }

    async fn sign_transaction(&self, tx: &Transaction) -> Result<SignedTransaction, CoreError> {
        Ok(SignedTransaction {
            transaction: tx.clone(),
            complete: self.sign_complete,
        })
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, CoreError> {
        self.broadcasts
            .lock()
            .expect("mock broadcast lock is never poisoned")
            .push(tx.clone());
        Ok(tx.compute_txid())
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        Ok(self.chain_info.clone())
    }
}
