//! Read-only REST API provider.
//!
//! Talks to a block-explorer style HTTP API (`addresses/{addr}/unspents`,
//! `transactions/{txid}/hex`) for ledger reads, so a client can run
//! without a local node. Signing and broadcast are delegated to an
//! optional fallback provider (typically [`super::CoreRpcProvider`]);
//! without one those operations degrade to `Unsupported`.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::consensus::encode;
use bitcoin::{Address, OutPoint, Transaction, Txid};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tracing::debug;

use crate::error::{CoreError, RpcError};

use super::{Capabilities, ChainInfo, ChainProvider, SignedTransaction, UnspentRef};

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct ApiProvider {
    client: reqwest::Client,
    base_url: String,
    network: String,
    limiter: Option<DirectRateLimiter>,
    fallback: Option<Arc<dyn ChainProvider>>,
}

impl ApiProvider {
    /// `base_url` is the API root, e.g. `https://api.example.com/v2/bitcoin`.
    /// `network` is reported as the chain name when no fallback provider
    /// can answer `getblockchaininfo` authoritatively.
    pub fn new(
        base_url: &str,
        network: &str,
        requests_per_second: Option<u32>,
        fallback: Option<Arc<dyn ChainProvider>>,
    ) -> Result<Self, CoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder uses valid static config");

        let limiter = match requests_per_second {
            None => None,
            Some(limit) => {
                let limit = NonZeroU32::new(limit).ok_or_else(|| {
                    CoreError::InvalidData("requests_per_second must be at least 1".to_owned())
                })?;
                Some(RateLimiter::direct(Quota::per_second(limit)))
            }
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            network: network.to_owned(),
            limiter,
            fallback,
        })
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, CoreError> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
        let url = format!("{}/{path}", self.base_url);
        debug!(%url, "api request");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(RpcError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(RpcError::Transport)?;
        debug!(%url, %status, body_len = body.len(), "api response");

        if !status.is_success() {
            return Err(RpcError::ServerError {
                code: i64::from(status.as_u16()),
                message: body,
            }
            .into());
        }
        serde_json::from_str(&body)
            .map_err(|e| RpcError::InvalidResponse(format!("decode API response: {e}")).into())
    }

    fn unsupported(&self, operation: &str, capability: &str) -> CoreError {
        CoreError::Unsupported {
            operation: operation.to_owned(),
            capability: capability.to_owned(),
            available: self.capabilities().describe(),
        }
    }
}

#[async_trait]
impl ChainProvider for ApiProvider {
    fn capabilities(&self) -> Capabilities {
        match &self.fallback {
            Some(fallback) => fallback.capabilities(),
            None => Capabilities::read_only(),
        }
    }

    async fn list_unspent(
        &self,
        addresses: Option<&[Address]>,
        min_conf: u32,
        max_conf: u32,
    ) -> Result<Vec<UnspentRef>, CoreError> {
        let Some(addresses) = addresses else {
            // The API has no wallet; only the fallback node can
            // enumerate its own outputs.
            return match &self.fallback {
                Some(fallback) => fallback.list_unspent(None, min_conf, max_conf).await,
                None => Err(self.unsupported("listunspent", "enumerate wallet outputs")),
            };
        };

        let mut unspents = Vec::new();
        for address in addresses {
            let raw = self.get_json(&format!("addresses/{address}/unspents")).await?;
            unspents.extend(parse_unspents(raw)?);
        }
        unspents.retain(|unspent| {
            unspent.confirmations >= min_conf && unspent.confirmations <= max_conf
        });
        Ok(unspents)
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        let raw = match self.get_json(&format!("transactions/{txid}/hex")).await {
            Err(CoreError::Rpc(RpcError::ServerError { code: 404, .. })) => {
                return Err(CoreError::TxNotFound(*txid));
            }
            other => other?,
        };
        parse_transaction_hex(raw)
    }

    async fn sign_transaction(&self, tx: &Transaction) -> Result<SignedTransaction, CoreError> {
        match &self.fallback {
            Some(fallback) => fallback.sign_transaction(tx).await,
            None => Err(self.unsupported("sign", "sign transactions")),
        }
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, CoreError> {
        match &self.fallback {
            Some(fallback) => fallback.broadcast_transaction(tx).await,
            None => Err(self.unsupported("broadcast", "broadcast transactions")),
        }
    }

    async fn get_blockchain_info(&self) -> Result<ChainInfo, CoreError> {
        match &self.fallback {
            Some(fallback) => fallback.get_blockchain_info().await,
            None => Ok(ChainInfo {
                chain: self.network.clone(),
                blocks: 0,
            }),
        }
    }
}

#[derive(Deserialize)]
struct UnspentEntry {
    transaction_hash: String,
    output_index: u32,
    #[serde(default)]
    confirmations: u32,
}

fn parse_unspents(raw: serde_json::Value) -> Result<Vec<UnspentRef>, CoreError> {
    let entries: Vec<UnspentEntry> = serde_json::from_value(raw)
        .map_err(|e| RpcError::InvalidResponse(format!("invalid unspents result: {e}")))?;
    entries
        .into_iter()
        .map(|entry| {
            let txid: Txid = entry.transaction_hash.parse().map_err(|e| {
                CoreError::from(RpcError::InvalidResponse(format!(
                    "invalid transaction hash in unspents: {e}"
                )))
            })?;
            Ok(UnspentRef {
                outpoint: OutPoint::new(txid, entry.output_index),
                confirmations: entry.confirmations,
            })
        })
        .collect()
}

fn parse_transaction_hex(raw: serde_json::Value) -> Result<Transaction, CoreError> {
    let hex_str = raw
        .get("hex")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| {
            CoreError::from(RpcError::InvalidResponse(format!(
                "missing hex in transaction result: {raw}"
            )))
        })?;
    let bytes = hex::decode(hex_str)
        .map_err(|e| RpcError::InvalidResponse(format!("invalid transaction hex: {e}")))?;
    encode::deserialize(&bytes)
        .map_err(|e| RpcError::InvalidResponse(format!("undecodable transaction: {e}")).into())
}
