//! Operation facade: the entry point shared by the CLI and the server.
//!
//! A [`Controller`] wires a provider, the output store, and the coloring
//! engine together and exposes one method per user-facing operation.
//! Inputs are validated before any provider interaction; transaction
//! construction holds a per-address lock and reserves the selected
//! outpoints until the draft is signed or abandoned.

use std::collections::BTreeMap;
use std::sync::Arc;

use bitcoin::address::NetworkUnchecked;
use bitcoin::{Address, Network, OutPoint, ScriptBuf, Txid};
use serde::Serialize;
use tracing::{debug, info};

use crate::builder::{IssuanceSpec, TransactionBuilder, TransactionDraft, TransferSpec};
use crate::cache::OutputStore;
use crate::color::ColoringEngine;
use crate::crowdsale::{CrowdsaleEngine, CrowdsaleState, Payment, PaymentOutput, PriceSchedule};
use crate::error::CoreError;
use crate::marker::MAX_ASSET_QUANTITY;
use crate::provider::ChainProvider;
use crate::types::{AssetId, Utxo};

/// Base58check version byte for asset ids (mainnet asset ids start
/// with `A`).
pub const DEFAULT_ASSET_VERSION_BYTE: u8 = 23;

pub const DEFAULT_DUST_LIMIT: u64 = 600;
pub const DEFAULT_FEE: u64 = 10_000;
pub const DEFAULT_MIN_CONFIRMATIONS: u32 = 1;
pub const DEFAULT_MAX_CONFIRMATIONS: u32 = 9_999_999;

// ==============================================================================
// Configuration
// ==============================================================================

#[derive(Debug, Clone)]
pub struct Config {
    pub network: Network,
    pub dust_limit: u64,
    pub default_fee: u64,
    pub asset_version_byte: u8,
    pub min_confirmations: u32,
    pub max_confirmations: u32,
}

impl Config {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            dust_limit: DEFAULT_DUST_LIMIT,
            default_fee: DEFAULT_FEE,
            asset_version_byte: DEFAULT_ASSET_VERSION_BYTE,
            min_confirmations: DEFAULT_MIN_CONFIRMATIONS,
            max_confirmations: DEFAULT_MAX_CONFIRMATIONS,
        }
    }
}

/// What to do with a constructed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Report what would happen without constructing state changes.
    /// Only `distribute` supports previews.
    Preview,
    Unsigned,
    Signed,
    Broadcast,
}

impl std::str::FromStr for Mode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(Self::Preview),
            "unsigned" => Ok(Self::Unsigned),
            "signed" => Ok(Self::Signed),
            "broadcast" => Ok(Self::Broadcast),
            other => Err(CoreError::InvalidData(format!(
                "unknown mode `{other}`; expected preview, unsigned, signed, or broadcast"
            ))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preview => write!(f, "preview"),
            Self::Unsigned => write!(f, "unsigned"),
            Self::Signed => write!(f, "signed"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

// ==============================================================================
// Operation Results
// ==============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct AssetBalance {
    pub asset_id: String,
    pub quantity: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceEntry {
    pub address: String,
    pub value: u64,
    pub assets: Vec<AssetBalance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnspentEntry {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub value: u64,
    pub confirmations: u32,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    pub asset_quantity: u64,
}

/// The rendered form of a constructed transaction, by mode.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessedTransaction {
    Unsigned { hex: String },
    Signed { hex: String },
    Broadcast { txid: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributionSummary {
    pub payment_txid: String,
    pub received: u64,
    pub collected: u64,
    pub units_issued: u64,
    pub price: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DistributeOutcome {
    pub sale_id: String,
    pub distributions: Vec<DistributionSummary>,
    pub transactions: Vec<ProcessedTransaction>,
}

// ==============================================================================
// Controller
// ==============================================================================

pub struct Controller {
    provider: Arc<dyn ChainProvider>,
    store: Arc<OutputStore>,
    engine: ColoringEngine,
    config: Config,
}

impl Controller {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        store: Arc<OutputStore>,
        config: Config,
    ) -> Self {
        let engine = ColoringEngine::new(Arc::clone(&provider), Arc::clone(&store));
        Self {
            provider,
            store,
            engine,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parse and network-check an address supplied by the user.
    pub fn parse_address(&self, text: &str) -> Result<Address, CoreError> {
        let unchecked: Address<NetworkUnchecked> =
            text.parse().map_err(|e| CoreError::InvalidAddress {
                address: text.to_owned(),
                reason: format!("{e}"),
            })?;
        unchecked
            .require_network(self.config.network)
            .map_err(|e| CoreError::InvalidAddress {
                address: text.to_owned(),
                reason: format!("{e}"),
            })
    }

    pub fn parse_asset_id(&self, text: &str) -> Result<AssetId, CoreError> {
        AssetId::from_base58(text, self.config.asset_version_byte)
    }

    // -- Read operations -------------------------------------------------------

    /// Aggregate native value and per-asset quantities by address. With
    /// no address the provider's wallet outputs are used.
    pub async fn get_balance(
        &self,
        address: Option<&Address>,
    ) -> Result<Vec<BalanceEntry>, CoreError> {
        let utxos = self.unspent_outputs(address).await?;

        let mut by_script: BTreeMap<ScriptBuf, (u64, BTreeMap<AssetId, u64>)> = BTreeMap::new();
        for utxo in &utxos {
            let entry = by_script
                .entry(utxo.output.script_pubkey.clone())
                .or_default();
            entry.0 += utxo.output.value.to_sat();
            if let Some(asset_id) = utxo.output.asset_id {
                *entry.1.entry(asset_id).or_default() += utxo.output.asset_quantity;
            }
        }

        Ok(by_script
            .into_iter()
            .map(|(script, (value, assets))| BalanceEntry {
                address: self.render_script(&script),
                value,
                assets: assets
                    .into_iter()
                    .map(|(asset_id, quantity)| AssetBalance {
                        asset_id: asset_id.to_base58(self.config.asset_version_byte),
                        quantity,
                    })
                    .collect(),
            })
            .collect())
    }

    /// List unspent outputs with their colored form.
    pub async fn list_unspent(
        &self,
        address: Option<&Address>,
    ) -> Result<Vec<UnspentEntry>, CoreError> {
        let utxos = self.unspent_outputs(address).await?;
        Ok(utxos
            .iter()
            .map(|utxo| UnspentEntry {
                txid: utxo.outpoint.txid.to_string(),
                vout: utxo.outpoint.vout,
                address: self.render_script(&utxo.output.script_pubkey),
                value: utxo.output.value.to_sat(),
                confirmations: utxo.confirmations,
                kind: utxo.output.kind.to_string(),
                asset_id: utxo
                    .output
                    .asset_id
                    .map(|id| id.to_base58(self.config.asset_version_byte)),
                asset_quantity: utxo.output.asset_quantity,
            })
            .collect())
    }

    // -- Transaction operations ------------------------------------------------

    /// Send plain bitcoin from one address.
    pub async fn send_bitcoin(
        &self,
        from: &Address,
        amount: u64,
        to: &Address,
        fee: Option<u64>,
        mode: Mode,
    ) -> Result<ProcessedTransaction, CoreError> {
        self.check_mode("sendbitcoin", mode)?;
        let from_script = from.script_pubkey();
        let _address_lock = self.store.lock_address(&from_script).await;

        let utxos = self.unspent_outputs(Some(from)).await?;
        let spec = TransferSpec {
            to_script: to.script_pubkey(),
            change_script: from_script,
            amount,
        };
        let draft = TransactionBuilder::new(self.config.dust_limit).transfer_bitcoin(
            &utxos,
            &spec,
            fee.unwrap_or(self.config.default_fee),
        )?;
        self.process("sendbitcoin", draft, mode).await
    }

    /// Send asset units from one address.
    pub async fn send_asset(
        &self,
        from: &Address,
        asset_id: &AssetId,
        quantity: u64,
        to: &Address,
        fee: Option<u64>,
        mode: Mode,
    ) -> Result<ProcessedTransaction, CoreError> {
        self.check_mode("sendasset", mode)?;
        if quantity == 0 {
            return Err(CoreError::InvalidData(
                "asset quantity must be positive".into(),
            ));
        }
        let from_script = from.script_pubkey();
        let _address_lock = self.store.lock_address(&from_script).await;

        let utxos = self.unspent_outputs(Some(from)).await?;
        let spec = TransferSpec {
            to_script: to.script_pubkey(),
            change_script: from_script,
            amount: quantity,
        };
        let draft = TransactionBuilder::new(self.config.dust_limit).transfer_assets(
            &utxos,
            asset_id,
            &spec,
            fee.unwrap_or(self.config.default_fee),
        )?;
        self.process("sendasset", draft, mode).await
    }

    /// Issue new asset units from an address. The asset id is derived
    /// from the issuing address's script.
    pub async fn issue_asset(
        &self,
        from: &Address,
        quantity: u64,
        to: Option<&Address>,
        metadata: Vec<u8>,
        fee: Option<u64>,
        mode: Mode,
    ) -> Result<ProcessedTransaction, CoreError> {
        self.check_mode("issueasset", mode)?;
        if quantity == 0 {
            return Err(CoreError::InvalidData(
                "asset quantity must be positive".into(),
            ));
        }
        if quantity > MAX_ASSET_QUANTITY {
            return Err(CoreError::QuantityOverflow(quantity));
        }
        let from_script = from.script_pubkey();
        let _address_lock = self.store.lock_address(&from_script).await;

        let utxos = self.unspent_outputs(Some(from)).await?;
        let spec = IssuanceSpec {
            to_script: to.unwrap_or(from).script_pubkey(),
            change_script: from_script,
            quantity,
            metadata,
        };
        let draft = TransactionBuilder::new(self.config.dust_limit).issue(
            &utxos,
            &spec,
            fee.unwrap_or(self.config.default_fee),
        )?;
        self.process("issueasset", draft, mode).await
    }

    /// Run one crowdsale pass: find confirmed payments to the sale
    /// address, plan distributions at the scheduled price, and render
    /// them per `mode`. The updated sale record is persisted before any
    /// transaction leaves the process; `Mode::Preview` persists nothing.
    ///
    /// `forward` must differ from the sale address: a forward output
    /// landing back at the sale address would be picked up as a fresh
    /// payment on the next pass and issue units against the sale's own
    /// funds.
    #[allow(clippy::too_many_arguments)]
    pub async fn distribute(
        &self,
        sale_id: &str,
        sale_address: &Address,
        forward: &Address,
        schedule: &PriceSchedule,
        reserve: Option<u64>,
        metadata: Vec<u8>,
        fee: Option<u64>,
        mode: Mode,
    ) -> Result<DistributeOutcome, CoreError> {
        if mode != Mode::Preview {
            self.check_mode("distribute", mode)?;
        }
        let sale_script = sale_address.script_pubkey();
        let forward_script = forward.script_pubkey();
        if forward_script == sale_script {
            return Err(CoreError::InvalidData(
                "forward address must differ from the sale address".into(),
            ));
        }
        let _address_lock = self.store.lock_address(&sale_script).await;

        let mut state = self
            .store
            .get_crowdsale_state(sale_id)?
            .unwrap_or_else(|| CrowdsaleState::new(sale_id));

        let utxos = self.unspent_outputs(Some(sale_address)).await?;
        // A transaction can pay the sale address on several outputs; they
        // settle as one payment so the full value is honored.
        let mut grouped: BTreeMap<Txid, Vec<&Utxo>> = BTreeMap::new();
        for utxo in &utxos {
            grouped.entry(utxo.outpoint.txid).or_default().push(utxo);
        }
        let mut payments = Vec::with_capacity(grouped.len());
        for (txid, outputs) in grouped {
            payments.push(Payment {
                txid,
                outputs: outputs
                    .iter()
                    .map(|utxo| PaymentOutput {
                        outpoint: utxo.outpoint,
                        value: utxo.output.value,
                    })
                    .collect(),
                script_pubkey: sale_script.clone(),
                payer_script: self.refund_script(&txid, &sale_script).await,
                confirmations: outputs[0].confirmations,
            });
        }

        let engine = CrowdsaleEngine::new(schedule.clone(), self.config.dust_limit);
        let fee = fee.unwrap_or(self.config.default_fee);
        let distributions = engine.plan(
            &mut state,
            &payments,
            reserve,
            &forward_script,
            &metadata,
            fee,
        )?;

        let summaries: Vec<DistributionSummary> = distributions
            .iter()
            .map(|dist| DistributionSummary {
                payment_txid: dist.payment_txid.to_string(),
                received: dist.received,
                collected: dist.collected,
                units_issued: dist.units_issued,
                price: dist.price,
            })
            .collect();

        if mode == Mode::Preview {
            return Ok(DistributeOutcome {
                sale_id: sale_id.to_owned(),
                distributions: summaries,
                transactions: Vec::new(),
            });
        }

        // The sale record must be durable before a distribution can
        // reach the network; a crash after this point replays as a
        // no-op.
        self.store.put_crowdsale_state(&state)?;
        info!(
            sale = sale_id,
            distributions = distributions.len(),
            cumulative = state.cumulative_received,
            issued = state.total_issued,
            "crowdsale state persisted"
        );

        let mut transactions = Vec::with_capacity(distributions.len());
        for dist in distributions {
            transactions.push(self.process("distribute", dist.draft, mode).await?);
        }

        Ok(DistributeOutcome {
            sale_id: sale_id.to_owned(),
            distributions: summaries,
            transactions,
        })
    }

    // -- Internals -------------------------------------------------------------

    /// Fail fast when the provider cannot carry out the requested mode.
    fn check_mode(&self, operation: &str, mode: Mode) -> Result<(), CoreError> {
        let caps = self.provider.capabilities();
        let missing = match mode {
            Mode::Preview => {
                return Err(CoreError::InvalidData(
                    "preview mode is only supported by distribute".into(),
                ));
            }
            Mode::Unsigned => None,
            Mode::Signed => (!caps.can_sign).then_some("sign transactions"),
            Mode::Broadcast => {
                if !caps.can_sign {
                    Some("sign transactions")
                } else {
                    (!caps.can_broadcast).then_some("broadcast transactions")
                }
            }
        };
        match missing {
            Some(capability) => Err(CoreError::Unsupported {
                operation: operation.to_owned(),
                capability: capability.to_owned(),
                available: caps.describe(),
            }),
            None => Ok(()),
        }
    }

    /// Render a finished draft per `mode`. The draft's inputs stay
    /// reserved until the transaction has been signed (or rendered
    /// unsigned); broadcast additionally evicts the spent outputs from
    /// the cache.
    async fn process(
        &self,
        operation: &str,
        draft: TransactionDraft,
        mode: Mode,
    ) -> Result<ProcessedTransaction, CoreError> {
        let outpoints = draft.input_outpoints();
        let _reservation = self.store.reserve(&outpoints)?;
        let unsigned = draft.unsigned_transaction();

        match mode {
            Mode::Preview => Err(CoreError::InvalidData(
                "preview mode is only supported by distribute".into(),
            )),
            Mode::Unsigned => Ok(ProcessedTransaction::Unsigned {
                hex: hex::encode(bitcoin::consensus::encode::serialize(&unsigned)),
            }),
            Mode::Signed => {
                let signed = self.provider.sign_transaction(&unsigned).await?;
                if !signed.complete {
                    return Err(CoreError::IncompleteSignature);
                }
                Ok(ProcessedTransaction::Signed {
                    hex: hex::encode(bitcoin::consensus::encode::serialize(&signed.transaction)),
                })
            }
            Mode::Broadcast => {
                let signed = self.provider.sign_transaction(&unsigned).await?;
                if !signed.complete {
                    return Err(CoreError::IncompleteSignature);
                }
                let txid = self.provider.broadcast_transaction(&signed.transaction).await?;
                self.store.evict_spent(&outpoints)?;
                info!(%txid, operation, "transaction broadcast");
                Ok(ProcessedTransaction::Broadcast {
                    txid: txid.to_string(),
                })
            }
        }
    }

    /// Fetch unspent outputs and resolve their colored form.
    async fn unspent_outputs(&self, address: Option<&Address>) -> Result<Vec<Utxo>, CoreError> {
        let addresses = address.map(|a| vec![a.clone()]);
        let refs = self
            .provider
            .list_unspent(
                addresses.as_deref(),
                self.config.min_confirmations,
                self.config.max_confirmations,
            )
            .await?;

        let mut utxos = Vec::with_capacity(refs.len());
        for unspent in refs {
            let output = self.engine.get_output(unspent.outpoint).await?;
            utxos.push(Utxo {
                outpoint: unspent.outpoint,
                output,
                confirmations: unspent.confirmations,
            });
        }
        Ok(utxos)
    }

    /// Where a crowdsale payment should be refunded: the script of the
    /// output spent by the payment's first input. Falls back to the sale
    /// script when the payment's ancestry cannot be resolved.
    async fn refund_script(&self, payment_txid: &Txid, sale_script: &ScriptBuf) -> ScriptBuf {
        let resolved: Result<Option<ScriptBuf>, CoreError> = async {
            let tx = self.provider.get_transaction(payment_txid).await?;
            let Some(first) = tx.input.first() else {
                return Ok(None);
            };
            if first.previous_output == OutPoint::null() {
                return Ok(None);
            }
            let spent = self.engine.get_output(first.previous_output).await?;
            Ok(Some(spent.script_pubkey))
        }
        .await;

        match resolved {
            Ok(Some(script)) => script,
            Ok(None) => sale_script.clone(),
            Err(err) => {
                debug!(payment = %payment_txid, error = %err, "falling back to the sale script for refunds");
                sale_script.clone()
            }
        }
    }

    fn render_script(&self, script: &ScriptBuf) -> String {
        match Address::from_script(script, self.config.network) {
            Ok(address) => address.to_string(),
            Err(_) => script.to_hex_string(),
        }
    }
}
