//! The Open Assets color kernel and the coloring engine.
//!
//! The kernel maps input asset quantities to output asset quantities for
//! one transaction: outputs before the marker are issuance outputs colored
//! by the asset id of the script spent by the first input; outputs after
//! the marker are transfer outputs colored by an ordered walk over the
//! input asset units. A transaction whose marker cannot be honored is
//! entirely uncolored on the read side; the builder rejects such drafts
//! at construction time instead.

use std::sync::Arc;

use bitcoin::{OutPoint, Transaction, TxOut, Txid};
use futures::future::BoxFuture;
use tracing::debug;

use crate::cache::OutputStore;
use crate::error::CoreError;
use crate::marker::MarkerPayload;
use crate::provider::ChainProvider;
use crate::types::{AssetId, ColoredOutput, OutputKind};

// ==============================================================================
// Kernel
// ==============================================================================

#[derive(Debug, thiserror::Error)]
pub(crate) enum KernelError {
    #[error("marker declares more quantities than the transaction has outputs")]
    TooManyQuantities,

    #[error("marker present but the transaction has no resolvable inputs")]
    NoInputs,

    #[error("issuing script is not supported")]
    UnsupportedIssuanceScript,

    #[error("input asset units exhausted at output {output_index}")]
    ExhaustedInputs { output_index: usize },

    #[error("output {output_index} would mix units of different assets")]
    MixedAssets { output_index: usize },
}

/// Locate the first marker output of a transaction.
///
/// A structurally invalid payload behind the OP_RETURN does not qualify
/// as a marker; scanning continues so a later valid marker still wins.
pub fn find_marker(outputs: &[TxOut]) -> Option<(usize, MarkerPayload)> {
    for (index, output) in outputs.iter().enumerate() {
        match MarkerPayload::from_script(&output.script_pubkey) {
            Ok(payload) => return Some((index, payload)),
            Err(CoreError::NotAMarker) => {}
            Err(err) => {
                debug!(output_index = index, error = %err, "skipping malformed marker candidate");
            }
        }
    }
    None
}

/// Every output uncolored; the fallback for markerless and uncolorable
/// transactions.
pub(crate) fn uncolor_all(outputs: &[TxOut]) -> Vec<ColoredOutput> {
    outputs
        .iter()
        .map(|output| ColoredOutput::uncolored(output.value, output.script_pubkey.clone()))
        .collect()
}

/// Run the color kernel over a transaction whose marker has been located
/// and whose spent outputs are resolved, in input order.
pub(crate) fn apply_kernel(
    marker_index: usize,
    payload: &MarkerPayload,
    spent: &[ColoredOutput],
    outputs: &[TxOut],
) -> Result<Vec<ColoredOutput>, KernelError> {
    if payload.quantities.len() > outputs.len().saturating_sub(1) {
        return Err(KernelError::TooManyQuantities);
    }
    if spent.is_empty() {
        return Err(KernelError::NoInputs);
    }

    let mut result = Vec::with_capacity(outputs.len());

    // Issuance outputs, colored by the script spent by the first input.
    let mut issuance_asset = None;
    for (index, output) in outputs.iter().take(marker_index).enumerate() {
        let quantity = payload.quantities.get(index).copied().unwrap_or(0);
        let asset_id = if quantity > 0 {
            if issuance_asset.is_none() {
                issuance_asset = Some(
                    AssetId::from_script(&spent[0].script_pubkey)
                        .map_err(|_| KernelError::UnsupportedIssuanceScript)?,
                );
            }
            issuance_asset
        } else {
            None
        };
        result.push(ColoredOutput {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            asset_id,
            asset_quantity: quantity,
            kind: OutputKind::Issuance,
        });
    }

    let marker = &outputs[marker_index];
    result.push(ColoredOutput {
        value: marker.value,
        script_pubkey: marker.script_pubkey.clone(),
        asset_id: None,
        asset_quantity: 0,
        kind: OutputKind::Marker,
    });

    // Transfer outputs: consume input units in order. All units assigned
    // to one output must come from the same asset.
    let mut inputs = spent.iter();
    let mut current_asset: Option<AssetId> = None;
    let mut units_left = 0u64;

    for (index, output) in outputs.iter().enumerate().skip(marker_index + 1) {
        // The quantity list skips the marker output itself.
        let quantity = payload.quantities.get(index - 1).copied().unwrap_or(0);
        let mut needed = quantity;
        let mut asset_id: Option<AssetId> = None;

        while needed > 0 {
            if units_left == 0 {
                let Some(next) = inputs.next() else {
                    return Err(KernelError::ExhaustedInputs {
                        output_index: index,
                    });
                };
                current_asset = next.asset_id;
                units_left = next.asset_quantity;
                continue;
            }
            match current_asset {
                Some(id) => {
                    let take = units_left.min(needed);
                    needed -= take;
                    units_left -= take;
                    match asset_id {
                        None => asset_id = Some(id),
                        Some(existing) if existing != id => {
                            return Err(KernelError::MixedAssets {
                                output_index: index,
                            });
                        }
                        Some(_) => {}
                    }
                }
                // Units on an uncolored input carry no color; drop them.
                None => units_left = 0,
            }
        }

        result.push(ColoredOutput {
            value: output.value,
            script_pubkey: output.script_pubkey.clone(),
            asset_id,
            asset_quantity: quantity,
            kind: OutputKind::Transfer,
        });
    }

    Ok(result)
}

/// Strict coloring used to validate freshly built drafts: a kernel
/// violation is an error here, never an uncolored fallback.
pub(crate) fn color_strict(
    spent: &[ColoredOutput],
    outputs: &[TxOut],
) -> Result<Vec<ColoredOutput>, CoreError> {
    let Some((marker_index, payload)) = find_marker(outputs) else {
        return Ok(uncolor_all(outputs));
    };
    apply_kernel(marker_index, &payload, spent, outputs).map_err(|err| match err {
        KernelError::ExhaustedInputs { output_index } => {
            CoreError::InsufficientColor { output_index }
        }
        KernelError::TooManyQuantities => {
            CoreError::MalformedMarker("more quantities than non-marker outputs".into())
        }
        other => CoreError::InvalidData(other.to_string()),
    })
}

// ==============================================================================
// Coloring Engine
// ==============================================================================

/// Resolves colored outputs by walking transactions backwards through the
/// provider, memoizing results in the output cache.
///
/// Recursion terminates at markerless transactions: their outputs are
/// uncolored without resolving any further ancestry.
pub struct ColoringEngine {
    provider: Arc<dyn ChainProvider>,
    store: Arc<OutputStore>,
}

impl ColoringEngine {
    pub fn new(provider: Arc<dyn ChainProvider>, store: Arc<OutputStore>) -> Self {
        Self { provider, store }
    }

    /// Fetch the colored form of one output, consulting the cache first.
    pub fn get_output(&self, outpoint: OutPoint) -> BoxFuture<'_, Result<ColoredOutput, CoreError>> {
        Box::pin(async move {
            if let Some(hit) = self.store.get_output(&outpoint)? {
                return Ok(hit);
            }

            let tx = self.transaction(&outpoint.txid).await?;
            let colored = self.color_transaction(&tx).await?;
            for (index, output) in colored.iter().enumerate() {
                self.store
                    .put_output(&OutPoint::new(outpoint.txid, index as u32), output)?;
            }

            colored
                .into_iter()
                .nth(outpoint.vout as usize)
                .ok_or_else(|| {
                    CoreError::InvalidData(format!(
                        "output index {} out of range for transaction {}",
                        outpoint.vout, outpoint.txid
                    ))
                })
        })
    }

    /// Apply the marker (if present) to a raw transaction, resolving the
    /// spent outputs recursively. Kernel violations fall back to an
    /// entirely uncolored transaction, preserving the original data.
    pub async fn color_transaction(
        &self,
        tx: &Transaction,
    ) -> Result<Vec<ColoredOutput>, CoreError> {
        let Some((marker_index, payload)) = find_marker(&tx.output) else {
            return Ok(uncolor_all(&tx.output));
        };

        if tx.input.is_empty()
            || tx
                .input
                .iter()
                .any(|input| input.previous_output == OutPoint::null())
        {
            debug!(
                txid = %tx.compute_txid(),
                "marker on a coinbase-like transaction; treating outputs as uncolored"
            );
            return Ok(uncolor_all(&tx.output));
        }

        let mut spent = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            spent.push(self.get_output(input.previous_output).await?);
        }

        match apply_kernel(marker_index, &payload, &spent, &tx.output) {
            Ok(colored) => Ok(colored),
            Err(err) => {
                debug!(
                    txid = %tx.compute_txid(),
                    error = %err,
                    "marker could not be honored; treating outputs as uncolored"
                );
                Ok(uncolor_all(&tx.output))
            }
        }
    }

    async fn transaction(&self, txid: &Txid) -> Result<Transaction, CoreError> {
        if let Some(tx) = self.store.cached_transaction(txid).await {
            return Ok(tx);
        }
        let tx = self.provider.get_transaction(txid).await?;
        self.store.cache_transaction(tx.clone()).await;
        Ok(tx)
    }
}
