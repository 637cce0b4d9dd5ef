//! Unsigned transaction construction for issuance, asset transfer, and
//! plain bitcoin sends.
//!
//! Input selection is deterministic for a given snapshot of unspent
//! outputs: candidates are ordered by descending size, then descending
//! confirmations, then outpoint. The builder never estimates fees; the
//! caller supplies an explicit fee or the configured default.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::color;
use crate::error::CoreError;
use crate::marker::MarkerPayload;
use crate::types::{AssetId, ColoredOutput, Utxo};

// ==============================================================================
// Drafts
// ==============================================================================

/// One selected input of a draft: the outpoint and the output it spends.
#[derive(Debug, Clone)]
pub struct DraftInput {
    pub outpoint: OutPoint,
    pub spent: ColoredOutput,
}

/// An unsigned transaction under construction.
///
/// Drafts are only mutated inside the builder; once returned they are
/// read-only and can be rendered into a `bitcoin::Transaction` for
/// signing.
#[derive(Debug, Clone)]
pub struct TransactionDraft {
    inputs: Vec<DraftInput>,
    outputs: Vec<TxOut>,
}

impl TransactionDraft {
    pub(crate) fn from_parts(inputs: Vec<DraftInput>, outputs: Vec<TxOut>) -> Self {
        Self { inputs, outputs }
    }

    pub fn inputs(&self) -> &[DraftInput] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[TxOut] {
        &self.outputs
    }

    pub fn input_outpoints(&self) -> Vec<OutPoint> {
        self.inputs.iter().map(|input| input.outpoint).collect()
    }

    /// Render the draft as an unsigned transaction.
    pub fn unsigned_transaction(&self) -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|input| TxIn {
                    previous_output: input.outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs.clone(),
        }
    }
}

// ==============================================================================
// Specs
// ==============================================================================

/// Parameters of an issuance transaction.
#[derive(Debug, Clone)]
pub struct IssuanceSpec {
    /// Script receiving the newly issued units.
    pub to_script: ScriptBuf,
    /// Script receiving uncolored change.
    pub change_script: ScriptBuf,
    pub quantity: u64,
    pub metadata: Vec<u8>,
}

/// Parameters of a transfer (asset units or plain bitcoin).
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub to_script: ScriptBuf,
    pub change_script: ScriptBuf,
    /// Asset units for `transfer_assets`, satoshis for `transfer_bitcoin`.
    pub amount: u64,
}

// ==============================================================================
// Builder
// ==============================================================================

/// Reject a satoshi amount beyond the total currency supply. Caller
/// inputs arrive as arbitrary `u64`s; once every term is in range, sums
/// of a draft's monetary components cannot overflow.
pub(crate) fn check_sats(value: u64, what: &str) -> Result<(), CoreError> {
    if value > Amount::MAX_MONEY.to_sat() {
        return Err(CoreError::InvalidData(format!(
            "{what} of {value} satoshis exceeds the maximum money supply"
        )));
    }
    Ok(())
}

pub struct TransactionBuilder {
    dust_limit: u64,
}

impl TransactionBuilder {
    pub fn new(dust_limit: u64) -> Self {
        Self { dust_limit }
    }

    fn check_amounts(&self, fee: u64) -> Result<(), CoreError> {
        check_sats(self.dust_limit, "dust limit")?;
        check_sats(fee, "fee")
    }

    /// Build an issuance draft: uncolored inputs covering `fee + dust`,
    /// one issuance output carrying `spec.quantity`, the marker output,
    /// and uncolored change when the residual is at or above the dust
    /// limit (smaller residuals are absorbed into the fee).
    pub fn issue(
        &self,
        utxos: &[Utxo],
        spec: &IssuanceSpec,
        fee: u64,
    ) -> Result<TransactionDraft, CoreError> {
        self.check_amounts(fee)?;
        let needed = fee + self.dust_limit;
        let (inputs, total) = self.collect_uncolored(utxos, needed)?;

        let marker = MarkerPayload::new(vec![spec.quantity], spec.metadata.clone());
        let mut outputs = vec![
            TxOut {
                value: Amount::from_sat(self.dust_limit),
                script_pubkey: spec.to_script.clone(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: marker.to_script()?,
            },
        ];

        let residual = total - fee - self.dust_limit;
        if residual >= self.dust_limit {
            outputs.push(TxOut {
                value: Amount::from_sat(residual),
                script_pubkey: spec.change_script.clone(),
            });
        }

        self.finalize(inputs, outputs)
    }

    /// Build an asset transfer draft: colored inputs of `asset_id` summing
    /// to at least `spec.amount`, the marker output first, the transfer
    /// output, colored change back to the sender when the inputs
    /// over-cover, and uncolored change for leftover native value.
    pub fn transfer_assets(
        &self,
        utxos: &[Utxo],
        asset_id: &AssetId,
        spec: &TransferSpec,
        fee: u64,
    ) -> Result<TransactionDraft, CoreError> {
        self.check_amounts(fee)?;
        let (mut inputs, collected_units) = self.collect_colored(utxos, asset_id, spec.amount)?;

        let mut quantities = vec![spec.amount];
        let mut colored_outputs = vec![TxOut {
            value: Amount::from_sat(self.dust_limit),
            script_pubkey: spec.to_script.clone(),
        }];
        if collected_units > spec.amount {
            quantities.push(collected_units - spec.amount);
            colored_outputs.push(TxOut {
                value: Amount::from_sat(self.dust_limit),
                script_pubkey: spec.change_script.clone(),
            });
        }

        // Native value carried by the colored inputs goes toward the dust
        // pinned to the colored outputs and the fee; top up from uncolored
        // outputs when it does not cover both.
        let mut inputs_value: u64 = inputs.iter().map(|input| input.spent.value.to_sat()).sum();
        let pinned: u64 = self.dust_limit * colored_outputs.len() as u64;
        if inputs_value < pinned + fee {
            let (extra, extra_total) = self.collect_uncolored(utxos, pinned + fee - inputs_value)?;
            inputs.extend(extra);
            inputs_value += extra_total;
        }

        let residual = inputs_value - pinned - fee;
        let marker = MarkerPayload::new(quantities, Vec::new());
        let mut outputs = vec![TxOut {
            value: Amount::ZERO,
            script_pubkey: marker.to_script()?,
        }];
        outputs.extend(colored_outputs);
        if residual >= self.dust_limit {
            outputs.push(TxOut {
                value: Amount::from_sat(residual),
                script_pubkey: spec.change_script.clone(),
            });
        }

        self.finalize(inputs, outputs)
    }

    /// Build a plain bitcoin send. Colored inputs are never selected, so a
    /// send can not accidentally destroy asset metadata.
    pub fn transfer_bitcoin(
        &self,
        utxos: &[Utxo],
        spec: &TransferSpec,
        fee: u64,
    ) -> Result<TransactionDraft, CoreError> {
        self.check_amounts(fee)?;
        check_sats(spec.amount, "amount")?;
        if spec.amount < self.dust_limit {
            return Err(CoreError::OutputBelowDust {
                value: spec.amount,
                dust_limit: self.dust_limit,
            });
        }
        let (inputs, total) = self.collect_uncolored(utxos, spec.amount + fee)?;

        let mut outputs = vec![TxOut {
            value: Amount::from_sat(spec.amount),
            script_pubkey: spec.to_script.clone(),
        }];
        let residual = total - spec.amount - fee;
        if residual >= self.dust_limit {
            outputs.push(TxOut {
                value: Amount::from_sat(residual),
                script_pubkey: spec.change_script.clone(),
            });
        }

        self.finalize(inputs, outputs)
    }

    /// Run the color kernel over the finished draft, rejecting any draft
    /// whose outputs could not be colored from its inputs. This enforces
    /// the conservation invariant at construction time instead of relying
    /// on the read-side uncolored fallback.
    fn finalize(
        &self,
        inputs: Vec<DraftInput>,
        outputs: Vec<TxOut>,
    ) -> Result<TransactionDraft, CoreError> {
        let draft = TransactionDraft { inputs, outputs };
        let spent: Vec<ColoredOutput> = draft
            .inputs
            .iter()
            .map(|input| input.spent.clone())
            .collect();
        color::color_strict(&spent, &draft.outputs)?;
        Ok(draft)
    }

    fn collect_uncolored(
        &self,
        utxos: &[Utxo],
        needed: u64,
    ) -> Result<(Vec<DraftInput>, u64), CoreError> {
        let mut candidates: Vec<&Utxo> = utxos
            .iter()
            .filter(|utxo| !utxo.output.is_colored())
            .collect();
        candidates.sort_by(|a, b| {
            b.output
                .value
                .cmp(&a.output.value)
                .then(b.confirmations.cmp(&a.confirmations))
                .then(a.outpoint.cmp(&b.outpoint))
        });

        let mut inputs = Vec::new();
        let mut total = 0u64;
        for utxo in candidates {
            if total >= needed {
                break;
            }
            total += utxo.output.value.to_sat();
            inputs.push(DraftInput {
                outpoint: utxo.outpoint,
                spent: utxo.output.clone(),
            });
        }

        if total < needed {
            return Err(CoreError::InsufficientFunds {
                needed,
                available: total,
            });
        }
        Ok((inputs, total))
    }

    fn collect_colored(
        &self,
        utxos: &[Utxo],
        asset_id: &AssetId,
        needed: u64,
    ) -> Result<(Vec<DraftInput>, u64), CoreError> {
        let mut candidates: Vec<&Utxo> = utxos
            .iter()
            .filter(|utxo| utxo.output.asset_id.as_ref() == Some(asset_id))
            .collect();
        // Largest quantities first keeps the input count small.
        candidates.sort_by(|a, b| {
            b.output
                .asset_quantity
                .cmp(&a.output.asset_quantity)
                .then(b.confirmations.cmp(&a.confirmations))
                .then(a.outpoint.cmp(&b.outpoint))
        });

        let mut inputs = Vec::new();
        let mut total = 0u64;
        for utxo in candidates {
            if total >= needed {
                break;
            }
            // Quantities are not satoshis; a handful of near-maximum
            // holdings can exceed u64 when summed.
            total = total.saturating_add(utxo.output.asset_quantity);
            inputs.push(DraftInput {
                outpoint: utxo.outpoint,
                spent: utxo.output.clone(),
            });
        }

        if total < needed {
            return Err(CoreError::InsufficientAssets {
                asset_id: asset_id.to_base58(crate::operations::DEFAULT_ASSET_VERSION_BYTE),
                needed,
                available: total,
            });
        }
        Ok((inputs, total))
    }
}
