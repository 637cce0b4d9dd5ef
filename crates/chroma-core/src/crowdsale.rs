//! Crowdsale distribution engine.
//!
//! Issues asset units against confirmed payments to a sale address, at a
//! price resolved from a threshold schedule. Each distribution transaction
//! is chained from the payment outputs it honors, so a double-spent payment
//! invalidates its own distribution; at-most-once processing is keyed by
//! the payment's transaction id and recorded in [`CrowdsaleState`], which
//! is persisted before any broadcast.

use std::collections::BTreeSet;

use bitcoin::{Amount, OutPoint, Script, ScriptBuf, TxOut, Txid};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::builder::{DraftInput, TransactionDraft};
use crate::color;
use crate::error::CoreError;
use crate::marker::MarkerPayload;
use crate::types::ColoredOutput;

// ==============================================================================
// Price Schedule
// ==============================================================================

/// One pricing rule: `price` satoshis per unit once the cumulative amount
/// received reaches `threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRule {
    pub threshold: u64,
    pub price: u64,
}

/// An ordered set of pricing rules. Thresholds are strictly increasing,
/// the first threshold is zero, and the last rule has no upper bound, so
/// a price can always be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSchedule {
    rules: Vec<PriceRule>,
}

impl PriceSchedule {
    pub fn new(rules: Vec<PriceRule>) -> Result<Self, CoreError> {
        if rules.is_empty() {
            return Err(CoreError::InvalidPriceSchedule(
                "schedule must contain at least one rule".into(),
            ));
        }
        if rules[0].threshold != 0 {
            return Err(CoreError::InvalidPriceSchedule(
                "first threshold must be 0".into(),
            ));
        }
        for window in rules.windows(2) {
            if window[1].threshold <= window[0].threshold {
                return Err(CoreError::InvalidPriceSchedule(format!(
                    "thresholds must be strictly increasing ({} then {})",
                    window[0].threshold, window[1].threshold
                )));
            }
        }
        if let Some(rule) = rules.iter().find(|rule| rule.price == 0) {
            return Err(CoreError::InvalidPriceSchedule(format!(
                "price must be positive (threshold {})",
                rule.threshold
            )));
        }
        Ok(Self { rules })
    }

    /// A single flat price for the whole sale.
    pub fn flat(price: u64) -> Result<Self, CoreError> {
        Self::new(vec![PriceRule {
            threshold: 0,
            price,
        }])
    }

    /// Parse `"5000"` (flat) or `"0:5000,100000:6000"` (threshold:price
    /// pairs).
    pub fn parse(text: &str) -> Result<Self, CoreError> {
        let invalid =
            |part: &str| CoreError::InvalidPriceSchedule(format!("cannot parse `{part}`"));

        if !text.contains(':') {
            let price = text.trim().parse::<u64>().map_err(|_| invalid(text))?;
            return Self::flat(price);
        }

        let mut rules = Vec::new();
        for part in text.split(',') {
            let (threshold, price) = part.trim().split_once(':').ok_or_else(|| invalid(part))?;
            rules.push(PriceRule {
                threshold: threshold.trim().parse().map_err(|_| invalid(part))?,
                price: price.trim().parse().map_err(|_| invalid(part))?,
            });
        }
        Self::new(rules)
    }

    /// The price applicable when `cumulative` satoshis have been received
    /// so far: the last rule whose threshold has been reached.
    pub fn price_at(&self, cumulative: u64) -> u64 {
        self.rules
            .iter()
            .rev()
            .find(|rule| rule.threshold <= cumulative)
            .map(|rule| rule.price)
            .unwrap_or_else(|| self.rules[0].price)
    }

    pub fn rules(&self) -> &[PriceRule] {
        &self.rules
    }
}

// ==============================================================================
// Sale State
// ==============================================================================

/// Persistent per-sale record. Never rolled back; replaying the same
/// payments against it is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrowdsaleState {
    pub sale_id: String,
    /// Transaction ids of payments already honored (or definitively
    /// settled with zero units).
    pub processed: BTreeSet<Txid>,
    /// Satoshis received across processed payments; drives price lookup.
    pub cumulative_received: u64,
    pub total_issued: u64,
}

impl CrowdsaleState {
    pub fn new(sale_id: impl Into<String>) -> Self {
        Self {
            sale_id: sale_id.into(),
            processed: BTreeSet::new(),
            cumulative_received: 0,
            total_issued: 0,
        }
    }
}

// ==============================================================================
// Payments and Distributions
// ==============================================================================

/// One unspent output of a payment transaction.
#[derive(Debug, Clone, Copy)]
pub struct PaymentOutput {
    pub outpoint: OutPoint,
    pub value: Amount,
}

/// A confirmed payment to the sale address, resolved by the facade.
///
/// All unspent sale outputs of one transaction form a single payment, so
/// a transaction paying the sale address on several outputs is settled
/// for its full value at once.
#[derive(Debug, Clone)]
pub struct Payment {
    pub txid: Txid,
    /// The unspent outputs of `txid` paying the sale address.
    pub outputs: Vec<PaymentOutput>,
    /// Script of the payment outputs (the sale address).
    pub script_pubkey: ScriptBuf,
    /// Script the issued units are sent back to.
    pub payer_script: ScriptBuf,
    pub confirmations: u32,
}

impl Payment {
    /// Total satoshis across this payment's sale outputs.
    pub fn total(&self) -> u64 {
        self.outputs
            .iter()
            .map(|output| output.value.to_sat())
            .sum()
    }
}

/// One planned distribution: the draft plus its accounting summary.
#[derive(Debug, Clone)]
pub struct Distribution {
    pub payment_txid: Txid,
    pub payer_script: ScriptBuf,
    pub received: u64,
    pub collected: u64,
    pub units_issued: u64,
    pub price: u64,
    pub draft: TransactionDraft,
}

// ==============================================================================
// Engine
// ==============================================================================

pub struct CrowdsaleEngine {
    schedule: PriceSchedule,
    dust_limit: u64,
}

impl CrowdsaleEngine {
    pub fn new(schedule: PriceSchedule, dust_limit: u64) -> Self {
        Self {
            schedule,
            dust_limit,
        }
    }

    /// Plan distributions for a batch of observed payments, updating
    /// `state` as each payment is settled.
    ///
    /// Payments are applied oldest-first (confirmation depth, then
    /// transaction id) so the price locks in at receipt order regardless
    /// of the order the batch was observed in. Payments already present
    /// in `state.processed` are skipped. When `supply_cap` is set and the
    /// remaining reserve cannot cover a payment, that payment is left
    /// pending for manual resolution and the rest of the batch continues.
    ///
    /// The caller must persist `state` before broadcasting any of the
    /// returned drafts.
    pub fn plan(
        &self,
        state: &mut CrowdsaleState,
        payments: &[Payment],
        supply_cap: Option<u64>,
        forward_script: &Script,
        metadata: &[u8],
        fee: u64,
    ) -> Result<Vec<Distribution>, CoreError> {
        crate::builder::check_sats(self.dust_limit, "dust limit")?;
        crate::builder::check_sats(fee, "fee")?;

        let mut ordered: Vec<&Payment> = payments.iter().collect();
        ordered.sort_by(|a, b| {
            b.confirmations
                .cmp(&a.confirmations)
                .then(a.txid.cmp(&b.txid))
        });

        let mut distributions = Vec::new();
        for payment in ordered {
            let txid = payment.txid;
            if payment.outputs.is_empty() || state.processed.contains(&txid) {
                debug!(sale = %state.sale_id, payment = %txid, "payment already processed");
                continue;
            }

            let value = payment.total();
            let price = self.schedule.price_at(state.cumulative_received);
            let effective = value.saturating_sub(fee + self.dust_limit);
            let units = effective / price;

            if units == 0 {
                debug!(
                    sale = %state.sale_id,
                    payment = %txid,
                    value,
                    price,
                    "payment too small to buy a unit; settled with zero units"
                );
                state.processed.insert(txid);
                state.cumulative_received += value;
                continue;
            }

            if let Some(cap) = supply_cap {
                let remaining = cap.saturating_sub(state.total_issued);
                if units > remaining {
                    let err = CoreError::InsufficientReserve {
                        sale_id: state.sale_id.clone(),
                        owed: units,
                        remaining,
                    };
                    warn!(
                        sale = %state.sale_id,
                        payment = %txid,
                        error = %err,
                        "leaving payment pending for manual resolution"
                    );
                    continue;
                }
            }

            let mut collected = units * price;
            let mut change = effective - collected;
            if change < self.dust_limit {
                collected += change;
                change = 0;
            }

            let draft =
                self.distribution_draft(payment, units, collected, change, forward_script, metadata)?;

            state.processed.insert(txid);
            state.cumulative_received += value;
            state.total_issued += units;

            distributions.push(Distribution {
                payment_txid: txid,
                payer_script: payment.payer_script.clone(),
                received: value,
                collected,
                units_issued: units,
                price,
                draft,
            });
        }

        Ok(distributions)
    }

    /// Build the distribution transaction chained from the payment
    /// outputs: issuance output to the payer, marker, collected funds
    /// forwarded, and sub-dust change returned with the issuance.
    fn distribution_draft(
        &self,
        payment: &Payment,
        units: u64,
        collected: u64,
        change: u64,
        forward_script: &Script,
        metadata: &[u8],
    ) -> Result<TransactionDraft, CoreError> {
        let inputs: Vec<DraftInput> = payment
            .outputs
            .iter()
            .map(|output| DraftInput {
                outpoint: output.outpoint,
                spent: ColoredOutput::uncolored(output.value, payment.script_pubkey.clone()),
            })
            .collect();

        let marker = MarkerPayload::new(vec![units], metadata.to_vec());
        // A collected amount below the dust limit cannot form a forward
        // output; it is returned to the payer with the issuance instead.
        let (issuance_value, forward_value) = if collected < self.dust_limit {
            (self.dust_limit + collected, 0)
        } else {
            (self.dust_limit, collected)
        };

        let mut outputs = vec![
            TxOut {
                value: Amount::from_sat(issuance_value),
                script_pubkey: payment.payer_script.clone(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: marker.to_script()?,
            },
        ];
        if forward_value > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(forward_value),
                script_pubkey: forward_script.to_owned(),
            });
        }
        if change > 0 {
            outputs.push(TxOut {
                value: Amount::from_sat(change),
                script_pubkey: payment.payer_script.clone(),
            });
        }

        let spent: Vec<ColoredOutput> = inputs.iter().map(|input| input.spent.clone()).collect();
        color::color_strict(&spent, &outputs)?;
        Ok(TransactionDraft::from_parts(inputs, outputs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{p2wpkh_script, txid_from_byte};

    const DUST: u64 = 600;
    const FEE: u64 = 1_000;

    fn payment(txid_byte: u8, value: u64, confirmations: u32) -> Payment {
        Payment {
            txid: txid_from_byte(txid_byte),
            outputs: vec![PaymentOutput {
                outpoint: OutPoint::new(txid_from_byte(txid_byte), 0),
                value: Amount::from_sat(value),
            }],
            script_pubkey: p2wpkh_script(50),
            payer_script: p2wpkh_script(txid_byte),
            confirmations,
        }
    }

    fn engine(schedule: PriceSchedule) -> CrowdsaleEngine {
        CrowdsaleEngine::new(schedule, DUST)
    }

    #[test]
    fn schedule_rejects_bad_shapes() {
        assert!(PriceSchedule::new(Vec::new()).is_err());
        assert!(PriceSchedule::new(vec![PriceRule {
            threshold: 10,
            price: 5
        }])
        .is_err());
        assert!(PriceSchedule::new(vec![
            PriceRule {
                threshold: 0,
                price: 5
            },
            PriceRule {
                threshold: 0,
                price: 6
            },
        ])
        .is_err());
        assert!(PriceSchedule::flat(0).is_err());
    }

    #[test]
    fn schedule_parses_flat_and_tiered_forms() {
        let flat = PriceSchedule::parse("5000").unwrap();
        assert_eq!(flat.price_at(0), 5000);
        assert_eq!(flat.price_at(u64::MAX), 5000);

        let tiered = PriceSchedule::parse("0:5000, 100000:6000").unwrap();
        assert_eq!(tiered.price_at(0), 5000);
        assert_eq!(tiered.price_at(99_999), 5000);
        assert_eq!(tiered.price_at(100_000), 6000);
    }

    #[test]
    fn plan_floors_units_and_accounts_fee_and_dust() {
        let mut state = CrowdsaleState::new("sale");
        let payments = vec![payment(1, 10_000, 3)];
        let dist = engine(PriceSchedule::flat(100).unwrap())
            .plan(&mut state, &payments, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();

        assert_eq!(dist.len(), 1);
        // effective = 10_000 - 1_000 - 600 = 8_400 -> 84 units at 100.
        assert_eq!(dist[0].units_issued, 84);
        assert_eq!(dist[0].collected, 8_400);
        assert_eq!(state.total_issued, 84);
        assert_eq!(state.cumulative_received, 10_000);
    }

    #[test]
    fn plan_folds_sub_dust_change_into_collected() {
        let mut state = CrowdsaleState::new("sale");
        let payments = vec![payment(1, 12_000, 3)];
        let dist = engine(PriceSchedule::flat(1_000).unwrap())
            .plan(&mut state, &payments, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();

        // effective = 10_400 -> 10 units, collected 10_000, change 400
        // folds into collected.
        assert_eq!(dist[0].units_issued, 10);
        assert_eq!(dist[0].collected, 10_400);
    }

    #[test]
    fn plan_is_idempotent_across_replays_and_duplicates() {
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(1, 10_000, 3), payment(1, 10_000, 3), payment(2, 10_000, 2)];
        let eng = engine(PriceSchedule::flat(100).unwrap());

        let first = eng
            .plan(&mut state, &batch, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert_eq!(first.len(), 2);

        let replay = eng
            .plan(&mut state, &batch, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert!(replay.is_empty());
        assert_eq!(state.processed.len(), 2);
    }

    #[test]
    fn price_locks_in_at_receipt_order() {
        // The older payment lands below the 50_000 threshold and must be
        // priced at the early rate even though it appears last in the
        // batch, after a newer payment that crosses the threshold.
        let schedule = PriceSchedule::parse("0:100,50000:200").unwrap();
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(2, 80_000, 1), payment(1, 40_000, 9)];

        let dist = engine(schedule)
            .plan(&mut state, &batch, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();

        assert_eq!(dist[0].payment_txid, txid_from_byte(1));
        assert_eq!(dist[0].price, 100);
        // The newer payment arrives when cumulative is 40_000, still
        // below the threshold.
        assert_eq!(dist[1].price, 100);
        assert_eq!(state.cumulative_received, 120_000);

        // A third payment after the threshold pays the late rate.
        let mut late = vec![payment(3, 30_000, 1)];
        late[0].confirmations = 1;
        let dist = engine(PriceSchedule::parse("0:100,50000:200").unwrap())
            .plan(&mut state, &late, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert_eq!(dist[0].price, 200);
    }

    #[test]
    fn multi_output_payment_settles_for_its_full_value() {
        // One transaction paying the sale address on two outputs must be
        // honored for both, in a single distribution spending both.
        let mut state = CrowdsaleState::new("sale");
        let mut pay = payment(1, 10_000, 3);
        pay.outputs.push(PaymentOutput {
            outpoint: OutPoint::new(txid_from_byte(1), 1),
            value: Amount::from_sat(10_000),
        });

        let dist = engine(PriceSchedule::flat(100).unwrap())
            .plan(&mut state, &[pay], None, &p2wpkh_script(90), b"", FEE)
            .unwrap();

        assert_eq!(dist.len(), 1);
        // effective = 20_000 - 1_000 - 600 = 18_400 -> 184 units at 100.
        assert_eq!(dist[0].received, 20_000);
        assert_eq!(dist[0].units_issued, 184);
        assert_eq!(state.cumulative_received, 20_000);
        assert_eq!(dist[0].draft.inputs().len(), 2);
    }

    #[test]
    fn fee_beyond_max_money_is_an_input_error() {
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(1, 10_000, 3)];
        let err = engine(PriceSchedule::flat(100).unwrap())
            .plan(&mut state, &batch, None, &p2wpkh_script(90), b"", u64::MAX)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidData(_)));
        assert!(state.processed.is_empty());
    }

    #[test]
    fn exhausted_supply_leaves_payment_pending() {
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(1, 10_000, 3)];
        let eng = engine(PriceSchedule::flat(100).unwrap());

        let dist = eng
            .plan(&mut state, &batch, Some(50), &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert!(dist.is_empty());
        assert!(!state.processed.contains(&txid_from_byte(1)));

        // Raising the cap lets the pending payment settle on the next run.
        let dist = eng
            .plan(&mut state, &batch, Some(100), &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert_eq!(dist.len(), 1);
        assert_eq!(dist[0].units_issued, 84);
    }

    #[test]
    fn zero_unit_payment_settles_without_a_draft() {
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(1, FEE + DUST + 50, 3)];
        let dist = engine(PriceSchedule::flat(100).unwrap())
            .plan(&mut state, &batch, None, &p2wpkh_script(90), b"", FEE)
            .unwrap();
        assert!(dist.is_empty());
        assert!(state.processed.contains(&txid_from_byte(1)));
    }

    #[test]
    fn distribution_draft_is_chained_from_the_payment() {
        let mut state = CrowdsaleState::new("sale");
        let batch = vec![payment(7, 20_000, 3)];
        let forward = p2wpkh_script(90);
        let dist = engine(PriceSchedule::flat(100).unwrap())
            .plan(&mut state, &batch, None, &forward, b"sale-meta", FEE)
            .unwrap();

        let draft = &dist[0].draft;
        assert_eq!(draft.inputs().len(), 1);
        assert_eq!(draft.inputs()[0].outpoint, batch[0].outputs[0].outpoint);

        // Issuance output to the payer, then the marker, then the
        // forwarded funds.
        assert_eq!(draft.outputs()[0].script_pubkey, p2wpkh_script(7));
        let marker = MarkerPayload::from_script(&draft.outputs()[1].script_pubkey).unwrap();
        assert_eq!(marker.quantities, vec![dist[0].units_issued]);
        assert_eq!(marker.metadata, b"sale-meta".to_vec());
        assert_eq!(draft.outputs()[2].script_pubkey, forward);
        assert_eq!(
            draft.outputs()[2].value,
            Amount::from_sat(dist[0].collected)
        );
    }
}
