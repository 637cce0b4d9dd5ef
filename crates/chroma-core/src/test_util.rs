//! Shared test helpers for `chroma-core` unit tests.
//!
//! Consolidates builder functions for raw transactions (`make_tx`,
//! `txout`) and cached unspent outputs (`uncolored_utxo`, `colored_utxo`)
//! so that tests across modules share a single source of truth for dummy
//! data construction.

use bitcoin::absolute::LockTime;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};

use crate::types::{AssetId, ColoredOutput, OutputKind, Utxo};

/// Create a deterministic `Txid` from a single distinguishing byte.
/// Useful for building small test fixtures where txids only need to be
/// unique.
pub fn txid_from_byte(b: u8) -> Txid {
    let mut bytes = [0u8; 32];
    bytes[0] = b;
    Txid::from_byte_array(bytes)
}

/// A minimal valid P2WPKH scriptPubKey (`OP_0 PUSH20 <hash>`), with the
/// hash filled by `b` so scripts from different bytes never collide.
pub fn p2wpkh_script(b: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[b; 20]);
    ScriptBuf::from_bytes(bytes)
}

pub fn txout(sats: u64, script_pubkey: ScriptBuf) -> TxOut {
    TxOut {
        value: Amount::from_sat(sats),
        script_pubkey,
    }
}

/// Build a raw transaction spending the given outpoints.
pub fn make_tx(prevouts: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: prevouts
            .into_iter()
            .map(|previous_output| TxIn {
                previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// A cached unspent output carrying only native value.
pub fn uncolored_utxo(txid_byte: u8, vout: u32, sats: u64) -> Utxo {
    Utxo {
        outpoint: OutPoint::new(txid_from_byte(txid_byte), vout),
        output: ColoredOutput::uncolored(Amount::from_sat(sats), p2wpkh_script(txid_byte)),
        confirmations: 6,
    }
}

/// A cached unspent output carrying `quantity` units of the asset issued
/// by `asset_script`.
pub fn colored_utxo(
    txid_byte: u8,
    vout: u32,
    sats: u64,
    asset_script: &Script,
    quantity: u64,
) -> Utxo {
    let asset_id = AssetId::from_script(asset_script).expect("test asset script is non-empty");
    Utxo {
        outpoint: OutPoint::new(txid_from_byte(txid_byte), vout),
        output: ColoredOutput {
            value: Amount::from_sat(sats),
            script_pubkey: p2wpkh_script(txid_byte),
            asset_id: Some(asset_id),
            asset_quantity: quantity,
            kind: OutputKind::Transfer,
        },
        confirmations: 6,
    }
}
