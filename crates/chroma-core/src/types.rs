//! Domain types for the Open Assets colored-coin model.
//!
//! Contains the asset identifier (`AssetId`), the colored output types
//! (`ColoredOutput`, `OutputKind`), and the cached unspent output (`Utxo`).

use bitcoin::hashes::{hash160, Hash};
use bitcoin::{Amount, OutPoint, Script, ScriptBuf};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ==============================================================================
// Asset Id
// ==============================================================================

/// A 20-byte asset identifier, derived deterministically from the issuing
/// output's locking script as `RIPEMD160(SHA256(script))`.
///
/// Equal issuing scripts always yield equal identifiers. The human-readable
/// form is base58check with a configurable version byte (23 by convention,
/// which makes mainnet asset ids start with `A`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AssetId([u8; 20]);

impl AssetId {
    /// Derive the asset id from the issuing output's scriptPubKey.
    pub fn from_script(script: &Script) -> Result<Self, CoreError> {
        if script.is_empty() {
            return Err(CoreError::InvalidScript);
        }
        let digest = hash160::Hash::hash(script.as_bytes());
        Ok(Self(digest.to_byte_array()))
    }

    pub fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Base58check representation with the given version byte.
    pub fn to_base58(&self, version_byte: u8) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(version_byte);
        payload.extend_from_slice(&self.0);
        bitcoin::base58::encode_check(&payload)
    }

    /// Parse a base58check asset id, checking the version byte and length.
    pub fn from_base58(encoded: &str, version_byte: u8) -> Result<Self, CoreError> {
        let payload = bitcoin::base58::decode_check(encoded)
            .map_err(|_| CoreError::InvalidAssetId(encoded.to_owned()))?;
        if payload.len() != 21 || payload[0] != version_byte {
            return Err(CoreError::InvalidAssetId(encoded.to_owned()));
        }
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&payload[1..]);
        Ok(Self(bytes))
    }
}

// ==============================================================================
// Colored Outputs
// ==============================================================================

/// The role an output plays under the Open Assets marker convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Carries only native-currency value.
    Uncolored,
    /// An output positioned before the marker, carrying newly issued units.
    Issuance,
    /// The marker output itself; spendable value is zero by convention.
    Marker,
    /// An output positioned after the marker, carrying transferred units.
    Transfer,
}

impl std::fmt::Display for OutputKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uncolored => write!(f, "uncolored"),
            Self::Issuance => write!(f, "issuance"),
            Self::Marker => write!(f, "marker"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

/// A ledger output enriched with optional asset metadata.
///
/// An output with `asset_id == None` is uncolored and carries only its
/// native value; a colored output additionally carries `asset_quantity`
/// units of `asset_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColoredOutput {
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub asset_id: Option<AssetId>,
    pub asset_quantity: u64,
    pub kind: OutputKind,
}

impl ColoredOutput {
    /// An output with no asset metadata.
    pub fn uncolored(value: Amount, script_pubkey: ScriptBuf) -> Self {
        Self {
            value,
            script_pubkey,
            asset_id: None,
            asset_quantity: 0,
            kind: OutputKind::Uncolored,
        }
    }

    pub fn is_colored(&self) -> bool {
        self.asset_id.is_some()
    }
}

/// An unspent output as tracked by the output cache: the outpoint, the
/// decoded colored output, and the confirmation depth observed when the
/// provider was last queried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub output: ColoredOutput,
    pub confirmations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::p2wpkh_script;

    #[test]
    fn asset_id_is_deterministic() {
        let script = p2wpkh_script(7);
        let a = AssetId::from_script(&script).unwrap();
        let b = AssetId::from_script(&script).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn asset_id_differs_for_differing_scripts() {
        let a = AssetId::from_script(&p2wpkh_script(1)).unwrap();
        let b = AssetId::from_script(&p2wpkh_script(2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn asset_id_rejects_empty_script() {
        let err = AssetId::from_script(Script::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidScript));
    }

    #[test]
    fn asset_id_base58_round_trip() {
        let id = AssetId::from_script(&p2wpkh_script(3)).unwrap();
        let encoded = id.to_base58(23);
        let decoded = AssetId::from_base58(&encoded, 23).unwrap();
        assert_eq!(id, decoded);
    }

    #[test]
    fn asset_id_base58_rejects_wrong_version_byte() {
        let id = AssetId::from_script(&p2wpkh_script(3)).unwrap();
        let encoded = id.to_base58(23);
        assert!(matches!(
            AssetId::from_base58(&encoded, 5),
            Err(CoreError::InvalidAssetId(_))
        ));
    }

    #[test]
    fn asset_id_base58_rejects_garbage() {
        assert!(matches!(
            AssetId::from_base58("not-base58-at-all", 23),
            Err(CoreError::InvalidAssetId(_))
        ));
    }
}
