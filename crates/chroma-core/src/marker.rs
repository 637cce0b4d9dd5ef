//! Open Assets marker output codec.
//!
//! The marker output is an OP_RETURN output whose pushdata carries the
//! asset quantities and issuance metadata of a transaction. The byte
//! layout follows the Open Assets Protocol exactly so third-party
//! decoders interoperate:
//!
//! ```text
//! 0x4f 0x41            marker tag ("OA")
//! 0x01 0x00            protocol version 1
//! varint               asset quantity count
//! LEB128 * count       asset quantities
//! varint               metadata length
//! bytes                metadata
//! ```
//!
//! Quantities use unsigned LEB128 and are capped at [`MAX_ASSET_QUANTITY`];
//! varints are Bitcoin CompactSize. Decoding is strict: non-minimal
//! varints and overlong LEB128 encodings are rejected, so every payload
//! has exactly one byte representation.

use bitcoin::opcodes::all::OP_RETURN;
use bitcoin::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf};

use crate::error::CoreError;

/// The two tag bytes identifying an Open Assets payload ("OA").
const MARKER_TAG: [u8; 2] = [0x4f, 0x41];

/// Protocol version 1, little-endian.
const MARKER_VERSION: [u8; 2] = [0x01, 0x00];

/// The largest asset quantity the protocol can encode.
pub const MAX_ASSET_QUANTITY: u64 = (1 << 63) - 1;

/// The decoded content of a marker output: per-output asset quantities in
/// transaction order, plus arbitrary issuer metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MarkerPayload {
    pub quantities: Vec<u64>,
    pub metadata: Vec<u8>,
}

impl MarkerPayload {
    pub fn new(quantities: Vec<u64>, metadata: Vec<u8>) -> Self {
        Self {
            quantities,
            metadata,
        }
    }

    /// Serialize the payload into an OP_RETURN script.
    ///
    /// Fails with [`CoreError::QuantityOverflow`] if any quantity exceeds
    /// the protocol's encodable range.
    pub fn to_script(&self) -> Result<ScriptBuf, CoreError> {
        let payload = self.to_payload_bytes()?;
        let push = PushBytesBuf::try_from(payload)
            .map_err(|_| CoreError::InvalidData("marker payload exceeds push size limit".into()))?;
        Ok(Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script())
    }

    /// Decode a marker output script.
    ///
    /// Fails with [`CoreError::NotAMarker`] if the script is not an
    /// OP_RETURN push carrying the Open Assets tag and version, and with
    /// [`CoreError::MalformedMarker`] on truncated or out-of-range data.
    pub fn from_script(script: &Script) -> Result<Self, CoreError> {
        let payload = extract_op_return_payload(script).ok_or(CoreError::NotAMarker)?;
        Self::from_payload_bytes(payload)
    }

    fn to_payload_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::with_capacity(8 + self.quantities.len() * 2 + self.metadata.len());
        out.extend_from_slice(&MARKER_TAG);
        out.extend_from_slice(&MARKER_VERSION);
        write_varint(self.quantities.len() as u64, &mut out);
        for &quantity in &self.quantities {
            if quantity > MAX_ASSET_QUANTITY {
                return Err(CoreError::QuantityOverflow(quantity));
            }
            write_leb128(quantity, &mut out);
        }
        write_varint(self.metadata.len() as u64, &mut out);
        out.extend_from_slice(&self.metadata);
        Ok(out)
    }

    fn from_payload_bytes(payload: &[u8]) -> Result<Self, CoreError> {
        if payload.len() < 4 || payload[0..2] != MARKER_TAG || payload[2..4] != MARKER_VERSION {
            return Err(CoreError::NotAMarker);
        }
        let mut offset = 4;

        let count = read_varint(payload, &mut offset)?;
        let mut quantities = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let quantity = read_leb128(payload, &mut offset)?;
            if quantity > MAX_ASSET_QUANTITY {
                return Err(CoreError::MalformedMarker(format!(
                    "asset quantity {quantity} exceeds the encodable maximum"
                )));
            }
            quantities.push(quantity);
        }

        let metadata_len = read_varint(payload, &mut offset)? as usize;
        let remaining = payload.len() - offset;
        if metadata_len != remaining {
            return Err(CoreError::MalformedMarker(format!(
                "metadata length {metadata_len} does not match {remaining} remaining bytes"
            )));
        }
        let metadata = payload[offset..].to_vec();

        Ok(Self {
            quantities,
            metadata,
        })
    }
}

/// Return the pushdata of an `OP_RETURN <push>` script, or `None` if the
/// script has any other shape.
fn extract_op_return_payload(script: &Script) -> Option<&[u8]> {
    let mut instructions = script.instructions();
    match instructions.next() {
        Some(Ok(Instruction::Op(OP_RETURN))) => {}
        _ => return None,
    }
    let payload = match instructions.next() {
        Some(Ok(Instruction::PushBytes(push))) => push.as_bytes(),
        _ => return None,
    };
    if instructions.next().is_some() {
        return None;
    }
    Some(payload)
}

// ==============================================================================
// Varint / LEB128 Primitives
// ==============================================================================

/// Bitcoin CompactSize encoding.
fn write_varint(value: u64, out: &mut Vec<u8>) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn read_varint(data: &[u8], offset: &mut usize) -> Result<u64, CoreError> {
    let truncated = || CoreError::MalformedMarker("truncated varint".into());

    let first = *data.get(*offset).ok_or_else(truncated)?;
    *offset += 1;
    let (width, value) = match first {
        0xfd => (2, None),
        0xfe => (4, None),
        0xff => (8, None),
        byte => (0, Some(u64::from(byte))),
    };
    if let Some(value) = value {
        return Ok(value);
    }

    let bytes = data
        .get(*offset..*offset + width)
        .ok_or_else(truncated)?;
    *offset += width;
    let mut buffer = [0u8; 8];
    buffer[..width].copy_from_slice(bytes);
    let value = u64::from_le_bytes(buffer);

    let minimum = match width {
        2 => 0xfd,
        4 => 0x1_0000,
        _ => 0x1_0000_0000,
    };
    if value < minimum {
        return Err(CoreError::MalformedMarker(format!(
            "non-minimal varint encoding of {value}"
        )));
    }
    Ok(value)
}

/// Unsigned LEB128 encoding, as specified for asset quantities.
fn write_leb128(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            return;
        }
    }
}

fn read_leb128(data: &[u8], offset: &mut usize) -> Result<u64, CoreError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = *data
            .get(*offset)
            .ok_or_else(|| CoreError::MalformedMarker("truncated LEB128 quantity".into()))?;
        *offset += 1;

        let bits = u64::from(byte & 0x7f);
        if shift >= 64 || (shift == 63 && bits > 1) {
            return Err(CoreError::MalformedMarker(
                "LEB128 quantity overflows 64 bits".into(),
            ));
        }
        result |= bits << shift;
        if byte & 0x80 == 0 {
            // A trailing zero byte after a continuation adds no bits;
            // the same value has a shorter encoding.
            if byte == 0 && shift > 0 {
                return Err(CoreError::MalformedMarker(
                    "overlong LEB128 quantity".into(),
                ));
            }
            return Ok(result);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(quantities: Vec<u64>, metadata: Vec<u8>) {
        let payload = MarkerPayload::new(quantities, metadata);
        let script = payload.to_script().expect("payload must encode");
        let decoded = MarkerPayload::from_script(&script).expect("script must decode");
        assert_eq!(payload, decoded);
    }

    #[test]
    fn round_trip_simple() {
        round_trip(vec![1, 300, 624], b"u=https://example.com/asset".to_vec());
    }

    #[test]
    fn round_trip_empty() {
        round_trip(Vec::new(), Vec::new());
    }

    #[test]
    fn round_trip_zero_quantities_and_max() {
        round_trip(vec![0, 0, MAX_ASSET_QUANTITY, 0], Vec::new());
    }

    #[test]
    fn round_trip_many_quantities() {
        // Forces the quantity count into the multi-byte varint range.
        round_trip((0..300).collect(), vec![0xAB; 64]);
    }

    #[test]
    fn leb128_known_encodings() {
        let mut out = Vec::new();
        write_leb128(300, &mut out);
        assert_eq!(out, vec![0xac, 0x02]);

        out.clear();
        write_leb128(624, &mut out);
        assert_eq!(out, vec![0xf0, 0x04]);

        out.clear();
        write_leb128(127, &mut out);
        assert_eq!(out, vec![0x7f]);

        out.clear();
        write_leb128(128, &mut out);
        assert_eq!(out, vec![0x80, 0x01]);
    }

    #[test]
    fn varint_known_encodings() {
        let mut out = Vec::new();
        write_varint(0xfc, &mut out);
        assert_eq!(out, vec![0xfc]);

        out.clear();
        write_varint(300, &mut out);
        assert_eq!(out, vec![0xfd, 0x2c, 0x01]);

        out.clear();
        write_varint(70_000, &mut out);
        assert_eq!(out, vec![0xfe, 0x70, 0x11, 0x01, 0x00]);
    }

    #[test]
    fn payload_layout_matches_protocol() {
        let payload = MarkerPayload::new(vec![300], b"md".to_vec());
        let bytes = payload.to_payload_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![0x4f, 0x41, 0x01, 0x00, 0x01, 0xac, 0x02, 0x02, b'm', b'd']
        );
    }

    #[test]
    fn encode_rejects_quantity_overflow() {
        let payload = MarkerPayload::new(vec![MAX_ASSET_QUANTITY + 1], Vec::new());
        assert!(matches!(
            payload.to_script(),
            Err(CoreError::QuantityOverflow(_))
        ));
    }

    #[test]
    fn decode_rejects_non_op_return() {
        let script = crate::test_util::p2wpkh_script(1);
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::NotAMarker)
        ));
    }

    #[test]
    fn decode_rejects_wrong_tag() {
        let push = PushBytesBuf::try_from(vec![0x4f, 0x42, 0x01, 0x00, 0x00, 0x00]).unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::NotAMarker)
        ));
    }

    #[test]
    fn decode_rejects_truncated_quantity() {
        // Count says two quantities, but the payload ends mid-LEB128.
        let push = PushBytesBuf::try_from(vec![0x4f, 0x41, 0x01, 0x00, 0x02, 0xac]).unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::MalformedMarker(_))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        // Metadata length 0 but one byte remains.
        let push = PushBytesBuf::try_from(vec![0x4f, 0x41, 0x01, 0x00, 0x00, 0x00, 0xff]).unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::MalformedMarker(_))
        ));
    }

    #[test]
    fn decode_rejects_overlong_leb128() {
        // 0x80 0x00 is a two-byte encoding of zero; only 0x00 is valid.
        let push =
            PushBytesBuf::try_from(vec![0x4f, 0x41, 0x01, 0x00, 0x01, 0x80, 0x00, 0x00]).unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::MalformedMarker(_))
        ));
    }

    #[test]
    fn decode_rejects_non_minimal_varint() {
        // Count 1 encoded as 0xfd 0x01 0x00 instead of the single byte.
        let push = PushBytesBuf::try_from(vec![
            0x4f, 0x41, 0x01, 0x00, 0xfd, 0x01, 0x00, 0x05, 0x00,
        ])
        .unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::MalformedMarker(_))
        ));
    }

    #[test]
    fn decode_rejects_oversized_leb128() {
        // Eleven continuation bytes overflow the 64-bit accumulator.
        let mut payload = vec![0x4f, 0x41, 0x01, 0x00, 0x01];
        payload.extend_from_slice(&[0xff; 10]);
        payload.push(0x01);
        payload.push(0x00);
        let push = PushBytesBuf::try_from(payload).unwrap();
        let script = Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script();
        assert!(matches!(
            MarkerPayload::from_script(&script),
            Err(CoreError::MalformedMarker(_))
        ));
    }
}
