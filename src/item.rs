//! Item identifiers and QR payload decoding.
//!
//! An item identifier is the SHA-256 of the 8-byte big-endian batch id
//! followed by the raw serial bytes.  The fixed-width prefix keeps the
//! encoding unambiguous: `(1, "SN1")` and `(11, "N1")` hash different
//! preimages.  External clients must replicate this derivation bit-for-bit.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VeritagError};
use crate::util;

/// Byte length of an item identifier (SHA-256 digest).
pub const ITEM_ID_LEN: usize = 32;

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Deterministic identifier for one physical item.
///
/// Sole key for verification state; not reversible to the serial number
/// without knowing both derivation inputs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemId([u8; ITEM_ID_LEN]);

impl ItemId {
    pub fn from_bytes(bytes: [u8; ITEM_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ITEM_ID_LEN] {
        &self.0
    }

    /// Canonical lowercase hex form, as stored in the database.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex, tolerating an optional `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| {
            VeritagError::InvalidInput(format!("item identifier '{s}' is not valid hex: {e}"))
        })?;
        let arr: [u8; ITEM_ID_LEN] = bytes.as_slice().try_into().map_err(|_| {
            VeritagError::InvalidInput(format!(
                "item identifier '{s}' must be {ITEM_ID_LEN} bytes ({} hex chars)",
                ITEM_ID_LEN * 2
            ))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.to_hex())
    }
}

impl FromStr for ItemId {
    type Err = VeritagError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Derive the identifier for `(batch_id, serial)`.
pub fn derive_identifier(batch_id: u64, serial: &str) -> ItemId {
    let mut preimage = Vec::with_capacity(8 + serial.len());
    preimage.extend_from_slice(&batch_id.to_be_bytes());
    preimage.extend_from_slice(serial.as_bytes());
    ItemId(util::sha256(&preimage))
}

// ---------------------------------------------------------------------------
// Serial validation
// ---------------------------------------------------------------------------

/// Regex for serial numbers: starts with alphanumeric, then up to 127 more
/// alphanumeric / hyphen / dot / underscore characters.
static SERIAL_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.]{0,127}$").unwrap()
});

/// Validate a serial number format.
pub fn validate_serial(serial: &str) -> Result<()> {
    if serial.is_empty() {
        return Err(VeritagError::InvalidInput(
            "serial number must not be empty".into(),
        ));
    }
    if !SERIAL_RE.is_match(serial) {
        return Err(VeritagError::InvalidInput(format!(
            "invalid serial '{}': 1-128 chars, alphanumeric/hyphen/dot/underscore",
            serial
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// QR payloads
// ---------------------------------------------------------------------------

/// Decoded QR payload from the scanning collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub batch_id: u64,
    pub serial: String,
}

impl QrPayload {
    /// The item identifier this payload resolves to.
    pub fn item_id(&self) -> ItemId {
        derive_identifier(self.batch_id, &self.serial)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonPayload {
    batch_id: serde_json::Value,
    serial_number: String,
}

/// Decode a scanned QR payload.  Two equivalent wire formats are accepted:
///
/// - colon-separated: `"<batchId>:<serialNumber>"`
/// - structured text: `{"batchId": "<batchId>", "serialNumber": "<serialNumber>"}`
///
/// Both decode to the same `(batch_id, serial)` pair fed to
/// [`derive_identifier`].
pub fn parse_qr_payload(payload: &str) -> Result<QrPayload> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Err(VeritagError::InvalidInput("empty QR payload".into()));
    }

    let (batch_part, serial) = if payload.starts_with('{') {
        let parsed: JsonPayload = serde_json::from_str(payload).map_err(|e| {
            VeritagError::InvalidInput(format!("malformed JSON QR payload: {e}"))
        })?;
        let batch = match parsed.batch_id {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(VeritagError::InvalidInput(format!(
                    "QR payload batchId must be a string or number, got {other}"
                )))
            }
        };
        (batch, parsed.serial_number)
    } else {
        let (batch, serial) = payload.split_once(':').ok_or_else(|| {
            VeritagError::InvalidInput(format!(
                "QR payload '{payload}' is neither '<batchId>:<serial>' nor JSON"
            ))
        })?;
        (batch.to_string(), serial.to_string())
    };

    let batch_id: u64 = batch_part.trim().parse().map_err(|_| {
        VeritagError::InvalidInput(format!("QR payload batch id '{batch_part}' is not a positive integer"))
    })?;
    let serial = serial.trim().to_string();
    validate_serial(&serial)?;

    Ok(QrPayload { batch_id, serial })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
