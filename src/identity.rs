//! Caller identities.
//!
//! The wallet/signing layer that authenticates callers is an external
//! collaborator; the engine only ever sees already-authenticated 20-byte
//! account identities, rendered as hex strings at every boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VeritagError};

/// Byte length of an account identity.
pub const IDENTITY_LEN: usize = 20;

/// A fixed-size account identity.
///
/// The all-zero identity is the null sentinel rejected by every
/// access-control operation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identity([u8; IDENTITY_LEN]);

impl Identity {
    /// The null identity.
    pub const ZERO: Identity = Identity([0u8; IDENTITY_LEN]);

    pub fn from_bytes(bytes: [u8; IDENTITY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTITY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; IDENTITY_LEN]
    }

    /// Canonical lowercase hex form (no prefix), as stored in the database.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex, tolerating an optional `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| {
            VeritagError::InvalidInput(format!("identity '{s}' is not valid hex: {e}"))
        })?;
        let arr: [u8; IDENTITY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            VeritagError::InvalidInput(format!(
                "identity '{s}' must be {IDENTITY_LEN} bytes ({} hex chars)",
                IDENTITY_LEN * 2
            ))
        })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({})", self.to_hex())
    }
}

impl FromStr for Identity {
    type Err = VeritagError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Identity {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Identity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = Identity::from_bytes([0xab; IDENTITY_LEN]);
        let parsed = Identity::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn accepts_0x_prefix() {
        let bare = "a".repeat(40);
        let prefixed = format!("0x{bare}");
        assert_eq!(
            Identity::from_hex(&bare).unwrap(),
            Identity::from_hex(&prefixed).unwrap()
        );
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex(&"a".repeat(64)).is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!(Identity::from_hex(&"zz".repeat(20)).is_err());
    }

    #[test]
    fn zero_identity() {
        assert!(Identity::ZERO.is_zero());
        assert!(!Identity::from_bytes([1; IDENTITY_LEN]).is_zero());
        assert_eq!(Identity::from_hex(&"00".repeat(20)).unwrap(), Identity::ZERO);
    }

    #[test]
    fn serde_as_hex_string() {
        let id = Identity::from_bytes([0x11; IDENTITY_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "11".repeat(20)));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
