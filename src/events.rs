//! Audit log event schema and hash-chain primitives.
//!
//! Every successful mutating registry operation appends exactly one event.
//! Events are append-only and hash-chained: each entry commits to its
//! predecessor, so any rewrite of history is detectable by replaying the
//! chain.  Off-chain indexers consume the exported stream; the engine never
//! depends on a listener.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VeritagError};
use crate::identity::Identity;
use crate::item::ItemId;
use crate::registry::BatchMetadata;
use crate::util;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RegistryInitialized,
    IssuerAuthorized,
    OwnershipTransferred,
    BatchRegistered,
    MetadataUpdated,
    ItemVerified,
    PauseSet,
}

impl EventKind {
    /// Stable string form used in the database and in chain preimages.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RegistryInitialized => "registry_initialized",
            Self::IssuerAuthorized => "issuer_authorized",
            Self::OwnershipTransferred => "ownership_transferred",
            Self::BatchRegistered => "batch_registered",
            Self::MetadataUpdated => "metadata_updated",
            Self::ItemVerified => "item_verified",
            Self::PauseSet => "pause_set",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "registry_initialized" => Ok(Self::RegistryInitialized),
            "issuer_authorized" => Ok(Self::IssuerAuthorized),
            "ownership_transferred" => Ok(Self::OwnershipTransferred),
            "batch_registered" => Ok(Self::BatchRegistered),
            "metadata_updated" => Ok(Self::MetadataUpdated),
            "item_verified" => Ok(Self::ItemVerified),
            "pause_set" => Ok(Self::PauseSet),
            other => Err(VeritagError::Other(format!("unknown event kind '{other}'"))),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Event payloads
// ---------------------------------------------------------------------------

/// Structured payload of one audit event.
///
/// Payloads carry the operation's key arguments plus the resulting counters
/// where relevant, so the full live state is reconstructable from the event
/// stream alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventPayload {
    RegistryInitialized {
        admin: Identity,
    },
    IssuerAuthorized {
        identity: Identity,
        authorized: bool,
        issuer_count: u64,
    },
    OwnershipTransferred {
        previous_admin: Identity,
        new_admin: Identity,
    },
    BatchRegistered {
        batch_id: u64,
        name: String,
        brand: String,
        identifier_count: u64,
        issuer: Identity,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<BatchMetadata>,
        total_products: u64,
    },
    MetadataUpdated {
        batch_id: u64,
        caller: Identity,
        metadata: BatchMetadata,
    },
    ItemVerified {
        item_id: ItemId,
        batch_id: u64,
        authentic: bool,
        verifier: Identity,
        ts_utc: String,
        total_verifications: u64,
    },
    PauseSet {
        paused: bool,
        admin: Identity,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RegistryInitialized { .. } => EventKind::RegistryInitialized,
            Self::IssuerAuthorized { .. } => EventKind::IssuerAuthorized,
            Self::OwnershipTransferred { .. } => EventKind::OwnershipTransferred,
            Self::BatchRegistered { .. } => EventKind::BatchRegistered,
            Self::MetadataUpdated { .. } => EventKind::MetadataUpdated,
            Self::ItemVerified { .. } => EventKind::ItemVerified,
            Self::PauseSet { .. } => EventKind::PauseSet,
        }
    }
}

// ---------------------------------------------------------------------------
// Stored event records
// ---------------------------------------------------------------------------

/// One row of the append-only audit log as stored and exported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub seq: i64,
    pub ts_utc: String,
    pub kind: EventKind,
    pub payload_json: String,
    pub payload_hash_hex: String,
    pub prev_hash_hex: String,
    pub entry_hash_hex: String,
}

impl EventRecord {
    /// Decode the structured payload.
    pub fn payload(&self) -> Result<EventPayload> {
        serde_json::from_str(&self.payload_json).map_err(|e| {
            VeritagError::Other(format!("decode event payload at seq {}: {e}", self.seq))
        })
    }
}

/// Previous-hash value for the first chain entry.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

/// Compute the chained hash of one entry.
///
/// The preimage commits to the predecessor, the payload digest, and the kind
/// tag, in that order.
pub fn chain_entry_hash(
    prev_hash: &[u8; 32],
    payload_hash: &[u8; 32],
    kind: EventKind,
) -> [u8; 32] {
    let kind_bytes = kind.as_str().as_bytes();
    let mut preimage = Vec::with_capacity(32 + 32 + kind_bytes.len());
    preimage.extend_from_slice(prev_hash);
    preimage.extend_from_slice(payload_hash);
    preimage.extend_from_slice(kind_bytes);
    util::sha256(&preimage)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
