//! The registry state machine: issuers, product batches, verification state,
//! and the tamper-evident, append-only audit log, all in one SQLite database.
//!
//! Every mutating operation runs inside a single immediate (write-locking)
//! transaction that validates all preconditions before touching state and
//! appends its audit event before committing.  That transaction boundary is
//! what serializes concurrent callers: only one writer at a time, each call
//! fully applied or fully rejected.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension as _, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::config::Limits;
use crate::error::{OptionExt as _, Result, ResultExt as _, VeritagError};
use crate::events::{chain_entry_hash, EventKind, EventPayload, EventRecord, GENESIS_HASH};
use crate::identity::Identity;
use crate::item::ItemId;
use crate::util;

pub const REGISTRY_SCHEMA_VERSION: i64 = 1;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryMeta {
    pub registry_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
}

/// Optional descriptive fields of a batch.  The only mutable part of a
/// [`ProductBatch`] after registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    #[serde(default)]
    pub ref_hash: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub image_uri: Option<String>,
}

impl BatchMetadata {
    pub fn is_empty(&self) -> bool {
        self.ref_hash.is_none() && self.description.is_none() && self.image_uri.is_none()
    }
}

/// An immutable product batch record.
///
/// Reads never fail on unknown ids; they return the `exists = false`
/// sentinel produced by [`ProductBatch::missing`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductBatch {
    pub batch_id: u64,
    pub name: String,
    pub brand: String,
    pub registered_at_utc: String,
    pub issuer: Identity,
    pub identifier_count: u64,
    pub metadata: BatchMetadata,
    pub exists: bool,
}

impl ProductBatch {
    /// Sentinel for an unregistered batch id.
    pub fn missing(batch_id: u64) -> Self {
        Self {
            batch_id,
            name: String::new(),
            brand: String::new(),
            registered_at_utc: String::new(),
            issuer: Identity::ZERO,
            identifier_count: 0,
            metadata: BatchMetadata::default(),
            exists: false,
        }
    }
}

/// One append-only verification record.  Records for the same identifier
/// accumulate in call order and are never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub seq: i64,
    pub item_id: ItemId,
    pub batch_id: u64,
    pub verifier: Identity,
    pub ts_utc: String,
    pub authentic: bool,
}

/// Consistent snapshot of the engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_products: u64,
    pub total_verifications: u64,
    pub issuer_count: u64,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct Registry {
    conn: Connection,
    meta: RegistryMeta,
    limits: Limits,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("meta", &self.meta)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a new registry database.  The deploying caller becomes the
    /// Administrator and is auto-authorized as an issuer; initial pause state
    /// is Active.
    pub fn create_new(db_path: &Path, admin: Identity, limits: Limits) -> Result<Self> {
        if admin.is_zero() {
            return Err(VeritagError::InvalidInput(
                "administrator identity must not be the zero identity".into(),
            ));
        }
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                VeritagError::Other(format!(
                    "create db parent dir {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut conn = Connection::open(db_path)
            .map_err(|e| VeritagError::Other(format!("open db {}: {e}", db_path.display())))?;
        create_schema(&conn)?;

        let meta = RegistryMeta {
            registry_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: REGISTRY_SCHEMA_VERSION,
        };

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        meta_set(&tx, "registry_id", &meta.registry_id.to_string())?;
        meta_set(&tx, "created_at_utc", &meta.created_at_utc)?;
        meta_set(&tx, "schema_version", &meta.schema_version.to_string())?;
        meta_set(&tx, "admin", &admin.to_hex())?;
        meta_set(&tx, "paused", "0")?;
        meta_set(&tx, "total_products", "0")?;
        meta_set(&tx, "total_verifications", "0")?;
        insert_issuer(&tx, &admin, &meta.created_at_utc)?;
        append_event(
            &tx,
            &meta.created_at_utc,
            &EventPayload::RegistryInitialized { admin },
        )?;
        tx.commit()?;

        info!(registry_id = %meta.registry_id, admin = %admin, "registry initialized");
        Ok(Self { conn, meta, limits })
    }

    /// Open an existing registry database.
    pub fn open_existing(db_path: &Path, limits: Limits) -> Result<Self> {
        let conn = Connection::open(db_path)
            .map_err(|e| VeritagError::Other(format!("open db {}: {e}", db_path.display())))?;

        let registry_id = meta_get(&conn, "registry_id")
            .ctx_store("read registry_id")?
            .required_store("registry_id missing (not a veritag database?)")?;
        let created_at_utc = meta_get(&conn, "created_at_utc")?
            .required_store("created_at_utc missing")?;
        let schema_version: i64 = meta_get(&conn, "schema_version")?
            .required_store("schema_version missing")?
            .parse()
            .ctx_store("parse schema_version")?;

        if schema_version != REGISTRY_SCHEMA_VERSION {
            return Err(VeritagError::Other(format!(
                "unsupported schema_version {schema_version} (expected {REGISTRY_SCHEMA_VERSION})"
            )));
        }

        let meta = RegistryMeta {
            registry_id: Uuid::parse_str(&registry_id).ctx_store("parse registry_id uuid")?,
            created_at_utc,
            schema_version,
        };
        Ok(Self { conn, meta, limits })
    }

    pub fn meta(&self) -> &RegistryMeta {
        &self.meta
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    // -----------------------------------------------------------------------
    // Access control
    // -----------------------------------------------------------------------

    /// Add or remove `identity` from the issuer set.  Administrator only.
    ///
    /// Repeat calls with the same value are no-op safe but still emit an
    /// event.  Available while paused.
    pub fn authorize_issuer(
        &mut self,
        caller: Identity,
        identity: Identity,
        authorized: bool,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_admin(&tx, &caller)?;
        if identity.is_zero() {
            return Err(VeritagError::InvalidInput(
                "issuer identity must not be the zero identity".into(),
            ));
        }

        let ts = util::now_utc_rfc3339();
        if authorized {
            insert_issuer(&tx, &identity, &ts)?;
        } else {
            remove_issuer(&tx, &identity)?;
        }
        let issuer_count = issuer_count_db(&tx)?;
        append_event(
            &tx,
            &ts,
            &EventPayload::IssuerAuthorized {
                identity,
                authorized,
                issuer_count,
            },
        )?;
        tx.commit()?;

        info!(identity = %identity, authorized, issuer_count, "issuer authorization updated");
        Ok(())
    }

    /// Transfer administrator authority to `new_admin`.
    ///
    /// Ownership and issuer rights move together: the old administrator
    /// leaves the issuer set and the new administrator joins it.  Available
    /// while paused.
    pub fn transfer_ownership(&mut self, caller: Identity, new_admin: Identity) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_admin(&tx, &caller)?;
        if new_admin.is_zero() {
            return Err(VeritagError::InvalidInput(
                "new administrator must not be the zero identity".into(),
            ));
        }
        let previous_admin = current_admin(&tx)?;
        if new_admin == previous_admin {
            return Err(VeritagError::InvalidInput(
                "new administrator equals the current administrator".into(),
            ));
        }

        let ts = util::now_utc_rfc3339();
        meta_set(&tx, "admin", &new_admin.to_hex())?;
        remove_issuer(&tx, &previous_admin)?;
        insert_issuer(&tx, &new_admin, &ts)?;
        append_event(
            &tx,
            &ts,
            &EventPayload::OwnershipTransferred {
                previous_admin,
                new_admin,
            },
        )?;
        tx.commit()?;

        info!(previous = %previous_admin, new = %new_admin, "ownership transferred");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pause / circuit breaker
    // -----------------------------------------------------------------------

    /// Engage the circuit breaker.  Administrator only; fails if already
    /// paused.
    pub fn pause(&mut self, caller: Identity) -> Result<()> {
        self.set_paused(caller, true)
    }

    /// Release the circuit breaker.  Administrator only; fails if already
    /// active.
    pub fn unpause(&mut self, caller: Identity) -> Result<()> {
        self.set_paused(caller, false)
    }

    fn set_paused(&mut self, caller: Identity, paused: bool) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_admin(&tx, &caller)?;
        if is_paused_db(&tx)? == paused {
            return Err(VeritagError::InvalidState(if paused {
                "already paused".into()
            } else {
                "not paused".into()
            }));
        }

        let ts = util::now_utc_rfc3339();
        meta_set(&tx, "paused", if paused { "1" } else { "0" })?;
        append_event(
            &tx,
            &ts,
            &EventPayload::PauseSet {
                paused,
                admin: caller,
            },
        )?;
        tx.commit()?;

        info!(paused, "pause state changed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Batch registry
    // -----------------------------------------------------------------------

    /// Register an immutable product batch.  Authorized issuers only, while
    /// active.  Only the identifier *count* is stored: identifiers are
    /// derived and checked lazily at verification time.
    pub fn register_batch(
        &mut self,
        caller: Identity,
        batch_id: u64,
        name: &str,
        brand: &str,
        item_ids: &[ItemId],
        metadata: Option<BatchMetadata>,
    ) -> Result<ProductBatch> {
        let max_identifiers = self.limits.max_batch_identifiers;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_active(&tx)?;
        ensure_issuer(&tx, &caller)?;

        let name = name.trim();
        let brand = brand.trim();
        let db_id = validate_batch_id(batch_id)?;
        if name.is_empty() {
            return Err(VeritagError::InvalidInput("batch name must not be empty".into()));
        }
        if brand.is_empty() {
            return Err(VeritagError::InvalidInput("batch brand must not be empty".into()));
        }
        if item_ids.is_empty() {
            return Err(VeritagError::InvalidInput(
                "batch must carry at least one item identifier".into(),
            ));
        }
        if item_ids.len() > max_identifiers {
            return Err(VeritagError::InvalidInput(format!(
                "batch carries {} item identifiers (limit {max_identifiers})",
                item_ids.len()
            )));
        }
        if batch_exists_db(&tx, batch_id)? {
            return Err(VeritagError::AlreadyExists(batch_id));
        }

        let registered_at_utc = util::now_utc_rfc3339();
        let metadata = metadata.unwrap_or_default();
        tx.execute(
            r#"
            INSERT INTO batches(
              batch_id, name, brand, registered_at_utc, issuer, identifier_count,
              ref_hash, description, image_uri
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            "#,
            params![
                db_id,
                name,
                brand,
                registered_at_utc,
                caller.to_hex(),
                item_ids.len() as i64,
                metadata.ref_hash,
                metadata.description,
                metadata.image_uri,
            ],
        )
        .ctx_store("insert batch")?;

        let total_products = bump_counter(&tx, "total_products")?;
        append_event(
            &tx,
            &registered_at_utc,
            &EventPayload::BatchRegistered {
                batch_id,
                name: name.to_string(),
                brand: brand.to_string(),
                identifier_count: item_ids.len() as u64,
                issuer: caller,
                metadata: if metadata.is_empty() {
                    None
                } else {
                    Some(metadata.clone())
                },
                total_products,
            },
        )?;
        tx.commit()?;

        info!(batch_id, identifiers = item_ids.len(), total_products, "batch registered");
        Ok(ProductBatch {
            batch_id,
            name: name.to_string(),
            brand: brand.to_string(),
            registered_at_utc,
            issuer: caller,
            identifier_count: item_ids.len() as u64,
            metadata,
            exists: true,
        })
    }

    /// Read one batch record.  Unknown ids report `exists = false` rather
    /// than failing.
    pub fn get_batch(&self, batch_id: u64) -> Result<ProductBatch> {
        get_batch_db(&self.conn, batch_id)
    }

    /// Read several batch records at once, one sentinel-or-record per id.
    pub fn get_batches(&self, batch_ids: &[u64]) -> Result<Vec<ProductBatch>> {
        batch_ids.iter().map(|&id| self.get_batch(id)).collect()
    }

    /// Update a batch's descriptive metadata.  Authorized issuers only,
    /// while active; `name`, `brand`, and the registration timestamp stay
    /// immutable.
    pub fn update_metadata(
        &mut self,
        caller: Identity,
        batch_id: u64,
        metadata: BatchMetadata,
    ) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_active(&tx)?;
        ensure_issuer(&tx, &caller)?;
        let db_id = validate_batch_id(batch_id)?;
        if !batch_exists_db(&tx, batch_id)? {
            return Err(VeritagError::NotFound(batch_id));
        }

        let ts = util::now_utc_rfc3339();
        tx.execute(
            "UPDATE batches SET ref_hash=?2, description=?3, image_uri=?4 WHERE batch_id=?1",
            params![db_id, metadata.ref_hash, metadata.description, metadata.image_uri],
        )
        .ctx_store("update batch metadata")?;
        append_event(
            &tx,
            &ts,
            &EventPayload::MetadataUpdated {
                batch_id,
                caller,
                metadata,
            },
        )?;
        tx.commit()?;

        info!(batch_id, "batch metadata updated");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Verification engine
    // -----------------------------------------------------------------------

    /// Verify one item.  Returns `true` exactly once per identifier (the
    /// first scan); every later call returns `false` and is the counterfeit
    /// signal.  A verification record and event are appended either way.
    ///
    /// Deliberately not idempotent.
    pub fn verify(&mut self, verifier: Identity, item_id: ItemId, batch_id: u64) -> Result<bool> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_active(&tx)?;
        if batch_id == 0 {
            return Err(VeritagError::InvalidInput("batch id must be positive".into()));
        }
        if !batch_exists_db(&tx, batch_id)? {
            return Err(VeritagError::NotFound(batch_id));
        }

        let authentic = apply_verification(&tx, &verifier, &item_id, batch_id)?;
        tx.commit()?;

        info!(item_id = %item_id, batch_id, authentic, "item verified");
        Ok(authentic)
    }

    /// Verify a batch of `(item_id, batch_id)` pairs in one atomic call.
    ///
    /// Pairs whose batch id is zero or unregistered are skipped: their result
    /// slot is `false` and no record, event, or state change is produced for
    /// them.  Valid pairs follow the exact [`Registry::verify`] rule.
    pub fn verify_batch(
        &mut self,
        verifier: Identity,
        item_ids: &[ItemId],
        batch_ids: &[u64],
    ) -> Result<Vec<bool>> {
        if item_ids.len() != batch_ids.len() {
            return Err(VeritagError::ArrayLengthMismatch {
                items: item_ids.len(),
                batches: batch_ids.len(),
            });
        }
        let max_items = self.limits.max_verify_items;
        if item_ids.len() > max_items {
            return Err(VeritagError::InvalidInput(format!(
                "verify_batch carries {} pairs (limit {max_items})",
                item_ids.len()
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        ensure_active(&tx)?;

        let mut results = Vec::with_capacity(item_ids.len());
        for (item_id, &batch_id) in item_ids.iter().zip(batch_ids) {
            if batch_id == 0 || !batch_exists_db(&tx, batch_id)? {
                results.push(false);
                continue;
            }
            results.push(apply_verification(&tx, &verifier, item_id, batch_id)?);
        }
        tx.commit()?;

        info!(
            pairs = item_ids.len(),
            authentic = results.iter().filter(|r| **r).count(),
            "batch verification complete"
        );
        Ok(results)
    }

    /// All verification records for one identifier, in insertion
    /// (chronological) order.
    pub fn verification_history(&self, item_id: ItemId) -> Result<Vec<VerificationRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT seq, item_id, batch_id, verifier, ts_utc, authentic
                FROM verifications
                WHERE item_id = ?1
                ORDER BY seq ASC
                "#,
            )
            .ctx_store("prepare select verifications")?;

        let mut rows = stmt
            .query(params![item_id.to_hex()])
            .ctx_store("query verifications")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next verification row")? {
            let seq: i64 = row.get(0)?;
            let item_hex: String = row.get(1)?;
            let batch_id: i64 = row.get(2)?;
            let verifier_hex: String = row.get(3)?;
            let ts_utc: String = row.get(4)?;
            let authentic: bool = row.get(5)?;
            out.push(VerificationRecord {
                seq,
                item_id: ItemId::from_hex(&item_hex)?,
                batch_id: batch_id as u64,
                verifier: Identity::from_hex(&verifier_hex)?,
                ts_utc,
                authentic,
            });
        }
        Ok(out)
    }

    /// Number of verification records for one identifier.
    pub fn verification_count(&self, item_id: ItemId) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM verifications WHERE item_id = ?1",
                params![item_id.to_hex()],
                |row| row.get(0),
            )
            .ctx_store("count verifications")?;
        Ok(n as u64)
    }

    /// Whether an identifier has been seen before.
    pub fn is_first_seen(&self, item_id: ItemId) -> Result<bool> {
        let seen: Option<String> = self
            .conn
            .query_row(
                "SELECT first_seen_at_utc FROM items WHERE item_id = ?1",
                params![item_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seen.is_some())
    }

    /// One consistent snapshot of the three counters.
    pub fn statistics(&self) -> Result<Statistics> {
        Ok(Statistics {
            total_products: read_counter(&self.conn, "total_products")?,
            total_verifications: read_counter(&self.conn, "total_verifications")?,
            issuer_count: issuer_count_db(&self.conn)?,
        })
    }

    // -----------------------------------------------------------------------
    // Reads supporting tooling and tests
    // -----------------------------------------------------------------------

    pub fn admin(&self) -> Result<Identity> {
        current_admin(&self.conn)
    }

    pub fn is_paused(&self) -> Result<bool> {
        is_paused_db(&self.conn)
    }

    pub fn is_issuer(&self, identity: Identity) -> Result<bool> {
        is_issuer_db(&self.conn, &identity)
    }

    /// The enumerable issuer set, in authorization order.
    pub fn issuers(&self) -> Result<Vec<Identity>> {
        let mut stmt = self
            .conn
            .prepare("SELECT identity FROM issuers ORDER BY seq ASC")
            .ctx_store("prepare select issuers")?;
        let mut rows = stmt.query([]).ctx_store("query issuers")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next issuer row")? {
            let identity_hex: String = row.get(0)?;
            out.push(Identity::from_hex(&identity_hex)?);
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    /// All audit events, in append order.
    pub fn events(&self) -> Result<Vec<EventRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r#"
                SELECT seq, ts_utc, kind, payload_json, payload_hash, prev_hash, entry_hash
                FROM events
                ORDER BY seq ASC
                "#,
            )
            .ctx_store("prepare select events")?;

        let mut rows = stmt.query([]).ctx_store("query events")?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().ctx_store("next event row")? {
            let seq: i64 = row.get(0)?;
            let ts_utc: String = row.get(1)?;
            let kind: String = row.get(2)?;
            let payload_json: String = row.get(3)?;
            let payload_hash: Vec<u8> = row.get(4)?;
            let prev_hash: Vec<u8> = row.get(5)?;
            let entry_hash: Vec<u8> = row.get(6)?;
            out.push(EventRecord {
                seq,
                ts_utc,
                kind: EventKind::parse(&kind)?,
                payload_json,
                payload_hash_hex: hex::encode(payload_hash),
                prev_hash_hex: hex::encode(prev_hash),
                entry_hash_hex: hex::encode(entry_hash),
            });
        }
        Ok(out)
    }

    /// Verify hash-chain integrity of the audit log.
    ///
    /// Recomputes every payload digest and chain hash from the stored JSON
    /// and fails on the first mismatch, including a kind tag that disagrees
    /// with its payload.
    pub fn verify_integrity(&self) -> Result<()> {
        let events = self.events()?;
        let mut prev_hash = GENESIS_HASH;
        for e in &events {
            let payload = e.payload()?;
            if payload.kind() != e.kind {
                return Err(VeritagError::Other(format!(
                    "event kind mismatch at seq {}: column says {}, payload says {}",
                    e.seq,
                    e.kind,
                    payload.kind()
                )));
            }

            let payload_hash = util::sha256(e.payload_json.as_bytes());
            let entry_hash = chain_entry_hash(&prev_hash, &payload_hash, e.kind);

            if hex::encode(payload_hash) != e.payload_hash_hex {
                return Err(VeritagError::Other(format!(
                    "payload_hash mismatch at seq {}",
                    e.seq
                )));
            }
            if hex::encode(prev_hash) != e.prev_hash_hex {
                return Err(VeritagError::Other(format!(
                    "prev_hash mismatch at seq {}",
                    e.seq
                )));
            }
            if hex::encode(entry_hash) != e.entry_hash_hex {
                return Err(VeritagError::Other(format!(
                    "entry_hash mismatch at seq {}",
                    e.seq
                )));
            }

            prev_hash = entry_hash;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared operation internals
// ---------------------------------------------------------------------------

fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=FULL;
        PRAGMA foreign_keys=ON;

        CREATE TABLE IF NOT EXISTS meta(
          k TEXT PRIMARY KEY,
          v TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS issuers(
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          identity TEXT NOT NULL UNIQUE,
          since_utc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS batches(
          batch_id INTEGER PRIMARY KEY,
          name TEXT NOT NULL,
          brand TEXT NOT NULL,
          registered_at_utc TEXT NOT NULL,
          issuer TEXT NOT NULL,
          identifier_count INTEGER NOT NULL,
          ref_hash TEXT,
          description TEXT,
          image_uri TEXT
        );

        CREATE TABLE IF NOT EXISTS items(
          item_id TEXT PRIMARY KEY,
          first_seen_at_utc TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS verifications(
          seq INTEGER PRIMARY KEY,
          item_id TEXT NOT NULL,
          batch_id INTEGER NOT NULL,
          verifier TEXT NOT NULL,
          ts_utc TEXT NOT NULL,
          authentic INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_verifications_item ON verifications(item_id);

        CREATE TABLE IF NOT EXISTS events(
          seq INTEGER PRIMARY KEY,
          ts_utc TEXT NOT NULL,
          kind TEXT NOT NULL,
          payload_json TEXT NOT NULL,
          payload_hash BLOB NOT NULL,
          prev_hash BLOB NOT NULL,
          entry_hash BLOB NOT NULL
        );
        "#,
    )
    .ctx_store("create tables")
}

/// SQLite INTEGER is signed 64-bit; ids outside that range cannot be stored.
fn validate_batch_id(batch_id: u64) -> Result<i64> {
    if batch_id == 0 {
        return Err(VeritagError::InvalidInput("batch id must be positive".into()));
    }
    i64::try_from(batch_id)
        .map_err(|_| VeritagError::InvalidInput(format!("batch id {batch_id} out of range")))
}

fn meta_get(conn: &Connection, k: &str) -> Result<Option<String>> {
    conn.query_row("SELECT v FROM meta WHERE k=?1", params![k], |row| row.get(0))
        .optional()
        .map_err(VeritagError::from)
}

fn meta_set(conn: &Connection, k: &str, v: &str) -> Result<()> {
    conn.execute("INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)", params![k, v])?;
    Ok(())
}

fn read_counter(conn: &Connection, k: &str) -> Result<u64> {
    meta_get(conn, k)?
        .required_store(&format!("counter {k} missing"))?
        .parse()
        .ctx_store(&format!("parse counter {k}"))
}

fn bump_counter(conn: &Connection, k: &str) -> Result<u64> {
    let next = read_counter(conn, k)? + 1;
    meta_set(conn, k, &next.to_string())?;
    Ok(next)
}

fn current_admin(conn: &Connection) -> Result<Identity> {
    let hex = meta_get(conn, "admin")?.required_store("admin missing")?;
    Identity::from_hex(&hex)
}

fn ensure_admin(conn: &Connection, caller: &Identity) -> Result<()> {
    if *caller != current_admin(conn)? {
        return Err(VeritagError::Unauthorized(format!(
            "caller {caller} is not the administrator"
        )));
    }
    Ok(())
}

fn is_paused_db(conn: &Connection) -> Result<bool> {
    Ok(meta_get(conn, "paused")?.required_store("paused flag missing")? == "1")
}

fn ensure_active(conn: &Connection) -> Result<()> {
    if is_paused_db(conn)? {
        return Err(VeritagError::SystemPaused);
    }
    Ok(())
}

fn is_issuer_db(conn: &Connection, identity: &Identity) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT seq FROM issuers WHERE identity=?1",
            params![identity.to_hex()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn ensure_issuer(conn: &Connection, caller: &Identity) -> Result<()> {
    if !is_issuer_db(conn, caller)? {
        return Err(VeritagError::Unauthorized(format!(
            "caller {caller} is not an authorized issuer"
        )));
    }
    Ok(())
}

fn insert_issuer(conn: &Connection, identity: &Identity, ts: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO issuers(identity, since_utc) VALUES (?1,?2)",
        params![identity.to_hex(), ts],
    )
    .ctx_store("insert issuer")?;
    Ok(())
}

fn remove_issuer(conn: &Connection, identity: &Identity) -> Result<()> {
    conn.execute(
        "DELETE FROM issuers WHERE identity=?1",
        params![identity.to_hex()],
    )
    .ctx_store("remove issuer")?;
    Ok(())
}

fn issuer_count_db(conn: &Connection) -> Result<u64> {
    let n: i64 = conn
        .query_row("SELECT COUNT(*) FROM issuers", [], |row| row.get(0))
        .ctx_store("count issuers")?;
    Ok(n as u64)
}

fn batch_exists_db(conn: &Connection, batch_id: u64) -> Result<bool> {
    let Ok(db_id) = i64::try_from(batch_id) else {
        return Ok(false);
    };
    let found: Option<i64> = conn
        .query_row(
            "SELECT batch_id FROM batches WHERE batch_id=?1",
            params![db_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn get_batch_db(conn: &Connection, batch_id: u64) -> Result<ProductBatch> {
    let Ok(db_id) = i64::try_from(batch_id) else {
        return Ok(ProductBatch::missing(batch_id));
    };
    let row = conn
        .query_row(
            r#"
            SELECT name, brand, registered_at_utc, issuer, identifier_count,
                   ref_hash, description, image_uri
            FROM batches WHERE batch_id=?1
            "#,
            params![db_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ))
            },
        )
        .optional()?;

    match row {
        None => Ok(ProductBatch::missing(batch_id)),
        Some((name, brand, registered_at_utc, issuer_hex, count, ref_hash, description, image_uri)) => {
            Ok(ProductBatch {
                batch_id,
                name,
                brand,
                registered_at_utc,
                issuer: Identity::from_hex(&issuer_hex)?,
                identifier_count: count as u64,
                metadata: BatchMetadata {
                    ref_hash,
                    description,
                    image_uri,
                },
                exists: true,
            })
        }
    }
}

/// First-scan-wins core: the atomic check-then-set on the per-identifier
/// `first_seen` flag, plus the unconditional record and event appends.
fn apply_verification(
    conn: &Connection,
    verifier: &Identity,
    item_id: &ItemId,
    batch_id: u64,
) -> Result<bool> {
    let ts = util::now_utc_rfc3339();
    let authentic = {
        let seen: Option<String> = conn
            .query_row(
                "SELECT first_seen_at_utc FROM items WHERE item_id=?1",
                params![item_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        seen.is_none()
    };

    if authentic {
        conn.execute(
            "INSERT INTO items(item_id, first_seen_at_utc) VALUES (?1,?2)",
            params![item_id.to_hex(), ts],
        )
        .ctx_store("insert item state")?;
    }
    let total_verifications = if authentic {
        bump_counter(conn, "total_verifications")?
    } else {
        read_counter(conn, "total_verifications")?
    };

    conn.execute(
        r#"
        INSERT INTO verifications(item_id, batch_id, verifier, ts_utc, authentic)
        VALUES (?1,?2,?3,?4,?5)
        "#,
        params![
            item_id.to_hex(),
            batch_id as i64,
            verifier.to_hex(),
            ts,
            authentic,
        ],
    )
    .ctx_store("insert verification record")?;

    append_event(
        conn,
        &ts,
        &EventPayload::ItemVerified {
            item_id: *item_id,
            batch_id,
            authentic,
            verifier: *verifier,
            ts_utc: ts.clone(),
            total_verifications,
        },
    )?;
    Ok(authentic)
}

/// Append one hash-chained event row.  Must run inside the operation's
/// transaction so a failed operation leaves no event behind.
fn append_event(conn: &Connection, ts: &str, payload: &EventPayload) -> Result<()> {
    let prev_hash: [u8; 32] = conn
        .query_row(
            "SELECT entry_hash FROM events ORDER BY seq DESC LIMIT 1",
            [],
            |row| row.get::<_, Vec<u8>>(0),
        )
        .optional()?
        .map(|bytes| {
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| VeritagError::Other("stored entry_hash is not 32 bytes".into()))
        })
        .transpose()?
        .unwrap_or(GENESIS_HASH);

    let payload_json =
        serde_json::to_string(payload).ctx_store("serialize event payload")?;
    let payload_hash = util::sha256(payload_json.as_bytes());
    let kind = payload.kind();
    let entry_hash = chain_entry_hash(&prev_hash, &payload_hash, kind);

    conn.execute(
        r#"
        INSERT INTO events(ts_utc, kind, payload_json, payload_hash, prev_hash, entry_hash)
        VALUES (?1,?2,?3,?4,?5,?6)
        "#,
        params![
            ts,
            kind.as_str(),
            payload_json,
            payload_hash.to_vec(),
            prev_hash.to_vec(),
            entry_hash.to_vec(),
        ],
    )
    .ctx_store("insert event")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Export / rebuild
// ---------------------------------------------------------------------------

/// Export the full audit stream (meta + events) to a JSON file.
pub fn export_events_json(registry: &Registry, out_path: &Path) -> Result<()> {
    let meta = registry.meta().clone();
    let events = registry.events()?;
    let export = serde_json::json!({
        "format": "veritag-events-v1",
        "exported_at_utc": util::now_utc_rfc3339(),
        "meta": meta,
        "events": events,
    });
    let json = serde_json::to_vec_pretty(&export).ctx_export("serialize events export")?;
    std::fs::write(out_path, json)
        .map_err(|e| VeritagError::Other(format!("export: write {}: {e}", out_path.display())))?;
    info!(path = %out_path.display(), events = events.len(), "audit events exported");
    Ok(())
}

/// Rebuild a registry database from an exported event stream.
///
/// Creates a fresh database and replays every event through the normal state
/// transitions, preserving the original rows and hashes, then re-verifies the
/// chain and cross-checks the replayed counters against the event-carried
/// ones.  This is the recovery path when the live state is lost: the audit
/// log is the durable history.
pub fn rebuild_from_export(json_path: &Path, db_path: &Path, limits: Limits) -> Result<Registry> {
    let json_bytes = std::fs::read(json_path)
        .map_err(|e| VeritagError::Other(format!("export: read {}: {e}", json_path.display())))?;

    #[derive(Deserialize)]
    struct EventsExport {
        meta: RegistryMeta,
        events: Vec<EventRecord>,
    }

    let export: EventsExport =
        serde_json::from_slice(&json_bytes).ctx_export("parse events export")?;
    if export.meta.schema_version != REGISTRY_SCHEMA_VERSION {
        return Err(VeritagError::Other(format!(
            "export: unsupported schema_version {} (expected {REGISTRY_SCHEMA_VERSION})",
            export.meta.schema_version
        )));
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VeritagError::Other(format!("create dir {}: {e}", parent.display()))
        })?;
    }
    let mut conn = Connection::open(db_path)
        .map_err(|e| VeritagError::Other(format!("open db {}: {e}", db_path.display())))?;
    create_schema(&conn)?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    meta_set(&tx, "registry_id", &export.meta.registry_id.to_string())?;
    meta_set(&tx, "created_at_utc", &export.meta.created_at_utc)?;
    meta_set(&tx, "schema_version", &export.meta.schema_version.to_string())?;
    meta_set(&tx, "paused", "0")?;
    meta_set(&tx, "total_products", "0")?;
    meta_set(&tx, "total_verifications", "0")?;

    for e in &export.events {
        let payload = e.payload()?;
        replay_event(&tx, e, &payload)?;

        let payload_hash = hex::decode(&e.payload_hash_hex).ctx_export("decode payload_hash")?;
        let prev_hash = hex::decode(&e.prev_hash_hex).ctx_export("decode prev_hash")?;
        let entry_hash = hex::decode(&e.entry_hash_hex).ctx_export("decode entry_hash")?;
        tx.execute(
            r#"
            INSERT INTO events(seq, ts_utc, kind, payload_json, payload_hash, prev_hash, entry_hash)
            VALUES (?1,?2,?3,?4,?5,?6,?7)
            "#,
            params![
                e.seq,
                e.ts_utc,
                e.kind.as_str(),
                e.payload_json,
                payload_hash,
                prev_hash,
                entry_hash,
            ],
        )
        .ctx_store("insert replayed event")?;
    }
    tx.commit()?;

    let registry = Registry {
        conn,
        meta: export.meta,
        limits,
    };
    registry.verify_integrity()?;
    info!(events = export.events.len(), "registry rebuilt from audit events");
    Ok(registry)
}

/// Apply one replayed event's state transition, cross-checking any counter
/// the payload carries.
fn replay_event(conn: &Connection, record: &EventRecord, payload: &EventPayload) -> Result<()> {
    match payload {
        EventPayload::RegistryInitialized { admin } => {
            meta_set(conn, "admin", &admin.to_hex())?;
            insert_issuer(conn, admin, &record.ts_utc)?;
        }
        EventPayload::IssuerAuthorized {
            identity,
            authorized,
            issuer_count,
        } => {
            if *authorized {
                insert_issuer(conn, identity, &record.ts_utc)?;
            } else {
                remove_issuer(conn, identity)?;
            }
            if issuer_count_db(conn)? != *issuer_count {
                return Err(VeritagError::Other(format!(
                    "replay: issuer count diverged at seq {}",
                    record.seq
                )));
            }
        }
        EventPayload::OwnershipTransferred {
            previous_admin,
            new_admin,
        } => {
            meta_set(conn, "admin", &new_admin.to_hex())?;
            remove_issuer(conn, previous_admin)?;
            insert_issuer(conn, new_admin, &record.ts_utc)?;
        }
        EventPayload::BatchRegistered {
            batch_id,
            name,
            brand,
            identifier_count,
            issuer,
            metadata,
            total_products,
        } => {
            let db_id = validate_batch_id(*batch_id)?;
            let metadata = metadata.clone().unwrap_or_default();
            conn.execute(
                r#"
                INSERT INTO batches(
                  batch_id, name, brand, registered_at_utc, issuer, identifier_count,
                  ref_hash, description, image_uri
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                "#,
                params![
                    db_id,
                    name,
                    brand,
                    record.ts_utc,
                    issuer.to_hex(),
                    *identifier_count as i64,
                    metadata.ref_hash,
                    metadata.description,
                    metadata.image_uri,
                ],
            )
            .ctx_store("insert replayed batch")?;
            if bump_counter(conn, "total_products")? != *total_products {
                return Err(VeritagError::Other(format!(
                    "replay: total_products diverged at seq {}",
                    record.seq
                )));
            }
        }
        EventPayload::MetadataUpdated {
            batch_id, metadata, ..
        } => {
            let db_id = validate_batch_id(*batch_id)?;
            conn.execute(
                "UPDATE batches SET ref_hash=?2, description=?3, image_uri=?4 WHERE batch_id=?1",
                params![db_id, metadata.ref_hash, metadata.description, metadata.image_uri],
            )
            .ctx_store("update replayed metadata")?;
        }
        EventPayload::ItemVerified {
            item_id,
            batch_id,
            authentic,
            verifier,
            ts_utc,
            total_verifications,
        } => {
            if *authentic {
                conn.execute(
                    "INSERT INTO items(item_id, first_seen_at_utc) VALUES (?1,?2)",
                    params![item_id.to_hex(), ts_utc],
                )
                .ctx_store("insert replayed item state")?;
            }
            let replayed = if *authentic {
                bump_counter(conn, "total_verifications")?
            } else {
                read_counter(conn, "total_verifications")?
            };
            if replayed != *total_verifications {
                return Err(VeritagError::Other(format!(
                    "replay: total_verifications diverged at seq {}",
                    record.seq
                )));
            }
            conn.execute(
                r#"
                INSERT INTO verifications(item_id, batch_id, verifier, ts_utc, authentic)
                VALUES (?1,?2,?3,?4,?5)
                "#,
                params![
                    item_id.to_hex(),
                    *batch_id as i64,
                    verifier.to_hex(),
                    ts_utc,
                    *authentic,
                ],
            )
            .ctx_store("insert replayed verification")?;
        }
        EventPayload::PauseSet { paused, .. } => {
            meta_set(conn, "paused", if *paused { "1" } else { "0" })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::derive_identifier;
    use tempfile::tempdir;

    fn id(byte: u8) -> Identity {
        Identity::from_bytes([byte; 20])
    }

    fn new_registry(dir: &tempfile::TempDir) -> Registry {
        let db = dir.path().join("registry.db");
        Registry::create_new(&db, id(0xAA), Limits::default()).unwrap()
    }

    #[test]
    fn create_and_open_registry() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("registry.db");
        let registry = Registry::create_new(&db, id(0xAA), Limits::default()).unwrap();
        let meta = registry.meta().clone();
        assert_eq!(registry.admin().unwrap(), id(0xAA));
        assert!(registry.is_issuer(id(0xAA)).unwrap());
        assert!(!registry.is_paused().unwrap());
        drop(registry);

        let reopened = Registry::open_existing(&db, Limits::default()).unwrap();
        assert_eq!(reopened.meta().registry_id, meta.registry_id);
    }

    #[test]
    fn create_rejects_zero_admin() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("registry.db");
        let err = Registry::create_new(&db, Identity::ZERO, Limits::default()).unwrap_err();
        assert!(matches!(err, VeritagError::InvalidInput(_)));
    }

    #[test]
    fn first_scan_wins() {
        let dir = tempdir().unwrap();
        let mut registry = new_registry(&dir);
        let admin = id(0xAA);
        let item = derive_identifier(1, "SN001");

        registry
            .register_batch(admin, 1, "Sneaker", "Nike", &[item], None)
            .unwrap();

        assert!(!registry.is_first_seen(item).unwrap());
        assert!(registry.verify(id(0x01), item, 1).unwrap());
        assert!(registry.is_first_seen(item).unwrap());
        assert!(!registry.verify(id(0x02), item, 1).unwrap());
        assert!(!registry.verify(id(0x01), item, 1).unwrap());

        let stats = registry.statistics().unwrap();
        assert_eq!(stats.total_verifications, 1);
        assert_eq!(registry.verification_count(item).unwrap(), 3);
    }

    #[test]
    fn verify_batch_skips_unknown_pairs() {
        let dir = tempdir().unwrap();
        let mut registry = new_registry(&dir);
        let admin = id(0xAA);
        let a = derive_identifier(1, "A");
        let b = derive_identifier(9, "B");
        let c = derive_identifier(1, "C");

        registry
            .register_batch(admin, 1, "Widget", "Acme", &[a, c], None)
            .unwrap();

        // Middle pair: unregistered batch.  Last pair: zero batch id.
        let results = registry
            .verify_batch(id(0x05), &[a, b, c], &[1, 9, 0])
            .unwrap();
        assert_eq!(results, vec![true, false, false]);

        // Skipped pairs leave no record behind.
        assert_eq!(registry.verification_count(b).unwrap(), 0);
        assert_eq!(registry.verification_count(c).unwrap(), 0);
        assert_eq!(registry.statistics().unwrap().total_verifications, 1);
    }

    #[test]
    fn issuer_set_is_ordered_and_unique() {
        let dir = tempdir().unwrap();
        let mut registry = new_registry(&dir);
        let admin = id(0xAA);

        registry.authorize_issuer(admin, id(0x01), true).unwrap();
        registry.authorize_issuer(admin, id(0x02), true).unwrap();
        // Repeat authorization must not duplicate.
        registry.authorize_issuer(admin, id(0x01), true).unwrap();
        assert_eq!(registry.issuers().unwrap(), vec![admin, id(0x01), id(0x02)]);

        registry.authorize_issuer(admin, id(0x01), false).unwrap();
        assert_eq!(registry.issuers().unwrap(), vec![admin, id(0x02)]);
        assert_eq!(registry.statistics().unwrap().issuer_count, 2);
    }

    #[test]
    fn audit_chain_detects_tamper() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("registry.db");
        let mut registry = Registry::create_new(&db, id(0xAA), Limits::default()).unwrap();
        let item = derive_identifier(1, "SN001");
        registry
            .register_batch(id(0xAA), 1, "Widget", "Acme", &[item], None)
            .unwrap();
        registry.verify(id(0x01), item, 1).unwrap();
        registry.verify_integrity().unwrap();
        drop(registry);

        // Tamper with a stored payload directly.
        let conn = Connection::open(&db).unwrap();
        conn.execute(
            "UPDATE events SET payload_json = replace(payload_json, '\"authentic\":true', '\"authentic\":false') WHERE kind='item_verified'",
            [],
        )
        .unwrap();
        drop(conn);

        let reopened = Registry::open_existing(&db, Limits::default()).unwrap();
        let err = reopened.verify_integrity().unwrap_err();
        assert!(err.to_string().contains("payload_hash mismatch"));
    }

    #[test]
    fn batch_id_range_guard() {
        let dir = tempdir().unwrap();
        let mut registry = new_registry(&dir);
        let item = derive_identifier(1, "SN001");
        let err = registry
            .register_batch(id(0xAA), u64::MAX, "Widget", "Acme", &[item], None)
            .unwrap_err();
        assert!(matches!(err, VeritagError::InvalidInput(_)));
        // Reads on an out-of-range id report absence, not an error.
        assert!(!registry.get_batch(u64::MAX).unwrap().exists);
    }

    #[test]
    fn statistics_snapshot() {
        let dir = tempdir().unwrap();
        let mut registry = new_registry(&dir);
        let admin = id(0xAA);
        let item = derive_identifier(3, "X-1");
        registry
            .register_batch(admin, 3, "Bag", "Hermes", &[item], None)
            .unwrap();
        registry.verify(id(0x01), item, 3).unwrap();

        let stats = registry.statistics().unwrap();
        assert_eq!(
            stats,
            Statistics {
                total_products: 1,
                total_verifications: 1,
                issuer_count: 1,
            }
        );
    }
}
