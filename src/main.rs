use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use veritag_core::{
    config::VeritagConfig,
    identity::Identity,
    item::{self, ItemId},
    registry::{self, BatchMetadata, Registry},
    util,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "veritag",
    version = util::VERSION,
    about = "VeriTag registry & verification engine"
)]
struct Cli {
    /// Path to the registry database (SQLite).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Authenticated caller identity (hex, 20 bytes), as handed in by the
    /// wallet layer.
    #[arg(long, global = true)]
    caller: Option<Identity>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new registry database; the given identity becomes the
    /// administrator and first authorized issuer.
    Init {
        #[arg(long)]
        admin: Identity,
    },

    /// Authorize an issuer identity (administrator only).
    AuthorizeIssuer {
        #[arg(long)]
        identity: Identity,
    },

    /// Revoke an issuer identity (administrator only).
    RevokeIssuer {
        #[arg(long)]
        identity: Identity,
    },

    /// Transfer administrator authority to a new identity.
    TransferOwnership {
        #[arg(long)]
        new_admin: Identity,
    },

    /// Engage the circuit breaker (administrator only).
    Pause,

    /// Release the circuit breaker (administrator only).
    Unpause,

    /// Register a product batch from inline serials or a CSV with a
    /// `serial` header.  Item identifiers are derived locally.
    RegisterBatch {
        #[arg(long)]
        batch_id: u64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        brand: String,
        #[arg(long)]
        serial: Vec<String>,
        #[arg(long)]
        csv: Option<PathBuf>,
        #[arg(long)]
        ref_hash: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        image_uri: Option<String>,
    },

    /// Print one or more batch records (unknown ids report exists=false).
    GetBatch {
        #[arg(long, required = true)]
        batch_id: Vec<u64>,
    },

    /// Update a batch's descriptive metadata (issuers only).
    UpdateMetadata {
        #[arg(long)]
        batch_id: u64,
        #[arg(long)]
        ref_hash: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        image_uri: Option<String>,
    },

    /// Verify one item from a scanned QR payload or an explicit
    /// batch-id/serial pair.
    Verify {
        /// Scanned payload: "<batchId>:<serial>" or the JSON form.
        #[arg(long, conflicts_with_all = ["batch_id", "serial"])]
        payload: Option<String>,
        #[arg(long, requires = "serial")]
        batch_id: Option<u64>,
        #[arg(long, requires = "batch_id")]
        serial: Option<String>,
    },

    /// Verify many items from a CSV with a `payload` header.
    VerifyBatch {
        #[arg(long)]
        csv: PathBuf,
    },

    /// Print the verification history for one item.
    History {
        /// Item identifier (hex), or derive it from --payload.
        #[arg(long, conflicts_with = "payload")]
        item_id: Option<ItemId>,
        #[arg(long)]
        payload: Option<String>,
    },

    /// Print the engine counters.
    Stats,

    /// Print the enumerable issuer set.
    Issuers,

    /// Verify hash-chain integrity of the audit log.
    VerifyAudit,

    /// Export the audit events to a JSON backup file.
    ExportEvents {
        #[arg(long)]
        out: PathBuf,
    },

    /// Rebuild a registry database from an exported event stream.
    Rebuild {
        #[arg(long)]
        json: PathBuf,
        /// Path for the new database (must not already exist).
        #[arg(long)]
        target_db: PathBuf,
    },

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration.
    let mut cfg = VeritagConfig::load(cli.config.as_deref())
        .context("load config")?;
    cfg.apply_env();

    init_logging(&cfg.logging);

    let db_path = cli.db.unwrap_or(cfg.paths.db.clone());
    util::validate_path(&db_path, "db")?;
    let limits = cfg.limits;

    match cli.cmd {
        Commands::Init { admin } => {
            let registry = Registry::create_new(&db_path, admin, limits)
                .context("create registry")?;
            info!(registry_id = %registry.meta().registry_id, "registry initialized");
        }

        Commands::AuthorizeIssuer { identity } => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry
                .authorize_issuer(caller, identity, true)
                .context("authorize issuer")?;
        }

        Commands::RevokeIssuer { identity } => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry
                .authorize_issuer(caller, identity, false)
                .context("revoke issuer")?;
        }

        Commands::TransferOwnership { new_admin } => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry
                .transfer_ownership(caller, new_admin)
                .context("transfer ownership")?;
        }

        Commands::Pause => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry.pause(caller).context("pause")?;
        }

        Commands::Unpause => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry.unpause(caller).context("unpause")?;
        }

        Commands::RegisterBatch {
            batch_id,
            name,
            brand,
            serial,
            csv,
            ref_hash,
            description,
            image_uri,
        } => {
            let caller = require_caller(cli.caller)?;

            let mut serials = serial;
            if let Some(csv_path) = csv {
                util::validate_path(&csv_path, "csv")?;
                let csv_path = util::canonicalize_if_exists(&csv_path, "csv")?;
                serials.extend(read_serial_csv(&csv_path)?);
            }
            anyhow::ensure!(!serials.is_empty(), "no serials given (use --serial or --csv)");
            for s in &serials {
                item::validate_serial(s)?;
            }
            let item_ids: Vec<ItemId> = serials
                .iter()
                .map(|s| item::derive_identifier(batch_id, s))
                .collect();

            let metadata = BatchMetadata {
                ref_hash,
                description,
                image_uri,
            };
            let metadata = if metadata.is_empty() { None } else { Some(metadata) };

            let mut registry = open(&db_path, limits)?;
            let batch = registry
                .register_batch(caller, batch_id, &name, &brand, &item_ids, metadata)
                .context("register batch")?;
            info!(
                batch_id = batch.batch_id,
                identifiers = batch.identifier_count,
                "batch registered"
            );
        }

        Commands::GetBatch { batch_id } => {
            let registry = open(&db_path, limits)?;
            let batches = registry.get_batches(&batch_id).context("read batches")?;
            println!("{}", serde_json::to_string_pretty(&batches)?);
        }

        Commands::UpdateMetadata {
            batch_id,
            ref_hash,
            description,
            image_uri,
        } => {
            let caller = require_caller(cli.caller)?;
            let mut registry = open(&db_path, limits)?;
            registry
                .update_metadata(
                    caller,
                    batch_id,
                    BatchMetadata {
                        ref_hash,
                        description,
                        image_uri,
                    },
                )
                .context("update metadata")?;
        }

        Commands::Verify {
            payload,
            batch_id,
            serial,
        } => {
            let caller = require_caller(cli.caller)?;
            let (item_id, batch_id) = match (payload, batch_id, serial) {
                (Some(p), _, _) => {
                    let decoded = item::parse_qr_payload(&p).context("decode QR payload")?;
                    (decoded.item_id(), decoded.batch_id)
                }
                (None, Some(b), Some(s)) => {
                    item::validate_serial(&s)?;
                    (item::derive_identifier(b, &s), b)
                }
                _ => anyhow::bail!("give either --payload or both --batch-id and --serial"),
            };

            let mut registry = open(&db_path, limits)?;
            let authentic = registry
                .verify(caller, item_id, batch_id)
                .context("verify item")?;
            if !authentic {
                warn!(item_id = %item_id, "item already claimed; possible counterfeit");
            }
            println!(
                "{}",
                serde_json::json!({
                    "item_id": item_id,
                    "batch_id": batch_id,
                    "authentic": authentic,
                })
            );
        }

        Commands::VerifyBatch { csv } => {
            let caller = require_caller(cli.caller)?;
            util::validate_path(&csv, "csv")?;
            let csv = util::canonicalize_if_exists(&csv, "csv")?;

            let mut item_ids = Vec::new();
            let mut batch_ids = Vec::new();
            for payload in read_payload_csv(&csv)? {
                let decoded = item::parse_qr_payload(&payload)
                    .with_context(|| format!("decode QR payload '{payload}'"))?;
                item_ids.push(decoded.item_id());
                batch_ids.push(decoded.batch_id);
            }

            let mut registry = open(&db_path, limits)?;
            let results = registry
                .verify_batch(caller, &item_ids, &batch_ids)
                .context("verify batch")?;
            let rows: Vec<_> = item_ids
                .iter()
                .zip(&batch_ids)
                .zip(&results)
                .map(|((item_id, batch_id), authentic)| {
                    serde_json::json!({
                        "item_id": item_id,
                        "batch_id": batch_id,
                        "authentic": authentic,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }

        Commands::History { item_id, payload } => {
            let item_id = match (item_id, payload) {
                (Some(id), _) => id,
                (None, Some(p)) => item::parse_qr_payload(&p)
                    .context("decode QR payload")?
                    .item_id(),
                (None, None) => anyhow::bail!("give either --item-id or --payload"),
            };
            let registry = open(&db_path, limits)?;
            let history = registry
                .verification_history(item_id)
                .context("read history")?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }

        Commands::Stats => {
            let registry = open(&db_path, limits)?;
            let stats = registry.statistics().context("read statistics")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }

        Commands::Issuers => {
            let registry = open(&db_path, limits)?;
            let issuers = registry.issuers().context("read issuers")?;
            println!("{}", serde_json::to_string_pretty(&issuers)?);
        }

        Commands::VerifyAudit => {
            let registry = open(&db_path, limits)?;
            let meta = registry.meta().clone();
            info!(registry_id = %meta.registry_id, schema_version = meta.schema_version, "verifying");
            registry.verify_integrity().context("verify audit log")?;
            info!("audit log verification passed");
        }

        Commands::ExportEvents { out } => {
            let registry = open(&db_path, limits)?;
            registry::export_events_json(&registry, &out).context("export events")?;
        }

        Commands::Rebuild { json, target_db } => {
            anyhow::ensure!(
                !target_db.exists(),
                "target database {} already exists -- will not overwrite",
                target_db.display()
            );
            let rebuilt = registry::rebuild_from_export(&json, &target_db, limits)
                .context("rebuild registry")?;
            info!(
                registry_id = %rebuilt.meta().registry_id,
                "registry rebuilt to {}",
                target_db.display()
            );
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn open(db_path: &std::path::Path, limits: veritag_core::config::Limits) -> Result<Registry> {
    Registry::open_existing(db_path, limits).context("open registry")
}

fn require_caller(caller: Option<Identity>) -> Result<Identity> {
    caller.context("this command needs --caller <identity>")
}

#[derive(Debug, serde::Deserialize)]
struct SerialRow {
    serial: String,
}

#[derive(Debug, serde::Deserialize)]
struct PayloadRow {
    payload: String,
}

fn read_serial_csv(path: &std::path::Path) -> Result<Vec<String>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("open csv: {}", path.display()))?;
    let headers = rdr.headers().context("read csv headers")?.clone();
    if !headers.iter().any(|h| h.eq_ignore_ascii_case("serial")) {
        anyhow::bail!("csv missing required header 'serial'");
    }

    let mut out = Vec::new();
    for rec in rdr.deserialize::<SerialRow>() {
        if out.len() >= util::MAX_CSV_ROWS {
            anyhow::bail!("csv exceeds maximum row limit of {}", util::MAX_CSV_ROWS);
        }
        out.push(rec.context("parse csv row")?.serial);
    }
    Ok(out)
}

fn read_payload_csv(path: &std::path::Path) -> Result<Vec<String>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("open csv: {}", path.display()))?;
    let headers = rdr.headers().context("read csv headers")?.clone();
    if !headers.iter().any(|h| h.eq_ignore_ascii_case("payload")) {
        anyhow::bail!("csv missing required header 'payload'");
    }

    let mut out = Vec::new();
    for rec in rdr.deserialize::<PayloadRow>() {
        if out.len() >= util::MAX_CSV_ROWS {
            anyhow::bail!("csv exceeds maximum row limit of {}", util::MAX_CSV_ROWS);
        }
        out.push(rec.context("parse csv row")?.payload);
    }
    Ok(out)
}

fn init_logging(cfg: &veritag_core::config::LoggingConfig) {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // JSON output to stdout for container / SIEM pipelines.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON-lines output to file for SIEM integration.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .expect("failed to open json log file");
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer();
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr.
        let console_layer = tracing_subscriber::fmt::layer();
        registry.with(console_layer).init();
    }
}
