use std::fs;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use ent_audit::{
    verify_hash_chain, AnomalyReporter, AuditAnomalyReporter, FanoutAnomalyReporter,
    TracingAnomalyReporter, VerifyResult,
};
use ent_cache::{ExpirationCache, FileStore, KeyValueStore, MemoryStore, CACHED_EXPIRATION_KEY};
use ent_provider::PaperProvider;
use ent_reconcile::{snapshot_adapter, SelectionPolicy};
use ent_runtime::{Clock, FixedClock, Reconciler, SystemClock};
use ent_schemas::VerificationResult;

#[derive(Parser)]
#[command(name = "ent")]
#[command(about = "Entitlement reconciliation CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute layered config hash + print canonical JSON
    ConfigHash {
        /// Paths in merge order (base -> env -> local)
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Inspect or reset the cached expiration marker
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },

    /// Run one reconciliation pass offline against a snapshot file
    Reconcile {
        /// Snapshot JSON: {"entries":[{"status":"verified", ...}]}
        #[arg(long)]
        snapshot: String,

        /// Marker store (JSON file). Omit to start from an empty marker.
        #[arg(long)]
        cache: Option<String>,

        /// Append anomalies to this hash-chained JSONL log
        #[arg(long)]
        anomaly_log: Option<String>,

        /// first_in_snapshot | latest_expiring | soonest_expiring
        #[arg(long, default_value = "first_in_snapshot")]
        policy: String,

        /// Evaluate as of this RFC 3339 instant instead of the wall clock
        #[arg(long)]
        now: Option<String>,

        /// Skip malformed entries instead of rejecting the whole snapshot
        #[arg(long, default_value_t = false)]
        lenient: bool,

        /// Compute the report without writing the marker or the anomaly log
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },

    /// Anomaly log utilities
    Anomalies {
        #[command(subcommand)]
        cmd: AnomaliesCmd,
    },
}

#[derive(Subcommand)]
enum CacheCmd {
    /// Print the cached expiration (or "none")
    Show {
        #[arg(long)]
        path: String,
    },
    /// Remove the cached expiration
    Clear {
        #[arg(long)]
        path: String,
    },
}

#[derive(Subcommand)]
enum AnomaliesCmd {
    /// Verify the hash chain of an anomaly log. Exits non-zero when broken.
    Verify {
        #[arg(long)]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    init_tracing();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::ConfigHash { paths } => {
            let path_refs: Vec<&str> = paths.iter().map(|s| s.as_str()).collect();
            let loaded = ent_config::load_layered_yaml(&path_refs)?;
            println!("config_hash={}", loaded.config_hash);
            println!("{}", loaded.canonical_json);
        }

        Commands::Cache { cmd } => match cmd {
            CacheCmd::Show { path } => {
                let cache = open_cache(&path)?;
                match cache.read()? {
                    Some(ts) => println!("cached_expiration={}", ts.to_rfc3339()),
                    None => println!("cached_expiration=none"),
                }
            }
            CacheCmd::Clear { path } => {
                open_cache(&path)?.clear()?;
                println!("cache_cleared=true");
            }
        },

        Commands::Reconcile {
            snapshot,
            cache,
            anomaly_log,
            policy,
            now,
            lenient,
            dry_run,
        } => {
            let policy = SelectionPolicy::parse(&policy)
                .with_context(|| format!("invalid --policy '{policy}'"))?;
            let clock: Arc<dyn Clock> = match now {
                Some(raw) => Arc::new(FixedClock::new(parse_instant(&raw)?)),
                None => Arc::new(SystemClock),
            };

            let entries = load_snapshot(&snapshot, lenient)?;
            let provider = Arc::new(PaperProvider::new());
            provider.set_entitlements(entries);

            let store = marker_store(cache.as_deref(), dry_run)?;

            let mut fanout = FanoutAnomalyReporter::new().with(Arc::new(TracingAnomalyReporter));
            match &anomaly_log {
                Some(path) if dry_run => {
                    tracing::warn!(path = %path, "dry run: anomaly log not written");
                }
                Some(path) => {
                    fanout = fanout.with(Arc::new(AuditAnomalyReporter::open(path, true)?));
                }
                None => {}
            }
            let reporter: Arc<dyn AnomalyReporter> = Arc::new(fanout);

            let reconciler = Reconciler::new(provider, store, reporter, clock).with_policy(policy);
            let report = reconciler
                .run_pass()
                .await
                .context("reconciliation pass failed")?;

            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Anomalies { cmd } => match cmd {
            AnomaliesCmd::Verify { path } => match verify_hash_chain(&path)? {
                VerifyResult::Valid { lines } => {
                    println!("chain=valid lines={lines}");
                }
                VerifyResult::Broken { line, reason } => {
                    println!("chain=broken line={line} reason={reason}");
                    bail!("anomaly log hash chain broken at line {line}");
                }
            },
        },
    }

    Ok(())
}

/// Logs go to stderr so stdout stays machine-readable.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .init();
}

fn open_cache(path: &str) -> Result<ExpirationCache<FileStore>> {
    let store = FileStore::open(path).with_context(|| format!("open cache store: {path}"))?;
    Ok(ExpirationCache::new(store))
}

fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid --now '{raw}' (expected RFC 3339)"))
}

fn load_snapshot(path: &str, lenient: bool) -> Result<Vec<VerificationResult>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read snapshot: {path}"))?;
    if lenient {
        let parsed: snapshot_adapter::RawSnapshot =
            serde_json::from_str(&raw).context("parse snapshot json")?;
        let (snapshot, skipped) = snapshot_adapter::normalize_lenient(parsed);
        for err in skipped {
            tracing::warn!(error = %err, "skipped malformed snapshot entry");
        }
        return Ok(snapshot.entries);
    }
    let snapshot = snapshot_adapter::normalize_json(&raw)
        .map_err(|e| anyhow::anyhow!("parse snapshot json: {e}"))?;
    Ok(snapshot.entries)
}

/// File-backed when a path is given. A dry run works on an in-memory copy of
/// the current marker so the file is never written.
fn marker_store(path: Option<&str>, dry_run: bool) -> Result<Arc<dyn KeyValueStore>> {
    let Some(path) = path else {
        return Ok(Arc::new(MemoryStore::new()));
    };
    let file = FileStore::open(path).with_context(|| format!("open cache store: {path}"))?;
    if !dry_run {
        return Ok(Arc::new(file));
    }

    let copy = MemoryStore::new();
    if let Some(raw) = file.get(CACHED_EXPIRATION_KEY)? {
        copy.set(CACHED_EXPIRATION_KEY, &raw)?;
    }
    Ok(Arc::new(copy))
}
