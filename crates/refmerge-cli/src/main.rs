use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use refmerge_core::EntityKind;
use refmerge_match::{CandidateRecord, DuplicateDetector};
use refmerge_storage::{CachedGeocoder, Geocoder, HttpGeocoder, MemoryStore, PgStore, ReferenceStore};
use refmerge_sync::{write_reports, EngineEnv, ImportMatcher, MergeConfig, Reconciler, RunOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "refmerge-cli")]
#[command(about = "Reference-data dedup and merge engine")]
struct Cli {
    /// Merge rules file (defaults to $REFMERGE_CONFIG or merge.yaml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Work on a JSON snapshot instead of $DATABASE_URL.
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Detect duplicates of one entity kind and merge them.
    Reconcile {
        #[arg(long, value_parser = parse_kind)]
        kind: EntityKind,
        /// Plan only; nothing is written to the store.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        reports_dir: Option<PathBuf>,
    },
    /// Match import candidates against the stored clubs.
    Detect {
        #[arg(long)]
        candidates: PathBuf,
        /// Look up coordinates for candidates that have none.
        #[arg(long)]
        geocode: bool,
    },
    /// Apply the reference schema migrations.
    Migrate,
}

fn parse_kind(raw: &str) -> Result<EntityKind, String> {
    raw.parse::<EntityKind>().map_err(|err| err.to_string())
}

enum Backend {
    Postgres(PgStore),
    Snapshot { store: MemoryStore, path: PathBuf },
}

impl Backend {
    async fn open(env: &EngineEnv, snapshot: Option<&Path>) -> Result<Self> {
        if let Some(path) = snapshot {
            let store = MemoryStore::load_json(path)?;
            return Ok(Backend::Snapshot {
                store,
                path: path.to_path_buf(),
            });
        }
        let Some(url) = env.database_url.as_deref() else {
            bail!("set DATABASE_URL or pass --snapshot <file.json>");
        };
        let store = PgStore::connect(url).await.context("connecting to DATABASE_URL")?;
        Ok(Backend::Postgres(store))
    }

    fn store(&self) -> &dyn ReferenceStore {
        match self {
            Backend::Postgres(store) => store,
            Backend::Snapshot { store, .. } => store,
        }
    }

    fn persist(&self) -> Result<()> {
        if let Backend::Snapshot { store, path } = self {
            store.save_json(path)?;
            info!(path = %path.display(), "snapshot written");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn")))
        .init();

    let cli = Cli::parse();
    let env = EngineEnv::from_env();
    let config_path = cli.config.clone().unwrap_or_else(|| env.config_path.clone());
    let config = MergeConfig::load(&config_path)?;

    match cli.command {
        Commands::Reconcile {
            kind,
            dry_run,
            reports_dir,
        } => {
            let backend = Backend::open(&env, cli.snapshot.as_deref()).await?;
            let report = Reconciler::new(backend.store(), config)
                .run(RunOptions { kind, dry_run })
                .await?;
            if !dry_run {
                backend.persist()?;
            }

            let reports_root = reports_dir.unwrap_or_else(|| env.reports_dir.clone());
            let written = write_reports(&reports_root, &report).await?;
            info!(dir = %written.display(), "reports written");

            if report.has_unresolved_faults() {
                eprintln!("reconciliation {} finished with unresolved faults:", report.run_id);
                for fault in report.unresolved_faults() {
                    eprintln!("  {fault}");
                }
                return Ok(ExitCode::FAILURE);
            }
            println!("{}", report.summary_markdown());
        }
        Commands::Detect {
            candidates,
            geocode,
        } => {
            let raw = std::fs::read_to_string(&candidates)
                .with_context(|| format!("reading {}", candidates.display()))?;
            let records: Vec<CandidateRecord> = serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", candidates.display()))?;

            let backend = Backend::open(&env, cli.snapshot.as_deref()).await?;
            let matcher = ImportMatcher::load(backend.store(), DuplicateDetector::new(config.detector))
                .await
                .context("loading clubs for matching")?;

            // the cache lives only as long as this command
            let geocoder = if geocode {
                let http = HttpGeocoder::new(env.geocoder_config(&config.retry))?;
                Some(CachedGeocoder::new(http, config.geocode_cache.build()))
            } else {
                None
            };
            let report = matcher
                .match_candidates(&records, geocoder.as_ref().map(|g| g as &dyn Geocoder))
                .await;

            for found in &report.matches {
                match (&found.existing, &found.reason) {
                    (Some(existing), Some(reason)) => {
                        println!("{} -> {} [{}]", found.candidate, existing, reason)
                    }
                    _ => println!("{} -> new", found.candidate),
                }
            }
            for skipped in &report.skipped {
                println!("{} -> skipped: {}", skipped.subject, skipped.reason);
            }
            info!(
                candidates = records.len(),
                duplicates = report.duplicates(),
                skipped = report.skipped.len(),
                "detection finished"
            );
        }
        Commands::Migrate => {
            let Some(url) = env.database_url.as_deref() else {
                bail!("DATABASE_URL is required for migrate");
            };
            let store = PgStore::connect(url).await.context("connecting to DATABASE_URL")?;
            store.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(ExitCode::SUCCESS)
}
