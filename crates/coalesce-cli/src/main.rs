//! `coalesce` — batch driver for the duplicate-record discovery and merge
//! engines.
//!
//! # Usage
//!
//! ```text
//! coalesce --db crm.sqlite discover --match email,name --kind person
//! coalesce --db crm.sqlite merge --run <run-id> \
//!     --resolvers same_kind,address_conflicts --count 50 --log merge.log
//! coalesce --db crm.sqlite exclude --run <run-id> --survivor 5 --members 7,9
//! coalesce --db crm.sqlite cleanup --run <run-id> --retention-days 2
//! ```

use std::path::PathBuf;

use anyhow::Context as _;
use chrono::Duration;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use coalesce_core::{record::RecordId, run::RunId};
use coalesce_engine::{
  CandidateSet, DiscoveryCriteria, FilterStrategy, MatchStrategy, MergeConfig,
  MergeSession, SurvivorPicker,
};
use coalesce_store_sqlite::SqliteStore;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
  name = "coalesce",
  about = "Duplicate-record discovery and merge driver"
)]
struct Cli {
  /// Path to a TOML configuration file.
  #[arg(short, long, default_value = "coalesce.toml")]
  config: PathBuf,

  /// Path to the SQLite entity store; overrides the config file and the
  /// COALESCE_DB environment variable.
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Start a discovery run, populate it, and print its identifier.
  Discover {
    /// Match strategy names, comma separated: email, name, birth_date.
    #[arg(long = "match", value_delimiter = ',', required = true)]
    matchers: Vec<String>,

    /// Filter strategy names, comma separated: excluded_pairs,
    /// max_members=<n>.
    #[arg(long = "filter", value_delimiter = ',')]
    filters: Vec<String>,

    /// Restrict discovery to records of this kind.
    #[arg(long)]
    kind: Option<String>,
  },

  /// Merge a page of tuples from an existing run and print the summary.
  Merge {
    /// Run identifier printed by `discover`.
    #[arg(long)]
    run: String,

    /// Resolver names applied in order: same_kind, address_conflicts.
    #[arg(long, value_delimiter = ',')]
    resolvers: Vec<String>,

    /// Continue past recoverable conflicts instead of aborting the pair.
    #[arg(long)]
    force: bool,

    /// Survivor picker names tried in order: highest_id, oldest_record.
    #[arg(long = "picker", value_delimiter = ',')]
    pickers: Vec<String>,

    #[arg(long, default_value_t = 50)]
    count: usize,

    #[arg(long, default_value_t = 0)]
    offset: usize,

    /// Append-mode audit log file; defaults to the diagnostic channel.
    #[arg(long)]
    log: Option<PathBuf>,
  },

  /// Mark a tuple as a confirmed non-duplicate and drop it from the run.
  Exclude {
    #[arg(long)]
    run: String,

    #[arg(long)]
    survivor: i64,

    /// Member record ids, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    members: Vec<i64>,
  },

  /// Drop the working tables of runs older than the retention horizon.
  Cleanup {
    /// The active run; its table is never dropped.
    #[arg(long)]
    run: String,

    /// Retention horizon in days.
    #[arg(long, default_value_t = 2)]
    retention_days: i64,
  },
}

// ─── Config file ──────────────────────────────────────────────────────────────

/// Shape of the optional TOML config file.
#[derive(Deserialize, Default)]
struct ConfigFile {
  #[serde(default)]
  db: String,
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  // Load configuration; CLI flags override the file.
  let settings = config::Config::builder()
    .add_source(config::File::from(cli.config.clone()).required(false))
    .add_source(config::Environment::with_prefix("COALESCE"))
    .build()
    .context("failed to read configuration")?;
  let file_cfg: ConfigFile = settings
    .try_deserialize()
    .context("failed to deserialise configuration")?;

  let db_path = cli
    .db
    .or_else(|| (!file_cfg.db.is_empty()).then(|| PathBuf::from(&file_cfg.db)))
    .unwrap_or_else(|| PathBuf::from("coalesce.sqlite"));

  let store = SqliteStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open store at {db_path:?}"))?;

  match cli.command {
    Command::Discover { matchers, filters, kind } => {
      let matchers = matchers
        .iter()
        .map(|name| MatchStrategy::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;
      let filters = filters
        .iter()
        .map(|name| FilterStrategy::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;
      let criteria = DiscoveryCriteria { record_kind: kind };

      let mut set = CandidateSet::create(store).await?;
      let inserted = set.discover(&criteria, &matchers, &filters).await?;

      println!("run: {}", set.run_id());
      println!("tuples inserted: {inserted}");
      println!("tuples stored:   {}", set.count().await?);
      println!("records covered: {}", set.total_members().await?);
    }

    Command::Merge { run, resolvers, force, pickers, count, offset, log } => {
      let run = RunId::parse(&run)?;
      let pickers = pickers
        .iter()
        .map(|name| SurvivorPicker::from_name(name))
        .collect::<Result<Vec<_>, _>>()?;

      let set = CandidateSet::attach(store.clone(), run).await?;
      let page = set.page(count, offset, &pickers).await?;

      let mut session = MergeSession::new(store, MergeConfig {
        resolvers,
        force_merge: force,
        log_path: log,
      })?;
      session.merge_candidates(&set, &page).await?;

      let summary = session.finish().summary();
      println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    Command::Exclude { run, survivor, members } => {
      let run = RunId::parse(&run)?;
      let set = CandidateSet::attach(store, run).await?;
      let members: Vec<RecordId> =
        members.into_iter().map(RecordId).collect();
      set.exclude(RecordId(survivor), &members).await?;
      println!("excluded tuple [{survivor}]");
    }

    Command::Cleanup { run, retention_days } => {
      let run = RunId::parse(&run)?;
      let set = CandidateSet::attach(store, run).await?;
      let report = set.reap_stale_runs(Duration::days(retention_days)).await?;

      println!("dropped: {}", report.dropped.len());
      for table in &report.unrecognised {
        println!("unrecognised (left alone): {table}");
      }
    }
  }

  Ok(())
}
