use chrono::Utc;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "trackersync", about = "Mirror tracker tasks and their status history into SQLite")]
struct Cli {
    /// Database path (default: ~/.trackersync/trackersync.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Page size for bounded search requests (default: 100)
    #[arg(long)]
    page_size: Option<usize>,

    /// Directory for per-run JSONL audit logs
    #[arg(long)]
    audit_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl trackersync::SyncProgress for StderrProgress {
    fn on_run_start(&self, run_id: i64) {
        eprintln!("Sync run {run_id} started");
    }

    fn on_tasks_found(&self, count: usize) {
        eprintln!("  Found {count} tasks");
    }

    fn on_batch_progress(&self, stage: &str, done: usize, total: usize) {
        if done == total {
            eprint!("\r  Fetching {stage}: {done}/{total}   \n");
        } else {
            eprint!("\r  Fetching {stage}: {done}/{total}   ");
        }
    }

    fn on_run_complete(&self, report: &trackersync::SyncReport) {
        eprintln!(
            "  Done: {} tasks ({} new, {} updated), {} intervals, {} API errors",
            report.tasks_processed,
            report.tasks_created,
            report.tasks_updated,
            report.intervals_created,
            report.api_errors
        );
        if let Some(error) = &report.error {
            eprintln!("  Run {} failed: {error}", report.run_id);
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync every task matching a search
    Sync {
        /// Query-language text or a JSON filter object (default: config `sync.query`)
        #[arg(long)]
        query: Option<String>,
        /// Sync at most this many tasks
        #[arg(long)]
        limit: Option<usize>,
        /// Rebuild every task's history from its full change log
        #[arg(long)]
        full: bool,
        /// Concurrent change-log fetches (default: 8)
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Sync specific tasks by key or URL
    SyncKeys {
        /// Issue keys (ABC-123) or tracker URLs
        #[arg(required = true)]
        keys: Vec<String>,
        #[arg(long)]
        full: bool,
    },
    /// Show the stored status history of a task
    History {
        key: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove duplicate status intervals
    Dedupe,
    /// Show store statistics and recent sync runs
    Status,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => trackersync::Database::open_at(path).await?,
        None => trackersync::Database::open().await?,
    };

    match cli.command {
        Commands::Status => {
            print_status(&db).await?;
        }
        Commands::Config { action } => {
            handle_config(&db, action).await?;
        }
        Commands::History { key, json } => {
            print_history(&db, &key, json).await?;
        }
        Commands::Dedupe => {
            let removed = db.deduplicate_intervals().await?;
            println!("Removed {removed} duplicate intervals.");
        }
        Commands::Sync {
            query,
            limit,
            full,
            workers,
        } => {
            let mut config = client_config(cli.page_size, cli.audit_dir.as_deref())?;
            if let Some(workers) = workers {
                config = config.with_batch_workers(workers);
            }
            let ts = trackersync::TrackerSync::from_config(db, config)?;
            let query = match query {
                Some(q) => trackersync::SearchQuery::parse(&q),
                None => ts.default_query().await?,
            };
            let mut options = trackersync::SyncOptions::new(query);
            options.limit = limit;
            options.full = full;
            let report = ts.sync(&options, &StderrProgress).await?;
            exit_on_failure(&report);
        }
        Commands::SyncKeys { keys, full } => {
            let config = client_config(cli.page_size, cli.audit_dir.as_deref())?;
            let ts = trackersync::TrackerSync::from_config(db, config)?;
            let report = ts.sync_keys(&keys, full, &StderrProgress).await?;
            exit_on_failure(&report);
        }
    }

    Ok(())
}

fn client_config(
    page_size: Option<usize>,
    audit_dir: Option<&str>,
) -> anyhow::Result<trackersync::Config> {
    let mut config = trackersync::Config::from_env()?;
    if let Some(ps) = page_size {
        config = config.with_page_size(ps);
    }
    if let Some(dir) = audit_dir {
        config = config.with_audit_dir(dir);
    }
    Ok(config)
}

fn exit_on_failure(report: &trackersync::SyncReport) {
    if !report.success {
        std::process::exit(1);
    }
}

async fn print_status(db: &trackersync::Database) -> anyhow::Result<()> {
    let status = db.status(5).await?;
    println!("Store Status");
    println!("  Tasks:     {}", status.tasks);
    println!("  Intervals: {}", status.intervals);
    if status.recent_runs.is_empty() {
        println!("  Last sync: never");
        return Ok(());
    }
    println!("Recent runs");
    for run in &status.recent_runs {
        println!(
            "  #{:<5} {:<10} {}  {} tasks, {} intervals, {} API errors",
            run.id,
            run.status.as_str(),
            run.started_at,
            run.tasks_processed,
            run.intervals_created,
            run.api_errors
        );
        if let Some(error) = &run.error_message {
            println!("         {error}");
        }
    }
    Ok(())
}

async fn print_history(db: &trackersync::Database, input: &str, json: bool) -> anyhow::Result<()> {
    let key = trackersync::resolve_issue_key(input)?;
    let history = db
        .task_history(&key)
        .await?
        .ok_or_else(|| anyhow::anyhow!("{key} has not been synced"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&history)?);
        return Ok(());
    }

    let task = &history.task.task;
    println!(
        "{}  {}  [{}]",
        task.key,
        task.summary.as_deref().unwrap_or(""),
        task.status_display
    );
    let now = Utc::now();
    for row in &history.intervals {
        let interval = &row.interval;
        let end = interval
            .end
            .map(|e| trackersync::date_util::format_timestamp(&e))
            .unwrap_or_else(|| "(open)".to_string());
        let hours = interval.duration(now).num_minutes() as f64 / 60.0;
        println!(
            "  {:<20} {} -> {:<24} {hours:>8.1}h",
            interval.status_display,
            trackersync::date_util::format_timestamp(&interval.start),
            end
        );
    }
    Ok(())
}

async fn handle_config(db: &trackersync::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match db.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            db.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = db.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}
