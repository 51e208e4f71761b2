use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use secrecy::SecretString;

use ariadw::storage::repository;
use ariadw::{AriaDW, DateRange, FitbitClient, MeasurementKind, SyncOptions, SyncReport};

#[derive(Parser)]
#[command(name = "ariadw", about = "Fitbit Aria health-data warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.ariadw/ariadw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Progress reporter that writes to stderr.
struct StderrProgress;

impl ariadw::SyncProgress for StderrProgress {
    fn on_windows_planned(&self, kind: &str, count: usize) {
        eprintln!("Syncing {kind} across {count} request window(s)...");
    }

    fn on_window_complete(&self, range: &DateRange, records: usize) {
        eprintln!("  {range}: {records} record(s)");
    }

    fn on_window_failed(&self, range: &DateRange, error: &str) {
        eprintln!("  {range}: failed ({error})");
    }

    fn on_sync_complete(&self, report: &SyncReport) {
        eprintln!(
            "  Done: {} saved, {} skipped, {} errors",
            report.samples_saved, report.samples_skipped, report.samples_errored
        );
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sync body measurements from the Fitbit API
    Sync {
        /// Measurement kind to sync
        #[arg(long, default_value = "weight")]
        kind: String,
        /// Start date (YYYY-MM-DD); default resumes after the last sync
        #[arg(long)]
        start: Option<String>,
        /// End date (YYYY-MM-DD); default is today
        #[arg(long)]
        end: Option<String>,
        /// Sync the last N days instead of resuming
        #[arg(long, conflicts_with = "start")]
        days: Option<u32>,
    },
    /// Manage the API credential
    Auth {
        #[command(subcommand)]
        action: AuthAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List recently synced samples
    Records {
        /// Maximum results
        #[arg(long, default_value = "20")]
        limit: u32,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the sync log
    Log {
        /// Clear the log instead of printing it
        #[arg(long)]
        clear: bool,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum AuthAction {
    /// Store a Fitbit access token
    SetToken { token: String },
    /// Forget the stored token
    Clear,
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

const TOKEN_KEY: &str = "fitbit_access_token";

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
        Some(path) => ariadw::Database::open_at(path).await?,
        None => ariadw::Database::open().await?,
    };

    match cli.command {
        Commands::Status => {
            print_status(&db).await?;
        }
        Commands::Config { action } => {
            handle_config(&db, action).await?;
        }
        Commands::Records { limit, json } => {
            handle_records(&db, limit, json).await?;
        }
        Commands::Auth { action } => {
            handle_auth(&db, action).await?;
        }
        Commands::Log { clear } => {
            let dw = AriaDW::new(db, FitbitClient::from_env());
            if clear {
                dw.settings().clear_log().await?;
                println!("Log cleared.");
            } else {
                print!("{}", dw.settings().sync_log().await?);
            }
        }
        Commands::Sync {
            kind,
            start,
            end,
            days,
        } => {
            let client = build_client(&db).await?;
            let dw = AriaDW::new(db, client);
            let kind: MeasurementKind = kind.parse()?;
            let options = SyncOptions {
                start: parse_date(start.as_deref())?,
                end: parse_date(end.as_deref())?,
                days,
            };
            let report = dw.sync(kind, &options, &StderrProgress).await?;
            if !report.succeeded() {
                anyhow::bail!(
                    "sync failed: {}",
                    report.error.as_deref().unwrap_or("unknown error")
                );
            }
            println!(
                "Sync {}: {} received, {} saved",
                match report.status {
                    ariadw::SyncStatus::Success => "complete",
                    _ => "partially complete",
                },
                report.records_received,
                report.samples_saved
            );
        }
    }

    Ok(())
}

/// Build the API client: environment first, stored token as fallback.
async fn build_client(db: &ariadw::Database) -> anyhow::Result<FitbitClient> {
    let client = FitbitClient::from_env();
    if !client.has_token() {
        let stored: Option<String> = db
            .reader()
            .call(|conn| repository::get_config(conn, TOKEN_KEY))
            .await?;
        if let Some(token) = stored {
            client.set_token(SecretString::new(token.into()));
        }
    }
    Ok(client)
}

fn parse_date(raw: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    raw.map(|s| {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s}"))
    })
    .transpose()
}

async fn print_status(db: &ariadw::Database) -> anyhow::Result<()> {
    let (counts, authorizations, last_job) = db
        .reader()
        .call(|conn| {
            Ok::<_, rusqlite::Error>((
                repository::sample_counts(conn)?,
                repository::list_authorizations(conn)?,
                repository::last_completed_sync(conn)?,
            ))
        })
        .await?;
    let (last_date, last_status) = db
        .reader()
        .call(|conn| {
            Ok::<_, rusqlite::Error>((
                repository::get_config(conn, "last_sync_date")?,
                repository::get_config(conn, "last_sync_status")?,
            ))
        })
        .await?;

    println!("Warehouse Status");
    if counts.is_empty() {
        println!("  Samples:   none");
    } else {
        for (category, count) in &counts {
            println!("  {category}: {count}");
        }
    }
    println!("Authorization");
    for (category, authorized) in &authorizations {
        println!(
            "  {category}: {}",
            if *authorized { "authorized" } else { "denied" }
        );
    }
    println!(
        "Last sync: {} ({})",
        last_date.unwrap_or_else(|| "never".to_string()),
        last_status.unwrap_or_default()
    );
    if let Some(completed_at) = last_job {
        println!("Last job completed at: {completed_at}");
    }
    Ok(())
}

async fn handle_config(db: &ariadw::Database, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let val: Option<String> = db
                .reader()
                .call({
                    let key = key.clone();
                    move |conn| repository::get_config(conn, &key)
                })
                .await?;
            match val {
                Some(v) => println!("{key} = {v}"),
                None => println!("{key} is not set"),
            }
        }
        ConfigAction::Set { key, value } => {
            db.writer()
                .call(move |conn| {
                    repository::set_config(conn, &key, &value)?;
                    Ok::<(), rusqlite::Error>(())
                })
                .await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items: Vec<(String, String)> = db
                .reader()
                .call(|conn| repository::list_config(conn))
                .await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    // Never echo the credential itself.
                    if k == TOKEN_KEY {
                        println!("{k} = <set>");
                    } else {
                        println!("{k} = {v}");
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_records(db: &ariadw::Database, limit: u32, json: bool) -> anyhow::Result<()> {
    let rows = db
        .reader()
        .call(move |conn| repository::recent_samples(conn, limit))
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("No samples synced yet.");
    } else {
        for row in rows {
            println!(
                "{}  {:<20} {:>8.2} {:<8} {}",
                row.recorded_at,
                row.category,
                row.value,
                row.unit,
                row.source.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}

async fn handle_auth(db: &ariadw::Database, action: AuthAction) -> anyhow::Result<()> {
    match action {
        AuthAction::SetToken { token } => {
            db.writer()
                .call(move |conn| repository::set_config(conn, TOKEN_KEY, &token))
                .await?;
            println!("Token stored.");
        }
        AuthAction::Clear => {
            db.writer()
                .call(|conn| repository::delete_config(conn, TOKEN_KEY))
                .await?;
            println!("Token cleared.");
        }
    }
    Ok(())
}
