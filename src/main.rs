mod ai;
mod config;
mod db;
mod matcher;
mod models;
mod notifier;
mod pipeline;
mod retry;
mod source;

use ai::{create_provider, AiCoverLetterWriter};
use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use config::{load_profile, AppConfig, ConfigError, TelegramCredentials, DEFAULT_CONFIG_PATH, DEFAULT_PROFILE_PATH};
use db::{Database, StoreError};
use matcher::{match_summary, score_posting};
use models::{Posting, RawPosting};
use notifier::TelegramNotifier;
use pipeline::{Pipeline, PipelineOptions, RunAborted, RunError, RunState, RunSummary};
use source::WellfoundSource;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Daily job alerts - scrape, score, and notify on new postings")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scrape, score and notify pass
    Run {
        /// Path to the run configuration (TOML)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Path to the user profile (JSON or TOML)
        #[arg(short, long, default_value = DEFAULT_PROFILE_PATH)]
        profile: PathBuf,

        /// Database path, overrides the config file
        #[arg(long)]
        db: Option<PathBuf>,

        /// Record postings without sending notifications or cover letters
        #[arg(long)]
        dry_run: bool,
    },

    /// Show seen-posting statistics
    Stats {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Show one seen posting
    Show {
        /// Posting ID
        id: String,

        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Score an ad-hoc posting against a profile
    Score {
        #[arg(short, long, default_value = DEFAULT_PROFILE_PATH)]
        profile: PathBuf,

        #[arg(short, long)]
        title: String,

        #[arg(short, long, default_value = "")]
        company: String,

        #[arg(short, long, default_value = "")]
        location: String,

        #[arg(short, long, default_value = "")]
        description: String,
    },
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scout=info,warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<ExitCode> {
    // A missing .env is fine; real environment variables still apply.
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            profile,
            db,
            dry_run,
        } => match execute_run(&config, &profile, db, dry_run) {
            Ok(summary) => {
                println!("\nRun finished: {}", summary.state);
                print!("{}", summary);
                if dry_run {
                    println!("\n(Dry run - no notifications were sent)");
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(aborted) => {
                let error = &aborted.error;
                println!("\nRun finished: {}", RunState::Aborted);
                println!("  {} during {}: {}", error.class(), error.state(), error);
                print!("{}", aborted.summary);
                Ok(ExitCode::FAILURE)
            }
        },

        Commands::Stats { config, db } => {
            let store = Database::open(store_path(&config, db)?.as_deref())
                .context("Failed to open database")?;
            let stats = store.stats()?;
            println!("Database: {}", store.path().display());
            println!("{:<12} {:>8}", "STATUS", "COUNT");
            println!("{}", "-".repeat(21));
            println!("{:<12} {:>8}", "notified", stats.notified);
            println!("{:<12} {:>8}", "failed", stats.failed);
            println!("{:<12} {:>8}", "pending", stats.pending);
            println!("{:<12} {:>8}", "skipped", stats.skipped);
            println!("{}", "-".repeat(21));
            println!("{:<12} {:>8}", "total", stats.total);
            println!("\nAverage score: {:.1}", stats.avg_score);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Show { id, config, db } => {
            let store = Database::open(store_path(&config, db)?.as_deref())
                .context("Failed to open database")?;
            match store.get(&id)? {
                Some(record) => {
                    println!("Posting {}", record.id);
                    println!("First seen: {}", record.first_seen_at.to_rfc3339());
                    if let Some(status) = store.status_of(&id)? {
                        println!("Status: {}", status);
                    }
                    if let Some(letter) = store.cover_letter_of(&id)? {
                        println!("\n--- Cover Letter ---\n{}", letter);
                    }
                }
                None => {
                    println!("Posting {} not found.", id);
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Score {
            profile,
            title,
            company,
            location,
            description,
        } => {
            let profile = load_profile(&profile)?;
            let posting = Posting::from_raw(
                RawPosting {
                    title,
                    company,
                    location,
                    description,
                    ..Default::default()
                },
                Utc::now(),
            );
            let scored = score_posting(&posting, &profile);
            let verdict = if scored.score >= profile.min_match_score {
                "MATCH"
            } else {
                "below"
            };

            println!("{:<32} {:>5} {:>6}  {}", "TITLE", "SCORE", "MIN", "RESULT");
            println!("{}", "-".repeat(54));
            println!(
                "{:<32} {:>5} {:>6}  {}",
                truncate(&posting.title, 30),
                scored.score,
                profile.min_match_score,
                verdict
            );
            println!("\n{}", match_summary(&scored));
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn store_path(config: &Path, db: Option<PathBuf>) -> Result<Option<PathBuf>> {
    if db.is_some() {
        return Ok(db);
    }
    Ok(AppConfig::load(config)?.database.path)
}

fn at_startup(source: StoreError) -> RunAborted {
    RunError::Store {
        state: RunState::Starting,
        source,
    }
    .into()
}

fn execute_run(
    config_path: &Path,
    profile_path: &Path,
    db: Option<PathBuf>,
    dry_run: bool,
) -> Result<RunSummary, RunAborted> {
    let config = AppConfig::load(config_path)?;
    let profile = load_profile(profile_path)?;
    tracing::info!(
        skills = profile.skills.len(),
        keywords = profile.keywords.len(),
        min_match_score = profile.min_match_score,
        "profile loaded"
    );

    let notify = config.notifications.enabled && !dry_run;
    let credentials = if notify {
        Some(TelegramCredentials::from_env()?)
    } else {
        None
    };

    let db_path = db.or_else(|| config.database.path.clone());
    let store = Database::open(db_path.as_deref()).map_err(at_startup)?;
    store.lock_for_run().map_err(at_startup)?;
    tracing::info!(path = %store.path().display(), "store opened");

    let query = profile.keywords.iter().take(2).cloned().collect::<Vec<_>>().join(" ");
    let location = profile.locations.first().map(String::as_str).unwrap_or("");
    let source = WellfoundSource::new(&config.scraper, &query, location)
        .map_err(|e| ConfigError::Invalid(format!("scraper client: {}", e)))?;

    let notifier = credentials
        .map(TelegramNotifier::new)
        .transpose()
        .map_err(|e| ConfigError::Invalid(format!("telegram client: {}", e)))?;

    let writer = if config.cover_letter.enabled && !dry_run {
        match create_provider(&config.cover_letter.model) {
            Ok(provider) => Some(AiCoverLetterWriter::new(provider)),
            Err(e) => {
                tracing::warn!(error = %e, "cover letters disabled for this run");
                None
            }
        }
    } else {
        None
    };

    let mut options = PipelineOptions::from_config(&config)?;
    options.notifications_enabled = notify;
    options.cover_letters_enabled = writer.is_some();

    let mut pipeline = Pipeline::new(&source, &store, &profile, options);
    if let Some(notifier) = &notifier {
        pipeline = pipeline.with_sink(notifier);
    }
    if let Some(writer) = &writer {
        pipeline = pipeline.with_cover_letters(writer);
    }
    let summary = pipeline.run()?;

    match store.count() {
        Ok(total) => tracing::info!(total, "postings in store"),
        Err(e) => tracing::warn!(error = %e, "could not count stored postings"),
    }
    Ok(summary)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
