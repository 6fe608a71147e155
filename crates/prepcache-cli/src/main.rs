//! prepcache - keeps an offline copy of community preparedness data.
//!
//! The `run` command starts the sync coordinator as a daemon and reads
//! worker signals and connectivity changes from stdin, one per line. The
//! other commands run a single operation against the local cache.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use prepcache_core::api::ApiClient;
use prepcache_core::auth::CredentialStore;
use prepcache_core::cache::CacheManager;
use prepcache_core::config::Config;
use prepcache_core::models::EntityGroup;
use prepcache_core::sync::{
    ChangeDetector, CheckOutcome, CoordinatorEvent, SyncCoordinator, SyncEngine, SyncOutcome,
    SyncReport, SyncStatus,
};
use prepcache_core::utils::truncate_string;

// ============================================================================
// Constants
// ============================================================================

const ENV_ACCESS_TOKEN: &str = "PREPCACHE_ACCESS_TOKEN";
const ENV_CACHE_PASSPHRASE: &str = "PREPCACHE_CACHE_PASSPHRASE";
const ENV_LOG_DIR: &str = "PREPCACHE_LOG_DIR";

/// Capacity of the coordinator event channel
const EVENT_CHANNEL_SIZE: usize = 32;

/// Longest error message printed per failed group
const MAX_ERROR_DISPLAY_LEN: usize = 120;

const USAGE: &str = "\
Usage: prepcache <command>

Commands:
  run                    Keep the cache in sync; reads signals from stdin
  sync                   Run one full sync
  check                  Check for remote changes and sync if needed
  status                 Show last sync, cache ages, pending changes, communities
  contacts               List cached emergency contacts
  store-token <user_id>  Save an access token (read from stdin) in the keychain
  forget-token <user_id> Remove a saved access token";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Run,
    Sync,
    Check,
    Status,
    Contacts,
    StoreToken(String),
    ForgetToken(String),
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let user_arg = |name: &str| {
        args.get(1)
            .cloned()
            .ok_or_else(|| anyhow!("{} requires a user id", name))
    };

    match args.first().map(String::as_str) {
        Some("run") => Ok(Command::Run),
        Some("sync") => Ok(Command::Sync),
        Some("check") => Ok(Command::Check),
        Some("status") => Ok(Command::Status),
        Some("contacts") => Ok(Command::Contacts),
        Some("store-token") => Ok(Command::StoreToken(user_arg("store-token")?)),
        Some("forget-token") => Ok(Command::ForgetToken(user_arg("forget-token")?)),
        None | Some("help") | Some("--help") | Some("-h") => Ok(Command::Help),
        Some(other) => Err(anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    }
}

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr, filtered by `RUST_LOG` (default `warn`). With a log
/// directory, a daily rolling file is written as well; keep the returned
/// guard alive so buffered lines are flushed.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "prepcache.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn log_dir(command: &Command) -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(ENV_LOG_DIR) {
        return Some(PathBuf::from(dir));
    }
    match command {
        Command::Run => Config::cache_root().ok().map(|root| root.join("logs")),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    let _log_guard = init_tracing(log_dir(&command));

    let mut config = Config::load().context("Failed to load config")?;
    config.apply_env();

    match command {
        Command::Help => {
            println!("{}", USAGE);
            Ok(())
        }
        Command::StoreToken(user_id) => store_token(&mut config, &user_id),
        Command::ForgetToken(user_id) => {
            CredentialStore::delete(&user_id)?;
            println!("Removed saved token for {}", user_id);
            Ok(())
        }
        Command::Status => show_status(&config),
        Command::Contacts => show_contacts(&config),
        Command::Sync => {
            let coordinator = build_coordinator(&config)?;
            match coordinator.sync().await? {
                SyncOutcome::Completed(report) => print_report(&report),
                SyncOutcome::AlreadyRunning => println!("A sync is already running"),
            }
            Ok(())
        }
        Command::Check => {
            let coordinator = build_coordinator(&config)?;
            match coordinator.check_for_changes().await? {
                CheckOutcome::Unchanged => println!("Cache is up to date"),
                CheckOutcome::Skipped => println!("A sync is already running"),
                CheckOutcome::Synced(report) => print_report(&report),
            }
            Ok(())
        }
        Command::Run => run_daemon(&config).await,
    }
}

// ============================================================================
// Composition
// ============================================================================

fn signed_in_user(config: &Config) -> Result<String> {
    config
        .last_user_id
        .clone()
        .ok_or_else(|| anyhow!("No member configured. Set PREPCACHE_USER_ID or run store-token."))
}

fn open_cache(config: &Config, user_id: &str) -> Result<CacheManager> {
    let dir = config.cache_dir(user_id)?;
    if config.encrypt_cache {
        let passphrase = std::env::var(ENV_CACHE_PASSPHRASE)
            .map_err(|_| anyhow!("Cache encryption is enabled but {} is not set", ENV_CACHE_PASSPHRASE))?;
        CacheManager::with_encryption(dir, &passphrase)
    } else {
        CacheManager::new(dir)
    }
}

fn access_token(user_id: &str) -> Option<String> {
    if let Ok(token) = std::env::var(ENV_ACCESS_TOKEN) {
        if !token.trim().is_empty() {
            return Some(token);
        }
    }
    match CredentialStore::get_token(user_id) {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(user_id = %user_id, error = %e, "No saved access token, using anonymous access");
            None
        }
    }
}

/// Build the coordinator with the configured member already signed in
fn build_coordinator(config: &Config) -> Result<Arc<SyncCoordinator>> {
    let user_id = signed_in_user(config)?;
    let coordinator = build_unsigned(config, &user_id)?;
    coordinator.sign_in(user_id)?;
    Ok(coordinator)
}

fn build_unsigned(config: &Config, user_id: &str) -> Result<Arc<SyncCoordinator>> {
    let url = config
        .supabase_url
        .as_deref()
        .ok_or_else(|| anyhow!("No service URL configured. Set PREPCACHE_SUPABASE_URL."))?;
    let anon_key = config
        .anon_key
        .as_deref()
        .ok_or_else(|| anyhow!("No anon key configured. Set PREPCACHE_ANON_KEY."))?;

    let mut client = ApiClient::new(url, anon_key)?;
    if let Some(token) = access_token(user_id) {
        client.set_token(token);
    }
    let remote = Arc::new(client);
    let cache = Arc::new(open_cache(config, user_id)?);

    Ok(Arc::new(SyncCoordinator::new(
        SyncEngine::new(remote.clone(), Arc::clone(&cache)),
        ChangeDetector::new(remote),
        cache,
        user_id,
        config.sync,
    )))
}

// ============================================================================
// Commands
// ============================================================================

async fn run_daemon(config: &Config) -> Result<()> {
    let user_id = signed_in_user(config)?;
    let coordinator = build_unsigned(config, &user_id)?;
    info!(user_id = %user_id, "prepcache daemon starting");

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let runner = tokio::spawn(Arc::clone(&coordinator).run(rx));
    tx.send(CoordinatorEvent::SignedIn { user_id })
        .await
        .context("Coordinator stopped unexpectedly")?;

    let mut progress = coordinator.subscribe_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = progress.borrow_and_update().clone();
            if current.status != SyncStatus::Syncing {
                println!(
                    "[{:?}] {}",
                    current.status,
                    current.message.unwrap_or_default()
                );
            }
        }
    });

    let events = tx.clone();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match CoordinatorEvent::parse_line(&line) {
                    Ok(event) => {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "Ignoring input line"),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    break;
                }
            }
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    reader.abort();
    drop(tx);
    runner.await.context("Coordinator task failed")?;
    reporter.abort();
    Ok(())
}

fn store_token(config: &mut Config, user_id: &str) -> Result<()> {
    print!("Access token for {}: ", user_id);
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin().lock().read_line(&mut token)?;
    let token = token.trim();
    if token.is_empty() {
        return Err(anyhow!("No token entered"));
    }

    CredentialStore::store_token(user_id, token)?;
    config.last_user_id = Some(user_id.to_string());
    config.save()?;
    println!("Token saved; {} is now the default member", user_id);
    Ok(())
}

fn show_status(config: &Config) -> Result<()> {
    let user_id = signed_in_user(config)?;
    let cache = open_cache(config, &user_id)?;

    let last_sync = match cache.load_metadata() {
        Ok(metadata) => metadata
            .last_sync
            .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string()),
        Err(e) => {
            warn!(error = %e, "Failed to read sync metadata");
            "unknown".to_string()
        }
    };

    let member = match cache.load_profile() {
        Ok(Some(cached)) => cached.data.map(|p| format!("{} ({})", p.display_name(), user_id)),
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Failed to read cached profile");
            None
        }
    };

    println!("Member:     {}", member.unwrap_or(user_id));
    println!("Cache:      {}", cache.cache_dir().display());
    println!("Encrypted:  {}", if cache.is_encrypted() { "yes" } else { "no" });
    println!("Last sync:  {}", last_sync);
    println!("Pending:    {}", cache.pending_count().unwrap_or(0));
    println!();

    let ages = cache.get_cache_ages();
    for group in EntityGroup::ALL {
        println!("{:<20} {}", group.display_name(), ages.age(group));
    }

    match cache.load_communities() {
        Ok(Some(cached)) if !cached.data.is_empty() => {
            println!();
            for community in &cached.data {
                println!("{:<30} {}", community.name, community.display_member_count());
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Failed to read cached communities"),
    }
    Ok(())
}

fn show_contacts(config: &Config) -> Result<()> {
    let user_id = signed_in_user(config)?;
    let cache = open_cache(config, &user_id)?;

    let contacts = match cache.load_emergency_contacts() {
        Ok(cached) => cached.map(|c| c.data).unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Failed to read cached contacts");
            Vec::new()
        }
    };

    if contacts.is_empty() {
        println!("No emergency contacts cached. Run `prepcache sync` while online.");
        return Ok(());
    }
    for contact in &contacts {
        println!("{}", contact.summary());
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    if report.success {
        println!("Sync complete: {}", report.summary());
    } else {
        println!("Sync finished with errors: {}", report.summary());
        for error in &report.errors {
            match error.group {
                Some(group) => println!(
                    "  {}: {}",
                    group.display_name(),
                    truncate_string(&error.message, MAX_ERROR_DISPLAY_LEN)
                ),
                None => println!("  {}", truncate_string(&error.message, MAX_ERROR_DISPLAY_LEN)),
            }
        }
    }
    if let Some(last_sync) = report.last_sync {
        println!("Last sync: {}", last_sync.to_rfc3339());
    }
}
