//! Command-line host for the swcache offline worker.
//!
//! Drives the worker against an on-disk cache so its behaviour can be
//! inspected without a browser.
//!
//! ## Usage
//!
//! ```bash
//! # Pre-cache the manifest and activate the configured version
//! swcache install
//!
//! # Send one request through the worker with the network switched off
//! swcache fetch /admin/reports/ --accept text/html --offline
//!
//! # Show what is stored
//! swcache list
//!
//! # Keep the worker registered and pick up version bumps in the config
//! swcache watch
//! ```

use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, ACCEPT};
use http::Method;
use serde_json::json;
use swcache_common::{init_logging, SwCacheError};
use swcache_net::{CannedFetcher, Fetcher, HttpFetcher, Request};
use swcache_sw::{
    CacheStorage, ClientType, Clients, FetchEvent, FetchOutcome, FileBackend, OfflineWorker,
    Registration, ServiceWorkerError,
};
use tracing::{debug, info, warn};

mod config;

use config::AppConfig;

#[derive(Parser)]
#[command(name = "swcache")]
#[command(about = "Offline cache worker host")]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Install and activate the configured worker version
    Install,

    /// Send one request through the worker
    Fetch {
        /// Path (or absolute URL) to request
        path: String,
        /// Request method
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// Accept header
        #[arg(long)]
        accept: Option<String>,
        /// Fail every network request
        #[arg(long)]
        offline: bool,
    },

    /// Delete every cache and notify controlled pages
    Clear,

    /// List cache namespaces and their entries
    List,

    /// Print the effective configuration
    Config,

    /// Install, then re-read the configuration every update interval and
    /// register new versions as they appear
    Watch {
        /// Stop after this many update checks
        #[arg(long)]
        checks: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> swcache_common::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(config.log_config(cli.verbose)?)?;

    match cli.command {
        Commands::Install => install(&config).await?,
        Commands::Fetch {
            path,
            method,
            accept,
            offline,
        } => fetch(&config, &path, &method, accept.as_deref(), offline).await?,
        Commands::Clear => clear(&config).await?,
        Commands::List => list(&config).await?,
        Commands::Watch { checks } => watch(&config, cli.config.as_deref(), checks).await?,
        Commands::Config => {
            let json = serde_json::to_string_pretty(&config)
                .map_err(|e| SwCacheError::config(e.to_string()))?;
            println!("{}", json);
        }
    }

    Ok(())
}

async fn storage(config: &AppConfig) -> swcache_common::Result<CacheStorage> {
    let backend = FileBackend::open_dir(config.cache_dir()).await?;
    Ok(CacheStorage::new(Arc::new(backend)))
}

fn fetcher(config: &AppConfig, offline: bool) -> swcache_common::Result<Arc<dyn Fetcher>> {
    if offline {
        return Ok(Arc::new(CannedFetcher::offline()));
    }
    let fetcher = HttpFetcher::new(config.loader_config()).map_err(ServiceWorkerError::from)?;
    Ok(Arc::new(fetcher))
}

/// A worker over the on-disk caches. Workers hold no state of their own,
/// so each command builds a fresh one.
async fn worker(
    config: &AppConfig,
    offline: bool,
    clients: Arc<Clients>,
) -> swcache_common::Result<OfflineWorker> {
    let worker = OfflineWorker::new(
        config.worker.clone(),
        config.origin_url()?,
        storage(config).await?,
        fetcher(config, offline)?,
        clients,
    )?;
    Ok(worker)
}

async fn install(config: &AppConfig) -> swcache_common::Result<()> {
    let backend = Arc::new(FileBackend::open_dir(config.cache_dir()).await?);
    let (registration, mut events) =
        Registration::new(config.origin_url()?, backend, fetcher(config, false)?);

    let id = registration.register(config.worker.clone()).await?;
    while let Ok(event) = events.try_recv() {
        debug!(?event, "Registration event");
    }

    println!("Installed {} ({})", config.worker.version, id);
    for name in registration.storage().keys().await? {
        let entries = registration.storage().entries(&name).await?;
        println!("  {} ({} entries)", name, entries.len());
    }
    Ok(())
}

async fn watch(
    config: &AppConfig,
    config_path: Option<&Path>,
    checks: Option<u64>,
) -> swcache_common::Result<()> {
    let backend = Arc::new(FileBackend::open_dir(config.cache_dir()).await?);
    let (registration, _events) =
        Registration::new(config.origin_url()?, backend, fetcher(config, false)?);

    // The first check registers the configured version.
    let mut current = config.worker.clone();
    let mut done = 0;
    loop {
        match registration.update_if_due(current.clone()).await {
            Ok(Some(id)) => println!("Activated {} ({})", current.version, id),
            Ok(None) => debug!(version = %current.version, "Up to date"),
            Err(e) => warn!(version = %current.version, error = %e, "Update failed"),
        }

        done += 1;
        if checks.is_some_and(|limit| done >= limit) {
            return Ok(());
        }

        tokio::time::sleep(current.update_interval().max(Duration::from_secs(1))).await;
        match AppConfig::load(config_path) {
            Ok(reloaded) => current = reloaded.worker,
            Err(e) => warn!(error = %e, "Keeping previous configuration"),
        }
        info!(version = %current.version, "Checking for update");
    }
}

async fn fetch(
    config: &AppConfig,
    path: &str,
    method: &str,
    accept: Option<&str>,
    offline: bool,
) -> swcache_common::Result<()> {
    let worker = worker(config, offline, Arc::new(Clients::new())).await?;
    let url = worker
        .scope()
        .join(path)
        .map_err(|e| SwCacheError::InvalidArgument(format!("{}: {}", path, e)))?;
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| SwCacheError::InvalidArgument(format!("{}: {}", method, e)))?;

    let mut request = Request::new(method, url);
    if let Some(accept) = accept {
        let value = HeaderValue::from_str(accept)
            .map_err(|e| SwCacheError::InvalidArgument(format!("accept: {}", e)))?;
        request = request.header(ACCEPT, value);
    }

    let mut event = FetchEvent::new(request);
    let outcome = worker.handle_fetch(&mut event).await;
    event.settled().await;

    match outcome {
        FetchOutcome::Passthrough => println!("not intercepted"),
        FetchOutcome::Respond { response, source } => {
            println!("{} from {} ({} bytes)", response.status, source, response.body_len());
        }
        FetchOutcome::Failed(e) => return Err(e.into()),
    }
    Ok(())
}

async fn clear(config: &AppConfig) -> swcache_common::Result<()> {
    let clients = Arc::new(Clients::new());
    let worker = worker(config, false, Arc::clone(&clients)).await?;

    // Stand-in page so the notification path is exercised.
    let (page, mut inbox) = clients.connect(worker.scope().clone(), ClientType::Window).await;
    clients.claim(worker.id(), worker.scope()).await;

    let outcome = worker.handle_message(&json!({"type": "CLEAR_CACHE"})).await;
    debug!(?outcome, "Clear finished");

    while let Ok(notification) = inbox.try_recv() {
        let json = serde_json::to_string(&notification)
            .map_err(|e| SwCacheError::internal(e.to_string()))?;
        println!("{} <- {}", page, json);
    }
    Ok(())
}

async fn list(config: &AppConfig) -> swcache_common::Result<()> {
    let storage = storage(config).await?;
    let names = storage.keys().await?;
    if names.is_empty() {
        println!("no caches in {}", config.cache_dir().display());
    }
    for name in names {
        println!("{}", name);
        for entry in storage.entries(&name).await? {
            println!("  {} {} ({}, {} bytes)", entry.method, entry.url, entry.status, entry.body.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_fetch_arguments() {
        let cli = Cli::try_parse_from([
            "swcache", "fetch", "/admin/", "--accept", "text/html", "--offline",
        ])
        .unwrap();
        match cli.command {
            Commands::Fetch {
                path,
                method,
                accept,
                offline,
            } => {
                assert_eq!(path, "/admin/");
                assert_eq!(method, "GET");
                assert_eq!(accept.as_deref(), Some("text/html"));
                assert!(offline);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn test_watch_arguments() {
        let cli = Cli::try_parse_from(["swcache", "watch", "--checks", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Watch { checks: Some(3) }));

        let cli = Cli::try_parse_from(["swcache", "-v", "watch"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Watch { checks: None }));
    }
}
