use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser as _;
use gravastar::blocklist::Blocklist;
use gravastar::cache::DnsCache;
use gravastar::cli::Args;
use gravastar::config::{self, LogLevel};
use gravastar::local_records::LocalRecords;
use gravastar::logging::setup_logging;
use gravastar::query_logger::QueryLogger;
use gravastar::resolver::UpstreamResolver;
use gravastar::rotate::DEFAULT_MAX_LOG_BYTES;
use gravastar::server::DnsServer;
use gravastar::updater::UpstreamBlocklistUpdater;
use gravastar::{State, DEFAULT_LOG_DIR, LOG_DIR_ENV};
use tokio::sync::{mpsc, watch};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_dir = std::env::var(LOG_DIR_ENV)
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_DIR));
    let log_handle = setup_logging(&log_dir, DEFAULT_MAX_LOG_BYTES).context("failed to initialize logging")?;
    if args.debug {
        tracing::debug!("debug logging enabled");
        tracing::debug!(config_dir = ?args.config_dir, "using config directory");
    }

    let config =
        config::load_main_config(&args.config_dir.join("gravastar.toml")).context("config error")?;
    log_handle.set(if args.debug { LogLevel::Debug } else { config.log_level });

    let blocklist_path = args.config_dir.join(&config.blocklist_file);
    let domains = config::load_blocklist(&blocklist_path).context("blocklist error")?;
    let mut blocklist = Blocklist::new();
    blocklist.set_domains(domains);
    tracing::info!(domains = blocklist.len(), "blocklist loaded");

    let records = config::load_local_records(&args.config_dir.join(&config.local_records_file))
        .context("local records error")?;
    let mut local_records = LocalRecords::new();
    local_records.load(&records);

    let upstreams =
        config::load_upstreams(&args.config_dir.join(&config.upstreams_file)).context("upstreams error")?;
    if !upstreams.dot_servers.is_empty() {
        tracing::debug!("DoT servers configured");
    }
    let upstream = UpstreamResolver::new(upstreams.udp_servers, upstreams.dot_servers, config.dot_verify);

    let cache = DnsCache::new(config.cache_size_bytes(), Duration::from_secs(config.cache_ttl_sec));
    let state = Arc::new(State::new(blocklist, local_records, cache, upstream));

    let (log_tx, log_rx) = mpsc::unbounded_channel();
    let query_logger = QueryLogger::new(log_rx, &log_dir, DEFAULT_MAX_LOG_BYTES);
    let query_logger_handle = tokio::spawn(query_logger.watch_for_logs());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let upstream_blocklists_path = args
        .upstream_blocklists
        .clone()
        .unwrap_or_else(|| args.config_dir.join("upstream_blocklists.toml"));
    let updater_handle = if upstream_blocklists_path.exists() {
        let updater_config = config::load_upstream_blocklist_config(&upstream_blocklists_path)
            .context("upstream blocklist config error")?;
        let updater = UpstreamBlocklistUpdater::new(
            updater_config,
            blocklist_path.clone(),
            blocklist_path.clone(),
            state.clone(),
        )
        .context("upstream blocklist updater error")?;
        tracing::info!("upstream blocklist updater started");
        Some(tokio::spawn(updater.run(shutdown_rx)))
    } else if args.upstream_blocklists.is_some() {
        anyhow::bail!(
            "upstream blocklist config not found: {}",
            upstream_blocklists_path.display()
        );
    } else {
        None
    };

    let server = DnsServer::new_with_workers(&config, state, log_tx)
        .await
        .context("failed to start the DNS server")?;
    server.block_until_completion().await?;

    // Stop the background tasks in reverse start order
    let _ = shutdown_tx.send(true);
    if let Some(handle) = updater_handle {
        let _ = handle.await;
    }
    let _ = query_logger_handle.await;

    Ok(())
}
