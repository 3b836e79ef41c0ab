pub mod blocklist;
pub mod cache;
pub mod cli;
pub mod config;
pub mod local_records;
pub mod logging;
pub mod query_logger;
pub mod resolver;
pub mod rotate;
pub mod server;
pub mod updater;

use blocklist::Blocklist;
use cache::DnsCache;
use local_records::LocalRecords;
use resolver::UpstreamResolver;
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_LOG_DIR: &str = "/var/log/gravastar";
pub const LOG_DIR_ENV: &str = "GRAVASTAR_LOG_DIR";

/// State shared by every worker: the blocklist behind a reader/writer lock
/// so the updater can hot-swap it, the cache behind its own mutex, and the
/// immutable local records and upstream configuration.
pub struct State {
    pub blocklist: RwLock<Blocklist>,
    pub local_records: LocalRecords,
    pub cache: Mutex<DnsCache>,
    pub upstream: UpstreamResolver,
}

impl State {
    pub fn new(
        blocklist: Blocklist,
        local_records: LocalRecords,
        cache: DnsCache,
        upstream: UpstreamResolver,
    ) -> Self {
        State {
            blocklist: RwLock::new(blocklist),
            local_records,
            cache: Mutex::new(cache),
            upstream,
        }
    }
}
