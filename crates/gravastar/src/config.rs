use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context;
use gravastar_lib::canonical_name;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

/// The main server configuration (`gravastar.toml`). Every key is optional
/// and falls back to its documented default.
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub listen_port: u16,
    pub cache_size_mb: u64,
    pub cache_ttl_sec: u64,
    pub dot_verify: bool,
    pub log_level: LogLevel,
    /// Reserved: accepted in the file but not consulted anywhere yet
    pub rebind_protection: bool,
    pub blocklist_file: String,
    pub local_records_file: String,
    pub upstreams_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: 53,
            cache_size_mb: 100,
            cache_ttl_sec: 120,
            dot_verify: true,
            log_level: LogLevel::Debug,
            rebind_protection: false,
            blocklist_file: "blocklist.toml".to_string(),
            local_records_file: "local_records.toml".to_string(),
            upstreams_file: "upstreams.toml".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn cache_size_bytes(&self) -> usize {
        self.cache_size_mb as usize * 1024 * 1024
    }
}

/// The blocklist file: a single `domains` array. Also the format the
/// updater publishes after merging the subscription sources.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistFile {
    pub domains: Vec<String>,
}

/// A raw `[[record]]` table from the local records file. Types are
/// validated later, when [`crate::local_records::LocalRecords`] is built.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawLocalRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LocalRecordsFile {
    record: Vec<RawLocalRecord>,
}

#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    pub udp_servers: Vec<String>,
    pub dot_servers: Vec<String>,
}

/// Configuration of the periodic blocklist updater
/// (`upstream_blocklists.toml`).
#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamBlocklistConfig {
    pub update_interval_sec: u64,
    pub urls: Vec<String>,
    pub cache_dir: PathBuf,
}

impl Default for UpstreamBlocklistConfig {
    fn default() -> Self {
        UpstreamBlocklistConfig {
            update_interval_sec: 3600,
            urls: Vec::new(),
            cache_dir: PathBuf::from("/var/gravastar"),
        }
    }
}

pub fn load_main_config(path: &Path) -> anyhow::Result<ServerConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("unable to open file: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("unable to parse config file: {}", path.display()))
}

/// Loads the blocklist file into a canonicalized domain set.
pub fn load_blocklist(path: &Path) -> anyhow::Result<HashSet<String>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("unable to open file: {}", path.display()))?;
    let file: BlocklistFile =
        toml::from_str(&raw).with_context(|| format!("unable to parse blocklist file: {}", path.display()))?;
    Ok(file.domains.iter().map(|domain| canonical_name(domain)).collect())
}

pub fn load_local_records(path: &Path) -> anyhow::Result<Vec<RawLocalRecord>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("unable to open file: {}", path.display()))?;
    let file: LocalRecordsFile =
        toml::from_str(&raw).with_context(|| format!("unable to parse local records file: {}", path.display()))?;
    Ok(file.record)
}

pub fn load_upstreams(path: &Path) -> anyhow::Result<UpstreamsConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("unable to open file: {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("unable to parse upstreams file: {}", path.display()))
}

pub fn load_upstream_blocklist_config(path: &Path) -> anyhow::Result<UpstreamBlocklistConfig> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("unable to open file: {}", path.display()))?;
    let mut config: UpstreamBlocklistConfig = toml::from_str(&raw)
        .with_context(|| format!("unable to parse upstream blocklist config: {}", path.display()))?;
    if config.update_interval_sec == 0 {
        config.update_interval_sec = 3600;
    }
    Ok(config)
}
