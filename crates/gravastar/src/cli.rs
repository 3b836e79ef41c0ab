use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(version, name = "gravastar", about = "Filtering DNS forwarder with blocklists and DNS-over-TLS upstreams")]
pub struct Args {
    /// Configuration directory
    #[arg(short = 'c', long = "config-dir", value_name = "DIR", default_value = "/etc/gravastar")]
    pub config_dir: PathBuf,
    /// Upstream blocklist subscription config; defaults to
    /// <config_dir>/upstream_blocklists.toml when that file exists
    #[arg(short = 'u', long = "upstream-blocklists", value_name = "PATH")]
    pub upstream_blocklists: Option<PathBuf>,
    /// Force debug logging regardless of the configured level
    #[arg(short = 'd', long = "debug")]
    pub debug: bool,
}
