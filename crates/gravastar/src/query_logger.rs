use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::Path;

use gravastar_lib::QueryType;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::resolver::ResolveSource;
use crate::rotate::RotatingFile;

pub const PASS_LOG_NAME: &str = "pass.log";
pub const BLOCK_LOG_NAME: &str = "block.log";

/// One query-log event, emitted by a worker after the response is sent.
#[derive(Debug)]
pub enum QueryLogEntry {
    Pass {
        client_ip: IpAddr,
        client_name: String,
        qname: String,
        qtype: QueryType,
        resolved_by: ResolveSource,
        upstream: String,
    },
    Block {
        client_ip: IpAddr,
        client_name: String,
        qname: String,
        qtype: QueryType,
    },
}

impl QueryLogEntry {
    /// Renders the `key=value` line for this event.
    fn render(&self, ts: &str) -> String {
        match self {
            QueryLogEntry::Pass {
                client_ip,
                client_name,
                qname,
                qtype,
                resolved_by,
                upstream,
            } => {
                let mut line = format!(
                    "ts={} client_ip={} client_name={} qname={} qtype={} resolved_by={}",
                    ts, client_ip, client_name, qname, qtype, resolved_by
                );
                if !upstream.is_empty() {
                    let _ = write!(line, " upstream={}", upstream);
                }
                line
            }
            QueryLogEntry::Block {
                client_ip,
                client_name,
                qname,
                qtype,
            } => format!(
                "ts={} client_ip={} client_name={} qname={} qtype={}",
                ts, client_ip, client_name, qname, qtype
            ),
        }
    }

    fn is_block(&self) -> bool {
        matches!(self, QueryLogEntry::Block { .. })
    }
}

/// Writes query events into two rotating append-only files, one for served
/// queries and one for blocked ones. Runs as a dedicated task fed by an
/// unbounded channel; dropping every sender shuts it down.
pub struct QueryLogger {
    pass: RotatingFile,
    block: RotatingFile,
    log_rx: UnboundedReceiver<QueryLogEntry>,
    enabled: bool,
}

impl QueryLogger {
    pub fn new(log_rx: UnboundedReceiver<QueryLogEntry>, dir: &Path, max_bytes: u64) -> Self {
        let enabled = match std::fs::create_dir_all(dir) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(dir = ?dir, "failed to create the query log dir, query logging disabled: {}", e);
                false
            }
        };

        QueryLogger {
            pass: RotatingFile::new(dir, PASS_LOG_NAME, max_bytes),
            block: RotatingFile::new(dir, BLOCK_LOG_NAME, max_bytes),
            log_rx,
            enabled,
        }
    }

    pub async fn watch_for_logs(mut self) -> anyhow::Result<()> {
        while let Some(entry) = self.log_rx.recv().await {
            if !self.enabled {
                continue;
            }
            let ts = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string();
            let line = entry.render(&ts);
            let result = if entry.is_block() {
                self.block.write_line(&line)
            } else {
                self.pass.write_line(&line)
            };
            if let Err(e) = result {
                tracing::warn!("failed to write a query log line: {:#}", e);
            }
        }

        tracing::debug!("all log senders were dropped, shutting down the query logger");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use tokio::sync::mpsc;

    use super::*;

    fn pass_entry(qname: &str) -> QueryLogEntry {
        QueryLogEntry::Pass {
            client_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
            client_name: "laptop.lan".to_string(),
            qname: qname.to_string(),
            qtype: QueryType::A,
            resolved_by: ResolveSource::Upstream,
            upstream: "1.1.1.1".to_string(),
        }
    }

    #[test]
    fn pass_lines_carry_the_upstream_when_present() {
        let line = pass_entry("example.com").render("2026-01-01T00:00:00");
        assert_eq!(
            line,
            "ts=2026-01-01T00:00:00 client_ip=192.168.1.2 client_name=laptop.lan \
             qname=example.com qtype=A resolved_by=upstream upstream=1.1.1.1"
        );
    }

    #[test]
    fn pass_lines_omit_an_empty_upstream() {
        let entry = QueryLogEntry::Pass {
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_name: "-".to_string(),
            qname: "example.com".to_string(),
            qtype: QueryType::AAAA,
            resolved_by: ResolveSource::Cache,
            upstream: String::new(),
        };
        let line = entry.render("2026-01-01T00:00:00");
        assert!(line.ends_with("resolved_by=cache"));
        assert!(!line.contains("upstream="));
    }

    #[test]
    fn block_lines_have_no_resolution_fields() {
        let entry = QueryLogEntry::Block {
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_name: "-".to_string(),
            qname: "ads.example.com".to_string(),
            qtype: QueryType::A,
        };
        let line = entry.render("2026-01-01T00:00:00");
        assert_eq!(
            line,
            "ts=2026-01-01T00:00:00 client_ip=10.0.0.1 client_name=- qname=ads.example.com qtype=A"
        );
    }

    #[tokio::test]
    async fn events_land_in_their_stream_files() {
        let dir = tempfile::tempdir().expect("shouldn't have failed");
        let (log_tx, log_rx) = mpsc::unbounded_channel();
        let logger = QueryLogger::new(log_rx, dir.path(), 1024 * 1024);

        log_tx.send(pass_entry("example.com")).expect("shouldn't have failed");
        log_tx
            .send(QueryLogEntry::Block {
                client_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)),
                client_name: "-".to_string(),
                qname: "ads.example.com".to_string(),
                qtype: QueryType::A,
            })
            .expect("shouldn't have failed");
        drop(log_tx);

        logger.watch_for_logs().await.expect("shouldn't have failed");

        let pass = std::fs::read_to_string(dir.path().join(PASS_LOG_NAME)).expect("shouldn't have failed");
        assert!(pass.contains("qname=example.com"));
        assert!(pass.contains("resolved_by=upstream"));
        let block = std::fs::read_to_string(dir.path().join(BLOCK_LOG_NAME)).expect("shouldn't have failed");
        assert!(block.contains("qname=ads.example.com"));
        assert!(!block.contains("resolved_by"));
    }
}
