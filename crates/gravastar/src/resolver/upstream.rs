use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use cfg_if::cfg_if;
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

/// Per-attempt deadline for upstream I/O: connect, send and receive alike.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_UDP_RESPONSE_SIZE: usize = 4096;
const DNS_PORT: u16 = 53;
const DOT_PORT: u16 = 853;

/// Forwards raw client queries to the configured public resolvers, either
/// in cleartext UDP or over TLS with the RFC 7766 two-byte length framing.
pub struct UpstreamResolver {
    udp_servers: Vec<String>,
    dot_servers: Vec<String>,
    dot_verify: bool,
}

impl UpstreamResolver {
    pub fn new(udp_servers: Vec<String>, dot_servers: Vec<String>, dot_verify: bool) -> Self {
        UpstreamResolver {
            udp_servers,
            dot_servers,
            dot_verify,
        }
    }

    /// The engine entry point: DoT when any DoT server is configured,
    /// cleartext UDP otherwise.
    pub async fn forward(&self, query: &[u8]) -> anyhow::Result<(Vec<u8>, String)> {
        if !self.dot_servers.is_empty() {
            self.resolve_dot(query).await
        } else {
            self.resolve_udp(query).await
        }
    }

    /// Sends the query to the first configured UDP server and waits for a
    /// single response. No retry and no failover to later servers.
    pub async fn resolve_udp(&self, query: &[u8]) -> anyhow::Result<(Vec<u8>, String)> {
        let server = self
            .udp_servers
            .first()
            .context("no upstream UDP servers configured")?;
        let address: Ipv4Addr = server
            .parse()
            .with_context(|| format!("invalid upstream UDP server: {}", server))?;

        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("unable to bind an upstream socket")?;
        socket
            .send_to(query, (address, DNS_PORT))
            .await
            .with_context(|| format!("error while sending the query to {}", server))?;

        let mut buf = vec![0; MAX_UDP_RESPONSE_SIZE];
        let (received, _) = timeout(UPSTREAM_TIMEOUT, socket.recv_from(&mut buf))
            .await
            .with_context(|| format!("upstream {} timed out", server))?
            .with_context(|| format!("error while reading the response from {}", server))?;
        if received == 0 {
            anyhow::bail!("zero-length response from {}", server);
        }
        buf.truncate(received);

        tracing::debug!(server = %server, bytes = received, "upstream response received");
        Ok((buf, server.clone()))
    }

    /// Resolves over TLS against the first configured DoT server.
    pub async fn resolve_dot(&self, query: &[u8]) -> anyhow::Result<(Vec<u8>, String)> {
        let server = self.dot_servers.first().context("no DoT servers configured")?;
        let dot = parse_dot_server(server).with_context(|| format!("invalid DoT server: {}", server))?;
        let used_server = format!("{}@{}:{}", dot.tls_host, dot.connect_host, dot.port);

        if query.len() > u16::MAX as usize {
            anyhow::bail!("query is too large for the DoT length framing");
        }

        let tcp = timeout(
            UPSTREAM_TIMEOUT,
            TcpStream::connect((dot.connect_host.as_str(), dot.port)),
        )
        .await
        .with_context(|| format!("DoT connect to {} timed out", dot.connect_host))?
        .with_context(|| format!("DoT connect to {} failed", dot.connect_host))?;

        let server_name = ServerName::try_from(dot.tls_host.as_str())
            .with_context(|| format!("invalid DoT TLS host: {}", dot.tls_host))?;
        let connector = TlsConnector::from(Arc::new(self.tls_config()));
        let mut stream = timeout(UPSTREAM_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .context("DoT handshake timed out")?
            .context("DoT handshake failed")?;

        let mut framed = Vec::with_capacity(query.len() + 2);
        framed.extend_from_slice(&(query.len() as u16).to_be_bytes());
        framed.extend_from_slice(query);
        timeout(UPSTREAM_TIMEOUT, stream.write_all(&framed))
            .await
            .context("DoT write timed out")?
            .context("DoT write failed")?;

        let mut length = [0u8; 2];
        timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut length))
            .await
            .context("DoT read timed out")?
            .context("DoT read failed")?;
        let response_length = u16::from_be_bytes(length) as usize;
        if response_length == 0 {
            anyhow::bail!("DoT response length is zero");
        }

        let mut response = vec![0; response_length];
        timeout(UPSTREAM_TIMEOUT, stream.read_exact(&mut response))
            .await
            .context("DoT read timed out")?
            .context("DoT read failed")?;

        tracing::debug!(server = %used_server, bytes = response_length, "DoT response received");
        Ok((response, used_server))
    }

    fn tls_config(&self) -> ClientConfig {
        if !self.dot_verify {
            tracing::debug!("DoT TLS verification disabled");
            return insecure_tls_config();
        }
        match load_root_store() {
            Some(store) => ClientConfig::builder()
                .with_safe_defaults()
                .with_root_certificates(store)
                .with_no_client_auth(),
            None => {
                tracing::debug!("no CA trust store found, DoT TLS verification disabled");
                insecure_tls_config()
            }
        }
    }
}

struct DotServer {
    tls_host: String,
    connect_host: String,
    port: u16,
}

/// `tls_host@connect_endpoint` or a bare `connect_endpoint`; the TLS name
/// doubles as the dial target in the bare form. Default port 853.
fn parse_dot_server(input: &str) -> anyhow::Result<DotServer> {
    match input.split_once('@') {
        None => {
            let (host, port) = parse_host_port(input, DOT_PORT)?;
            Ok(DotServer {
                tls_host: host.clone(),
                connect_host: host,
                port,
            })
        }
        Some((tls_host, endpoint)) => {
            if tls_host.is_empty() || endpoint.is_empty() {
                anyhow::bail!("empty side of an '@' separator");
            }
            let (connect_host, port) = parse_host_port(endpoint, DOT_PORT)?;
            Ok(DotServer {
                tls_host: tls_host.to_string(),
                connect_host,
                port,
            })
        }
    }
}

/// Splits `host[:port]`, `[ipv6]` and `[ipv6]:port` forms.
pub fn parse_host_port(input: &str, default_port: u16) -> anyhow::Result<(String, u16)> {
    if input.is_empty() {
        anyhow::bail!("empty host");
    }

    if let Some(rest) = input.strip_prefix('[') {
        let (host, after) = rest.split_once(']').context("unmatched '[' in host")?;
        if host.is_empty() {
            anyhow::bail!("empty host");
        }
        if after.is_empty() {
            return Ok((host.to_string(), default_port));
        }
        let port = after
            .strip_prefix(':')
            .context("unexpected characters after the ']'")?;
        return Ok((host.to_string(), parse_port(port)?));
    }

    match input.split_once(':') {
        None => Ok((input.to_string(), default_port)),
        Some((host, port)) => {
            if port.contains(':') {
                anyhow::bail!("ambiguous ':' in host, bracket IPv6 addresses: {}", input);
            }
            if host.is_empty() {
                anyhow::bail!("empty host");
            }
            Ok((host.to_string(), parse_port(port)?))
        }
    }
}

fn parse_port(port: &str) -> anyhow::Result<u16> {
    if port.is_empty() {
        anyhow::bail!("empty port");
    }
    let port: u16 = port.parse().with_context(|| format!("invalid port: {}", port))?;
    if port == 0 {
        anyhow::bail!("port out of range");
    }
    Ok(port)
}

fn insecure_tls_config() -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth()
}

/// Probes the platform trust store locations in a fixed order; the first
/// one that yields any certificate wins.
fn load_root_store() -> Option<RootCertStore> {
    if let Some(store) = platform_root_store() {
        return Some(store);
    }

    let certs_dir = Path::new("/etc/ssl/certs");
    if certs_dir.is_dir() {
        if let Some(store) = root_store_from_dir(certs_dir) {
            return Some(store);
        }
    }
    for path in ["/etc/ssl/cert.pem", "/etc/ssl/certs/ca-certificates.crt"] {
        if let Some(store) = root_store_from_file(Path::new(path)) {
            return Some(store);
        }
    }
    None
}

cfg_if! {
    if #[cfg(target_os = "macos")] {
        fn platform_root_store() -> Option<RootCertStore> {
            for path in ["/opt/homebrew/etc/ssl/cert.pem", "/usr/local/etc/ssl/cert.pem"] {
                if let Some(store) = root_store_from_file(Path::new(path)) {
                    return Some(store);
                }
            }
            None
        }
    } else {
        fn platform_root_store() -> Option<RootCertStore> {
            None
        }
    }
}

fn root_store_from_file(path: &Path) -> Option<RootCertStore> {
    let file = File::open(path).ok()?;
    let mut store = RootCertStore::empty();
    add_pem_certs(&mut store, &mut BufReader::new(file));
    (!store.is_empty()).then_some(store)
}

fn root_store_from_dir(dir: &Path) -> Option<RootCertStore> {
    let entries = std::fs::read_dir(dir).ok()?;
    let mut store = RootCertStore::empty();
    for entry in entries.flatten() {
        let Ok(file) = File::open(entry.path()) else {
            continue;
        };
        add_pem_certs(&mut store, &mut BufReader::new(file));
    }
    (!store.is_empty()).then_some(store)
}

fn add_pem_certs(store: &mut RootCertStore, reader: &mut dyn std::io::BufRead) {
    let Ok(ders) = rustls_pemfile::certs(reader) else {
        return;
    };
    for der in ders {
        // Individual unparseable certificates are skipped
        let _ = store.add(&Certificate(der));
    }
}

struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
