use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::watch;

use crate::config::{self, BlocklistFile, UpstreamBlocklistConfig};
use crate::State;

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Periodically rebuilds the blocklist from remote subscription sources,
/// merges in the operator's own list, republishes the blocklist file and
/// hot-swaps the in-memory set.
pub struct UpstreamBlocklistUpdater {
    config: UpstreamBlocklistConfig,
    custom_blocklist_path: PathBuf,
    output_path: PathBuf,
    state: Arc<State>,
    http: reqwest::Client,
}

impl UpstreamBlocklistUpdater {
    pub fn new(
        config: UpstreamBlocklistConfig,
        custom_blocklist_path: PathBuf,
        output_path: PathBuf,
        state: Arc<State>,
    ) -> anyhow::Result<Self> {
        // Redirects are followed by default
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build the HTTP client")?;

        Ok(UpstreamBlocklistUpdater {
            config,
            custom_blocklist_path,
            output_path,
            state,
            http,
        })
    }

    /// Runs an immediate update, then one per interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("upstream blocklist initial update");
        if let Err(e) = self.update_once().await {
            tracing::error!("upstream blocklist update failed: {:#}", e);
        }

        let interval = Duration::from_secs(self.config.update_interval_sec.max(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    tracing::info!("upstream blocklist updater stopped");
                    return;
                }
            }
            tracing::info!("upstream blocklist periodic update");
            if let Err(e) = self.update_once().await {
                tracing::error!("upstream blocklist update failed: {:#}", e);
            }
        }
    }

    /// One full update cycle. Any failure leaves the previously published
    /// blocklist in effect.
    pub async fn update_once(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.config.cache_dir)
            .await
            .with_context(|| format!("unable to create cache dir: {}", self.config.cache_dir.display()))?;

        let mut domains = self.build_from_sources().await?;

        let custom = config::load_blocklist(&self.custom_blocklist_path).context("custom blocklist load failed")?;
        domains.extend(custom);

        self.publish(&domains)
            .await
            .context("failed to write the blocklist file")?;

        let count = domains.len();
        self.state
            .blocklist
            .write()
            .await
            .set_domains(domains.into_iter().collect());
        tracing::info!(domains = count, "upstream blocklist updated");

        Ok(())
    }

    /// Fetches every subscription URL in order, falling back to the on-disk
    /// copy when a fetch fails. A URL with neither aborts the whole update.
    async fn build_from_sources(&self) -> anyhow::Result<BTreeSet<String>> {
        if self.config.urls.is_empty() {
            anyhow::bail!("no upstream urls configured");
        }

        let mut domains = BTreeSet::new();
        for url in &self.config.urls {
            let cache_path = cache_path_for_url(&self.config.cache_dir, url);
            let content = match self.fetch(url).await {
                Ok(content) => {
                    write_atomically(&cache_path, content.as_bytes())
                        .await
                        .with_context(|| format!("failed to cache {}", url))?;
                    tracing::info!(url = %url, "upstream blocklist fetched");
                    content
                }
                Err(fetch_error) => match tokio::fs::read_to_string(&cache_path).await {
                    Ok(content) => {
                        tracing::warn!(url = %url, "upstream fetch failed, using cached copy: {:#}", fetch_error);
                        content
                    }
                    Err(_) => {
                        return Err(fetch_error.context(format!("failed to fetch {} and no cached copy exists", url)))
                    }
                },
            };
            parse_blocklist_content(&content, &mut domains);
        }

        Ok(domains)
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        let response = self.http.get(url).send().await.context("request failed")?;
        let response = response.error_for_status().context("unexpected status")?;
        response.text().await.context("failed to read the response body")
    }

    async fn publish(&self, domains: &BTreeSet<String>) -> anyhow::Result<()> {
        let file = BlocklistFile {
            domains: domains.iter().cloned().collect(),
        };
        let body = toml::to_string(&file).context("failed to serialize the blocklist")?;
        write_atomically(&self.output_path, body.as_bytes()).await
    }
}

/// `<cache_dir>/upstream_<djb2(url)>.txt`
pub fn cache_path_for_url(cache_dir: &Path, url: &str) -> PathBuf {
    cache_dir.join(format!("upstream_{}.txt", djb2(url)))
}

fn djb2(input: &str) -> u64 {
    input
        .bytes()
        .fold(5381u64, |hash, byte| hash.wrapping_mul(33).wrapping_add(byte as u64))
}

async fn write_atomically(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, data)
        .await
        .with_context(|| format!("unable to write file: {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename failed for {}", path.display()))?;
    Ok(())
}

/// Parses one fetched source. Lines come in three shapes: hosts-file
/// entries (leading IP token), adblock `||domain^` filters, and plain
/// domain lists. Everything else is skipped.
pub fn parse_blocklist_content(content: &str, domains: &mut BTreeSet<String>) {
    for line in content.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let trimmed = line.trim();
        if is_skippable_line(trimmed) {
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("||") {
            let Some(caret) = rest.find('^') else {
                continue;
            };
            if let Some(domain) = normalize_domain(&rest[..caret]) {
                domains.insert(domain);
            }
            continue;
        }

        let mut tokens = trimmed.split_whitespace().peekable();
        if tokens.peek().is_some_and(|token| looks_like_ip(token)) {
            tokens.next();
        }
        for token in tokens {
            if token.starts_with('#') {
                break;
            }
            if let Some(domain) = normalize_domain(token) {
                domains.insert(domain);
            }
        }
    }
}

fn is_skippable_line(line: &str) -> bool {
    if line.is_empty() {
        return true;
    }
    if line.starts_with('!') || line.starts_with('[') || line.starts_with('#') {
        return true;
    }
    // Adblock cosmetic filters
    ["##", "#@#", "#?#", "#$#"]
        .iter()
        .any(|marker| line.contains(marker))
}

fn looks_like_ip(token: &str) -> bool {
    if token.contains(':') {
        return true;
    }
    let mut has_dot = false;
    for c in token.chars() {
        if c == '.' {
            has_dot = true;
        } else if !c.is_ascii_digit() {
            return false;
        }
    }
    has_dot
}

/// Lowercases and validates a candidate domain: at least two labels, each
/// made of `[a-z0-9-]` and not edge-hyphenated.
fn normalize_domain(raw: &str) -> Option<String> {
    let mut name = raw.to_ascii_lowercase();
    if name.ends_with('.') {
        name.pop();
    }
    if name.is_empty() || name.contains('/') || name.contains('*') {
        return None;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return None;
    }
    for label in labels {
        if label.is_empty() || label.starts_with('-') || label.ends_with('-') {
            return None;
        }
        if !label.bytes().all(|byte| byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-') {
            return None;
        }
    }

    Some(name)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::blocklist::Blocklist;
    use crate::cache::DnsCache;
    use crate::local_records::LocalRecords;
    use crate::resolver::UpstreamResolver;

    fn parse(content: &str) -> BTreeSet<String> {
        let mut domains = BTreeSet::new();
        parse_blocklist_content(content, &mut domains);
        domains
    }

    #[test]
    fn hosts_file_lines_skip_the_ip_and_single_label_names() {
        let domains = parse("127.0.0.1 localhost\n0.0.0.0 ads.example.com tracker.example.org\n");
        assert!(!domains.contains("localhost"));
        assert!(domains.contains("ads.example.com"));
        assert!(domains.contains("tracker.example.org"));
    }

    #[test]
    fn adblock_filters_extract_the_domain() {
        let domains = parse("||abp.example.org^\n||bad.example.org/path^\n||no-caret.example.org\n");
        assert_eq!(domains.len(), 1);
        assert!(domains.contains("abp.example.org"));
    }

    #[test]
    fn comments_and_cosmetic_filters_are_skipped() {
        let domains = parse(
            "! adblock comment\n\
             [Adblock Plus 2.0]\n\
             # hosts comment\n\
             example.com##.banner\n\
             plain.example.com # trailing comment\n\
             other.example.com #tag more.example.com\n",
        );
        assert_eq!(domains.len(), 2);
        assert!(domains.contains("plain.example.com"));
        assert!(domains.contains("other.example.com"));
    }

    #[test]
    fn carriage_returns_are_stripped() {
        let domains = parse("crlf.example.com\r\n");
        assert!(domains.contains("crlf.example.com"));
    }

    #[test]
    fn domain_validation_rejects_bad_labels() {
        assert_eq!(normalize_domain("Example.COM."), Some("example.com".to_string()));
        assert_eq!(normalize_domain("sub.example.com"), Some("sub.example.com".to_string()));
        assert_eq!(normalize_domain("localhost"), None);
        assert_eq!(normalize_domain("bad.example.org/path"), None);
        assert_eq!(normalize_domain("*.example.org"), None);
        assert_eq!(normalize_domain("-bad.example.org"), None);
        assert_eq!(normalize_domain("bad-.example.org"), None);
        assert_eq!(normalize_domain("under_score.example.org"), None);
        assert_eq!(normalize_domain(""), None);
    }

    #[test]
    fn djb2_matches_the_published_cache_names() {
        assert_eq!(djb2(""), 5381);
        assert_eq!(djb2("a"), 5381 * 33 + 97);
        assert_eq!(
            cache_path_for_url(Path::new("/var/gravastar"), "a"),
            PathBuf::from(format!("/var/gravastar/upstream_{}.txt", 5381u64 * 33 + 97))
        );
    }

    fn stub_updater(urls: Vec<String>, cache_dir: &Path, blocklist_path: &Path) -> UpstreamBlocklistUpdater {
        let state = Arc::new(State::new(
            Blocklist::new(),
            LocalRecords::new(),
            DnsCache::new(1024, Duration::from_secs(60)),
            UpstreamResolver::new(Vec::new(), Vec::new(), true),
        ));
        UpstreamBlocklistUpdater::new(
            UpstreamBlocklistConfig {
                update_interval_sec: 3600,
                urls,
                cache_dir: cache_dir.to_path_buf(),
            },
            blocklist_path.to_path_buf(),
            blocklist_path.to_path_buf(),
            state,
        )
        .expect("shouldn't have failed")
    }

    // Port 9 is the discard service; connections are refused immediately in
    // any sane test environment
    const UNREACHABLE_URL: &str = "http://127.0.0.1:9/hosts.txt";

    #[tokio::test]
    async fn fetch_failure_falls_back_to_the_cached_copy() {
        let dir = tempfile::tempdir().expect("shouldn't have failed");
        let blocklist_path = dir.path().join("blocklist.toml");
        std::fs::write(&blocklist_path, "domains = [\"custom.example.com\"]\n").expect("shouldn't have failed");

        let updater = stub_updater(vec![UNREACHABLE_URL.to_string()], dir.path(), &blocklist_path);
        let cache_path = cache_path_for_url(dir.path(), UNREACHABLE_URL);
        std::fs::write(&cache_path, "cached.example.com\n").expect("shouldn't have failed");

        updater.update_once().await.expect("shouldn't have failed");

        let blocklist = updater.state.blocklist.read().await;
        assert!(blocklist.is_blocked("cached.example.com"));
        assert!(blocklist.is_blocked("custom.example.com"));
        drop(blocklist);

        let published: HashSet<String> = config::load_blocklist(&blocklist_path).expect("shouldn't have failed");
        assert!(published.contains("cached.example.com"));
        assert!(published.contains("custom.example.com"));
    }

    #[tokio::test]
    async fn fetch_failure_without_a_cache_aborts_the_update() {
        let dir = tempfile::tempdir().expect("shouldn't have failed");
        let blocklist_path = dir.path().join("blocklist.toml");
        std::fs::write(&blocklist_path, "domains = []\n").expect("shouldn't have failed");

        let updater = stub_updater(vec![UNREACHABLE_URL.to_string()], dir.path(), &blocklist_path);
        let error = updater.update_once().await.expect_err("should have failed");
        assert!(error.to_string().contains("no cached copy"));
    }

    #[tokio::test]
    async fn update_requires_configured_urls() {
        let dir = tempfile::tempdir().expect("shouldn't have failed");
        let blocklist_path = dir.path().join("blocklist.toml");
        let updater = stub_updater(Vec::new(), dir.path(), &blocklist_path);
        let error = updater.update_once().await.expect_err("should have failed");
        assert!(error.to_string().contains("no upstream urls configured"));
    }
}
