mod upstream;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use gravastar_lib::{
    build_a_response, build_aaaa_response, build_cname_response, build_empty_response, extract_first_ptr_target,
    parse_query, ByteBuf, DnsHeader, DnsQuestion, EncodeToBuf as _, QueryType, FLAG_RECURSION_DESIRED,
};
pub use upstream::{parse_host_port, UpstreamResolver};

use crate::cache::cache_key;
use crate::State;

/// Which layer of the pipeline produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSource {
    Blocklist,
    Local,
    Cache,
    Upstream,
    None,
}

impl fmt::Display for ResolveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveSource::Blocklist => write!(f, "blocklist"),
            ResolveSource::Local => write!(f, "local"),
            ResolveSource::Cache => write!(f, "cache"),
            ResolveSource::Upstream => write!(f, "upstream"),
            ResolveSource::None => write!(f, "none"),
        }
    }
}

pub struct ResolveResult {
    /// Wire-ready response. Empty means there is nothing to send.
    pub response: Vec<u8>,
    pub source: ResolveSource,
    /// The upstream server that answered, when one was used
    pub upstream: String,
}

impl ResolveResult {
    fn without_upstream(response: Vec<u8>, source: ResolveSource) -> Self {
        ResolveResult {
            response,
            source,
            upstream: String::new(),
        }
    }
}

/// The resolution decision engine: blocklist, then local records, then the
/// cache, then an upstream.
pub struct Resolver {
    state: Arc<State>,
}

impl Resolver {
    pub fn new(state: Arc<State>) -> Self {
        Resolver { state }
    }

    pub async fn resolve_query(
        &self,
        packet: &[u8],
        header: &DnsHeader,
        question: &DnsQuestion,
    ) -> anyhow::Result<ResolveResult> {
        if self.state.blocklist.read().await.is_blocked(&question.qname) {
            tracing::debug!(qname = %question.qname, qtype = %question.query_type, "found entry in the blocklist");
            let response = match question.query_type {
                QueryType::A => build_a_response(header, question, "0.0.0.0")?,
                QueryType::AAAA => build_aaaa_response(header, question, "::1")?,
                _ => build_empty_response(header, question)?,
            };
            return Ok(ResolveResult::without_upstream(response, ResolveSource::Blocklist));
        }

        if let Some(record) = self.state.local_records.resolve(&question.qname, question.query_type.into()) {
            tracing::debug!(qname = %question.qname, qtype = %question.query_type, "found a local record");
            let response = match record.rtype {
                QueryType::A => Some(build_a_response(header, question, &record.value)?),
                QueryType::AAAA => Some(build_aaaa_response(header, question, &record.value)?),
                QueryType::CNAME => Some(build_cname_response(header, question, &record.value)?),
                // PTR/TXT/MX records load but are not served
                _ => None,
            };
            return Ok(match response {
                Some(response) => ResolveResult::without_upstream(response, ResolveSource::Local),
                None => ResolveResult::without_upstream(Vec::new(), ResolveSource::None),
            });
        }

        let key = cache_key(&question.qname, question.query_type.into());
        if let Some(response) = self.state.cache.lock().await.get(&key) {
            tracing::debug!(qname = %question.qname, qtype = %question.query_type, "cache hit");
            return Ok(ResolveResult::without_upstream(response, ResolveSource::Cache));
        }

        match self.state.upstream.forward(packet).await {
            Ok((response, upstream)) => {
                self.state.cache.lock().await.put(&key, &response);
                Ok(ResolveResult {
                    response,
                    source: ResolveSource::Upstream,
                    upstream,
                })
            }
            Err(e) => {
                tracing::debug!(qname = %question.qname, "upstream resolution failed: {:#}", e);
                Ok(ResolveResult {
                    response: build_empty_response(header, question)?,
                    source: ResolveSource::Upstream,
                    upstream: String::new(),
                })
            }
        }
    }

    /// Best-effort reverse lookup of the client address for log lines.
    /// Runs through the normal resolution path, so the PTR answer lands in
    /// the cache like any other response. Failures collapse to `"-"`.
    pub async fn resolve_client_name(&self, client_ip: IpAddr) -> String {
        let IpAddr::V4(address) = client_ip else {
            return "-".to_string();
        };
        let octets = address.octets();
        let qname = format!(
            "{}.{}.{}.{}.in-addr.arpa",
            octets[3], octets[2], octets[1], octets[0]
        );
        match self.reverse_lookup(&qname).await {
            Ok(name) if !name.is_empty() => name,
            _ => "-".to_string(),
        }
    }

    async fn reverse_lookup(&self, qname: &str) -> anyhow::Result<String> {
        let query = build_ptr_query(qname)?;
        let (header, question) = parse_query(&query)?;
        let result = self.resolve_query(&query, &header, &question).await?;
        if result.response.is_empty() {
            anyhow::bail!("no response for the reverse lookup");
        }
        extract_first_ptr_target(&result.response)
    }
}

fn build_ptr_query(qname: &str) -> anyhow::Result<Vec<u8>> {
    let mut buf = ByteBuf::new_empty(None);
    DnsHeader {
        flags: FLAG_RECURSION_DESIRED,
        qdcount: 1,
        ..Default::default()
    }
    .encode_to_buf(&mut buf)?;
    DnsQuestion::new(qname, QueryType::PTR, None).encode_to_buf(&mut buf)?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use gravastar_lib::{patch_response_id, EncodeToBuf as _, FromBuf as _};

    use super::*;
    use crate::blocklist::Blocklist;
    use crate::cache::DnsCache;
    use crate::config::RawLocalRecord;
    use crate::local_records::LocalRecords;

    fn stub_state(blocked: &[&str], records: &[RawLocalRecord]) -> Arc<State> {
        let mut blocklist = Blocklist::new();
        blocklist.set_domains(blocked.iter().map(|domain| domain.to_string()).collect::<HashSet<_>>());
        let mut local_records = LocalRecords::new();
        local_records.load(records);
        // No configured upstreams: the forward step always fails
        let upstream = UpstreamResolver::new(Vec::new(), Vec::new(), true);
        let cache = DnsCache::new(1024 * 1024, Duration::from_secs(60));
        Arc::new(State::new(blocklist, local_records, cache, upstream))
    }

    fn encode_query(qname: &str, query_type: QueryType) -> Vec<u8> {
        let mut buf = ByteBuf::new_empty(None);
        DnsHeader {
            id: 0x4242,
            flags: FLAG_RECURSION_DESIRED,
            qdcount: 1,
            ..Default::default()
        }
        .encode_to_buf(&mut buf)
        .expect("shouldn't have failed");
        DnsQuestion::new(qname, query_type, None)
            .encode_to_buf(&mut buf)
            .expect("shouldn't have failed");
        buf.into_inner()
    }

    async fn resolve(resolver: &Resolver, qname: &str, query_type: QueryType) -> ResolveResult {
        let query = encode_query(qname, query_type);
        let (header, question) = parse_query(&query).expect("shouldn't have failed");
        resolver
            .resolve_query(&query, &header, &question)
            .await
            .expect("shouldn't have failed")
    }

    fn parse_response(response: &[u8]) -> DnsHeader {
        let mut buf = ByteBuf::new(&response);
        DnsHeader::from_buf(&mut buf).expect("shouldn't have failed")
    }

    #[tokio::test]
    async fn blocked_a_query_gets_a_null_address() {
        let resolver = Resolver::new(stub_state(&["ads.example.com"], &[]));
        let result = resolve(&resolver, "ads.example.com", QueryType::A).await;
        assert_eq!(result.source, ResolveSource::Blocklist);
        let header = parse_response(&result.response);
        assert_eq!(header.ancount, 1);
        assert_eq!(&result.response[result.response.len() - 4..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn blocked_txt_query_gets_an_empty_response() {
        let resolver = Resolver::new(stub_state(&["ads.example.com"], &[]));
        let result = resolve(&resolver, "ads.example.com", QueryType::TXT).await;
        assert_eq!(result.source, ResolveSource::Blocklist);
        assert_eq!(parse_response(&result.response).ancount, 0);
    }

    #[tokio::test]
    async fn local_records_answer_before_the_upstream() {
        let records = [RawLocalRecord {
            name: "printer.lan".to_string(),
            record_type: "A".to_string(),
            value: "192.168.1.9".to_string(),
        }];
        let resolver = Resolver::new(stub_state(&[], &records));
        let result = resolve(&resolver, "printer.lan", QueryType::A).await;
        assert_eq!(result.source, ResolveSource::Local);
        assert_eq!(&result.response[result.response.len() - 4..], &[192, 168, 1, 9]);
    }

    #[tokio::test]
    async fn unservable_local_record_types_yield_nothing() {
        let records = [RawLocalRecord {
            name: "printer.lan".to_string(),
            record_type: "TXT".to_string(),
            value: "in the closet".to_string(),
        }];
        let resolver = Resolver::new(stub_state(&[], &records));
        let result = resolve(&resolver, "printer.lan", QueryType::TXT).await;
        assert_eq!(result.source, ResolveSource::None);
        assert!(result.response.is_empty());
    }

    #[tokio::test]
    async fn cached_responses_are_returned_with_their_original_id() {
        let state = stub_state(&[], &[]);
        let stored = {
            let query = encode_query("example.com", QueryType::A);
            let (header, question) = parse_query(&query).expect("shouldn't have failed");
            let mut response =
                build_a_response(&header, &question, "93.184.216.34").expect("shouldn't have failed");
            // Cached under the ID of the client that filled the cache
            patch_response_id(&mut response, 0x1111);
            response
        };
        state
            .cache
            .lock()
            .await
            .put(&cache_key("example.com", QueryType::A.into()), &stored);

        let resolver = Resolver::new(state);
        let result = resolve(&resolver, "example.com", QueryType::A).await;
        assert_eq!(result.source, ResolveSource::Cache);
        // The engine returns the stored bytes untouched: patching the ID is
        // the caller's job
        assert_eq!(&result.response[..2], &[0x11, 0x11]);
    }

    #[tokio::test]
    async fn upstream_failure_degrades_to_an_empty_answer() {
        let resolver = Resolver::new(stub_state(&[], &[]));
        let result = resolve(&resolver, "example.com", QueryType::A).await;
        assert_eq!(result.source, ResolveSource::Upstream);
        assert!(result.upstream.is_empty());
        let header = parse_response(&result.response);
        assert_eq!(header.ancount, 0);
        assert_eq!(header.id, 0x4242);
    }

    #[tokio::test]
    async fn client_names_fall_back_to_a_dash() {
        let resolver = Resolver::new(stub_state(&[], &[]));
        let name = resolver
            .resolve_client_name("192.168.1.2".parse().expect("shouldn't have failed"))
            .await;
        assert_eq!(name, "-");
        let name = resolver
            .resolve_client_name("2001:db8::1".parse().expect("shouldn't have failed"))
            .await;
        assert_eq!(name, "-");
    }
}
