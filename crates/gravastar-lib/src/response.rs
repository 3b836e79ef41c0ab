use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Context;

use crate::header::{FLAG_RECURSION_AVAILABLE, FLAG_RECURSION_DESIRED, FLAG_RESPONSE};
use crate::{ByteBuf, DnsHeader, DnsQuestion, EncodeToBuf, QueryType, IN_CLASS};

/// Locally synthesized answers are short-lived on purpose: the authoritative
/// data lives in config files that can change at any time.
const ANSWER_TTL: u32 = 60;

fn response_flags(query_header: &DnsHeader) -> u16 {
    FLAG_RESPONSE | (query_header.flags & FLAG_RECURSION_DESIRED) | FLAG_RECURSION_AVAILABLE
}

fn begin_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    ancount: u16,
) -> anyhow::Result<ByteBuf<'static>> {
    let header = DnsHeader {
        id: query_header.id,
        flags: response_flags(query_header),
        qdcount: 1,
        ancount,
        nscount: 0,
        arcount: 0,
    };

    let mut buf = ByteBuf::new_empty(None);
    header.encode_to_buf(&mut buf).context("writing header")?;
    question.encode_to_buf(&mut buf).context("writing question")?;

    Ok(buf)
}

fn append_answer(
    buf: &mut ByteBuf,
    question: &DnsQuestion,
    rtype: QueryType,
    rdata: &[u8],
) -> anyhow::Result<()> {
    buf.write_qname(&question.qname).context("writing answer NAME")?;
    buf.write_u16(rtype.into());
    buf.write_u16(IN_CLASS);
    buf.write_u32(ANSWER_TTL);
    buf.write_u16(rdata.len() as u16);
    buf.write_bytes(rdata);

    Ok(())
}

/// A response carrying the question back with no answers.
pub fn build_empty_response(query_header: &DnsHeader, question: &DnsQuestion) -> anyhow::Result<Vec<u8>> {
    begin_response(query_header, question, 0).map(ByteBuf::into_inner)
}

/// A single A answer. An unparseable address serializes as `0.0.0.0` rather
/// than failing: blocklist and config paths both rely on this.
pub fn build_a_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    address: &str,
) -> anyhow::Result<Vec<u8>> {
    let address: Ipv4Addr = address.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
    let mut buf = begin_response(query_header, question, 1)?;
    append_answer(&mut buf, question, QueryType::A, &address.octets()).context("writing A answer")?;
    Ok(buf.into_inner())
}

/// A single AAAA answer, with the same all-zeroes fallback as [`build_a_response`].
pub fn build_aaaa_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    address: &str,
) -> anyhow::Result<Vec<u8>> {
    let address: Ipv6Addr = address.parse().unwrap_or(Ipv6Addr::UNSPECIFIED);
    let mut buf = begin_response(query_header, question, 1)?;
    append_answer(&mut buf, question, QueryType::AAAA, &address.octets()).context("writing AAAA answer")?;
    Ok(buf.into_inner())
}

pub fn build_cname_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    target: &str,
) -> anyhow::Result<Vec<u8>> {
    build_name_response(query_header, question, QueryType::CNAME, target)
}

pub fn build_ptr_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    target: &str,
) -> anyhow::Result<Vec<u8>> {
    build_name_response(query_header, question, QueryType::PTR, target)
}

fn build_name_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    rtype: QueryType,
    target: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut rdata = ByteBuf::new_empty(Some(target.len() + 2));
    rdata
        .write_qname(target)
        .with_context(|| format!("writing {} RDATA", rtype))?;

    let mut buf = begin_response(query_header, question, 1)?;
    append_answer(&mut buf, question, rtype, &rdata).with_context(|| format!("writing {} answer", rtype))?;
    Ok(buf.into_inner())
}

/// A single TXT answer. RDATA is a sequence of length-prefixed character
/// strings, each at most 255 bytes.
pub fn build_txt_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    text: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut rdata = Vec::with_capacity(text.len() + 1);
    if text.is_empty() {
        rdata.push(0);
    }
    for chunk in text.as_bytes().chunks(255) {
        rdata.push(chunk.len() as u8);
        rdata.extend_from_slice(chunk);
    }

    let mut buf = begin_response(query_header, question, 1)?;
    append_answer(&mut buf, question, QueryType::TXT, &rdata).context("writing TXT answer")?;
    Ok(buf.into_inner())
}

/// A single MX answer: a 16-bit preference followed by the exchange name.
pub fn build_mx_response(
    query_header: &DnsHeader,
    question: &DnsQuestion,
    preference: u16,
    exchange: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut rdata = ByteBuf::new_empty(Some(exchange.len() + 4));
    rdata.write_u16(preference);
    rdata.write_qname(exchange).context("writing MX RDATA")?;

    let mut buf = begin_response(query_header, question, 1)?;
    append_answer(&mut buf, question, QueryType::MX, &rdata).context("writing MX answer")?;
    Ok(buf.into_inner())
}

/// Overwrites the transaction ID in place. Cached responses carry the ID of
/// the query that originally filled the cache, so it has to be patched to
/// the current client's ID before sending.
pub fn patch_response_id(packet: &mut [u8], id: u16) {
    if packet.len() < 2 {
        return;
    }
    packet[..2].copy_from_slice(&id.to_be_bytes());
}
