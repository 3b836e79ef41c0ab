use anyhow::Context;

use crate::{canonical_name, ByteBuf, DnsHeader, FromBuf, QueryType};

fn is_private_ipv4(octets: &[u8]) -> bool {
    match octets {
        [10, ..] => true,
        [192, 168, ..] => true,
        [172, second, ..] => (16..=31).contains(second),
        _ => false,
    }
}

/// Skips the question section, leaving the cursor at the first RR.
fn skip_questions(buf: &mut ByteBuf, qdcount: u16) -> anyhow::Result<()> {
    for idx in 0..qdcount {
        buf.read_qname()
            .with_context(|| format!("question name at idx {}", idx))?;
        buf.read_u16().context("QTYPE is missing")?;
        buf.read_u16().context("QCLASS is missing")?;
    }
    Ok(())
}

/// Zeroes the RDATA of every A record whose address falls in the RFC 1918
/// ranges, across the answer, authority and additional sections. Returns
/// whether anything was rewritten. Any malformed record is a hard error:
/// the caller is expected to discard the packet in that case.
pub fn rewrite_private_a_records(packet: &mut [u8]) -> anyhow::Result<bool> {
    let rewrite_offsets = {
        let snapshot: &[u8] = packet;
        let mut buf = ByteBuf::new(&snapshot);
        let header = DnsHeader::from_buf(&mut buf).context("header parsing error")?;
        skip_questions(&mut buf, header.qdcount).context("question section walking error")?;

        let rr_count = header.ancount as usize + header.nscount as usize + header.arcount as usize;
        let mut offsets = Vec::new();
        for idx in 0..rr_count {
            buf.read_qname()
                .with_context(|| format!("RR name at idx {}", idx))?;
            let rtype = buf.read_u16().context("RR TYPE is missing")?;
            buf.read_u16().context("RR CLASS is missing")?;
            buf.read_u32().context("RR TTL is missing")?;
            let rdlength = buf.read_u16().context("RDLENGTH is missing")? as usize;
            let rdata_offset = buf.position();
            let rdata = buf
                .read_bytes(rdlength)
                .with_context(|| format!("RDATA of length {} is missing at idx {}", rdlength, idx))?;
            if QueryType::from(rtype) == QueryType::A && rdlength == 4 && is_private_ipv4(rdata) {
                offsets.push(rdata_offset);
            }
        }
        offsets
    };

    for offset in &rewrite_offsets {
        packet[*offset..*offset + 4].fill(0);
    }

    Ok(!rewrite_offsets.is_empty())
}

/// Returns the decoded RDATA of the first PTR record in the answer section.
pub fn extract_first_ptr_target(packet: &[u8]) -> anyhow::Result<String> {
    let mut buf = ByteBuf::new(&packet);
    let header = DnsHeader::from_buf(&mut buf).context("header parsing error")?;
    skip_questions(&mut buf, header.qdcount).context("question section walking error")?;

    for idx in 0..header.ancount {
        buf.read_qname()
            .with_context(|| format!("answer RR name at idx {}", idx))?;
        let rtype = buf.read_u16().context("RR TYPE is missing")?;
        buf.read_u16().context("RR CLASS is missing")?;
        buf.read_u32().context("RR TTL is missing")?;
        let rdlength = buf.read_u16().context("RDLENGTH is missing")? as usize;
        if QueryType::from(rtype) == QueryType::PTR {
            let target = buf.read_qname().context("PTR RDATA is missing")?;
            return Ok(canonical_name(&target));
        }
        buf.read_bytes(rdlength)
            .with_context(|| format!("RDATA of length {} is missing at idx {}", rdlength, idx))?;
    }

    anyhow::bail!("no PTR record in the answer section")
}
