#[cfg(test)]
pub(crate) mod test_utils;

mod buf;
mod header;
mod question;
mod response;
mod scan;

use anyhow::Context;
pub use buf::{ByteBuf, EncodeToBuf, FromBuf};
pub use header::{DnsHeader, FLAG_RECURSION_AVAILABLE, FLAG_RECURSION_DESIRED, FLAG_RESPONSE};
pub use question::{DnsQuestion, QueryType};
pub use response::{
    build_a_response, build_aaaa_response, build_cname_response, build_empty_response, build_mx_response,
    build_ptr_response, build_txt_response, patch_response_id,
};
pub use scan::{extract_first_ptr_target, rewrite_private_a_records};

pub const IN_CLASS: u16 = 1;

const HEADER_LEN: usize = 12;

/// Lowercases a name and strips a single trailing dot. This is the universal
/// key form used by the blocklist, local records and cache.
pub fn canonical_name(name: &str) -> String {
    let mut canonical = name.to_ascii_lowercase();
    if canonical.ends_with('.') {
        canonical.pop();
    }
    canonical
}

/// Parses the header and the first question of a client query.
pub fn parse_query(packet: &[u8]) -> anyhow::Result<(DnsHeader, DnsQuestion)> {
    if packet.len() < HEADER_LEN {
        anyhow::bail!("packet is shorter than the DNS header");
    }

    let mut buf = ByteBuf::new(&packet);
    let header = DnsHeader::from_buf(&mut buf).context("header parsing error")?;
    if header.qdcount == 0 {
        anyhow::bail!("query contains no questions");
    }
    let question = DnsQuestion::from_buf(&mut buf).context("question parsing error")?;

    Ok((header, question))
}
