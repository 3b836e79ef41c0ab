use std::fmt;

use anyhow::Context;

use crate::{canonical_name, ByteBuf, EncodeToBuf, FromBuf};

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum QueryType {
    UNKNOWN(u16),
    A,
    CNAME,
    PTR,
    MX,
    TXT,
    AAAA,
}

impl From<u16> for QueryType {
    fn from(value: u16) -> Self {
        match value {
            1 => QueryType::A,
            5 => QueryType::CNAME,
            12 => QueryType::PTR,
            15 => QueryType::MX,
            16 => QueryType::TXT,
            28 => QueryType::AAAA,
            _ => QueryType::UNKNOWN(value),
        }
    }
}

impl From<QueryType> for u16 {
    fn from(val: QueryType) -> Self {
        match val {
            QueryType::A => 1,
            QueryType::CNAME => 5,
            QueryType::PTR => 12,
            QueryType::MX => 15,
            QueryType::TXT => 16,
            QueryType::AAAA => 28,
            QueryType::UNKNOWN(qtype) => qtype,
        }
    }
}

impl QueryType {
    /// Maps a record type name from a configuration file to a serveable
    /// query type. Unknown names are dropped by the caller.
    pub fn from_record_type(name: &str) -> Option<QueryType> {
        match name.to_ascii_lowercase().as_str() {
            "a" => Some(QueryType::A),
            "aaaa" => Some(QueryType::AAAA),
            "cname" => Some(QueryType::CNAME),
            "ptr" => Some(QueryType::PTR),
            "txt" => Some(QueryType::TXT),
            "mx" => Some(QueryType::MX),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::A => write!(f, "A"),
            QueryType::CNAME => write!(f, "CNAME"),
            QueryType::PTR => write!(f, "PTR"),
            QueryType::MX => write!(f, "MX"),
            QueryType::TXT => write!(f, "TXT"),
            QueryType::AAAA => write!(f, "AAAA"),
            QueryType::UNKNOWN(qtype) => write!(f, "{}", qtype),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct DnsQuestion {
    /// Canonical form: lowercase, no trailing dot
    pub qname: String,
    pub query_type: QueryType,
    pub qclass: u16,
    /// Byte span of the encoded question within its source packet
    pub raw_offset: usize,
    pub raw_len: usize,
}

impl DnsQuestion {
    pub fn new(qname: &str, query_type: QueryType, qclass: Option<u16>) -> Self {
        DnsQuestion {
            qname: canonical_name(qname),
            query_type,
            qclass: qclass.unwrap_or(crate::IN_CLASS),
            raw_offset: 0,
            raw_len: 0,
        }
    }
}

impl FromBuf for DnsQuestion {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Self> {
        let raw_offset = buf.position();
        let qname = buf.read_uncompressed_qname().context("QNAME is missing")?;
        let qtype_raw = buf.read_u16().context("QTYPE is missing")?;
        let qclass = buf.read_u16().context("QCLASS is missing")?;
        let raw_len = buf.position() - raw_offset;

        Ok(DnsQuestion {
            qname: canonical_name(&qname),
            query_type: qtype_raw.into(),
            qclass,
            raw_offset,
            raw_len,
        })
    }
}

impl EncodeToBuf for DnsQuestion {
    fn encode_to_buf(&self, buf: &mut ByteBuf) -> anyhow::Result<()> {
        buf.write_qname(&self.qname).context("writing QNAME")?;
        buf.write_u16(self.query_type.into());
        buf.write_u16(self.qclass);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::arb_qname;

    #[test]
    fn question_records_its_raw_span() {
        let mut buf = ByteBuf::new_empty(None);
        let question = DnsQuestion::new("test.com", QueryType::A, None);
        question.encode_to_buf(&mut buf).expect("shouldn't have failed");

        let mut reader = ByteBuf::new(&buf);
        let parsed = DnsQuestion::from_buf(&mut reader).expect("shouldn't have failed");
        assert_eq!(parsed.raw_offset, 0);
        // 1 + 4 ("test") + 1 + 3 ("com") + 1 (zero byte) + 2 (QTYPE) + 2 (QCLASS)
        assert_eq!(parsed.raw_len, 14);
    }

    proptest! {
        #[test]
        fn question_roundtrip(qname in arb_qname(), query_type: QueryType) {
            let question = DnsQuestion::new(&qname, query_type, None);
            let mut buf = ByteBuf::new_empty(None);
            question.encode_to_buf(&mut buf).expect("shouldn't have failed");
            let roundtripped = DnsQuestion::from_buf(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(question.qname, roundtripped.qname);
            // Compare wire values: UNKNOWN(1) decodes as A and so on
            prop_assert_eq!(u16::from(question.query_type), u16::from(roundtripped.query_type));
            prop_assert_eq!(question.qclass, roundtripped.qclass);
        }
    }
}
