use anyhow::Context;

use crate::{ByteBuf, EncodeToBuf, FromBuf};

/// QR bit: the packet is a response
pub const FLAG_RESPONSE: u16 = 0x8000;
/// RD bit: recursion desired, echoed from the query
pub const FLAG_RECURSION_DESIRED: u16 = 0x0100;
/// RA bit: recursion available
pub const FLAG_RECURSION_AVAILABLE: u16 = 0x0080;

/// The fixed 12-byte DNS header. Flags are kept raw: the forwarder only ever
/// masks individual bits and copies the rest through verbatim.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct DnsHeader {
    /// Unique ID of this request.
    /// A query and its response **must have the same ID**.
    pub id: u16,
    pub flags: u16,
    /// Number of entries in the *Question* section
    pub qdcount: u16,
    /// Number of entries in the *Answer* section
    pub ancount: u16,
    /// Number of entries in the *Authority* section
    pub nscount: u16,
    /// Number of entries in the *Additional* section
    pub arcount: u16,
}

impl DnsHeader {
    pub fn new() -> Self {
        DnsHeader::default()
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RECURSION_DESIRED != 0
    }
}

impl FromBuf for DnsHeader {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Self> {
        let id = buf.read_u16().context("id is missing")?;
        let flags = buf.read_u16().context("flags are missing")?;
        let qdcount = buf.read_u16().context("question count is missing")?;
        let ancount = buf.read_u16().context("answer RR count is missing")?;
        let nscount = buf.read_u16().context("authority RR count is missing")?;
        let arcount = buf.read_u16().context("additional RR count is missing")?;

        Ok(DnsHeader {
            id,
            flags,
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl EncodeToBuf for DnsHeader {
    fn encode_to_buf(&self, buf: &mut ByteBuf) -> anyhow::Result<()> {
        buf.write_u16(self.id);
        buf.write_u16(self.flags);
        buf.write_u16(self.qdcount);
        buf.write_u16(self.ancount);
        buf.write_u16(self.nscount);
        buf.write_u16(self.arcount);

        Ok(())
    }
}
