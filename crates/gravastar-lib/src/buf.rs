use core::str;
use std::borrow::Cow;
use std::ops::Deref;

use anyhow::Context;

/// Upper bound on compression-pointer jumps while decoding a single name.
/// Unbounded chasing would loop forever on crafted packets.
const MAX_POINTER_JUMPS: usize = 16;

pub trait FromBuf: Sized {
    fn from_buf(buf: &mut ByteBuf) -> anyhow::Result<Self>;
}

pub trait EncodeToBuf {
    fn encode_to_buf(&self, buf: &mut ByteBuf) -> anyhow::Result<()>;
}

/// A cursor over DNS packet bytes. Reads are big-endian and bounds-checked;
/// writes are plain appends to the underlying growable buffer.
pub struct ByteBuf<'a> {
    buf: Cow<'a, [u8]>,
    pos: usize,
}

impl<'a> Deref for ByteBuf<'a> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buf.as_ref()
    }
}

impl<'a> AsRef<[u8]> for ByteBuf<'a> {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}

impl<'a> ByteBuf<'a> {
    pub fn new(src: &impl AsRef<[u8]>) -> ByteBuf<'_> {
        ByteBuf {
            buf: Cow::Borrowed(src.as_ref()),
            pos: 0,
        }
    }

    pub fn new_empty(capacity: Option<usize>) -> ByteBuf<'static> {
        ByteBuf {
            buf: Cow::Owned(Vec::with_capacity(capacity.unwrap_or(512))),
            pos: 0,
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf.into_owned()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        self.read_bytes(1)
            .and_then(|bytes| bytes.first().copied().context("bug: should be present"))
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        self.read_bytes(2)
            .and_then(|bytes| TryInto::<[u8; 2]>::try_into(bytes).context("bug: should be exactly two bytes in length"))
            .map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.read_bytes(4)
            .and_then(|bytes| TryInto::<[u8; 4]>::try_into(bytes).context("bug: should be exactly four bytes in length"))
            .map(u32::from_be_bytes)
    }

    pub fn read_bytes(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        self.ensure_length(self.pos, n)?;
        let pos = self.pos;
        self.pos += n;
        self.buf.get(pos..pos + n).context("bug: should be present")
    }

    pub fn write_u8(&mut self, data: u8) {
        self.buf.to_mut().push(data);
    }

    pub fn write_u16(&mut self, data: u16) {
        self.buf.to_mut().extend_from_slice(&data.to_be_bytes());
    }

    pub fn write_u32(&mut self, data: u32) {
        self.buf.to_mut().extend_from_slice(&data.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.to_mut().extend_from_slice(data);
    }

    /// Reads a possibly compressed name per RFC 1035 §4.1.4.
    ///
    /// After a pointer-free traversal the cursor lands on the byte after the
    /// terminating zero; if the traversal jumped, it lands on the byte after
    /// the first pointer so that the caller can resume reading the record.
    pub fn read_qname(&mut self) -> anyhow::Result<String> {
        let mut jumped = false;
        let mut jumps = 0;
        let mut pos = self.pos;
        let mut labels = Vec::new();
        loop {
            let label_length = *self
                .buf
                .get(pos)
                .context("malformed packet: expected QNAME label length")?;
            match label_length & 0xC0 {
                0xC0 => {
                    let second_byte = *self
                        .buf
                        .get(pos + 1)
                        .context("malformed packet: expected second jump ptr byte in QNAME")?;
                    jumps += 1;
                    if jumps > MAX_POINTER_JUMPS {
                        anyhow::bail!("malformed packet: more than {} jump ptrs in QNAME", MAX_POINTER_JUMPS);
                    }
                    if !jumped {
                        // Continue parsing right after the first jump ptr once the QNAME is done
                        self.pos = pos + 2;
                        jumped = true;
                    }
                    pos = ((label_length as usize ^ 0xC0) << 8) | second_byte as usize;
                }
                0x00 => {
                    pos += 1;
                    if label_length != 0 {
                        let label = self.buf.get(pos..pos + label_length as usize).with_context(|| {
                            format!(
                                "malformed packet: expected label of length {} at byte {}",
                                label_length, pos
                            )
                        })?;
                        let label = str::from_utf8(label)
                            .with_context(|| format!("malformed packet: QNAME label at byte {} is not UTF-8", pos))?;
                        labels.push(label.to_owned());
                        pos += label_length as usize;
                    }
                    if !jumped {
                        self.pos = pos;
                    }
                    if label_length == 0 {
                        break;
                    }
                }
                // 0x40 and 0x80 are reserved label types
                reserved => anyhow::bail!("malformed packet: reserved QNAME label type {:#x}", reserved >> 6),
            }
        }

        Ok(labels.join("."))
    }

    /// Reads a name while rejecting compression pointers. Question sections
    /// built by stub clients are never compressed, and treating a pointer
    /// there as malformed keeps the raw question span contiguous.
    pub fn read_uncompressed_qname(&mut self) -> anyhow::Result<String> {
        let mut labels = Vec::new();
        loop {
            let label_length = self.read_u8().context("malformed packet: expected QNAME label length")?;
            if label_length == 0 {
                break;
            }
            if label_length & 0xC0 != 0 {
                anyhow::bail!("malformed packet: compressed or reserved label in an uncompressed QNAME");
            }
            let label = self
                .read_bytes(label_length as usize)
                .with_context(|| format!("malformed packet: expected label of length {}", label_length))?;
            let label =
                str::from_utf8(label).context("malformed packet: QNAME label is not UTF-8")?;
            labels.push(label.to_owned());
        }

        Ok(labels.join("."))
    }

    /// Writes a name without compression: replies re-encode the question and
    /// record names in full.
    pub fn write_qname(&mut self, qname: &str) -> anyhow::Result<()> {
        if !qname.is_empty() {
            for label in qname.split('.') {
                if label.is_empty() {
                    anyhow::bail!("empty label in name: {}", qname);
                }
                if label.len() > 0x3f {
                    anyhow::bail!("label is too long ({}): {}", label.len(), label);
                }
                self.write_u8(label.len() as u8);
                self.write_bytes(label.as_bytes());
            }
        }
        self.write_u8(0);

        Ok(())
    }

    fn ensure_length(&self, pos: usize, n: usize) -> anyhow::Result<()> {
        if self.buf.len() < pos + n {
            anyhow::bail!("underlying buffer is too small")
        }
        Ok(())
    }
}
