//! Frame layout and bounds-checked field access
//!
//! ```text
//! kind:u8 | version:u8 | body_len:u32 BE | body | zero padding to bucket
//! ```

use crate::error::{Error, Result};

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 6;

/// Frame discriminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Query = 0x51,
    Response = 0x52,
}

impl FrameKind {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0x51 => Some(Self::Query),
            0x52 => Some(Self::Response),
            _ => None,
        }
    }
}

fn malformed(reason: impl Into<String>) -> Error {
    Error::MalformedEnvelope(reason.into())
}

/// Wrap `body` in a header and pad to the smallest bucket that fits
pub fn seal(kind: FrameKind, body: &[u8], buckets: &[usize]) -> Result<Vec<u8>> {
    let frame_len = HEADER_LEN + body.len();
    let max = buckets.last().copied().unwrap_or(0);
    let bucket = buckets
        .iter()
        .copied()
        .find(|b| *b >= frame_len)
        .ok_or(Error::PayloadTooLarge {
            size: frame_len,
            max,
        })?;

    let body_len = u32::try_from(body.len()).map_err(|_| Error::PayloadTooLarge {
        size: frame_len,
        max,
    })?;

    let mut frame = Vec::with_capacity(bucket);
    frame.push(kind as u8);
    frame.push(FRAME_VERSION);
    frame.extend_from_slice(&body_len.to_be_bytes());
    frame.extend_from_slice(body);
    frame.resize(bucket, 0);
    Ok(frame)
}

/// Validate framing and return the kind and body slice
pub fn open<'a>(frame: &'a [u8], buckets: &[usize]) -> Result<(FrameKind, &'a [u8])> {
    if !buckets.contains(&frame.len()) {
        return Err(malformed(format!(
            "frame length {} is not a bucket size",
            frame.len()
        )));
    }

    let kind = peek_kind(frame)?;
    if frame[1] != FRAME_VERSION {
        return Err(malformed(format!("unsupported version {}", frame[1])));
    }

    let body_len = u32::from_be_bytes([frame[2], frame[3], frame[4], frame[5]]) as usize;
    let end = HEADER_LEN
        .checked_add(body_len)
        .filter(|end| *end <= frame.len())
        .ok_or_else(|| malformed(format!("body length {} overruns frame", body_len)))?;

    if frame[end..].iter().any(|b| *b != 0) {
        return Err(malformed("non-zero padding"));
    }

    Ok((kind, &frame[HEADER_LEN..end]))
}

/// Read the kind byte without validating the rest of the frame
pub fn peek_kind(frame: &[u8]) -> Result<FrameKind> {
    if frame.len() < HEADER_LEN {
        return Err(malformed("frame shorter than header"));
    }
    FrameKind::from_u8(frame[0]).ok_or_else(|| malformed(format!("unknown frame kind {:#04x}", frame[0])))
}

/// Append-only body builder
#[derive(Debug, Default)]
pub struct BodyWriter {
    buf: Vec<u8>,
}

impl BodyWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// `len:u32` followed by `bytes`
    pub fn long_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u32::try_from(bytes.len()).map_err(|_| Error::PayloadTooLarge {
            size: bytes.len(),
            max: u32::MAX as usize,
        })?;
        Ok(self.u32(len).raw(bytes))
    }

    /// `len:u16` followed by `bytes`
    pub fn short_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = u16::try_from(bytes.len()).map_err(|_| Error::PayloadTooLarge {
            size: bytes.len(),
            max: u16::MAX as usize,
        })?;
        Ok(self.u16(len).raw(bytes))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an untrusted body; every read is bounds-checked
#[derive(Debug)]
pub struct BodyReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| malformed(format!("truncated {}", field)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn array<const N: usize>(&mut self, field: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    pub fn u8(&mut self, field: &str) -> Result<u8> {
        Ok(self.array::<1>(field)?[0])
    }

    pub fn u16(&mut self, field: &str) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array(field)?))
    }

    pub fn u32(&mut self, field: &str) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array(field)?))
    }

    pub fn i64(&mut self, field: &str) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array(field)?))
    }

    pub fn long_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.u32(field)? as usize;
        self.take(len, field)
    }

    pub fn short_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.u16(field)? as usize;
        self.take(len, field)
    }

    /// Fail if any bytes remain unread
    pub fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(malformed(format!(
                "{} trailing bytes in body",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}
