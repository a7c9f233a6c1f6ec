//! Binary wire primitives and PADMÉ frame padding.
//!
//! All multi-byte integers are big-endian. Variable-length fields carry a
//! u32 length prefix; arrays carry a u32 count prefix. Padded frames hide
//! payload sizes behind the PADMÉ scheme: the padded length reveals only
//! O(log log L) bits of the true length, at a bounded overhead.

use rand::RngCore;

use crate::error::{CoreError, Result};

/// Upper bound on any length-prefixed field (16 MiB).
pub const MAX_VAR_LEN: usize = 16 * 1024 * 1024;

/// Size of the trailing payload-length footer in a padded frame.
pub const FOOTER_LEN: usize = 4;

/// Incremental big-endian writer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a writer with preallocated capacity.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    /// Append a u8.
    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    /// Append a big-endian u16.
    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u32.
    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append a big-endian u64.
    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// Append raw bytes with no length prefix.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append a u32 length prefix followed by the bytes.
    pub fn put_varbytes(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() > MAX_VAR_LEN {
            return Err(CoreError::LengthOverflow {
                len: bytes.len(),
                max: MAX_VAR_LEN,
            });
        }
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
        Ok(())
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and return the buffer.
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Zero-copy big-endian reader.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    rest: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Create a reader over a buffer.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { rest: buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.rest.len() < n {
            return Err(CoreError::Truncated {
                needed: n - self.rest.len(),
            });
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    /// Read a u8.
    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u16.
    pub fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32.
    pub fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a big-endian u64.
    pub fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read exactly `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Read a u32 length prefix and that many bytes.
    pub fn varbytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        if len > MAX_VAR_LEN {
            return Err(CoreError::LengthOverflow {
                len,
                max: MAX_VAR_LEN,
            });
        }
        self.take(len)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.rest.len()
    }

    /// Assert the buffer is fully consumed.
    pub fn finish(self) -> Result<()> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(CoreError::TrailingBytes(self.rest.len()))
        }
    }
}

/// The PADMÉ padded size for a payload of `len` bytes.
///
/// With `E = floor(log2 len)` and `S = floor(log2 E) + 1`, the low
/// `E − S` bits of the padded size are forced to zero. The overhead is at
/// most `1 / 2^(S−1)`, vanishing as lengths grow.
pub fn padme_size(len: u64) -> u64 {
    if len < 2 {
        return len;
    }
    let e = 63 - u64::from(len.leading_zeros());
    let s = 64 - u64::from(e.leading_zeros());
    let last_bits = e - s;
    let mask = (1u64 << last_bits) - 1;
    (len + mask) & !mask
}

/// Pad a payload: payload ‖ random fill ‖ u32 payload length.
///
/// The whole frame (payload + fill + footer) has the PADMÉ size for
/// `payload.len() + 4`, so observed frame sizes leak only the padded
/// bucket.
pub fn pad_frame(payload: &[u8], rng: &mut impl RngCore) -> Result<Vec<u8>> {
    if payload.len() > u32::MAX as usize {
        return Err(CoreError::LengthOverflow {
            len: payload.len(),
            max: u32::MAX as usize,
        });
    }
    let inner = payload.len() as u64 + FOOTER_LEN as u64;
    let padded = padme_size(inner) as usize;
    let mut out = vec![0u8; padded];
    out[..payload.len()].copy_from_slice(payload);
    rng.fill_bytes(&mut out[payload.len()..padded - FOOTER_LEN]);
    out[padded - FOOTER_LEN..].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    Ok(out)
}

/// Recover the payload from a padded frame.
pub fn unpad_frame(frame: &[u8]) -> Result<&[u8]> {
    if frame.len() < FOOTER_LEN {
        return Err(CoreError::BadPadding("frame shorter than footer".into()));
    }
    let mut footer = [0u8; FOOTER_LEN];
    footer.copy_from_slice(&frame[frame.len() - FOOTER_LEN..]);
    let len = u32::from_be_bytes(footer) as usize;
    if len + FOOTER_LEN > frame.len() {
        return Err(CoreError::BadPadding(
            "footer length exceeds frame size".into(),
        ));
    }
    if padme_size((len + FOOTER_LEN) as u64) as usize != frame.len() {
        return Err(CoreError::BadPadding(
            "frame size is not the padded size of its payload".into(),
        ));
    }
    Ok(&frame[..len])
}
