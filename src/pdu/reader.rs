//! Incremental PDU framing over an async byte stream.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::pdu::message::{parse_header, Pdu, PduError};

/// Reads whole LDAPMessage envelopes from `inner`.
///
/// `next` is cancel safe: a partially received PDU stays buffered.
pub struct PduReader<R> {
    inner: R,
    buf: BytesMut,
    max_size: usize,
}

impl<R: AsyncRead + Unpin> PduReader<R> {
    pub fn new(inner: R, max_size: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            max_size,
        }
    }

    /// Next complete PDU, or `None` on a clean end of stream.
    pub async fn next(&mut self) -> Result<Option<Pdu>, PduError> {
        loop {
            if let Some(pdu) = self.try_frame()? {
                return Ok(Some(pdu));
            }
            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(PduError::Truncated);
            }
        }
    }

    fn try_frame(&mut self) -> Result<Option<Pdu>, PduError> {
        let Some((header_len, content_len)) = parse_header(&self.buf)? else {
            return Ok(None);
        };
        let total = header_len + content_len;
        if total > self.max_size {
            return Err(PduError::TooLarge {
                size: total,
                max: self.max_size,
            });
        }
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let raw = self.buf.split_to(total).freeze();
        Pdu::parse(raw).map(Some)
    }
}
