use crate::error::Error;
use crate::frame::MAX_HEADER_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

/// Prefetch region for the receive path, owned for the connection's lifetime.
///
/// Bytes come off the stream in whatever chunks it yields and are consumed by
/// the frame parser in header-sized and payload-sized slices; `offset` and
/// `count` delimit the unconsumed range. The capacity never goes below the
/// largest possible frame header, so a header prefetch always fits.
pub(crate) struct ReceiveBuffer {
    data: Vec<u8>,
    offset: usize,
    count: usize,
}

impl ReceiveBuffer {
    pub fn new(size: usize) -> Self {
        ReceiveBuffer {
            data: vec![0; size.max(MAX_HEADER_SIZE)],
            offset: 0,
            count: 0,
        }
    }

    /// Wrap a caller-supplied backing region, used exactly as given.
    pub fn from_external(data: Vec<u8>) -> Result<Self, Error> {
        if data.len() < MAX_HEADER_SIZE {
            return Err(Error::InvalidBufferSize);
        }
        Ok(ReceiveBuffer {
            data,
            offset: 0,
            count: 0,
        })
    }

    /// Unconsumed bytes currently buffered.
    pub fn available(&self) -> usize {
        self.count
    }

    /// View of up to `n` unconsumed bytes.
    pub fn peek(&self, n: usize) -> &[u8] {
        &self.data[self.offset..self.offset + n.min(self.count)]
    }

    /// Drop `n` consumed bytes from the front of the unconsumed range.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.count);
        self.offset += n;
        self.count -= n;
        if self.count == 0 {
            self.offset = 0;
        }
    }

    /// Read from the stream until at least `min` unconsumed bytes are
    /// buffered. The unconsumed prefix is shifted down to the start of the
    /// region first, so the free space behind it is contiguous.
    ///
    /// Returns `Ok(false)` on a clean end-of-stream when `graceful_eof` is
    /// set and nothing at all was buffered; any other end of stream short of
    /// `min` is a premature close.
    pub async fn ensure_at_least<R: AsyncRead + Unpin>(
        &mut self,
        read: &mut R,
        min: usize,
        graceful_eof: bool,
        abort: &CancellationToken,
    ) -> Result<bool, Error> {
        debug_assert!(min <= self.data.len());
        if self.count >= min {
            return Ok(true);
        }

        if self.offset > 0 {
            self.data.copy_within(self.offset..self.offset + self.count, 0);
            self.offset = 0;
        }

        while self.count < min {
            let n = tokio::select! {
                _ = abort.cancelled() => return Err(Error::Canceled),
                res = read.read(&mut self.data[self.count..]) => res?,
            };
            if n == 0 {
                if graceful_eof && self.count == 0 {
                    return Ok(false);
                }
                return Err(Error::ConnectionClosedPrematurely);
            }
            self.count += n;
        }

        Ok(true)
    }
}
