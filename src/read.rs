use crate::buffer::ReceiveBuffer;
use crate::config::Role;
use crate::error::Error;
use crate::frame::{self, CloseFrame, FrameHeader, OpCode};
use crate::mask::apply_mask;
use crate::utf8::Utf8Validator;
use log::trace;
use tokio::io::{AsyncRead, ReadHalf};
use tokio_util::sync::CancellationToken;

/// What a received message is, as reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
}

/// Outcome of one receive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveResult {
    /// Bytes copied into the caller's buffer.
    pub count: usize,
    pub kind: MessageKind,
    /// Whether this call consumed the last payload byte of a final frame.
    pub end_of_message: bool,
    /// Peer close details, present when `kind` is [`MessageKind::Close`].
    pub close: Option<CloseFrame>,
}

/// One step of ingress, handed to the connection driver. Control frames are
/// consumed whole, data frames are streamed into the caller's buffer slice by
/// slice.
pub(crate) enum Ingress {
    Data {
        count: usize,
        kind: MessageKind,
        end_of_message: bool,
    },
    Ping(Vec<u8>),
    Pong,
    Close(CloseFrame),
}

/// Partial-frame state persisted between receive calls when the caller's
/// buffer is smaller than the frame payload.
struct PendingFrame {
    /// Resolved message kind; continuation frames already collapsed to the
    /// kind of the message they continue.
    kind: MessageKind,
    final_fragment: bool,
    remaining: u64,
    mask: Option<[u8; 4]>,
    /// Position in the mask for the next payload byte, carried across reads
    /// that split the frame.
    mask_offset: u8,
}

/// Ingress half of the engine. Strictly sequential: a single receive is in
/// flight at any time, enforced by the mutex this sits behind.
pub(crate) struct Reader<S> {
    read_half: ReadHalf<S>,
    buffer: ReceiveBuffer,
    role: Role,
    abort: CancellationToken,
    pending: Option<PendingFrame>,
    /// Kind of the fragmented message in progress, if any. Continuation
    /// frames take their kind from here; the header's own opcode is never
    /// rewritten.
    current_message: Option<MessageKind>,
    utf8: Utf8Validator,
}

impl<S: AsyncRead> Reader<S> {
    pub fn new(
        read_half: ReadHalf<S>,
        buffer: ReceiveBuffer,
        role: Role,
        abort: CancellationToken,
    ) -> Self {
        Reader {
            read_half,
            buffer,
            role,
            abort,
            pending: None,
            current_message: None,
            utf8: Utf8Validator::default(),
        }
    }

    /// Drive ingress until something must be reported: a slice of a data
    /// frame copied into `caller`, or a whole control frame.
    pub async fn next_ingress(&mut self, caller: &mut [u8]) -> Result<Ingress, Error> {
        // Step 1: a partially consumed frame from a previous call is resumed
        // before any new header is read
        if self.pending.is_none() {
            if let Some(control) = self.read_header().await? {
                return Ok(control);
            }
        }

        // Make at least one payload byte available when the frame still has
        // some and nothing is buffered
        if self.buffer.available() == 0
            && self.pending.as_ref().is_some_and(|p| p.remaining > 0)
        {
            self.buffer
                .ensure_at_least(&mut self.read_half, 1, false, &self.abort)
                .await?;
        }

        let Some(pending) = self.pending.as_mut() else {
            unreachable!("data frame pending after header read");
        };

        let to_copy = pending
            .remaining
            .min(caller.len() as u64)
            .min(self.buffer.available() as u64) as usize;

        if to_copy > 0 {
            caller[..to_copy].copy_from_slice(self.buffer.peek(to_copy));
            self.buffer.consume(to_copy);
            // Only a server unmasks ingress payloads; the offset keeps the
            // key aligned across split reads of one frame
            if let Some(mask) = pending.mask {
                pending.mask_offset = apply_mask(&mut caller[..to_copy], mask, pending.mask_offset);
            }
            pending.remaining -= to_copy as u64;
        }

        let kind = pending.kind;
        let end_of_message = pending.final_fragment && pending.remaining == 0;
        let frame_done = pending.remaining == 0;
        let final_fragment = pending.final_fragment;

        // Text payloads are validated as they are handed out, and flushed at
        // the end of the message to catch a truncated sequence
        if kind == MessageKind::Text {
            if to_copy > 0 && !self.utf8.advance(&caller[..to_copy]) {
                return Err(Error::InvalidPayloadData);
            }
            if end_of_message && !self.utf8.finish() {
                return Err(Error::InvalidPayloadData);
            }
        }

        if frame_done {
            self.pending = None;
            if final_fragment {
                self.current_message = None;
            }
        }

        Ok(Ingress::Data {
            count: to_copy,
            kind,
            end_of_message,
        })
    }

    /// Read and validate one frame header. Control frames are consumed whole
    /// and returned; a data frame becomes the pending frame and `None` is
    /// returned.
    async fn read_header(&mut self) -> Result<Option<Ingress>, Error> {
        // End of stream before the first header byte of a frame means the
        // peer dropped the transport without a close handshake
        if !self
            .buffer
            .ensure_at_least(&mut self.read_half, 2, true, &self.abort)
            .await?
        {
            return Err(Error::ConnectionClosedPrematurely);
        }

        let prefix = [self.buffer.peek(2)[0], self.buffer.peek(2)[1]];
        let header_size = FrameHeader::size_from_prefix(prefix);

        // The buffer capacity never goes below the largest header, so the
        // whole header always fits
        self.buffer
            .ensure_at_least(&mut self.read_half, header_size, false, &self.abort)
            .await?;
        let header = FrameHeader::parse(self.buffer.peek(header_size))?;
        self.buffer.consume(header_size);

        trace!(
            "received frame header, opcode {:?}, fin {}, {} payload bytes",
            header.opcode,
            header.final_fragment,
            header.payload_len
        );

        // Masking direction is fixed by the role: servers mask nothing,
        // clients mask everything
        match self.role {
            Role::Client if header.mask.is_some() => return Err(Error::MaskedFrameFromServer),
            Role::Server if header.mask.is_none() => return Err(Error::UnmaskedFrameFromClient),
            _ => {}
        }

        if header.opcode.is_control() {
            let payload = self.read_control_payload(&header).await?;
            return Ok(Some(match header.opcode {
                OpCode::Ping => Ingress::Ping(payload),
                OpCode::Pong => Ingress::Pong,
                _ => Ingress::Close(frame::parse_close_payload(&payload)?),
            }));
        }

        let kind = match header.opcode {
            OpCode::Continue => self
                .current_message
                .ok_or(Error::InvalidContinuationFrame)?,
            opcode => {
                // A fresh Text or Binary frame must not arrive while a
                // fragmented message is still in progress
                if self.current_message.is_some() {
                    return Err(Error::InvalidFrameFragmentation);
                }
                if opcode == OpCode::Text {
                    MessageKind::Text
                } else {
                    MessageKind::Binary
                }
            }
        };

        if !header.final_fragment {
            self.current_message = Some(kind);
        }

        self.pending = Some(PendingFrame {
            kind,
            final_fragment: header.final_fragment,
            remaining: header.payload_len,
            mask: header.mask,
            mask_offset: 0,
        });
        Ok(None)
    }

    /// Collect a control frame's payload in full. Gathered in buffer-sized
    /// slices, so even the minimum 14-byte capacity handles the 125-byte
    /// control maximum.
    async fn read_control_payload(&mut self, header: &FrameHeader) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::with_capacity(header.payload_len as usize);
        let mut remaining = header.payload_len as usize;

        while remaining > 0 {
            if self.buffer.available() == 0 {
                self.buffer
                    .ensure_at_least(&mut self.read_half, 1, false, &self.abort)
                    .await?;
            }
            let take = remaining.min(self.buffer.available());
            payload.extend_from_slice(self.buffer.peek(take));
            self.buffer.consume(take);
            remaining -= take;
        }

        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask, 0);
        }

        Ok(payload)
    }
}
