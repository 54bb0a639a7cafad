use crate::config::Role;
use crate::error::Error;
use crate::frame::{FrameHeader, OpCode};
use crate::mask::{apply_mask, generate_mask};
use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio_util::sync::CancellationToken;

/// Egress half of the engine.
///
/// Serializes one frame at a time into a reusable buffer and puts it on the
/// wire with a single write, so a frame can never interleave with another.
/// Lives behind the send mutex: user sends hold it for one frame, the receive
/// path borrows it for Pong replies, and the keep-alive timer for its Pings.
pub(crate) struct Writer<S> {
    write_half: WriteHalf<S>,
    role: Role,
    buf: BytesMut,
    mask_generator: fn() -> [u8; 4],
    abort: CancellationToken,
}

impl<S: AsyncWrite> Writer<S> {
    pub fn new(write_half: WriteHalf<S>, role: Role, abort: CancellationToken) -> Self {
        Writer {
            write_half,
            role,
            buf: BytesMut::new(),
            mask_generator: generate_mask,
            abort,
        }
    }

    /// Pin the mask key source, letting tests produce deterministic wire
    /// bytes.
    #[cfg(test)]
    pub fn set_mask_generator(&mut self, mask_generator: fn() -> [u8; 4]) {
        self.mask_generator = mask_generator;
    }

    /// Serialize and send a single frame. According to the RFC, all frames
    /// sent from the client need the payload masked; masking happens in the
    /// frame buffer, the caller's payload slice is never touched.
    pub async fn send_frame(
        &mut self,
        opcode: OpCode,
        final_fragment: bool,
        payload: &[u8],
    ) -> Result<(), Error> {
        let mask = match self.role {
            Role::Client => Some((self.mask_generator)()),
            Role::Server => None,
        };

        self.buf.clear();
        FrameHeader::encode(&mut self.buf, opcode, final_fragment, mask, payload.len());
        let payload_at = self.buf.len();
        self.buf.extend_from_slice(payload);
        if let Some(mask) = mask {
            apply_mask(&mut self.buf[payload_at..], mask, 0);
        }

        trace!(
            "sending frame, opcode {:?}, fin {}, {} payload bytes",
            opcode,
            final_fragment,
            payload.len()
        );

        tokio::select! {
            _ = self.abort.cancelled() => Err(Error::Canceled),
            res = self.write_half.write_all(&self.buf) => res.map_err(Error::from),
        }
    }
}
