use crate::buffer::ReceiveBuffer;
use crate::config::WebSocketConfig;
use crate::error::Error;
use crate::frame::{self, CloseCode, CloseFrame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEADER_SIZE};
use crate::read::{Ingress, MessageKind, Reader, ReceiveResult};
use crate::write::Writer;
use log::{debug, trace};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Connection lifecycle, as observed through [`WebSocket::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake still in flight. Never produced by this engine, which is
    /// constructed on an already-upgraded stream; kept for integrations that
    /// surface their own connect phase.
    Connecting,
    Open,
    /// Our Close frame went out and the peer's hasn't arrived yet.
    CloseSent,
    /// The peer's Close frame arrived before ours went out.
    CloseReceived,
    Closed,
    Aborted,
}

/// Mutable connection state. Sits under a plain mutex whose critical sections
/// never suspend; the externally visible state is derived from the flags.
#[derive(Default)]
struct Shared {
    sent_close_frame: bool,
    received_close_frame: bool,
    aborted: bool,
    disposed: bool,
    close: Option<CloseFrame>,
    /// A user send is running. Tracked apart from the send mutex, which the
    /// engine's own Pong, Ping and Close writes also take.
    send_in_flight: bool,
    /// The previous user send ended with `end_of_message = false`, so the
    /// next one continues that message with a Continue frame.
    last_send_was_fragment: bool,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        if self.aborted {
            ConnectionState::Aborted
        } else if self.disposed || (self.sent_close_frame && self.received_close_frame) {
            ConnectionState::Closed
        } else if self.sent_close_frame {
            ConnectionState::CloseSent
        } else if self.received_close_frame {
            ConnectionState::CloseReceived
        } else {
            ConnectionState::Open
        }
    }
}

fn lock(shared: &StdMutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the user-send flag on every exit path, including a dropped send
/// future.
struct SendPermit<'a>(&'a StdMutex<Shared>);

impl Drop for SendPermit<'_> {
    fn drop(&mut self) {
        lock(self.0).send_in_flight = false;
    }
}

struct Inner<S> {
    shared: StdMutex<Shared>,
    writer: Mutex<Writer<S>>,
    /// Receive engine. Its mutex doubles as the close-coordination lock: user
    /// receives take it with `try_lock`, the close drain awaits it, so a
    /// close started while a receive is pending waits that receive out
    /// instead of preempting it.
    reader: Mutex<Reader<S>>,
    abort_signal: CancellationToken,
    subprotocol: Option<String>,
}

impl<S> Inner<S> {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    fn do_abort(&self) {
        {
            let mut shared = self.shared();
            if shared.state() != ConnectionState::Closed {
                shared.aborted = true;
            }
        }
        self.abort_signal.cancel();
    }
}

impl<S: AsyncRead + AsyncWrite> Inner<S> {
    /// Loop ingress through the reader until a data slice or the peer's Close
    /// surfaces, answering control frames along the way.
    async fn drive_receive(
        &self,
        reader: &mut Reader<S>,
        buf: &mut [u8],
    ) -> Result<ReceiveResult, Error> {
        loop {
            match reader.next_ingress(buf).await {
                Ok(Ingress::Data {
                    count,
                    kind,
                    end_of_message,
                }) => {
                    return Ok(ReceiveResult {
                        count,
                        kind,
                        end_of_message,
                        close: None,
                    });
                }
                Ok(Ingress::Ping(payload)) => {
                    // Per the RFC a Ping gets exactly one Pong, unless our
                    // Close frame is already out; nothing follows a Close
                    let suppressed = self.shared().sent_close_frame;
                    if suppressed {
                        trace!("ping after close sent, not answering");
                        continue;
                    }
                    let mut writer = tokio::select! {
                        _ = self.abort_signal.cancelled() => return Err(Error::Canceled),
                        guard = self.writer.lock() => guard,
                    };
                    let sent = writer.send_frame(OpCode::Pong, true, &payload).await;
                    drop(writer);
                    if let Err(err) = sent {
                        return Err(self.fail_receive(err).await);
                    }
                }
                Ok(Ingress::Pong) => {
                    // Answering one of our keep-alive Pings, or unsolicited;
                    // absorbed either way
                }
                Ok(Ingress::Close(close)) => {
                    debug!("received close frame, code {:?}", close.code);
                    let mut shared = self.shared();
                    shared.received_close_frame = true;
                    if shared.close.is_none() {
                        shared.close = Some(close.clone());
                    }
                    drop(shared);
                    return Ok(ReceiveResult {
                        count: 0,
                        kind: MessageKind::Close,
                        end_of_message: true,
                        close: Some(close),
                    });
                }
                Err(err) => return Err(self.fail_receive(err).await),
            }
        }
    }

    /// Protocol violations get a best-effort Close with the matching status
    /// before the failing receive is surfaced; transport failures skip the
    /// courtesy and abort outright.
    async fn fail_receive(&self, err: Error) -> Error {
        match err.close_code() {
            Some(code) => {
                if let Err(send_err) = self.send_close_frame(code, "").await {
                    debug!("best-effort close after protocol error failed: {send_err}");
                }
            }
            None => self.do_abort(),
        }
        err
    }

    /// Send a Close frame once. The writer lock settles the race between
    /// concurrent closers; only the first puts a frame on the wire.
    async fn send_close_frame(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        let payload = frame::encode_close_payload(code, reason)?;

        let mut writer = tokio::select! {
            _ = self.abort_signal.cancelled() => return Err(Error::Canceled),
            guard = self.writer.lock() => guard,
        };
        if self.shared().sent_close_frame {
            return Ok(());
        }
        writer.send_frame(OpCode::Close, true, &payload).await?;
        self.shared().sent_close_frame = true;
        Ok(())
    }
}

/// A WebSocket over an established, already-upgraded stream.
///
/// The engine owns the stream and drives RFC 6455 framing on it: masking,
/// fragmentation, control frames, the close handshake and streaming text
/// validation. One send and one receive may run concurrently; everything else
/// is serialized internally.
pub struct WebSocket<S> {
    inner: Arc<Inner<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> WebSocket<S> {
    /// Wrap a connected stream on which the upgrade handshake has completed.
    /// The connection starts out in the `Open` state.
    pub fn from_stream(stream: S, config: WebSocketConfig) -> Result<Self, Error> {
        let buffer = match config.receive_buffer {
            Some(region) => ReceiveBuffer::from_external(region)?,
            None => ReceiveBuffer::new(config.receive_buffer_size),
        };

        let abort_signal = CancellationToken::new();
        let (read_half, write_half) = tokio::io::split(stream);

        let inner = Arc::new(Inner {
            shared: StdMutex::new(Shared::default()),
            writer: Mutex::new(Writer::new(write_half, config.role, abort_signal.clone())),
            reader: Mutex::new(Reader::new(
                read_half,
                buffer,
                config.role,
                abort_signal.clone(),
            )),
            abort_signal,
            subprotocol: config.subprotocol,
        });

        if let Some(period) = config.keep_alive_interval {
            if !period.is_zero() {
                tokio::spawn(keep_alive(Arc::clone(&inner), period));
            }
        }

        Ok(WebSocket { inner })
    }

    /// Send one frame of a Text or Binary message. A call with
    /// `end_of_message = false` starts or continues a fragmented message;
    /// the frames that follow it carry the Continue opcode until one is
    /// final.
    pub async fn send(
        &self,
        payload: &[u8],
        kind: MessageKind,
        end_of_message: bool,
    ) -> Result<(), Error> {
        if kind == MessageKind::Close {
            return Err(Error::InvalidMessageType);
        }

        let opcode = {
            let mut shared = self.inner.shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            let state = shared.state();
            if !matches!(state, ConnectionState::Open | ConnectionState::CloseReceived) {
                return Err(Error::InvalidState(state));
            }
            if shared.send_in_flight {
                drop(shared);
                self.inner.do_abort();
                return Err(Error::SendInProgress);
            }
            shared.send_in_flight = true;

            let opcode = if shared.last_send_was_fragment {
                OpCode::Continue
            } else if kind == MessageKind::Text {
                OpCode::Text
            } else {
                OpCode::Binary
            };
            shared.last_send_was_fragment = !end_of_message;
            opcode
        };

        let _permit = SendPermit(&self.inner.shared);
        let mut writer = tokio::select! {
            _ = self.inner.abort_signal.cancelled() => return Err(Error::Canceled),
            guard = self.inner.writer.lock() => guard,
        };
        writer.send_frame(opcode, end_of_message, payload).await
    }

    /// Receive the next slice of a message into `buf`. Data frames may be
    /// delivered over several calls when `buf` is smaller than the payload;
    /// Ping and Pong frames are handled internally and never surface.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<ReceiveResult, Error> {
        {
            let shared = self.inner.shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            let state = shared.state();
            if !matches!(state, ConnectionState::Open | ConnectionState::CloseSent) {
                return Err(Error::InvalidState(state));
            }
        }

        let mut reader = match self.inner.reader.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // A second concurrent receive is caller misuse and poisons
                // the framing, so the connection goes down with it
                self.inner.do_abort();
                return Err(Error::ReceiveInProgress);
            }
        };

        self.inner.drive_receive(&mut reader, buf).await
    }

    /// Send our Close frame without waiting for the peer's. Receives may
    /// continue until the peer's Close arrives.
    pub async fn close_output(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        {
            let shared = self.inner.shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            let state = shared.state();
            if !matches!(state, ConnectionState::Open | ConnectionState::CloseReceived) {
                return Err(Error::InvalidState(state));
            }
        }

        self.inner.send_close_frame(code, reason).await
    }

    /// Run the full close handshake: send our Close frame if it hasn't gone
    /// out yet, then drain incoming frames until the peer's Close arrives.
    /// Data surfacing during the drain is discarded. Calling this again after
    /// the handshake completed is a no-op.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), Error> {
        {
            let shared = self.inner.shared();
            if shared.disposed {
                return Err(Error::Disposed);
            }
            match shared.state() {
                ConnectionState::Closed => return Ok(()),
                state @ (ConnectionState::Aborted | ConnectionState::Connecting) => {
                    return Err(Error::InvalidState(state));
                }
                _ => {}
            }
        }

        self.inner.send_close_frame(code, reason).await?;

        // An already running receive is awaited, never preempted: the reader
        // lock is taken only between its calls, and the received-close flag
        // is re-checked each time it is held
        loop {
            if self.inner.shared().received_close_frame {
                break;
            }
            let mut reader = tokio::select! {
                _ = self.inner.abort_signal.cancelled() => return Err(Error::Canceled),
                guard = self.inner.reader.lock() => guard,
            };
            if self.inner.shared().received_close_frame {
                break;
            }
            let mut drain = [0u8; MAX_CONTROL_PAYLOAD + MAX_HEADER_SIZE];
            self.inner.drive_receive(&mut reader, &mut drain).await?;
        }

        debug!("close handshake complete");
        Ok(())
    }

    /// Unilateral termination: no close handshake, pending operations are
    /// unblocked with a cancellation failure. Idempotent.
    pub fn abort(&self) {
        self.inner.do_abort();
    }

    /// Release the connection. Pending operations are unblocked, later ones
    /// fail with [`Error::Disposed`]. Idempotent; also run on drop.
    pub fn dispose(&self) {
        {
            let mut shared = self.inner.shared();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
        }
        self.inner.abort_signal.cancel();
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared().state()
    }

    /// Status code from the peer's Close frame, once one arrived.
    pub fn close_code(&self) -> Option<CloseCode> {
        self.inner.shared().close.as_ref().map(|close| close.code)
    }

    /// Reason text from the peer's Close frame, once one arrived.
    pub fn close_reason(&self) -> Option<String> {
        self.inner
            .shared()
            .close
            .as_ref()
            .map(|close| close.reason.clone())
    }

    /// Subprotocol agreed during the handshake, as configured.
    pub fn subprotocol(&self) -> Option<&str> {
        self.inner.subprotocol.as_deref()
    }

    #[cfg(test)]
    pub(crate) async fn pin_mask_generator(&self, mask_generator: fn() -> [u8; 4]) {
        self.inner
            .writer
            .lock()
            .await
            .set_mask_generator(mask_generator);
    }
}

impl<S> Drop for WebSocket<S> {
    fn drop(&mut self) {
        {
            let mut shared = self.inner.shared();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
        }
        self.inner.abort_signal.cancel();
    }
}

/// Emits an unsolicited empty Ping at every tick while the send path is idle.
/// A busy send mutex means traffic is already flowing, so the tick is skipped
/// rather than queued behind it.
async fn keep_alive<S: AsyncRead + AsyncWrite + Send + 'static>(
    inner: Arc<Inner<S>>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = inner.abort_signal.cancelled() => return,
            _ = ticker.tick() => {}
        }

        {
            let shared = inner.shared();
            if shared.sent_close_frame || shared.aborted || shared.disposed {
                return;
            }
        }

        if let Ok(mut writer) = inner.writer.try_lock() {
            if let Err(err) = writer.send_frame(OpCode::Ping, true, &[]).await {
                // Swallowed: whichever operation touches the broken
                // transport next will surface the failure
                debug!("keep-alive ping failed: {err}");
            }
        }
    }
}
