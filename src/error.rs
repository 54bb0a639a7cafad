use crate::frame::CloseCode;
use crate::websocket::ConnectionState;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Transport errors
    #[error("IO Error happened: {source}")]
    IOError {
        #[from]
        source: io::Error,
    },

    #[error("Connection closed prematurely, without a close handshake")]
    ConnectionClosedPrematurely,

    // Framing errors
    #[error("RSV not zero")]
    RSVNotZero,

    #[error("Invalid Opcode")]
    InvalidOpcode,

    #[error("Control frames must not be fragmented")]
    ControlFramesFragmented,

    #[error("Control frame with invalid payload size, can't be greater than 125")]
    ControlFramePayloadSize,

    #[error("Received a masked frame from the server")]
    MaskedFrameFromServer,

    #[error("Received an unmasked frame from the client")]
    UnmaskedFrameFromClient,

    // Fragmentation errors
    #[error("Invalid frame while there is a fragmented message in progress")]
    InvalidFrameFragmentation,

    #[error("Invalid continuation frame: no fragmented message to continue")]
    InvalidContinuationFrame,

    // Close handshake errors
    #[error("Close frame with a single-byte payload")]
    InvalidClosePayload,

    #[error("Close status code `{0}` is not allowed on the wire")]
    InvalidCloseCode(u16),

    #[error("Close frame reason is not valid UTF-8")]
    InvalidCloseReason,

    #[error("Close reason can't be longer than 123 bytes")]
    CloseReasonTooLong,

    // Payload errors
    #[error("Text message payload is not valid UTF-8")]
    InvalidPayloadData,

    // API misuse errors
    #[error("Close frames are sent through close_output, not send")]
    InvalidMessageType,

    #[error("Operation is not valid in the `{0:?}` state")]
    InvalidState(ConnectionState),

    #[error("Another receive is already in progress")]
    ReceiveInProgress,

    #[error("Another send is already in progress")]
    SendInProgress,

    #[error("Receive buffer must be at least 14 bytes long")]
    InvalidBufferSize,

    #[error("Operation was canceled")]
    Canceled,

    #[error("The WebSocket has been disposed")]
    Disposed,
}

impl Error {
    /// Close status for the best-effort Close frame emitted before a failing
    /// receive is surfaced. Transport errors return `None` and skip the Close
    /// attempt entirely.
    pub(crate) fn close_code(&self) -> Option<CloseCode> {
        match self {
            Error::InvalidPayloadData => Some(CloseCode::InvalidFramePayloadData),
            Error::RSVNotZero
            | Error::InvalidOpcode
            | Error::ControlFramesFragmented
            | Error::ControlFramePayloadSize
            | Error::MaskedFrameFromServer
            | Error::UnmaskedFrameFromClient
            | Error::InvalidFrameFragmentation
            | Error::InvalidContinuationFrame
            | Error::InvalidClosePayload
            | Error::InvalidCloseCode(_)
            | Error::InvalidCloseReason => Some(CloseCode::ProtocolError),
            _ => None,
        }
    }
}
