//! Async WebSocket protocol engine for the Tokio stack.
//!
//! This library implements the framed-messaging core of the
//! [WebSocket Protocol RFC](https://datatracker.ietf.org/doc/html/rfc6455):
//! frame encoding and decoding, payload masking, fragmentation, control-frame
//! handling, the close handshake, keep-alive pings and streaming UTF-8
//! validation of text messages.
//!
//! It deliberately starts where the handshake ends. The caller establishes
//! the connection (TCP, TLS, proxy, whatever applies), performs the HTTP
//! Upgrade exchange, and hands the resulting stream to
//! [`WebSocket::from_stream`]. From there the engine owns the stream and
//! drives framed message I/O on it: one send and one receive may run
//! concurrently, messages are delivered into caller-supplied buffers slice by
//! slice, and Ping, Pong and Close frames are coordinated internally.

mod buffer;
pub mod config;
pub mod error;
pub mod frame;
mod mask;
mod read;
#[cfg(test)]
mod tests;
mod utf8;
mod websocket;
mod write;

pub use config::{Role, WebSocketConfig};
pub use error::Error;
pub use frame::{CloseCode, CloseFrame, OpCode};
pub use read::{MessageKind, ReceiveResult};
pub use websocket::{ConnectionState, WebSocket};
