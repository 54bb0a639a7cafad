use crate::config::{Role, WebSocketConfig};
use crate::error::Error;
use crate::frame::CloseCode;
use crate::read::MessageKind;
use crate::websocket::{ConnectionState, WebSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

fn zero_mask() -> [u8; 4] {
    [0u8; 4]
}

async fn connected_with_config(
    config: WebSocketConfig,
) -> (WebSocket<DuplexStream>, DuplexStream) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (local, remote) = tokio::io::duplex(16 * 1024);
    let ws = WebSocket::from_stream(local, config).unwrap();
    ws.pin_mask_generator(zero_mask).await;
    (ws, remote)
}

async fn connected_client() -> (WebSocket<DuplexStream>, DuplexStream) {
    connected_with_config(WebSocketConfig::default()).await
}

#[tokio::test]
async fn receive_unfragmented_text() {
    let (ws, mut server) = connected_client().await;
    server
        .write_all(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'])
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let result = ws.receive(&mut buf).await.unwrap();

    assert_eq!(result.count, 5);
    assert_eq!(result.kind, MessageKind::Text);
    assert!(result.end_of_message);
    assert_eq!(&buf[..5], b"hello");
}

#[tokio::test]
async fn send_binary_with_pinned_mask() {
    let (ws, mut server) = connected_client().await;
    ws.send(&[0xDE, 0xAD, 0xBE, 0xEF], MessageKind::Binary, true)
        .await
        .unwrap();

    let mut wire = [0u8; 10];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(
        wire,
        [0x82, 0x84, 0x00, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF]
    );
}

#[tokio::test]
async fn receive_fragmented_text() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x01, 0x02, b'a', b'b']).await.unwrap();
    server.write_all(&[0x80, 0x02, b'c', b'd']).await.unwrap();

    let mut buf = [0u8; 4];

    let first = ws.receive(&mut buf).await.unwrap();
    assert_eq!(first.count, 2);
    assert_eq!(first.kind, MessageKind::Text);
    assert!(!first.end_of_message);
    assert_eq!(&buf[..2], b"ab");

    let second = ws.receive(&mut buf).await.unwrap();
    assert_eq!(second.count, 2);
    // continuation frames collapse to the kind of the message they continue
    assert_eq!(second.kind, MessageKind::Text);
    assert!(second.end_of_message);
    assert_eq!(&buf[..2], b"cd");
}

#[tokio::test]
async fn ping_between_fragments_is_answered_once() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x01, 0x02, b'a', b'b']).await.unwrap();
    server.write_all(&[0x89, 0x01, b'x']).await.unwrap();
    server.write_all(&[0x80, 0x02, b'c', b'd']).await.unwrap();

    let mut message = Vec::new();
    let mut buf = [0u8; 4];

    let first = ws.receive(&mut buf).await.unwrap();
    message.extend_from_slice(&buf[..first.count]);
    assert!(!first.end_of_message);

    // The second receive eats the Ping, answers it, and carries on with the
    // final fragment
    let second = ws.receive(&mut buf).await.unwrap();
    message.extend_from_slice(&buf[..second.count]);
    assert!(second.end_of_message);
    assert_eq!(message, b"abcd");

    let mut pong = [0u8; 7];
    server.read_exact(&mut pong).await.unwrap();
    assert_eq!(pong, [0x8A, 0x81, 0x00, 0x00, 0x00, 0x00, b'x']);
}

#[tokio::test]
async fn close_handshake_initiated_locally() {
    let (ws, mut server) = connected_client().await;

    ws.close_output(CloseCode::NormalClosure, "").await.unwrap();
    assert_eq!(ws.state(), ConnectionState::CloseSent);

    let mut wire = [0u8; 8];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xE8]);

    // Peer acknowledges; close() drains until that frame is seen
    server.write_all(&[0x88, 0x02, 0x03, 0xE8]).await.unwrap();
    ws.close(CloseCode::NormalClosure, "").await.unwrap();

    assert_eq!(ws.state(), ConnectionState::Closed);
    assert_eq!(ws.close_code(), Some(CloseCode::NormalClosure));
    assert_eq!(ws.close_reason(), Some(String::new()));

    // A completed handshake makes close() a no-op
    ws.close(CloseCode::NormalClosure, "").await.unwrap();
    assert_eq!(ws.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn close_initiated_by_peer() {
    let (ws, mut server) = connected_client().await;
    server
        .write_all(&[0x88, 0x05, 0x03, 0xE9, b'b', b'y', b'e'])
        .await
        .unwrap();

    let mut buf = [0u8; 16];
    let result = ws.receive(&mut buf).await.unwrap();
    assert_eq!(result.kind, MessageKind::Close);
    assert_eq!(result.count, 0);
    assert!(result.end_of_message);
    let close = result.close.unwrap();
    assert_eq!(close.code, CloseCode::GoingAway);
    assert_eq!(close.reason, "bye");
    assert_eq!(ws.state(), ConnectionState::CloseReceived);

    // Receiving again in this state is invalid
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState(ConnectionState::CloseReceived)
    ));

    // Completing the handshake only needs our half now
    ws.close(CloseCode::NormalClosure, "").await.unwrap();
    assert_eq!(ws.state(), ConnectionState::Closed);

    let mut wire = [0u8; 8];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xE8]);
}

#[tokio::test]
async fn unknown_opcode_fails_the_connection() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x83, 0x00]).await.unwrap();

    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::InvalidOpcode));

    // A best-effort Close with status 1002 went out first
    let mut wire = [0u8; 8];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xEA]);
}

#[tokio::test]
async fn masked_ingress_is_rejected_by_a_client() {
    let (ws, mut server) = connected_client().await;
    let mask = [0x01, 0x02, 0x03, 0x04];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&mask);
    frame.extend(b"hello".iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    server.write_all(&frame).await.unwrap();

    let mut buf = [0u8; 16];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::MaskedFrameFromServer));
}

#[tokio::test]
async fn close_payload_of_one_byte_is_a_protocol_error() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x88, 0x01, 0x03]).await.unwrap();

    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::InvalidClosePayload));
}

#[tokio::test]
async fn out_of_range_close_codes_are_protocol_errors() {
    for code in [999u16, 5000] {
        let (ws, mut server) = connected_client().await;
        let be = code.to_be_bytes();
        server.write_all(&[0x88, 0x02, be[0], be[1]]).await.unwrap();

        let mut buf = [0u8; 8];
        let err = ws.receive(&mut buf).await.unwrap_err();
        assert!(matches!(err, Error::InvalidCloseCode(c) if c == code));
    }
}

#[tokio::test]
async fn fragments_reassemble_through_small_caller_buffers() {
    let (ws, mut server) = connected_client().await;
    let payload: Vec<u8> = (0..64u8).collect();

    // four binary fragments of 16 bytes each
    for (i, chunk) in payload.chunks(16).enumerate() {
        let fin = i == 3;
        let opcode = if i == 0 { 0x02 } else { 0x00 };
        let mut frame = vec![(fin as u8) << 7 | opcode, chunk.len() as u8];
        frame.extend_from_slice(chunk);
        server.write_all(&frame).await.unwrap();
    }

    let mut message = Vec::new();
    let mut buf = [0u8; 5];
    loop {
        let result = ws.receive(&mut buf).await.unwrap();
        assert_eq!(result.kind, MessageKind::Binary);
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            break;
        }
    }
    assert_eq!(message, payload);
}

#[tokio::test]
async fn frame_larger_than_the_receive_buffer_is_streamed() {
    let (ws, mut server) = connected_with_config(WebSocketConfig {
        receive_buffer_size: 14,
        ..Default::default()
    })
    .await;

    let payload: Vec<u8> = (0..100u8).collect();
    let mut frame = vec![0x82, payload.len() as u8];
    frame.extend_from_slice(&payload);
    server.write_all(&frame).await.unwrap();

    let mut message = Vec::new();
    let mut buf = [0u8; 32];
    loop {
        let result = ws.receive(&mut buf).await.unwrap();
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            break;
        }
    }
    assert_eq!(message, payload);
}

#[tokio::test]
async fn large_frame_with_64_bit_length_round_trips() {
    let (ws, mut server) = connected_client().await;
    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 251) as u8).collect();

    // Past 65535 bytes the length escapes to the 8-byte form. The writer runs
    // as its own task so the pipe can drain while it pushes.
    let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
            let mut frame = vec![0x82, 127];
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
            frame.extend_from_slice(&payload);
            server.write_all(&frame).await.unwrap();
            server
        })
    };

    let mut message = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let result = ws.receive(&mut buf).await.unwrap();
        assert_eq!(result.kind, MessageKind::Binary);
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            break;
        }
    }
    assert_eq!(message, payload);

    let _server = writer.await.unwrap();
}

#[tokio::test]
async fn zero_length_caller_buffer() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x82, 0x02, 0x01, 0x02]).await.unwrap();

    let mut empty = [0u8; 0];
    let result = ws.receive(&mut empty).await.unwrap();
    assert_eq!(result.count, 0);
    assert!(!result.end_of_message);

    let mut buf = [0u8; 4];
    let result = ws.receive(&mut buf).await.unwrap();
    assert_eq!(result.count, 2);
    assert!(result.end_of_message);

    // An empty final frame reports end-of-message even into an empty buffer
    server.write_all(&[0x82, 0x00]).await.unwrap();
    let result = ws.receive(&mut empty).await.unwrap();
    assert_eq!(result.count, 0);
    assert!(result.end_of_message);
}

#[tokio::test]
async fn utf8_state_survives_fragment_boundaries_and_control_frames() {
    let (ws, mut server) = connected_client().await;
    // "é" split down the middle of its two-byte sequence, with a Ping wedged
    // between the fragments
    server.write_all(&[0x01, 0x01, 0xC3]).await.unwrap();
    server.write_all(&[0x89, 0x00]).await.unwrap();
    server.write_all(&[0x80, 0x01, 0xA9]).await.unwrap();

    let mut message = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let result = ws.receive(&mut buf).await.unwrap();
        assert_eq!(result.kind, MessageKind::Text);
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            break;
        }
    }
    assert_eq!(message, "é".as_bytes());
}

#[tokio::test]
async fn invalid_utf8_in_text_fails_with_payload_error() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x81, 0x01, 0xFF]).await.unwrap();

    let mut buf = [0u8; 4];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPayloadData));

    // The best-effort Close carries 1007
    let mut wire = [0u8; 8];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x88, 0x82, 0x00, 0x00, 0x00, 0x00, 0x03, 0xEF]);
}

#[tokio::test]
async fn truncated_utf8_at_end_of_message_is_rejected() {
    let (ws, mut server) = connected_client().await;
    server.write_all(&[0x81, 0x01, 0xC3]).await.unwrap();

    let mut buf = [0u8; 4];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::InvalidPayloadData));
}

#[tokio::test]
async fn fragmented_send_uses_continuation_opcodes() {
    let (ws, mut server) = connected_client().await;
    ws.send(b"ab", MessageKind::Text, false).await.unwrap();
    ws.send(b"cd", MessageKind::Text, true).await.unwrap();

    let mut wire = [0u8; 16];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(
        wire,
        [
            0x01, 0x82, 0x00, 0x00, 0x00, 0x00, b'a', b'b', //
            0x80, 0x82, 0x00, 0x00, 0x00, 0x00, b'c', b'd',
        ]
    );
}

#[tokio::test]
async fn send_rejects_the_close_kind() {
    let (ws, _server) = connected_client().await;
    let err = ws.send(&[], MessageKind::Close, true).await.unwrap_err();
    assert!(matches!(err, Error::InvalidMessageType));
}

#[tokio::test]
async fn concurrent_sends_are_misuse() {
    let (ws, _server) = connected_with_config(WebSocketConfig::default()).await;
    let ws = Arc::new(ws);

    // A megabyte into a duplex pipe wedges the first send on backpressure
    let blocked = {
        let ws = Arc::clone(&ws);
        tokio::spawn(async move {
            let payload = vec![0u8; 1 << 20];
            ws.send(&payload, MessageKind::Binary, true).await
        })
    };
    tokio::task::yield_now().await;

    let err = ws.send(b"x", MessageKind::Text, true).await.unwrap_err();
    assert!(matches!(err, Error::SendInProgress));
    assert_eq!(ws.state(), ConnectionState::Aborted);

    let first = blocked.await.unwrap();
    assert!(matches!(first, Err(Error::Canceled)));
}

#[tokio::test]
async fn concurrent_receives_are_misuse() {
    let (ws, _server) = connected_client().await;
    let ws = Arc::new(ws);

    let blocked = {
        let ws = Arc::clone(&ws);
        tokio::spawn(async move {
            let mut buf = [0u8; 8];
            ws.receive(&mut buf).await.map(|result| result.count)
        })
    };
    tokio::task::yield_now().await;

    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::ReceiveInProgress));
    assert_eq!(ws.state(), ConnectionState::Aborted);

    let first = blocked.await.unwrap();
    assert!(matches!(first, Err(Error::Canceled)));
}

#[tokio::test]
async fn transport_eof_without_close_handshake_aborts() {
    let (ws, server) = connected_client().await;
    drop(server);

    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosedPrematurely));
    assert_eq!(ws.state(), ConnectionState::Aborted);
}

#[tokio::test]
async fn eof_in_the_middle_of_a_frame_aborts() {
    let (ws, mut server) = connected_client().await;
    // announces 5 payload bytes, delivers 1, then vanishes
    server.write_all(&[0x82, 0x05, 0x01]).await.unwrap();
    drop(server);

    let mut buf = [0u8; 8];
    let partial = ws.receive(&mut buf).await.unwrap();
    assert_eq!(partial.count, 1);
    assert!(!partial.end_of_message);

    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionClosedPrematurely));
    assert_eq!(ws.state(), ConnectionState::Aborted);
}

#[tokio::test]
async fn abort_is_idempotent_and_surfaces_as_state() {
    let (ws, _server) = connected_client().await;
    ws.abort();
    ws.abort();
    assert_eq!(ws.state(), ConnectionState::Aborted);

    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::InvalidState(ConnectionState::Aborted)));
}

#[tokio::test]
async fn dispose_is_idempotent_and_fails_later_operations() {
    let (ws, _server) = connected_client().await;
    ws.dispose();
    ws.dispose();
    assert_eq!(ws.state(), ConnectionState::Closed);

    let err = ws.send(b"x", MessageKind::Text, true).await.unwrap_err();
    assert!(matches!(err, Error::Disposed));
    let mut buf = [0u8; 8];
    let err = ws.receive(&mut buf).await.unwrap_err();
    assert!(matches!(err, Error::Disposed));
}

#[tokio::test]
async fn server_role_unmasks_ingress_and_sends_bare_frames() {
    let (ws, mut client) = connected_with_config(WebSocketConfig {
        role: Role::Server,
        ..Default::default()
    })
    .await;

    let mask = [0x01, 0x02, 0x03, 0x04];
    let payload = b"abcdefgh";
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    client.write_all(&frame).await.unwrap();

    // A 3-byte caller buffer forces the unmasking to roll across calls
    let mut message = Vec::new();
    let mut buf = [0u8; 3];
    loop {
        let result = ws.receive(&mut buf).await.unwrap();
        message.extend_from_slice(&buf[..result.count]);
        if result.end_of_message {
            break;
        }
    }
    assert_eq!(message, payload);

    ws.send(b"ok", MessageKind::Text, true).await.unwrap();
    let mut wire = [0u8; 4];
    client.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x81, 0x02, b'o', b'k']);
}

#[tokio::test]
async fn external_receive_buffer_is_validated() {
    let (local, _remote) = tokio::io::duplex(64);
    let result = WebSocket::from_stream(
        local,
        WebSocketConfig {
            receive_buffer: Some(vec![0; 8]),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(Error::InvalidBufferSize)));
}

#[tokio::test]
async fn subprotocol_is_exposed() {
    let (ws, _server) = connected_with_config(WebSocketConfig {
        subprotocol: Some("chat.v2".to_owned()),
        ..Default::default()
    })
    .await;
    assert_eq!(ws.subprotocol(), Some("chat.v2"));
}

#[tokio::test(start_paused = true)]
async fn keep_alive_pings_while_idle() {
    let (ws, mut server) = connected_with_config(WebSocketConfig {
        keep_alive_interval: Some(Duration::from_millis(100)),
        ..Default::default()
    })
    .await;

    let mut wire = [0u8; 6];
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x89, 0x80, 0x00, 0x00, 0x00, 0x00]);

    // Another tick, another ping
    server.read_exact(&mut wire).await.unwrap();
    assert_eq!(wire, [0x89, 0x80, 0x00, 0x00, 0x00, 0x00]);

    drop(ws);
}
