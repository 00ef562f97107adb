// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Frame encoding/decoding tests for relaypool-protocol.

use bytes::Bytes;
use relaypool_protocol::frame::{
    Flags, Frame, FrameError, HEADER_SIZE, MAX_FRAME_SIZE, PROTOCOL_VERSION, read_frame,
    write_frame,
};
use relaypool_protocol::{Payload, PidCommand, StopCommand};

// ============================================================================
// Constants
// ============================================================================

#[test]
fn test_header_size_constant() {
    // 1 byte version + 1 byte flags + 4 bytes context length + 4 bytes body length
    assert_eq!(HEADER_SIZE, 10);
}

#[test]
fn test_max_frame_size_constant() {
    assert_eq!(MAX_FRAME_SIZE, 64 * 1024 * 1024);
}

// ============================================================================
// Frame construction
// ============================================================================

#[test]
fn test_data_frame_keeps_context_and_body() {
    let payload = Payload::new("headers", "hello");
    let frame = Frame::data(&payload);

    assert_eq!(frame.flags, Flags::DATA);
    assert!(!frame.is_control());
    assert!(!frame.is_error());
    assert_eq!(frame.into_payload(), payload);
}

#[test]
fn test_error_frame() {
    let frame = Frame::error("bad input");
    assert!(frame.is_error());
    assert!(frame.context.is_empty());
    assert_eq!(frame.body, Bytes::from_static(b"bad input"));
}

#[test]
fn test_control_frame_json_context() {
    let frame = Frame::control(&PidCommand { pid: 1234 }).unwrap();
    assert!(frame.is_control());
    assert_eq!(frame.context, Bytes::from_static(br#"{"pid":1234}"#));

    let decoded: PidCommand = frame.decode_control().unwrap();
    assert_eq!(decoded.pid, 1234);
}

#[test]
fn test_stop_command_encoding() {
    let frame = Frame::control(&StopCommand::new()).unwrap();
    assert_eq!(frame.context, Bytes::from_static(br#"{"stop":true}"#));
}

// ============================================================================
// Encoding edge cases
// ============================================================================

#[test]
fn test_empty_frame_is_header_only() {
    let frame = Frame::data(&Payload::default());
    let encoded = frame.encode().unwrap();
    assert_eq!(encoded.len(), HEADER_SIZE);
    assert_eq!(encoded[0], PROTOCOL_VERSION);
}

#[test]
fn test_oversized_frame_rejected_on_encode() {
    let frame = Frame {
        flags: Flags::DATA,
        context: Bytes::new(),
        body: Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]),
    };
    assert!(matches!(
        frame.encode(),
        Err(FrameError::FrameTooLarge(size)) if size == MAX_FRAME_SIZE + 1
    ));
}

#[test]
fn test_oversized_header_rejected_on_decode() {
    let mut raw = vec![PROTOCOL_VERSION, 0];
    raw.extend_from_slice(&0u32.to_be_bytes());
    raw.extend_from_slice(&((MAX_FRAME_SIZE as u32) + 1).to_be_bytes());

    let result = Frame::decode_from_bytes(Bytes::from(raw));
    assert!(matches!(result, Err(FrameError::FrameTooLarge(_))));
}

#[test]
fn test_truncated_payload_rejected() {
    let encoded = Frame::data(&Payload::from_body("truncated")).encode().unwrap();
    let cut = encoded.slice(..encoded.len() - 3);

    let result = Frame::decode_from_bytes(cut);
    assert!(matches!(result, Err(FrameError::Io(_))));
}

#[test]
fn test_unknown_flags_rejected() {
    let mut raw = Frame::data(&Payload::from_body("x")).encode().unwrap().to_vec();
    raw[1] = 0x10;

    let result = Frame::decode_from_bytes(Bytes::from(raw));
    assert!(matches!(result, Err(FrameError::InvalidFlags(0x10))));
}

#[test]
fn test_binary_body_survives_encoding() {
    let body: Vec<u8> = (0..=255u8).collect();
    let frame = Frame::data(&Payload::new(Bytes::new(), body.clone()));
    let decoded = Frame::decode_from_bytes(frame.encode().unwrap()).unwrap();
    assert_eq!(decoded.body.as_ref(), body.as_slice());
}

// ============================================================================
// Async read/write
// ============================================================================

#[tokio::test]
async fn test_write_then_read_sequence() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    write_frame(&mut client, &Frame::data(&Payload::new("c1", "b1")))
        .await
        .unwrap();
    write_frame(&mut client, &Frame::error("failed")).await.unwrap();

    let first = read_frame(&mut server).await.unwrap();
    let second = read_frame(&mut server).await.unwrap();

    assert_eq!(first.into_payload(), Payload::new("c1", "b1"));
    assert!(second.is_error());
}

#[tokio::test]
async fn test_read_after_peer_closed() {
    let (client, mut server) = tokio::io::duplex(64);
    drop(client);

    let result = read_frame(&mut server).await;
    assert!(matches!(result, Err(FrameError::ConnectionClosed)));
}

#[tokio::test]
async fn test_frame_larger_than_duplex_buffer() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let body = vec![7u8; 4096];
    let expected = body.clone();

    let writer = tokio::spawn(async move {
        write_frame(&mut client, &Frame::data(&Payload::from_body(body)))
            .await
            .unwrap();
    });

    let frame = read_frame(&mut server).await.unwrap();
    writer.await.unwrap();
    assert_eq!(frame.body.as_ref(), expected.as_slice());
}
