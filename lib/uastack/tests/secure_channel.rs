//! End-to-end channel tests over the deterministic Signed16 policy:
//! sign/encrypt round-trips, corruption detection and token rotation.

use uabase::status::StatusCode;
use uabase::time;
use uabase::types::NodeId;
use uastack::channel::{SecureChannelState, SecurityMode};
use uastack::frame::MessageType;
use uastack::testing::{open_signed_pair, test_token};

fn echo_type() -> NodeId {
    NodeId::numeric(0, 1)
}

#[test]
fn sign_and_encrypt_roundtrip() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    let body = [0xDEu8, 0xAD, 0xBE, 0xEF];
    client
        .send_message(1, MessageType::Msg, &echo_type(), &body)
        .unwrap();

    let chunks = client.take_output();
    assert_eq!(chunks.len(), 1);
    // the encrypted chunk must not contain the plaintext body
    assert!(!chunks[0]
        .windows(body.len())
        .any(|window| window == &body[..]));

    let mut messages = Vec::new();
    for chunk in chunks {
        messages.extend(server.process(&chunk, now).unwrap());
    }
    assert_eq!(messages.len(), 1);

    let mut stream = &messages[0].body[..];
    assert_eq!(NodeId::decode(&mut stream).unwrap(), echo_type());
    assert_eq!(stream, &body);
}

#[test]
fn sign_only_roundtrip() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::Sign);
    let now = time::now_monotonic();

    let body: Vec<u8> = (0..100).collect();
    client
        .send_message(3, MessageType::Msg, &echo_type(), &body)
        .unwrap();

    let mut messages = Vec::new();
    for chunk in client.take_output() {
        messages.extend(server.process(&chunk, now).unwrap());
    }
    assert_eq!(messages.len(), 1);

    let mut stream = &messages[0].body[..];
    NodeId::decode(&mut stream).unwrap();
    assert_eq!(stream, &body[..]);
}

#[test]
fn both_directions_roundtrip() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    client
        .send_message(1, MessageType::Msg, &echo_type(), b"ping")
        .unwrap();
    for chunk in client.take_output() {
        server.process(&chunk, now).unwrap();
    }

    server
        .send_message(1, MessageType::Msg, &echo_type(), b"pong")
        .unwrap();
    let mut messages = Vec::new();
    for chunk in server.take_output() {
        messages.extend(client.process(&chunk, now).unwrap());
    }
    assert_eq!(messages.len(), 1);
    let mut stream = &messages[0].body[..];
    NodeId::decode(&mut stream).unwrap();
    assert_eq!(stream, b"pong");
}

#[test]
fn chunked_encrypted_message_reassembles() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    // larger than one 64 KiB send buffer, forcing multiple chunks
    let body: Vec<u8> = (0..100_000u32).map(|value| value as u8).collect();
    client
        .send_message(11, MessageType::Msg, &echo_type(), &body)
        .unwrap();

    let chunks = client.take_output();
    assert!(chunks.len() > 1);
    assert_eq!(chunks.last().unwrap()[3], b'F');
    for chunk in &chunks[..chunks.len() - 1] {
        assert_eq!(chunk[3], b'C');
    }

    let mut messages = Vec::new();
    for chunk in chunks {
        messages.extend(server.process(&chunk, now).unwrap());
    }
    assert_eq!(messages.len(), 1);

    let mut stream = &messages[0].body[..];
    NodeId::decode(&mut stream).unwrap();
    assert_eq!(stream.len(), body.len());
    assert_eq!(stream, &body[..]);
}

#[test]
fn corrupted_ciphertext_is_rejected_without_err() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    client
        .send_message(1, MessageType::Msg, &echo_type(), b"sensitive")
        .unwrap();
    let mut chunks = client.take_output();

    // flip one byte inside the encrypted region
    let flip_at = 20;
    chunks[0][flip_at] ^= 0xFF;

    let err = server.process(&chunks[0], now).unwrap_err();
    assert_eq!(err, StatusCode::BAD_SECURITY_CHECKS_FAILED);
    // no application callback and no ERR chunk for security failures
    assert!(server.take_output().is_empty());
    assert_eq!(server.state(), SecureChannelState::Closing);
}

#[test]
fn corrupted_signature_is_rejected() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::Sign);
    let now = time::now_monotonic();

    client
        .send_message(1, MessageType::Msg, &echo_type(), b"payload")
        .unwrap();
    let mut chunks = client.take_output();

    let last = chunks[0].len() - 1;
    chunks[0][last] ^= 0x01;

    let err = server.process(&chunks[0], now).unwrap_err();
    assert_eq!(err, StatusCode::BAD_SECURITY_CHECKS_FAILED);
    assert!(server.take_output().is_empty());
}

#[test]
fn opn_asymmetric_roundtrip() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    let opn_body = b"renew-secure-channel-request";
    client.send_open(7, opn_body).unwrap();

    let chunks = client.take_output();
    assert_eq!(chunks.len(), 1);
    assert_eq!(&chunks[0][..4], b"OPNF");
    // the body is encrypted on the wire
    assert!(!chunks[0]
        .windows(opn_body.len())
        .any(|window| window == &opn_body[..]));

    let messages = server.process(&chunks[0], now).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message_type, MessageType::Opn);
    assert_eq!(messages[0].request_id, 7);
    assert_eq!(&messages[0].body[..], &opn_body[..]);
}

#[test]
fn corrupted_opn_is_rejected() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();

    client.send_open(7, b"renew").unwrap();
    let mut chunks = client.take_output();
    let last = chunks[0].len() - 5;
    chunks[0][last] ^= 0x80;

    let err = server.process(&chunks[0], now).unwrap_err();
    assert_eq!(err, StatusCode::BAD_SECURITY_CHECKS_FAILED);
}

#[test]
fn token_rotation_accepts_previous_within_grace() {
    // S6: the side that completed the renewal switches on its next send;
    // chunks still protected by the previous token are accepted inbound
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();
    let first_token = *client.current_token();

    // client prepares the renewal nonce (rides in its OPN request)
    let client_nonce = client.generate_local_nonce().unwrap().clone();

    // the server issues the new token and completes the renewal first
    let renewed = test_token(first_token.channel_id, 2, now);
    let server_nonce = server.generate_local_nonce().unwrap().clone();
    server.complete_open(renewed, client_nonce, now).unwrap();

    // the server's next send revolves: current <- next
    server
        .send_message(1, MessageType::Msg, &echo_type(), b"renewed")
        .unwrap();
    let server_chunks = server.take_output();
    assert_eq!(server.current_token().token_id, 2);
    assert_eq!(server.previous_token().token_id, first_token.token_id);

    // the client has not processed the response yet and keeps sending
    // under the previous token; the server accepts it in the grace window
    client
        .send_message(2, MessageType::Msg, &echo_type(), b"late")
        .unwrap();
    let late_chunks = client.take_output();
    let messages = server.process(&late_chunks[0], now).unwrap();
    assert_eq!(messages.len(), 1);
    let mut stream = &messages[0].body[..];
    NodeId::decode(&mut stream).unwrap();
    assert_eq!(stream, b"late");

    // once the client completes the renewal, the server's new-token chunk
    // revolves the client as well
    client.complete_open(renewed, server_nonce, now).unwrap();
    let messages = client.process(&server_chunks[0], now).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(client.current_token().token_id, 2);

    let mut stream = &messages[0].body[..];
    NodeId::decode(&mut stream).unwrap();
    assert_eq!(stream, b"renewed");
}

#[test]
fn previous_token_rejected_after_grace() {
    let (mut client, mut server) = open_signed_pair(SecurityMode::SignAndEncrypt);
    let now = time::now_monotonic();
    let first_token = *client.current_token();

    let client_nonce = client.generate_local_nonce().unwrap().clone();
    let renewed = test_token(first_token.channel_id, 2, now);
    server.generate_local_nonce().unwrap();
    server.complete_open(renewed, client_nonce, now).unwrap();

    // server revolves on send
    server
        .send_message(1, MessageType::Msg, &echo_type(), b"renewed")
        .unwrap();
    server.take_output();

    client
        .send_message(2, MessageType::Msg, &echo_type(), b"too-late")
        .unwrap();
    let late_chunks = client.take_output();

    // 1.25 x 600s lifetime is 750s; arrive later than that
    let too_late = now + time::from_ms(800_000);
    let err = server.process(&late_chunks[0], too_late).unwrap_err();
    assert_eq!(err, StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN);
}
