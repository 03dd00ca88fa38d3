use std::{
    io::Write,
    os::{
        fd::{AsFd, AsRawFd},
        unix::net::UnixStream,
    },
};

use nix::libc;
use pretty_assertions::assert_eq;

use super::{
    peek_routing_name,
    read_startup_request,
    StartupRequest,
    CANCEL_REQUEST_CODE,
    MAX_STARTUP_PACKET,
    PROTOCOL_VERSION_3,
    TLS_REQUEST_CODE,
};
use crate::error::ErrorKind;

pub(crate) fn startup_packet(pairs: &[(&str, &str)]) -> Vec<u8> {
    let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
    for (key, value) in pairs {
        body.extend_from_slice(key.as_bytes());
        body.push(0);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);

    let mut packet = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    packet.extend_from_slice(&body);
    packet
}

fn request_packet(code: u32) -> Vec<u8> {
    let mut packet = 8u32.to_be_bytes().to_vec();
    packet.extend_from_slice(&code.to_be_bytes());
    packet
}

fn loaded_socket(bytes: &[u8]) -> (UnixStream, UnixStream) {
    let (receiving, mut sending) = UnixStream::pair().unwrap();
    sending.write_all(bytes).unwrap();
    (receiving, sending)
}

#[test]
fn parses_a_regular_startup_packet() {
    let bytes = startup_packet(&[("user", "alice"), ("database", "app")]);
    let (socket, _keep) = loaded_socket(&bytes);

    let packet = match read_startup_request(socket.as_fd()).unwrap() {
        StartupRequest::Startup(packet) => packet,
        other => panic!("expected startup, got {:?}", other),
    };
    assert_eq!(packet.protocol, PROTOCOL_VERSION_3);
    assert_eq!(packet.database(), Some("app"));
    assert_eq!(packet.user(), Some("alice"));
    assert_eq!(packet.routing_name(), Some("app"));
    assert!(!packet.wants_replication());
}

#[test]
fn routing_name_falls_back_to_the_user() {
    let bytes = startup_packet(&[("user", "bob")]);
    let (socket, _keep) = loaded_socket(&bytes);

    let StartupRequest::Startup(packet) = read_startup_request(socket.as_fd()).unwrap() else {
        panic!("expected startup");
    };
    assert_eq!(packet.routing_name(), Some("bob"));
}

#[test]
fn classifies_negotiation_and_cancel_requests() {
    for (code, expect_tls, expect_cancel) in [
        (TLS_REQUEST_CODE, true, false),
        (CANCEL_REQUEST_CODE, false, true),
    ] {
        let (socket, _keep) = loaded_socket(&request_packet(code));
        let request = read_startup_request(socket.as_fd()).unwrap();
        assert_eq!(matches!(request, StartupRequest::Tls), expect_tls);
        assert_eq!(matches!(request, StartupRequest::Cancel), expect_cancel);
    }
}

#[test]
fn rejects_out_of_range_lengths() {
    for len in [4u32, (MAX_STARTUP_PACKET as u32) + 1] {
        let mut bytes = len.to_be_bytes().to_vec();
        bytes.extend_from_slice(&PROTOCOL_VERSION_3.to_be_bytes());
        let (socket, _keep) = loaded_socket(&bytes);

        let err = read_startup_request(socket.as_fd()).unwrap_err();
        assert!(matches!(
            err.kind.as_ref(),
            ErrorKind::StartupMalformed { .. }
        ));
    }
}

#[test]
fn rejects_a_packet_without_terminator() {
    let mut body = PROTOCOL_VERSION_3.to_be_bytes().to_vec();
    body.extend_from_slice(b"user\0alice\0");
    // Final NUL deliberately missing.
    let mut bytes = ((body.len() + 4) as u32).to_be_bytes().to_vec();
    bytes.extend_from_slice(&body);
    let (socket, _keep) = loaded_socket(&bytes);

    let err = read_startup_request(socket.as_fd()).unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::StartupMalformed { .. }
    ));
}

#[test]
fn rejects_truncated_packets_as_malformed() {
    let bytes = startup_packet(&[("user", "alice")]);
    let (socket, sending) = loaded_socket(&bytes[..bytes.len() - 3]);
    drop(sending);

    let err = read_startup_request(socket.as_fd()).unwrap_err();
    assert!(matches!(
        err.kind.as_ref(),
        ErrorKind::StartupMalformed { .. }
    ));
}

#[test]
fn peek_extracts_the_database_without_consuming_bytes() {
    let bytes = startup_packet(&[("database", "app"), ("user", "alice")]);
    let (socket, _keep) = loaded_socket(&bytes);

    assert_eq!(
        peek_routing_name(socket.as_fd()).unwrap().as_deref(),
        Some("app")
    );
    // Non-destructive: the full packet is still there for the worker.
    let StartupRequest::Startup(packet) = read_startup_request(socket.as_fd()).unwrap() else {
        panic!("expected startup");
    };
    assert_eq!(packet.database(), Some("app"));
}

#[test]
fn peek_restores_blocking_mode() {
    let bytes = startup_packet(&[("database", "app")]);
    let (socket, _keep) = loaded_socket(&bytes);

    peek_routing_name(socket.as_fd()).unwrap();
    let flags = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_GETFL) };
    assert_eq!(flags & libc::O_NONBLOCK, 0);
}

#[test]
fn peek_falls_back_to_the_user_name() {
    let bytes = startup_packet(&[("user", "bob")]);
    let (socket, _keep) = loaded_socket(&bytes);
    assert_eq!(
        peek_routing_name(socket.as_fd()).unwrap().as_deref(),
        Some("bob")
    );
}

#[test]
fn peek_refuses_negotiation_cancel_and_replication() {
    for bytes in [
        request_packet(TLS_REQUEST_CODE),
        request_packet(super::CREDENTIAL_REQUEST_CODE),
        request_packet(CANCEL_REQUEST_CODE),
        startup_packet(&[("user", "alice"), ("replication", "true")]),
    ] {
        let (socket, _keep) = loaded_socket(&bytes);
        assert_eq!(peek_routing_name(socket.as_fd()).unwrap(), None);
    }
}

#[test]
fn peek_refuses_when_no_bytes_are_buffered() {
    let (socket, _keep) = UnixStream::pair().unwrap();
    assert_eq!(peek_routing_name(socket.as_fd()).unwrap(), None);
}
