//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use corvus_bgp::packet::consts::{
    CeaseSubcode, ErrorCode, MessageHeaderErrorSubcode,
};
use corvus_bgp::packet::message::{Message, NotificationMsg};

use super::{test_decode_msg, test_encode_msg};

static NOTIFICATION1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x03, 0x01, 0x02, 0xff,
            0xff,
        ],
        Message::Notification(NotificationMsg {
            error_code: ErrorCode::MessageHeaderError as u8,
            error_subcode: MessageHeaderErrorSubcode::BadMessageLength as u8,
            data: vec![0xff, 0xff],
        }),
    )
});

// Cease / Administrative Shutdown carrying an RFC 9003 Shutdown
// Communication.
static NOTIFICATION2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x2e, 0x03, 0x06, 0x02, 0x18,
            b'p', b'l', b'a', b'n', b'n', b'e', b'd', b' ', b'm', b'a', b'i',
            b'n', b't', b'e', b'n', b'a', b'n', b'c', b'e', b' ', b'4', b'h',
            b'r', b's',
        ],
        Message::Notification(NotificationMsg::new_with_communication(
            CeaseSubcode::AdministrativeShutdown,
            "planned maintenance 4hrs",
        )),
    )
});

#[test]
fn test_encode_notification1() {
    let (ref bytes, ref msg) = *NOTIFICATION1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_notification1() {
    let (ref bytes, ref msg) = *NOTIFICATION1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_notification2() {
    let (ref bytes, ref msg) = *NOTIFICATION2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_notification2() {
    let (ref bytes, ref msg) = *NOTIFICATION2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_shutdown_communication() {
    let (_, ref msg) = *NOTIFICATION2;
    let msg = msg.as_notification().unwrap();
    assert_eq!(
        msg.shutdown_communication().as_deref(),
        Some("planned maintenance 4hrs")
    );

    // Non-administrative subcodes carry no communication.
    let (_, ref msg) = *NOTIFICATION1;
    let msg = msg.as_notification().unwrap();
    assert_eq!(msg.shutdown_communication(), None);
}
