//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock as Lazy;

use corvus_bgp::packet::consts::{
    Afi, BGP_VERSION, GrAfiSafiFlags, GrFlags, Safi,
};
use corvus_bgp::packet::message::{
    AddPathTuple, Capability, GrTuple, Message, OpenMsg,
};
use corvus_bgp::packet::consts::AddPathMode;

use super::{test_decode_msg, test_encode_msg};

static OPEN1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x1d, 0x01, 0x04, 0x00, 0x01,
            0x00, 0xb4, 0x01, 0x01, 0x01, 0x01, 0x00,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 1,
            holdtime: 180,
            identifier: Ipv4Addr::from_str("1.1.1.1").unwrap(),
            capabilities: [].into(),
        }),
    )
});

static OPEN2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x25, 0x01, 0x04, 0x00, 0x01,
            0x00, 0xb4, 0x01, 0x01, 0x01, 0x01, 0x08, 0x02, 0x06, 0x01, 0x04,
            0x00, 0x01, 0x00, 0x01,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 1,
            holdtime: 180,
            identifier: Ipv4Addr::from_str("1.1.1.1").unwrap(),
            capabilities: [Capability::MultiProtocol {
                afi: Afi::Ipv4,
                safi: Safi::Unicast,
            }]
            .into(),
        }),
    )
});

static OPEN3: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3d, 0x01, 0x04, 0x00, 0x01,
            0x00, 0xb4, 0x01, 0x01, 0x01, 0x01, 0x20,
            // Multiprotocol: IPv4 unicast.
            0x02, 0x06, 0x01, 0x04, 0x00, 0x01, 0x00, 0x01,
            // Multiprotocol: IPv6 unicast.
            0x02, 0x06, 0x01, 0x04, 0x00, 0x02, 0x00, 0x01,
            // Route refresh.
            0x02, 0x02, 0x02, 0x00,
            // Four-octet AS number.
            0x02, 0x06, 0x41, 0x04, 0x00, 0x01, 0x00, 0x0e,
            // Enhanced route refresh.
            0x02, 0x02, 0x46, 0x00,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 1,
            holdtime: 180,
            identifier: Ipv4Addr::from_str("1.1.1.1").unwrap(),
            capabilities: [
                Capability::MultiProtocol {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                },
                Capability::MultiProtocol {
                    afi: Afi::Ipv6,
                    safi: Safi::Unicast,
                },
                Capability::FourOctetAsNumber { asn: 65550 },
                Capability::RouteRefresh,
                Capability::EnhancedRouteRefresh,
            ]
            .into(),
        }),
    )
});

static OPEN4: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3f, 0x01, 0x04, 0xfd, 0xe9,
            0x00, 0xb4, 0x01, 0x01, 0x01, 0x01, 0x22,
            // Multiprotocol: IPv4 unicast.
            0x02, 0x06, 0x01, 0x04, 0x00, 0x01, 0x00, 0x01,
            // Graceful restart: restarting, time 120, IPv4 unicast with
            // forwarding preserved.
            0x02, 0x08, 0x40, 0x06, 0x80, 0x78, 0x00, 0x01, 0x01, 0x80,
            // Four-octet AS number.
            0x02, 0x06, 0x41, 0x04, 0x00, 0x00, 0xfd, 0xe9,
            // ADD-PATH: IPv4 unicast, send and receive.
            0x02, 0x06, 0x45, 0x04, 0x00, 0x01, 0x01, 0x03,
        ],
        Message::Open(OpenMsg {
            version: BGP_VERSION,
            my_as: 65001,
            holdtime: 180,
            identifier: Ipv4Addr::from_str("1.1.1.1").unwrap(),
            capabilities: [
                Capability::MultiProtocol {
                    afi: Afi::Ipv4,
                    safi: Safi::Unicast,
                },
                Capability::GracefulRestart {
                    flags: GrFlags::RESTART,
                    restart_time: 120,
                    families: vec![GrTuple {
                        afi: Afi::Ipv4,
                        safi: Safi::Unicast,
                        flags: GrAfiSafiFlags::FORWARDING,
                    }],
                },
                Capability::FourOctetAsNumber { asn: 65001 },
                Capability::AddPath(
                    [AddPathTuple {
                        afi: Afi::Ipv4,
                        safi: Safi::Unicast,
                        mode: AddPathMode::ReceiveSend,
                    }]
                    .into(),
                ),
            ]
            .into(),
        }),
    )
});

#[test]
fn test_encode_open1() {
    let (ref bytes, ref msg) = *OPEN1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open1() {
    let (ref bytes, ref msg) = *OPEN1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_open2() {
    let (ref bytes, ref msg) = *OPEN2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open2() {
    let (ref bytes, ref msg) = *OPEN2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_open3() {
    let (ref bytes, ref msg) = *OPEN3;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open3() {
    let (ref bytes, ref msg) = *OPEN3;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_open4() {
    let (ref bytes, ref msg) = *OPEN4;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_open4() {
    let (ref bytes, ref msg) = *OPEN4;
    test_decode_msg(bytes, msg);
}

// An unknown capability code is retained verbatim rather than aborting
// the session (RFC 5492).
#[test]
fn test_decode_open_unknown_capability() {
    use bytes::Bytes;

    let bytes = vec![
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x23, 0x01, 0x04, 0x00, 0x01,
        0x00, 0xb4, 0x01, 0x01, 0x01, 0x01, 0x06, 0x02, 0x04, 0xee, 0x02,
        0xbe, 0xef,
    ];
    let msg = Message::Open(OpenMsg {
        version: BGP_VERSION,
        my_as: 1,
        holdtime: 180,
        identifier: Ipv4Addr::from_str("1.1.1.1").unwrap(),
        capabilities: [Capability::Unknown {
            code: 0xee,
            value: Bytes::from_static(&[0xbe, 0xef]),
        }]
        .into(),
    });
    test_decode_msg(&bytes, &msg);
}
