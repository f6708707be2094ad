//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::LazyLock as Lazy;

use corvus_bgp::packet::consts::{Afi, RouteRefreshSubtype, Safi};
use corvus_bgp::packet::message::{Message, RouteRefreshMsg};

use super::{test_decode_msg, test_encode_msg};

static ROUTE_REFRESH1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x05, 0x00, 0x01, 0x00,
            0x01,
        ],
        Message::RouteRefresh(RouteRefreshMsg::new(
            Afi::Ipv4,
            Safi::Unicast,
            RouteRefreshSubtype::Normal,
        )),
    )
});

// Begin-of-RR marker (RFC 7313).
static ROUTE_REFRESH2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x05, 0x00, 0x02, 0x01,
            0x01,
        ],
        Message::RouteRefresh(RouteRefreshMsg::new(
            Afi::Ipv6,
            Safi::Unicast,
            RouteRefreshSubtype::Begin,
        )),
    )
});

#[test]
fn test_encode_route_refresh1() {
    let (ref bytes, ref msg) = *ROUTE_REFRESH1;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_route_refresh1() {
    let (ref bytes, ref msg) = *ROUTE_REFRESH1;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_encode_route_refresh2() {
    let (ref bytes, ref msg) = *ROUTE_REFRESH2;
    test_encode_msg(bytes, msg);
}

#[test]
fn test_decode_route_refresh2() {
    let (ref bytes, ref msg) = *ROUTE_REFRESH2;
    test_decode_msg(bytes, msg);
}

#[test]
fn test_route_refresh_family() {
    let (_, ref msg) = *ROUTE_REFRESH1;
    let msg = msg.as_route_refresh().unwrap();
    assert_eq!(msg.family(), Some((Afi::Ipv4, Safi::Unicast)));
}
