//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::LazyLock as Lazy;

use corvus_bgp::neighbor::PeerType;
use corvus_bgp::packet::attribute::{
    AsPath, AsPathSegment, Attrs, Comm, Comms, ExtComm, ExtComms,
};
use corvus_bgp::packet::consts::{AsPathSegmentType, Origin};
use corvus_bgp::packet::message::{
    DecodeCxt, EncodeCxt, Message, MpReachNlri, NegotiatedCapability,
    ReachNlri, UpdateMsg,
};
use corvus_bgp::packet::nlri::{
    InetNlri, Label, Labels, Nlri, RouteDistinguisher, VpnNlri,
};
use ipnetwork::IpNetwork;

//
// Helper functions.
//
// UPDATE fixtures model an eBGP session with AS 65001 so that the
// first-AS check and the LOCAL_PREF requirements stay out of the way.
//

fn test_encode_update(bytes_expected: &[u8], msg: &Message) {
    let cxt = EncodeCxt {
        capabilities: [NegotiatedCapability::FourOctetAsNumber].into(),
    };

    let bytes_actual = msg.encode(&cxt);
    assert_eq!(
        bytes_expected,
        bytes_actual.as_ref(),
        "expected {bytes_expected:02x?}, got {:02x?}",
        bytes_actual.as_ref(),
    );
}

fn decode_update(bytes: &[u8]) -> UpdateMsg {
    let cxt = DecodeCxt {
        peer_type: PeerType::External,
        peer_as: 65001,
        capabilities: [NegotiatedCapability::FourOctetAsNumber].into(),
    };

    let msg_size = Message::get_message_len(bytes)
        .expect("Buffer doesn't contain a full BGP message");
    let msg = Message::decode(&bytes[0..msg_size], &cxt).unwrap();
    msg.into_update().unwrap()
}

fn test_decode_update(bytes: &[u8], msg_expected: &Message) {
    let msg_actual = decode_update(bytes);
    assert_eq!(*msg_expected.as_update().unwrap(), msg_actual);
}

fn as_path(asns: &[u32]) -> AsPath {
    if asns.is_empty() {
        return AsPath::default();
    }
    AsPath {
        segments: [AsPathSegment {
            seg_type: AsPathSegmentType::Sequence,
            members: asns.iter().copied().collect(),
        }]
        .into(),
    }
}

fn v4_unicast(prefix: &str) -> Nlri {
    Nlri::Unicast(InetNlri {
        prefix: IpNetwork::from_str(prefix).unwrap(),
        path_id: None,
    })
}

// IPv4-unicast End-of-RIB: header plus empty withdrawn-routes and
// path-attribute sections, 23 bytes on the wire.
static UPDATE1: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x02, 0x00, 0x00, 0x00,
            0x00,
        ],
        Message::Update(UpdateMsg::default()),
    )
});

// eBGP announcement of 10.0.0.0/24, nexthop 10.0.255.1, community
// 30740:30740.
static UPDATE2: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    let mut attrs = Attrs::new(Origin::Igp, as_path(&[65001]));
    attrs.comm = Some(Comms::new([Comm(0x78147814)]));

    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x36, 0x02,
            // Withdrawn routes length.
            0x00, 0x00,
            // Total path attribute length.
            0x00, 0x1b,
            // ORIGIN: IGP.
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH: sequence of one four-octet ASN.
            0x40, 0x02, 0x06, 0x02, 0x01, 0x00, 0x00, 0xfd, 0xe9,
            // NEXT_HOP: 10.0.255.1.
            0x40, 0x03, 0x04, 0x0a, 0x00, 0xff, 0x01,
            // COMMUNITIES: 30740:30740.
            0xc0, 0x08, 0x04, 0x78, 0x14, 0x78, 0x14,
            // NLRI: 10.0.0.0/24.
            0x18, 0x0a, 0x00, 0x00,
        ],
        Message::Update(UpdateMsg {
            reach: Some(ReachNlri {
                prefixes: vec![v4_unicast("10.0.0.0/24")],
                nexthop: Ipv4Addr::from_str("10.0.255.1").unwrap(),
            }),
            attrs: Some(attrs),
            ..Default::default()
        }),
    )
});

// IPv6 unicast announcement through MP_REACH_NLRI.
static UPDATE3: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    let attrs = Attrs::new(Origin::Igp, as_path(&[65001]));

    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x41, 0x02,
            // Withdrawn routes length.
            0x00, 0x00,
            // Total path attribute length.
            0x00, 0x2a,
            // MP_REACH_NLRI: IPv6 unicast, nexthop 2001:db8::1,
            // prefix 2001:db8::/32.
            0x80, 0x0e, 0x1a, 0x00, 0x02, 0x01, 0x10, 0x20, 0x01, 0x0d, 0xb8,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x01, 0x00, 0x20, 0x20, 0x01, 0x0d, 0xb8,
            // ORIGIN: IGP.
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH: sequence of one four-octet ASN.
            0x40, 0x02, 0x06, 0x02, 0x01, 0x00, 0x00, 0xfd, 0xe9,
        ],
        Message::Update(UpdateMsg {
            mp_reach: Some(MpReachNlri {
                afi: corvus_bgp::packet::consts::Afi::Ipv6,
                safi: corvus_bgp::packet::consts::Safi::Unicast,
                nexthop: IpAddr::V6(
                    Ipv6Addr::from_str("2001:db8::1").unwrap(),
                ),
                ll_nexthop: None,
                prefixes: vec![Nlri::Unicast(InetNlri {
                    prefix: IpNetwork::from_str("2001:db8::/32").unwrap(),
                    path_id: None,
                })],
            }),
            attrs: Some(attrs),
            ..Default::default()
        }),
    )
});

// VPN-IPv4 announcement: label 100, route distinguisher 65001:1.
static UPDATE4: Lazy<(Vec<u8>, Message)> = Lazy::new(|| {
    let mut attrs = Attrs::new(Origin::Igp, as_path(&[65001]));
    attrs.ext_comm = Some(ExtComms::new([ExtComm([
        0x00, 0x02, 0xfd, 0xe9, 0x00, 0x00, 0x00, 0x64,
    ])]));

    (
        vec![
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x52, 0x02,
            // Withdrawn routes length.
            0x00, 0x00,
            // Total path attribute length.
            0x00, 0x3b,
            // MP_REACH_NLRI: VPN-IPv4, RD-prefixed nexthop 10.0.255.1,
            // NLRI label 100 / RD 65001:1 / 10.0.0.0/24.
            0x80, 0x0e, 0x20, 0x00, 0x01, 0x80, 0x0c, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x0a, 0x00, 0xff, 0x01, 0x00, 0x70, 0x00,
            0x06, 0x41, 0x00, 0x00, 0xfd, 0xe9, 0x00, 0x00, 0x00, 0x01, 0x0a,
            0x00, 0x00,
            // ORIGIN: IGP.
            0x40, 0x01, 0x01, 0x00,
            // AS_PATH: sequence of one four-octet ASN.
            0x40, 0x02, 0x06, 0x02, 0x01, 0x00, 0x00, 0xfd, 0xe9,
            // EXTENDED COMMUNITIES: route target 65001:100.
            0xc0, 0x10, 0x08, 0x00, 0x02, 0xfd, 0xe9, 0x00, 0x00, 0x00, 0x64,
        ],
        Message::Update(UpdateMsg {
            mp_reach: Some(MpReachNlri {
                afi: corvus_bgp::packet::consts::Afi::Ipv4,
                safi: corvus_bgp::packet::consts::Safi::LabeledVpn,
                nexthop: IpAddr::V4(
                    Ipv4Addr::from_str("10.0.255.1").unwrap(),
                ),
                ll_nexthop: None,
                prefixes: vec![Nlri::LabeledVpn(VpnNlri {
                    prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
                    path_id: None,
                    labels: Labels(vec![Label(100)]),
                    rd: RouteDistinguisher::from_asn2(65001, 1),
                })],
            }),
            attrs: Some(attrs),
            ..Default::default()
        }),
    )
});

#[test]
fn test_encode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_encode_update(bytes, msg);
}

#[test]
fn test_decode_update1() {
    let (ref bytes, ref msg) = *UPDATE1;
    test_decode_update(bytes, msg);
}

#[test]
fn test_update1_is_eor() {
    let (ref bytes, _) = *UPDATE1;
    let msg = decode_update(bytes);
    assert_eq!(
        msg.is_eor(),
        Some((
            corvus_bgp::packet::consts::Afi::Ipv4,
            corvus_bgp::packet::consts::Safi::Unicast
        ))
    );
}

#[test]
fn test_encode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_encode_update(bytes, msg);
}

#[test]
fn test_decode_update2() {
    let (ref bytes, ref msg) = *UPDATE2;
    test_decode_update(bytes, msg);
}

#[test]
fn test_encode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_encode_update(bytes, msg);
}

#[test]
fn test_decode_update3() {
    let (ref bytes, ref msg) = *UPDATE3;
    test_decode_update(bytes, msg);
}

#[test]
fn test_encode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_encode_update(bytes, msg);
}

#[test]
fn test_decode_update4() {
    let (ref bytes, ref msg) = *UPDATE4;
    test_decode_update(bytes, msg);
}

// A malformed AS_PATH (segment count pointing past the attribute end)
// converts the announced prefixes into withdrawals instead of tearing
// down the session (RFC 7606).
#[test]
fn test_decode_treat_as_withdraw() {
    let bytes = vec![
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x2e, 0x02,
        // Withdrawn routes length.
        0x00, 0x00,
        // Total path attribute length.
        0x00, 0x14,
        // ORIGIN: IGP.
        0x40, 0x01, 0x01, 0x00,
        // AS_PATH: claims two members, carries one.
        0x40, 0x02, 0x06, 0x02, 0x02, 0x00, 0x00, 0xfd, 0xe9,
        // NEXT_HOP: 10.0.255.1.
        0x40, 0x03, 0x04, 0x0a, 0x00, 0xff, 0x01,
        // NLRI: 10.1.0.0/16.
        0x10, 0x0a, 0x01,
    ];

    let msg = decode_update(&bytes);
    assert!(msg.attrs.is_none());
    assert_eq!(msg.malformed_attr, Some(2));
    let reach = msg.reach.unwrap();
    assert_eq!(reach.prefixes, vec![v4_unicast("10.1.0.0/16")]);
}
