//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::str::FromStr;

use corvus_bgp::packet::attribute::{
    Aggregator, AsPath, AsPathSegment, Attrs,
};
use corvus_bgp::packet::consts::{AsPathSegmentType, Origin};
use corvus_bgp::packet::message::{
    EncodeCxt, Message, ReachNlri, UpdateMsg,
};
use corvus_bgp::packet::nlri::{InetNlri, Nlri};
use ipnetwork::IpNetwork;

// When the four-octet ASN capability wasn't negotiated, mappable members
// are encoded as-is, four-octet members become AS_TRANS, and the true
// path travels in a synthesized AS4_PATH (RFC 6793).
#[test]
fn test_encode_as_trans() {
    let attrs = Attrs::new(
        Origin::Igp,
        AsPath {
            segments: [AsPathSegment {
                seg_type: AsPathSegmentType::Sequence,
                members: [70000, 65001].into(),
            }]
            .into(),
        },
    );
    let msg = Message::Update(UpdateMsg {
        reach: Some(ReachNlri {
            prefixes: vec![Nlri::Unicast(InetNlri {
                prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
                path_id: None,
            })],
            nexthop: Ipv4Addr::from_str("10.0.255.1").unwrap(),
        }),
        attrs: Some(attrs),
        ..Default::default()
    });

    let bytes_expected = vec![
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3c, 0x02,
        // Withdrawn routes length.
        0x00, 0x00,
        // Total path attribute length.
        0x00, 0x21,
        // ORIGIN: IGP.
        0x40, 0x01, 0x01, 0x00,
        // AS_PATH: 70000 mapped to AS_TRANS, then 65001.
        0x40, 0x02, 0x06, 0x02, 0x02, 0x5b, 0xa0, 0xfd, 0xe9,
        // NEXT_HOP: 10.0.255.1.
        0x40, 0x03, 0x04, 0x0a, 0x00, 0xff, 0x01,
        // AS4_PATH: the true four-octet members.
        0xc0, 0x11, 0x0a, 0x02, 0x02, 0x00, 0x01, 0x11, 0x70, 0x00, 0x00,
        0xfd, 0xe9,
        // NLRI: 10.0.0.0/24.
        0x18, 0x0a, 0x00, 0x00,
    ];

    // Two-octet session: no four-octet ASN capability.
    let cxt = EncodeCxt {
        capabilities: [].into(),
    };
    let bytes_actual = msg.encode(&cxt);
    assert_eq!(
        bytes_expected,
        bytes_actual.as_ref(),
        "expected {bytes_expected:02x?}, got {:02x?}",
        bytes_actual.as_ref(),
    );
}

// AGGREGATOR gets the same treatment through AS4_AGGREGATOR.
#[test]
fn test_encode_as4_aggregator() {
    let mut attrs = Attrs::new(Origin::Igp, AsPath::default());
    attrs.base.aggregator = Some(Aggregator {
        asn: 70000,
        identifier: Ipv4Addr::from_str("3.3.3.3").unwrap(),
    });
    let msg = Message::Update(UpdateMsg {
        reach: Some(ReachNlri {
            prefixes: vec![Nlri::Unicast(InetNlri {
                prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
                path_id: None,
            })],
            nexthop: Ipv4Addr::from_str("10.0.255.1").unwrap(),
        }),
        attrs: Some(attrs),
        ..Default::default()
    });

    let bytes_expected = vec![
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x3d, 0x02,
        // Withdrawn routes length.
        0x00, 0x00,
        // Total path attribute length.
        0x00, 0x22,
        // ORIGIN: IGP.
        0x40, 0x01, 0x01, 0x00,
        // AS_PATH: empty.
        0x40, 0x02, 0x00,
        // NEXT_HOP: 10.0.255.1.
        0x40, 0x03, 0x04, 0x0a, 0x00, 0xff, 0x01,
        // AGGREGATOR: AS_TRANS, 3.3.3.3.
        0xc0, 0x07, 0x06, 0x5b, 0xa0, 0x03, 0x03, 0x03, 0x03,
        // AS4_AGGREGATOR: the true four-octet ASN.
        0xc0, 0x12, 0x08, 0x00, 0x01, 0x11, 0x70, 0x03, 0x03, 0x03, 0x03,
        // NLRI: 10.0.0.0/24.
        0x18, 0x0a, 0x00, 0x00,
    ];

    let cxt = EncodeCxt {
        capabilities: [].into(),
    };
    let bytes_actual = msg.encode(&cxt);
    assert_eq!(
        bytes_expected,
        bytes_actual.as_ref(),
        "expected {bytes_expected:02x?}, got {:02x?}",
        bytes_actual.as_ref(),
    );
}
