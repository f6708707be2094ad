//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::str::FromStr;

use bytes::{Buf, BytesMut};
use corvus_bgp::packet::consts::{Afi, Safi};
use corvus_bgp::packet::nlri::{
    InetNlri, Label, LabeledNlri, Labels, Nlri, RouteDistinguisher, VpnNlri,
};
use ipnetwork::IpNetwork;

fn v4_unicast(prefix: &str, path_id: Option<u32>) -> Nlri {
    Nlri::Unicast(InetNlri {
        prefix: IpNetwork::from_str(prefix).unwrap(),
        path_id,
    })
}

// The cache index tells distinct path identifiers apart.
#[test]
fn test_index_path_id() {
    let a = v4_unicast("10.0.0.0/24", Some(1));
    let b = v4_unicast("10.0.0.0/24", Some(2));
    assert_ne!(a.index(), b.index());
}

// MPLS labels are rewritten on re-announcement and must not split the
// identity of a route.
#[test]
fn test_index_ignores_labels() {
    let a = Nlri::LabeledUnicast(LabeledNlri {
        prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
        path_id: None,
        labels: Labels(vec![Label(100)]),
    });
    let b = Nlri::LabeledUnicast(LabeledNlri {
        prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
        path_id: None,
        labels: Labels(vec![Label(200)]),
    });
    assert_eq!(a.index(), b.index());
}

// Distinct route distinguishers keep otherwise identical prefixes apart.
#[test]
fn test_index_route_distinguisher() {
    let a = Nlri::LabeledVpn(VpnNlri {
        prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
        path_id: None,
        labels: Labels(vec![Label(100)]),
        rd: RouteDistinguisher::from_asn2(65001, 1),
    });
    let b = Nlri::LabeledVpn(VpnNlri {
        prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
        path_id: None,
        labels: Labels(vec![Label(100)]),
        rd: RouteDistinguisher::from_asn2(65001, 2),
    });
    assert_ne!(a.index(), b.index());
}

// The advertised wire length matches the encoder's output for every
// variant.
#[test]
fn test_wire_len() {
    let nlris = [
        v4_unicast("10.0.0.0/24", None),
        v4_unicast("10.0.0.0/24", Some(7)),
        v4_unicast("0.0.0.0/0", None),
        Nlri::Unicast(InetNlri {
            prefix: IpNetwork::from_str("2001:db8::/32").unwrap(),
            path_id: None,
        }),
        Nlri::LabeledUnicast(LabeledNlri {
            prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
            path_id: None,
            labels: Labels(vec![Label(100), Label(200)]),
        }),
        Nlri::LabeledVpn(VpnNlri {
            prefix: IpNetwork::from_str("10.0.0.0/24").unwrap(),
            path_id: Some(1),
            labels: Labels(vec![Label(100)]),
            rd: RouteDistinguisher::from_asn2(65001, 1),
        }),
    ];

    for nlri in nlris {
        let path_ids = nlri.path_id().is_some();
        let mut buf = BytesMut::new();
        nlri.encode(&mut buf, path_ids);
        assert_eq!(buf.len(), nlri.wire_len(path_ids), "{nlri:?}");
    }
}

// Labeled NLRIs survive an encode/decode cycle.
#[test]
fn test_labeled_round_trip() {
    let nlri = Nlri::LabeledUnicast(LabeledNlri {
        prefix: IpNetwork::from_str("10.1.2.0/24").unwrap(),
        path_id: None,
        labels: Labels(vec![Label(16), Label(17)]),
    });

    let mut buf = BytesMut::new();
    nlri.encode(&mut buf, false);
    let mut buf = buf.freeze();
    let decoded =
        Nlri::decode(&mut buf, Afi::Ipv4, Safi::LabeledUnicast, false)
            .unwrap()
            .unwrap();
    assert_eq!(nlri, decoded);
    assert_eq!(buf.remaining(), 0);
}

// Semantically incorrect prefixes are skipped, not treated as errors.
#[test]
fn test_decode_unroutable() {
    // 127.0.0.0/8
    let mut buf = bytes::Bytes::from_static(&[0x08, 0x7f]);
    let decoded =
        Nlri::decode(&mut buf, Afi::Ipv4, Safi::Unicast, false).unwrap();
    assert_eq!(decoded, None);
}

// A prefix length above the address family maximum is a hard error.
#[test]
fn test_decode_invalid_prefix_length() {
    let mut buf = bytes::Bytes::from_static(&[0x21, 0x0a, 0x00, 0x00, 0x00]);
    assert!(Nlri::decode(&mut buf, Afi::Ipv4, Safi::Unicast, false).is_err());
}
