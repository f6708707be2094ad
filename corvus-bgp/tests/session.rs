//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;

use corvus_bgp::neighbor::{Negotiated, RefreshMode};
use corvus_bgp::packet::consts::{
    AS_TRANS, AddPathMode, Afi, ErrorCode, GrFlags, OpenMessageErrorSubcode,
    Safi,
};
use corvus_bgp::packet::message::{
    AddPathTuple, Capability, GrTuple, Message, OpenMsg,
};

//
// Capability negotiation scenarios, driven from pairs of OPEN messages.
//

fn open_msg(
    asn: u32,
    identifier: &str,
    holdtime: u16,
    capabilities: BTreeSet<Capability>,
) -> OpenMsg {
    OpenMsg {
        version: 4,
        my_as: u16::try_from(asn).unwrap_or(AS_TRANS),
        holdtime,
        identifier: Ipv4Addr::from_str(identifier).unwrap(),
        capabilities,
    }
}

fn mp_v4u() -> Capability {
    Capability::MultiProtocol {
        afi: Afi::Ipv4,
        safi: Safi::Unicast,
    }
}

// Plain IPv4-unicast session: multiprotocol and four-octet ASNs only.
// The negotiated hold time is the common offer, the keepalive interval a
// third of it.
#[test]
fn test_negotiate_basic() {
    let local = open_msg(
        65001,
        "1.1.1.1",
        180,
        [mp_v4u(), Capability::FourOctetAsNumber { asn: 65001 }].into(),
    );
    let remote = open_msg(
        65002,
        "2.2.2.2",
        180,
        [mp_v4u(), Capability::FourOctetAsNumber { asn: 65002 }].into(),
    );

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.local_as, 65001);
    assert_eq!(negotiated.peer_as, 65002);
    assert_eq!(negotiated.holdtime, 180);
    assert_eq!(negotiated.keepalive, 60);
    assert!(negotiated.asn4);
    assert_eq!(
        negotiated.families,
        [(Afi::Ipv4, Safi::Unicast)].into()
    );
    assert_eq!(negotiated.refresh, RefreshMode::Absent);
    assert_eq!(negotiated.msg_size, Message::MAX_LEN);
    assert!(!negotiated.multisession);
    assert!(negotiated.graceful_restart.is_none());
}

// The smaller hold time offer wins.
#[test]
fn test_negotiate_holdtime() {
    let local = open_msg(65001, "1.1.1.1", 180, [mp_v4u()].into());
    let remote = open_msg(65002, "2.2.2.2", 90, [mp_v4u()].into());

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.holdtime, 90);
    assert_eq!(negotiated.keepalive, 30);

    // Zero disables the hold timer altogether.
    let remote = open_msg(65002, "2.2.2.2", 0, [mp_v4u()].into());
    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.holdtime, 0);
}

// Peers that don't speak capabilities at all get the implicit IPv4
// unicast session.
#[test]
fn test_negotiate_implicit_ipv4() {
    let local = open_msg(65001, "1.1.1.1", 180, [].into());
    let remote = open_msg(65002, "2.2.2.2", 180, [].into());

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(
        negotiated.families,
        [(Afi::Ipv4, Safi::Unicast)].into()
    );
    assert!(!negotiated.asn4);
}

// No family in common is a fatal negotiation error (2, 7).
#[test]
fn test_negotiate_no_common_family() {
    let local = open_msg(65001, "1.1.1.1", 180, [mp_v4u()].into());
    let remote = open_msg(
        65002,
        "2.2.2.2",
        180,
        [Capability::MultiProtocol {
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
        }]
        .into(),
    );

    let notif = Negotiated::negotiate(&local, &remote, false).unwrap_err();
    assert_eq!(notif.error_code, ErrorCode::OpenMessageError as u8);
    assert_eq!(
        notif.error_subcode,
        OpenMessageErrorSubcode::UnsupportedCapability as u8
    );
}

// Refresh support ladder: enhanced when both ends support it, otherwise
// plain refresh, otherwise absent.
#[test]
fn test_negotiate_refresh_mode() {
    let both = |caps: &[Capability]| {
        let mut set: BTreeSet<_> = [mp_v4u()].into();
        set.extend(caps.iter().cloned());
        let local = open_msg(65001, "1.1.1.1", 180, set.clone());
        let remote = open_msg(65002, "2.2.2.2", 180, set);
        Negotiated::negotiate(&local, &remote, false).unwrap()
    };

    assert_eq!(both(&[]).refresh, RefreshMode::Absent);
    assert_eq!(
        both(&[Capability::RouteRefresh]).refresh,
        RefreshMode::Normal
    );
    assert_eq!(
        both(&[Capability::RouteRefresh, Capability::EnhancedRouteRefresh])
            .refresh,
        RefreshMode::Enhanced
    );

    // One-sided support doesn't negotiate.
    let local = open_msg(
        65001,
        "1.1.1.1",
        180,
        [mp_v4u(), Capability::RouteRefresh].into(),
    );
    let remote = open_msg(65002, "2.2.2.2", 180, [mp_v4u()].into());
    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.refresh, RefreshMode::Absent);
}

// Extended message support raises the size limit to 65535 (RFC 8654).
#[test]
fn test_negotiate_msg_size() {
    let caps: BTreeSet<_> = [mp_v4u(), Capability::ExtendedMessage].into();
    let local = open_msg(65001, "1.1.1.1", 180, caps.clone());
    let remote = open_msg(65002, "2.2.2.2", 180, caps);

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.msg_size, Message::MAX_LEN_EXT);
}

// ADD-PATH directions result from crossing our modes with the peer's
// (RFC 7911).
#[test]
fn test_negotiate_addpath_directions() {
    let addpath = |mode| {
        Capability::AddPath(
            [AddPathTuple {
                afi: Afi::Ipv4,
                safi: Safi::Unicast,
                mode,
            }]
            .into(),
        )
    };

    let local = open_msg(
        65001,
        "1.1.1.1",
        180,
        [mp_v4u(), addpath(AddPathMode::ReceiveSend)].into(),
    );
    let remote = open_msg(
        65002,
        "2.2.2.2",
        180,
        [mp_v4u(), addpath(AddPathMode::Receive)].into(),
    );

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert!(negotiated.addpath_send(Afi::Ipv4, Safi::Unicast));
    assert!(!negotiated.addpath_recv(Afi::Ipv4, Safi::Unicast));

    // No tuple from the peer disables the family entirely.
    let remote = open_msg(65002, "2.2.2.2", 180, [mp_v4u()].into());
    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert!(!negotiated.addpath_send(Afi::Ipv4, Safi::Unicast));
    assert!(!negotiated.addpath_recv(Afi::Ipv4, Safi::Unicast));
}

// A four-octet local AS puts AS_TRANS in the ASN field and the real value
// in the capability (RFC 6793).
#[test]
fn test_negotiate_as_trans() {
    let local = open_msg(
        70000,
        "1.1.1.1",
        180,
        [mp_v4u(), Capability::FourOctetAsNumber { asn: 70000 }].into(),
    );
    assert_eq!(local.my_as, AS_TRANS);
    assert_eq!(local.real_as(), 70000);

    let remote = open_msg(
        65002,
        "2.2.2.2",
        180,
        [mp_v4u(), Capability::FourOctetAsNumber { asn: 65002 }].into(),
    );
    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert_eq!(negotiated.local_as, 70000);
    assert!(negotiated.asn4);
}

// The peer's graceful restart announcement is retained when the
// capability is negotiated both ways (RFC 4724).
#[test]
fn test_negotiate_graceful_restart() {
    let gr = |restarting: bool| Capability::GracefulRestart {
        flags: if restarting {
            GrFlags::RESTART
        } else {
            GrFlags::empty()
        },
        restart_time: 120,
        families: vec![GrTuple {
            afi: Afi::Ipv4,
            safi: Safi::Unicast,
            flags: Default::default(),
        }],
    };

    let local = open_msg(65001, "1.1.1.1", 180, [mp_v4u(), gr(false)].into());
    let remote = open_msg(65002, "2.2.2.2", 180, [mp_v4u(), gr(true)].into());

    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    let peer_gr = negotiated.graceful_restart.unwrap();
    assert_eq!(peer_gr.restart_time, 120);
    assert!(peer_gr.restarting);

    // One-sided graceful restart doesn't negotiate.
    let remote = open_msg(65002, "2.2.2.2", 180, [mp_v4u()].into());
    let negotiated = Negotiated::negotiate(&local, &remote, false).unwrap();
    assert!(negotiated.graceful_restart.is_none());
}
