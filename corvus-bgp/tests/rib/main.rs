//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

use corvus_bgp::neighbor::Negotiated;
use corvus_bgp::packet::attribute::{AsPath, Attrs};
use corvus_bgp::packet::consts::{
    AddPathMode, Afi, Origin, RouteRefreshSubtype, Safi,
};
use corvus_bgp::packet::message::{
    AddPathTuple, Capability, EncodeCxt, Message, OpenMsg,
};
use corvus_bgp::packet::nlri::{InetNlri, Nlri};
use corvus_bgp::rib::{Change, Family, OutgoingRib};
use ipnetwork::IpNetwork;

const IPV4_UNICAST: Family = (Afi::Ipv4, Safi::Unicast);

//
// Helper functions.
//

fn open_msg(
    asn: u32,
    identifier: &str,
    extra_caps: &[Capability],
) -> OpenMsg {
    let mut capabilities: BTreeSet<_> = [
        Capability::MultiProtocol {
            afi: Afi::Ipv4,
            safi: Safi::Unicast,
        },
        Capability::MultiProtocol {
            afi: Afi::Ipv6,
            safi: Safi::Unicast,
        },
        Capability::FourOctetAsNumber { asn },
    ]
    .into();
    capabilities.extend(extra_caps.iter().cloned());

    OpenMsg {
        version: 4,
        my_as: asn as u16,
        holdtime: 180,
        identifier: Ipv4Addr::from_str(identifier).unwrap(),
        capabilities,
    }
}

fn negotiated_with(extra_caps: &[Capability]) -> Negotiated {
    let local = open_msg(65001, "1.1.1.1", extra_caps);
    let remote = open_msg(65002, "2.2.2.2", extra_caps);
    Negotiated::negotiate(&local, &remote, false).unwrap()
}

fn negotiated() -> Negotiated {
    negotiated_with(&[])
}

fn rib() -> OutgoingRib {
    OutgoingRib::new([IPV4_UNICAST, (Afi::Ipv6, Safi::Unicast)].into())
}

fn attrs(nexthop: &str, med: Option<u32>) -> Arc<Attrs> {
    let mut attrs = Attrs::new(Origin::Igp, AsPath::default());
    attrs.base.nexthop = Some(IpAddr::from_str(nexthop).unwrap());
    attrs.base.med = med;
    Arc::new(attrs)
}

fn v4_unicast(prefix: &str) -> Nlri {
    Nlri::Unicast(InetNlri {
        prefix: IpNetwork::from_str(prefix).unwrap(),
        path_id: None,
    })
}

fn v4_unicast_path(prefix: &str, path_id: u32) -> Nlri {
    Nlri::Unicast(InetNlri {
        prefix: IpNetwork::from_str(prefix).unwrap(),
        path_id: Some(path_id),
    })
}

fn reach_prefixes(msgs: &[Message]) -> Vec<Nlri> {
    msgs.iter()
        .filter_map(|msg| msg.as_update())
        .filter_map(|update| update.reach.as_ref())
        .flat_map(|reach| reach.prefixes.iter().cloned())
        .collect()
}

fn unreach_prefixes(msgs: &[Message]) -> Vec<Nlri> {
    msgs.iter()
        .filter_map(|msg| msg.as_update())
        .filter_map(|update| update.unreach.as_ref())
        .flat_map(|unreach| unreach.prefixes.iter().cloned())
        .collect()
}

//
// Tests.
//

// Announcing the same route twice produces the UPDATE stream of the
// first call only; the second one is a no-op against the cache.
#[test]
fn test_idempotent_announce() {
    let negotiated = negotiated();
    let mut rib = rib();
    let attrs = attrs("10.0.255.1", None);

    rib.add_change(Change::announce(v4_unicast("10.0.0.0/24"), attrs.clone()));
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(rib.cached_count(IPV4_UNICAST), 1);

    rib.add_change(Change::announce(v4_unicast("10.0.0.0/24"), attrs));
    assert!(!rib.is_pending());
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert!(msgs.is_empty());
}

// Changing the attributes does re-announce.
#[test]
fn test_attribute_change_reannounces() {
    let negotiated = negotiated();
    let mut rib = rib();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.updates(&negotiated, true).unwrap();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", Some(50)),
    ));
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(rib.cached_count(IPV4_UNICAST), 1);
}

// Withdraw then announce between two generations collapses to a single
// wire UPDATE (last write wins per NLRI).
#[test]
fn test_withdraw_then_announce_collapses() {
    let negotiated = negotiated();
    let mut rib = rib();
    let base_attrs = attrs("10.0.255.1", None);

    rib.add_change(Change::announce(v4_unicast("10.0.0.0/24"), base_attrs.clone()));
    rib.updates(&negotiated, true).unwrap();

    rib.add_change(Change::withdraw(v4_unicast("10.0.0.0/24")));
    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", Some(50)),
    ));
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(reach_prefixes(&msgs), vec![v4_unicast("10.0.0.0/24")]);
    assert!(unreach_prefixes(&msgs).is_empty());

    // Announce then withdraw nets out to the withdrawal alone.
    rib.add_change(Change::announce(v4_unicast("10.1.0.0/16"), base_attrs));
    rib.add_change(Change::withdraw(v4_unicast("10.1.0.0/16")));
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(msgs.len(), 1);
    assert!(reach_prefixes(&msgs).is_empty());
    assert_eq!(unreach_prefixes(&msgs), vec![v4_unicast("10.1.0.0/16")]);
}

// A withdraw for an NLRI that was never advertised is still emitted: the
// peer may have state we no longer know about.
#[test]
fn test_withdraw_uncached() {
    let negotiated = negotiated();
    let mut rib = rib();

    rib.add_change(Change::withdraw(v4_unicast("192.0.2.0/24")));
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(unreach_prefixes(&msgs), vec![v4_unicast("192.0.2.0/24")]);
}

// Grouping packs prefixes sharing an attribute set into one UPDATE;
// without it every prefix rides its own message.
#[test]
fn test_grouped_updates() {
    let negotiated = negotiated();
    let attrs = attrs("10.0.255.1", None);

    let mut grouped = rib();
    for prefix in ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"] {
        grouped
            .add_change(Change::announce(v4_unicast(prefix), attrs.clone()));
    }
    let msgs = grouped.updates(&negotiated, true).unwrap();
    assert_eq!(msgs.len(), 1);
    assert_eq!(reach_prefixes(&msgs).len(), 3);

    let mut ungrouped = rib();
    for prefix in ["10.0.0.0/24", "10.0.1.0/24", "10.0.2.0/24"] {
        ungrouped
            .add_change(Change::announce(v4_unicast(prefix), attrs.clone()));
    }
    let msgs = ungrouped.updates(&negotiated, false).unwrap();
    assert_eq!(msgs.len(), 3);
    assert_eq!(reach_prefixes(&msgs).len(), 3);
}

// No generated message ever exceeds the negotiated maximum size.
#[test]
fn test_message_size_bound() {
    let negotiated = negotiated();
    let mut rib = rib();
    let attrs = attrs("10.0.255.1", None);

    for i in 0..8u32 {
        for j in 0..250u32 {
            let prefix = format!("10.{i}.{j}.0/24");
            rib.add_change(Change::announce(
                v4_unicast(&prefix),
                attrs.clone(),
            ));
        }
    }

    let msgs = rib.updates(&negotiated, true).unwrap();
    assert!(msgs.len() > 1);
    assert_eq!(reach_prefixes(&msgs).len(), 2000);

    let cxt = EncodeCxt {
        capabilities: negotiated.capabilities.clone(),
    };
    for msg in &msgs {
        let buf = msg.encode(&cxt);
        assert!(buf.len() <= negotiated.msg_size as usize);
    }
}

// Two NLRIs with the same prefix but distinct path identifiers are
// distinct cache entries, and both survive a replay (RFC 7911).
#[test]
fn test_addpath_distinct_entries() {
    let addpath = Capability::AddPath(
        [AddPathTuple {
            afi: Afi::Ipv4,
            safi: Safi::Unicast,
            mode: AddPathMode::ReceiveSend,
        }]
        .into(),
    );
    let negotiated = negotiated_with(&[addpath]);
    assert!(negotiated.addpath_send(Afi::Ipv4, Safi::Unicast));

    let mut rib = rib();
    let attrs = attrs("10.0.255.1", None);
    rib.add_change(Change::announce(
        v4_unicast_path("10.0.0.0/24", 1),
        attrs.clone(),
    ));
    rib.add_change(Change::announce(
        v4_unicast_path("10.0.0.0/24", 2),
        attrs,
    ));
    rib.updates(&negotiated, true).unwrap();
    assert_eq!(rib.cached_count(IPV4_UNICAST), 2);

    rib.resend(None, false);
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(
        reach_prefixes(&msgs),
        vec![
            v4_unicast_path("10.0.0.0/24", 1),
            v4_unicast_path("10.0.0.0/24", 2),
        ]
    );
}

// Replay after a session loss: queued changes are dropped, the advertised
// state survives and is reissued deterministically.
#[test]
fn test_replay_deterministic() {
    let negotiated = negotiated();
    let mut rib = rib();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.add_change(Change::announce(
        v4_unicast("10.0.1.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.add_change(Change::announce(
        v4_unicast("172.16.0.0/16"),
        attrs("10.0.255.2", Some(10)),
    ));
    rib.updates(&negotiated, true).unwrap();

    // Session loss: pending only is dropped.
    rib.add_change(Change::announce(
        v4_unicast("192.0.2.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.reset();
    assert!(!rib.is_pending());
    assert_eq!(rib.cached_count(IPV4_UNICAST), 3);

    let cxt = EncodeCxt {
        capabilities: negotiated.capabilities.clone(),
    };
    let encode_all = |msgs: &[Message]| {
        msgs.iter()
            .flat_map(|msg| msg.encode(&cxt).to_vec())
            .collect::<Vec<_>>()
    };

    rib.resend(None, false);
    let replay1 = encode_all(&rib.updates(&negotiated, true).unwrap());
    rib.resend(None, false);
    let replay2 = encode_all(&rib.updates(&negotiated, true).unwrap());
    assert!(!replay1.is_empty());
    assert_eq!(replay1, replay2);
}

// Dropping the advertised state empties everything.
#[test]
fn test_clear() {
    let negotiated = negotiated();
    let mut rib = rib();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.updates(&negotiated, true).unwrap();
    rib.clear();
    assert_eq!(rib.cached_count(IPV4_UNICAST), 0);

    rib.resend(None, false);
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert!(msgs.is_empty());
}

// remove_all turns the whole advertised family into withdrawals.
#[test]
fn test_remove_all() {
    let negotiated = negotiated();
    let mut rib = rib();

    for prefix in ["10.0.0.0/24", "10.0.1.0/24"] {
        rib.add_change(Change::announce(
            v4_unicast(prefix),
            attrs("10.0.255.1", None),
        ));
    }
    rib.updates(&negotiated, true).unwrap();

    rib.remove_all(IPV4_UNICAST);
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(unreach_prefixes(&msgs).len(), 2);
    assert_eq!(rib.cached_count(IPV4_UNICAST), 0);
}

// Configuration reload produces the optimal delta: gone routes are
// withdrawn, unchanged routes stay quiet, new routes are announced.
#[test]
fn test_replace_delta() {
    let negotiated = negotiated();
    let mut rib = rib();
    let attrs = attrs("10.0.255.1", None);

    let r1 = Change::announce(v4_unicast("10.0.0.0/24"), attrs.clone());
    let r2 = Change::announce(v4_unicast("10.0.1.0/24"), attrs.clone());
    rib.add_change(r1.clone());
    rib.add_change(r2.clone());
    rib.updates(&negotiated, true).unwrap();

    let r3 = Change::announce(v4_unicast("10.0.2.0/24"), attrs);
    rib.replace(vec![r1, r2.clone()], vec![r2, r3]);
    let msgs = rib.updates(&negotiated, true).unwrap();
    assert_eq!(unreach_prefixes(&msgs), vec![v4_unicast("10.0.0.0/24")]);
    assert_eq!(reach_prefixes(&msgs), vec![v4_unicast("10.0.2.0/24")]);
}

// End-of-RIB markers: the IPv4-unicast one is the empty 23-byte UPDATE,
// other families get an empty MP_UNREACH_NLRI.
#[test]
fn test_end_of_rib() {
    let negotiated = negotiated();
    let cxt = EncodeCxt {
        capabilities: negotiated.capabilities.clone(),
    };

    let eor = OutgoingRib::eor(IPV4_UNICAST);
    let buf = eor.encode(&cxt);
    assert_eq!(
        buf.as_ref(),
        &[
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
            0xff, 0xff, 0xff, 0xff, 0xff, 0x00, 0x17, 0x02, 0x00, 0x00, 0x00,
            0x00,
        ]
    );

    let eor = OutgoingRib::eor((Afi::Ipv6, Safi::Unicast));
    let update = eor.as_update().unwrap();
    assert_eq!(update.is_eor(), Some((Afi::Ipv6, Safi::Unicast)));
}

// A route refresh on an enhanced-refresh session brackets the replay
// between BoRR and EoRR markers (RFC 7313).
#[test]
fn test_enhanced_refresh_bracketing() {
    let negotiated = negotiated_with(&[
        Capability::RouteRefresh,
        Capability::EnhancedRouteRefresh,
    ]);
    let mut rib = rib();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.add_change(Change::announce(
        v4_unicast("10.0.1.0/24"),
        attrs("10.0.255.1", Some(20)),
    ));
    rib.updates(&negotiated, true).unwrap();

    rib.resend(Some(&[IPV4_UNICAST].into()), true);
    let msgs = rib.updates(&negotiated, true).unwrap();

    assert_eq!(msgs.len(), 4);
    let borr = msgs.first().unwrap().as_route_refresh().unwrap();
    assert_eq!(borr.subtype, RouteRefreshSubtype::Begin);
    assert_eq!(borr.family(), Some(IPV4_UNICAST));
    let eorr = msgs.last().unwrap().as_route_refresh().unwrap();
    assert_eq!(eorr.subtype, RouteRefreshSubtype::End);
    assert_eq!(reach_prefixes(&msgs).len(), 2);
}

// Changes posted while a refresh bracket is pending are held back and
// replayed right after the bracket closes.
#[test]
fn test_refresh_defers_new_changes() {
    let negotiated = negotiated_with(&[
        Capability::RouteRefresh,
        Capability::EnhancedRouteRefresh,
    ]);
    let mut rib = rib();

    rib.add_change(Change::announce(
        v4_unicast("10.0.0.0/24"),
        attrs("10.0.255.1", None),
    ));
    rib.updates(&negotiated, true).unwrap();

    rib.resend(Some(&[IPV4_UNICAST].into()), true);
    rib.add_change(Change::announce(
        v4_unicast("192.0.2.0/24"),
        attrs("10.0.255.1", None),
    ));

    let msgs = rib.updates(&negotiated, true).unwrap();
    let subtypes = msgs
        .iter()
        .filter_map(|msg| msg.as_route_refresh())
        .map(|rr| rr.subtype)
        .collect::<Vec<_>>();
    assert_eq!(
        subtypes,
        vec![RouteRefreshSubtype::Begin, RouteRefreshSubtype::End]
    );

    // The deferred change is generated after the bracket closed.
    let reach = reach_prefixes(&msgs);
    assert_eq!(reach.len(), 2);
    assert_eq!(*reach.last().unwrap(), v4_unicast("192.0.2.0/24"));
    assert_eq!(rib.cached_count(IPV4_UNICAST), 2);
}
