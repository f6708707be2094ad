//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::neighbor::{Negotiated, PeerType};
use crate::packet::attribute::{Attrs, nexthop};
use crate::packet::consts::{Afi, Origin, RouteRefreshSubtype, Safi};
use crate::packet::message::{
    Message, MpReachNlri, MpUnreachNlri, ReachNlri, RouteRefreshMsg,
    UnreachNlri, UpdateMsg,
};
use crate::packet::nlri::Nlri;

// Combined address family identifier.
pub type Family = (Afi, Safi);

// Fixed per-message overhead: header (19), withdrawn routes length (2) and
// total path attribute length (2).
const MSG_OVERHEAD: u16 = 23;
// MP_REACH_NLRI/MP_UNREACH_NLRI attribute header plus AFI/SAFI fields.
const MP_ATTR_OVERHEAD: u16 = 4 + 3;

// An announce-or-withdraw record for one NLRI.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Change {
    pub action: ChangeAction,
    pub nlri: Nlri,
    // The effective nexthop rides in `attrs.base.nexthop`; withdrawals
    // ignore the attributes except for pending-queue bucketing.
    pub attrs: Arc<Attrs>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum ChangeAction {
    Announce,
    Withdraw,
}

// Last advertised state of one NLRI.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Route {
    pub nlri: Nlri,
    pub attrs: Arc<Attrs>,
}

// Errors raised by UPDATE generation.
//
// These indicate a malformed change slipped past the producer; the caller
// tears the session down rather than corrupt the wire.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RibError {
    MissingNexthop(Family),
    NexthopAddressFamily(Family, IpAddr),
    AttributesTooLong(Family),
}

//
// Per-neighbor outgoing RIB.
//
// Changes posted by producers are coalesced per NLRI (last write wins) and
// grouped by attribute set, so one UPDATE can carry every prefix sharing
// its attributes. The cache remembers what was last put on the wire and
// suppresses no-op announcements; it survives session loss so the routes
// are replayed on reconnect.
//
#[derive(Debug, Default)]
pub struct OutgoingRib {
    // Families this RIB accepts changes for.
    families: BTreeSet<Family>,
    // family -> NLRI index -> last advertised state.
    cache: BTreeMap<Family, BTreeMap<Bytes, Route>>,
    // attribute set -> family -> NLRI index -> queued change.
    pending: BTreeMap<Arc<Attrs>, BTreeMap<Family, BTreeMap<Bytes, Change>>>,
    // (family, NLRI index) -> attribute set of the queued change.
    pending_index: BTreeMap<(Family, Bytes), Arc<Attrs>>,
    // Families with a route-refresh bracket to open on the next generation.
    refresh_start: Vec<Family>,
    // Changes posted while a refresh bracket was pending, replayed after
    // the bracket closes.
    refresh_delay: Vec<Change>,
}

// ===== impl Change =====

impl Change {
    pub fn announce(nlri: Nlri, attrs: Arc<Attrs>) -> Change {
        Change {
            action: ChangeAction::Announce,
            nlri,
            attrs,
        }
    }

    pub fn withdraw(nlri: Nlri) -> Change {
        Change {
            action: ChangeAction::Withdraw,
            nlri,
            attrs: Arc::new(Attrs::new(Origin::Incomplete, Default::default())),
        }
    }
}

// ===== impl OutgoingRib =====

impl OutgoingRib {
    pub fn new(families: BTreeSet<Family>) -> OutgoingRib {
        OutgoingRib {
            families,
            ..Default::default()
        }
    }

    // Returns whether any change is queued for the next generation.
    pub fn is_pending(&self) -> bool {
        !self.pending_index.is_empty() || !self.refresh_start.is_empty()
    }

    // Number of cached routes for the given family.
    pub fn cached_count(&self, family: Family) -> usize {
        self.cache.get(&family).map_or(0, |table| table.len())
    }

    // Iterates over the advertised state of the given family.
    pub fn cached_routes(
        &self,
        family: Family,
    ) -> impl Iterator<Item = &Route> {
        self.cache.get(&family).into_iter().flatten().map(|(_, route)| route)
    }

    // Enqueues an announce or withdraw.
    //
    // A change superseding a queued change for the same NLRI replaces it,
    // and an announce identical to the advertised state is dropped.
    pub fn add_change(&mut self, change: Change) {
        self.add_change_full(change, false);
    }

    fn add_change_full(&mut self, change: Change, force: bool) {
        // Hold new changes back while a refresh bracket is open, so the
        // BoRR/EoRR pair frames exactly the replayed routes.
        if !force && !self.refresh_start.is_empty() {
            self.refresh_delay.push(change);
            return;
        }

        let family = change.nlri.family();
        let index = change.nlri.index();
        let key = (family, index.clone());

        // Replace a queued change for the same NLRI (last write wins).
        if let Some(old_attrs) = self.pending_index.remove(&key) {
            if let Some(per_family) = self.pending.get_mut(&old_attrs) {
                if let Some(changes) = per_family.get_mut(&family) {
                    changes.remove(&index);
                    if changes.is_empty() {
                        per_family.remove(&family);
                    }
                }
                if per_family.is_empty() {
                    self.pending.remove(&old_attrs);
                }
            }
        }

        // An announce identical to what the peer already has is a no-op.
        // Withdrawals go through even when the NLRI isn't cached: the peer
        // may have state we no longer know about.
        if !force
            && change.action == ChangeAction::Announce
            && let Some(cached) =
                self.cache.get(&family).and_then(|table| table.get(&index))
            && cached.nlri == change.nlri
            && cached.attrs == change.attrs
        {
            return;
        }

        self.pending_index.insert(key, change.attrs.clone());
        self.pending
            .entry(change.attrs.clone())
            .or_default()
            .entry(family)
            .or_default()
            .insert(index, change);
    }

    // Enqueues withdrawals for every advertised route of the family.
    pub fn remove_all(&mut self, family: Family) {
        let routes = self
            .cache
            .get(&family)
            .into_iter()
            .flatten()
            .map(|(_, route)| route.nlri.clone())
            .collect::<Vec<_>>();
        for nlri in routes {
            self.add_change_full(Change::withdraw(nlri), false);
        }
    }

    // Re-enqueues the advertised state of the requested families (all of
    // them by default). With `enhanced`, the next generation brackets the
    // replay between BoRR and EoRR markers (RFC 7313).
    pub fn resend(&mut self, families: Option<&BTreeSet<Family>>, enhanced: bool) {
        let requested = match families {
            Some(families) => {
                families.intersection(&self.families).copied().collect()
            }
            None => self.families.clone(),
        };

        if enhanced {
            for family in &requested {
                if !self.refresh_start.contains(family) {
                    self.refresh_start.push(*family);
                }
            }
        }

        for family in &requested {
            let routes = self
                .cache
                .get(family)
                .into_iter()
                .flatten()
                .map(|(_, route)| route.clone())
                .collect::<Vec<_>>();
            for route in routes {
                self.add_change_full(
                    Change::announce(route.nlri, route.attrs),
                    true,
                );
            }
        }
    }

    // Applies a configuration reload as an optimal delta: routes present
    // only in the previous set are withdrawn, the new set is announced
    // (announcements matching the advertised state are suppressed).
    pub fn replace(&mut self, previous: Vec<Change>, changes: Vec<Change>) {
        for mut change in previous {
            change.action = ChangeAction::Withdraw;
            self.add_change_full(change, true);
        }
        for change in changes {
            self.add_change(change);
        }
    }

    // Generates the UPDATE (and refresh marker) messages for every queued
    // change, moving announced state into the cache. Generation is pure;
    // transmission and its errors are the caller's concern.
    pub fn updates(
        &mut self,
        negotiated: &Negotiated,
        grouped: bool,
    ) -> Result<Vec<Message>, RibError> {
        let mut msgs = Vec::new();

        // Open refresh brackets.
        let refresh_families = std::mem::take(&mut self.refresh_start);
        for (afi, safi) in &refresh_families {
            msgs.push(Message::RouteRefresh(RouteRefreshMsg::new(
                *afi,
                *safi,
                RouteRefreshSubtype::Begin,
            )));
        }

        // Snapshot the pending changes; producers keep enqueueing into a
        // fresh structure while these are turned into messages.
        let pending = std::mem::take(&mut self.pending);
        self.pending_index.clear();

        for (attrs, per_family) in pending {
            for (family, changes) in per_family {
                let mut announces = Vec::new();
                let mut withdraws = Vec::new();

                for (index, change) in changes {
                    match change.action {
                        ChangeAction::Announce => {
                            self.cache.entry(family).or_default().insert(
                                index,
                                Route {
                                    nlri: change.nlri.clone(),
                                    attrs: change.attrs.clone(),
                                },
                            );
                            announces.push(change.nlri);
                        }
                        ChangeAction::Withdraw => {
                            if let Some(table) = self.cache.get_mut(&family) {
                                table.remove(&index);
                            }
                            withdraws.push(change.nlri);
                        }
                    }
                }

                if !withdraws.is_empty() {
                    self.build_withdraws(
                        family, withdraws, negotiated, &mut msgs,
                    );
                }
                if !announces.is_empty() {
                    self.build_announces(
                        family, announces, &attrs, negotiated, grouped,
                        &mut msgs,
                    )?;
                }
            }
        }

        // Close refresh brackets.
        let bracketed = !refresh_families.is_empty();
        for (afi, safi) in refresh_families {
            msgs.push(Message::RouteRefresh(RouteRefreshMsg::new(
                afi,
                safi,
                RouteRefreshSubtype::End,
            )));
        }

        // Replay the changes that were held back by the bracket.
        if bracketed && !self.refresh_delay.is_empty() {
            for change in std::mem::take(&mut self.refresh_delay) {
                self.add_change_full(change, true);
            }
            msgs.extend(self.updates(negotiated, grouped)?);
        }

        Ok(msgs)
    }

    // Builds the End-of-RIB marker for a family (RFC 4724).
    pub fn eor(family: Family) -> Message {
        let (afi, safi) = family;
        if family == (Afi::Ipv4, Safi::Unicast) {
            Message::Update(UpdateMsg::default())
        } else {
            Message::Update(UpdateMsg {
                mp_unreach: Some(MpUnreachNlri {
                    afi,
                    safi,
                    prefixes: vec![],
                }),
                ..Default::default()
            })
        }
    }

    // Drops the queued changes after session loss. The cache is retained
    // so the routes are replayed when the session comes back.
    pub fn reset(&mut self) {
        self.pending = Default::default();
        self.pending_index = Default::default();
        self.refresh_start = Default::default();
        self.refresh_delay = Default::default();
    }

    // Drops both the queued changes and the advertised state.
    pub fn clear(&mut self) {
        self.reset();
        self.cache = Default::default();
    }

    fn build_withdraws(
        &self,
        family: Family,
        nlris: Vec<Nlri>,
        negotiated: &Negotiated,
        msgs: &mut Vec<Message>,
    ) {
        let (afi, safi) = family;
        let path_ids = negotiated.addpath_send(afi, safi);

        if family == (Afi::Ipv4, Safi::Unicast) {
            let room = negotiated.msg_size - MSG_OVERHEAD;
            for chunk in chunk_nlris(nlris, room as usize, path_ids) {
                msgs.push(Message::Update(UpdateMsg {
                    unreach: Some(UnreachNlri { prefixes: chunk }),
                    ..Default::default()
                }));
            }
        } else {
            let room = negotiated.msg_size - MSG_OVERHEAD - MP_ATTR_OVERHEAD;
            for chunk in chunk_nlris(nlris, room as usize, path_ids) {
                msgs.push(Message::Update(UpdateMsg {
                    mp_unreach: Some(MpUnreachNlri {
                        afi,
                        safi,
                        prefixes: chunk,
                    }),
                    ..Default::default()
                }));
            }
        }
    }

    fn build_announces(
        &self,
        family: Family,
        nlris: Vec<Nlri>,
        attrs: &Arc<Attrs>,
        negotiated: &Negotiated,
        grouped: bool,
        msgs: &mut Vec<Message>,
    ) -> Result<(), RibError> {
        let (afi, safi) = family;
        let path_ids = negotiated.addpath_send(afi, safi);
        let Some(nh) = attrs.base.nexthop else {
            return Err(RibError::MissingNexthop(family));
        };

        if family == (Afi::Ipv4, Safi::Unicast) {
            let IpAddr::V4(nh) = nh else {
                return Err(RibError::NexthopAddressFamily(family, nh));
            };

            let attrs_len = attrs.length() + nexthop::length();
            let room = negotiated
                .msg_size
                .saturating_sub(MSG_OVERHEAD + attrs_len);
            if room == 0 {
                return Err(RibError::AttributesTooLong(family));
            }

            // Grouping packs every prefix sharing this attribute set into
            // as few messages as possible; otherwise one prefix per UPDATE.
            let chunks = if grouped {
                chunk_nlris(nlris, room as usize, path_ids)
            } else {
                nlris.into_iter().map(|nlri| vec![nlri]).collect()
            };
            for chunk in chunks {
                msgs.push(Message::Update(UpdateMsg {
                    reach: Some(ReachNlri {
                        prefixes: chunk,
                        nexthop: nh,
                    }),
                    attrs: Some((**attrs).clone()),
                    ..Default::default()
                }));
            }
        } else {
            // Address family sanity check: a v6 route can't ride a v4
            // nexthop and vice versa.
            match (afi, nh) {
                (Afi::Ipv4, IpAddr::V4(_)) | (Afi::Ipv6, IpAddr::V6(_)) => (),
                _ => {
                    return Err(RibError::NexthopAddressFamily(family, nh));
                }
            }

            // One NLRI per UPDATE outside IPv4 unicast, keeping a single
            // nexthop per message.
            for nlri in nlris {
                msgs.push(Message::Update(UpdateMsg {
                    mp_reach: Some(MpReachNlri {
                        afi,
                        safi,
                        nexthop: nh,
                        ll_nexthop: attrs.base.ll_nexthop,
                        prefixes: vec![nlri],
                    }),
                    attrs: Some((**attrs).clone()),
                    ..Default::default()
                }));
            }
        }

        Ok(())
    }
}

// ===== impl RibError =====

impl std::fmt::Display for RibError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RibError::MissingNexthop((afi, safi)) => {
                write!(f, "route without nexthop ({afi}/{safi:?})")
            }
            RibError::NexthopAddressFamily((afi, safi), nexthop) => {
                write!(
                    f,
                    "nexthop {nexthop} doesn't match the address family \
                     ({afi}/{safi:?})"
                )
            }
            RibError::AttributesTooLong((afi, safi)) => {
                write!(
                    f,
                    "attributes don't fit the negotiated message size \
                     ({afi}/{safi:?})"
                )
            }
        }
    }
}

impl std::error::Error for RibError {}

// ===== global functions =====

// Rewrites route attributes for transmission to the given kind of peer.
pub(crate) fn attrs_tx_update(
    attrs: &mut Attrs,
    peer_type: PeerType,
    local_asn: u32,
) {
    match peer_type {
        PeerType::Internal => {
            // The AS path isn't modified towards internal peers.
        }
        PeerType::External => {
            if attrs.base.as_path.first() != Some(local_asn) {
                attrs.base.as_path.prepend(local_asn);
            }
            // LOCAL_PREF never crosses an AS boundary.
            attrs.base.local_pref = None;
        }
    }
}

// Resolves a "nexthop self" announcement to the session source address.
//
// BGP-over-IPv4 sessions carrying IPv6 routes use the IPv4-mapped form of
// the source address; the opposite combination has no usable mapping.
pub(crate) fn nexthop_self(afi: Afi, session_src: IpAddr) -> Option<IpAddr> {
    match (afi, session_src) {
        (Afi::Ipv4, IpAddr::V4(_)) | (Afi::Ipv6, IpAddr::V6(_)) => {
            Some(session_src)
        }
        (Afi::Ipv6, IpAddr::V4(addr)) => {
            Some(IpAddr::V6(addr.to_ipv6_mapped()))
        }
        (Afi::Ipv4, IpAddr::V6(_)) => None,
    }
}

// ===== helper functions =====

// Splits a run of NLRIs into chunks whose encoded size stays under the
// available room.
fn chunk_nlris(
    nlris: Vec<Nlri>,
    room: usize,
    path_ids: bool,
) -> Vec<Vec<Nlri>> {
    let mut chunks = Vec::new();
    let mut chunk = Vec::new();
    let mut used = 0;

    for nlri in nlris {
        let len = nlri.wire_len(path_ids);
        if !chunk.is_empty() && used + len > room {
            chunks.push(std::mem::take(&mut chunk));
            used = 0;
        }
        used += len;
        chunk.push(nlri);
    }
    if !chunk.is_empty() {
        chunks.push(chunk);
    }

    chunks
}
