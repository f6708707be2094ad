//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use corvus_utils::bytes::{BytesExt, BytesMutExt};
use corvus_utils::ip::{
    Ipv4AddrExt, Ipv4NetworkExt, Ipv6AddrExt, Ipv6NetworkExt, IpNetworkExt,
};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::packet::consts::{Afi, Safi};
use crate::packet::error::UpdateMessageError;

// Path Identifier (RFC 7911).
pub type PathId = u32;

// Maximum depth of an MPLS label stack accepted off the wire.
const MAX_LABELS: usize = 8;

// Compatibility label used on withdrawals (RFC 8277 - Section 2.4).
const WITHDRAW_LABEL: u32 = 0x800000;

//
// One MPLS label stack entry (RFC 8277).
//
// Encoding format:
//
// 0                   1                   2
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                Label                  | Rsrv |S|
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Label(pub u32);

// MPLS label stack carried by labeled NLRIs.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Labels(pub Vec<Label>);

// Route Distinguisher (RFC 4364).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RouteDistinguisher([u8; 8]);

// Ethernet Tag ID, part of the EVPN codec vocabulary (RFC 7432).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct EthernetTag(pub u32);

// Ethernet Segment Identifier, part of the EVPN codec vocabulary (RFC 7432).
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Esi(pub [u8; 10]);

//
// Network Layer Reachability Information.
//
// The variant determines the SAFI; the prefix determines the AFI. Additional
// (AFI, SAFI) codecs (FlowSpec, EVPN, BGP-LS, ...) plug in as new variants
// dispatched from `Nlri::decode`.
//
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Nlri {
    Unicast(InetNlri),
    Multicast(InetNlri),
    LabeledUnicast(LabeledNlri),
    LabeledVpn(VpnNlri),
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct InetNlri {
    pub prefix: IpNetwork,
    pub path_id: Option<PathId>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct LabeledNlri {
    pub prefix: IpNetwork,
    pub path_id: Option<PathId>,
    pub labels: Labels,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct VpnNlri {
    pub prefix: IpNetwork,
    pub path_id: Option<PathId>,
    pub labels: Labels,
    pub rd: RouteDistinguisher,
}

// ===== impl Label =====

impl Label {
    pub const VALUE_MAX: u32 = 0xfffff;
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ===== impl Labels =====

impl Labels {
    pub fn wire_len(&self) -> usize {
        if self.0.is_empty() { 3 } else { self.0.len() * 3 }
    }

    fn encode(&self, buf: &mut BytesMut) {
        if self.0.is_empty() {
            // No labels to preserve (withdrawal or unresolved stack).
            buf.put_u24(WITHDRAW_LABEL);
            return;
        }
        for (pos, label) in self.0.iter().enumerate() {
            let bos = (pos == self.0.len() - 1) as u32;
            buf.put_u24((label.0 << 4) | bos);
        }
    }

    fn decode(
        buf: &mut Bytes,
        avail_bits: &mut usize,
    ) -> Result<Labels, UpdateMessageError> {
        let mut labels = Vec::new();

        loop {
            if *avail_bits < 24 || labels.len() == MAX_LABELS {
                return Err(UpdateMessageError::InvalidNetworkField);
            }
            let entry = buf.try_get_u24()?;
            *avail_bits -= 24;

            if entry == WITHDRAW_LABEL {
                break;
            }
            labels.push(Label(entry >> 4));
            if entry & 0x1 != 0 {
                break;
            }
        }

        Ok(Labels(labels))
    }
}

// ===== impl RouteDistinguisher =====

impl RouteDistinguisher {
    pub const LENGTH: usize = 8;

    pub fn new(bytes: [u8; 8]) -> RouteDistinguisher {
        RouteDistinguisher(bytes)
    }

    pub fn from_asn2(asn: u16, assigned: u32) -> RouteDistinguisher {
        let mut bytes = [0; 8];
        bytes[2..4].copy_from_slice(&asn.to_be_bytes());
        bytes[4..8].copy_from_slice(&assigned.to_be_bytes());
        RouteDistinguisher(bytes)
    }

    pub fn from_ip(addr: Ipv4Addr, assigned: u16) -> RouteDistinguisher {
        let mut bytes = [0; 8];
        bytes[1] = 1;
        bytes[2..6].copy_from_slice(&addr.octets());
        bytes[6..8].copy_from_slice(&assigned.to_be_bytes());
        RouteDistinguisher(bytes)
    }

    pub const fn as_bytes(&self) -> [u8; 8] {
        self.0
    }
}

impl std::fmt::Display for RouteDistinguisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rd_type = u16::from_be_bytes([self.0[0], self.0[1]]);
        match rd_type {
            0 => {
                let asn = u16::from_be_bytes([self.0[2], self.0[3]]);
                let assigned = u32::from_be_bytes([
                    self.0[4], self.0[5], self.0[6], self.0[7],
                ]);
                write!(f, "{asn}:{assigned}")
            }
            1 => {
                let addr = Ipv4Addr::new(
                    self.0[2], self.0[3], self.0[4], self.0[5],
                );
                let assigned = u16::from_be_bytes([self.0[6], self.0[7]]);
                write!(f, "{addr}:{assigned}")
            }
            2 => {
                let asn = u32::from_be_bytes([
                    self.0[2], self.0[3], self.0[4], self.0[5],
                ]);
                let assigned = u16::from_be_bytes([self.0[6], self.0[7]]);
                write!(f, "{asn}:{assigned}")
            }
            _ => {
                write!(f, "rd:{:02x?}", self.0)
            }
        }
    }
}

// ===== impl Esi =====

impl std::fmt::Display for Esi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let esi =
            self.0.iter().map(|byte| format!("{byte:02x}")).join(":");
        write!(f, "{esi}")
    }
}

// ===== impl Nlri =====

impl Nlri {
    // Returns whether this implementation ships a codec for the given
    // address family.
    pub fn supported(afi: Afi, safi: Safi) -> bool {
        matches!(afi, Afi::Ipv4 | Afi::Ipv6)
            && matches!(
                safi,
                Safi::Unicast
                    | Safi::Multicast
                    | Safi::LabeledUnicast
                    | Safi::LabeledVpn
            )
    }

    pub fn afi(&self) -> Afi {
        match self.prefix() {
            IpNetwork::V4(_) => Afi::Ipv4,
            IpNetwork::V6(_) => Afi::Ipv6,
        }
    }

    pub fn safi(&self) -> Safi {
        match self {
            Nlri::Unicast(_) => Safi::Unicast,
            Nlri::Multicast(_) => Safi::Multicast,
            Nlri::LabeledUnicast(_) => Safi::LabeledUnicast,
            Nlri::LabeledVpn(_) => Safi::LabeledVpn,
        }
    }

    pub fn family(&self) -> (Afi, Safi) {
        (self.afi(), self.safi())
    }

    pub fn prefix(&self) -> &IpNetwork {
        match self {
            Nlri::Unicast(nlri) | Nlri::Multicast(nlri) => &nlri.prefix,
            Nlri::LabeledUnicast(nlri) => &nlri.prefix,
            Nlri::LabeledVpn(nlri) => &nlri.prefix,
        }
    }

    pub fn path_id(&self) -> Option<PathId> {
        match self {
            Nlri::Unicast(nlri) | Nlri::Multicast(nlri) => nlri.path_id,
            Nlri::LabeledUnicast(nlri) => nlri.path_id,
            Nlri::LabeledVpn(nlri) => nlri.path_id,
        }
    }

    // Canonical byte string identifying this NLRI within its address family.
    //
    // This is the only legitimate dictionary key for Adj-RIB-Out lookups.
    // MPLS labels are deliberately excluded: they are rewritten on every
    // re-announcement and must not split the identity of a route.
    pub fn index(&self) -> Bytes {
        let mut buf = BytesMut::new();

        if let Some(path_id) = self.path_id() {
            buf.put_u32(path_id);
        }
        if let Nlri::LabeledVpn(nlri) = self {
            buf.put_slice(&nlri.rd.as_bytes());
        }
        let prefix = self.prefix();
        buf.put_u8(prefix.prefix());
        match prefix {
            IpNetwork::V4(prefix) => {
                let octets = prefix.ip().octets();
                buf.put_slice(&octets[..prefix_wire_len(prefix.prefix())]);
            }
            IpNetwork::V6(prefix) => {
                let octets = prefix.ip().octets();
                buf.put_slice(&octets[..prefix_wire_len(prefix.prefix())]);
            }
        }

        buf.freeze()
    }

    // Number of bytes this NLRI occupies on the wire.
    pub fn wire_len(&self, path_ids: bool) -> usize {
        let mut len = 1 + prefix_wire_len(self.prefix().prefix());
        if path_ids {
            len += 4;
        }
        match self {
            Nlri::Unicast(_) | Nlri::Multicast(_) => (),
            Nlri::LabeledUnicast(nlri) => {
                len += nlri.labels.wire_len();
            }
            Nlri::LabeledVpn(nlri) => {
                len += nlri.labels.wire_len() + RouteDistinguisher::LENGTH;
            }
        }
        len
    }

    pub fn encode(&self, buf: &mut BytesMut, path_ids: bool) {
        if path_ids {
            buf.put_u32(self.path_id().unwrap_or(0));
        }

        let prefix = self.prefix();
        let mut plen = prefix.prefix() as usize;
        match self {
            Nlri::Unicast(_) | Nlri::Multicast(_) => {
                buf.put_u8(plen as u8);
            }
            Nlri::LabeledUnicast(nlri) => {
                plen += nlri.labels.wire_len() * 8;
                buf.put_u8(plen as u8);
                nlri.labels.encode(buf);
            }
            Nlri::LabeledVpn(nlri) => {
                plen += nlri.labels.wire_len() * 8
                    + RouteDistinguisher::LENGTH * 8;
                buf.put_u8(plen as u8);
                nlri.labels.encode(buf);
                buf.put_slice(&nlri.rd.as_bytes());
            }
        }

        match prefix {
            IpNetwork::V4(prefix) => {
                let octets = prefix.ip().octets();
                buf.put_slice(&octets[..prefix_wire_len(prefix.prefix())]);
            }
            IpNetwork::V6(prefix) => {
                let octets = prefix.ip().octets();
                buf.put_slice(&octets[..prefix_wire_len(prefix.prefix())]);
            }
        }
    }

    // Decodes one NLRI of the given address family from the buffer.
    //
    // Semantically incorrect but well-formed prefixes are skipped by
    // returning `None`; anything that prevents the buffer from staying in
    // sync is an error.
    pub fn decode(
        buf: &mut Bytes,
        afi: Afi,
        safi: Safi,
        path_ids: bool,
    ) -> Result<Option<Nlri>, UpdateMessageError> {
        let path_id = if path_ids { Some(buf.try_get_u32()?) } else { None };

        let plen = buf.try_get_u8()?;
        let mut avail_bits = plen as usize;

        // Family-specific qualifiers precede the prefix bits.
        let mut labels = None;
        let mut rd = None;
        match safi {
            Safi::Unicast | Safi::Multicast => (),
            Safi::LabeledUnicast => {
                labels = Some(Labels::decode(buf, &mut avail_bits)?);
            }
            Safi::LabeledVpn => {
                labels = Some(Labels::decode(buf, &mut avail_bits)?);
                if avail_bits < RouteDistinguisher::LENGTH * 8 {
                    return Err(UpdateMessageError::InvalidNetworkField);
                }
                let mut bytes = [0; RouteDistinguisher::LENGTH];
                buf.try_copy_to_slice(&mut bytes)?;
                avail_bits -= RouteDistinguisher::LENGTH * 8;
                rd = Some(RouteDistinguisher::new(bytes));
            }
            _ => {
                // No registered codec for this family.
                return Err(UpdateMessageError::InvalidNetworkField);
            }
        }

        // Parse prefix address (variable length).
        let prefix = decode_prefix(buf, afi, avail_bits as u8)?;

        // Ignore semantically incorrect prefix.
        if !prefix.is_routable() {
            return Ok(None);
        }

        let nlri = match safi {
            Safi::Unicast => Nlri::Unicast(InetNlri { prefix, path_id }),
            Safi::Multicast => Nlri::Multicast(InetNlri { prefix, path_id }),
            Safi::LabeledUnicast => Nlri::LabeledUnicast(LabeledNlri {
                prefix,
                path_id,
                labels: labels.unwrap(),
            }),
            Safi::LabeledVpn => Nlri::LabeledVpn(VpnNlri {
                prefix,
                path_id,
                labels: labels.unwrap(),
                rd: rd.unwrap(),
            }),
            _ => unreachable!(),
        };

        Ok(Some(nlri))
    }
}

// ===== helper functions =====

fn decode_prefix(
    buf: &mut Bytes,
    afi: Afi,
    plen: u8,
) -> Result<IpNetwork, UpdateMessageError> {
    let plen_wire = prefix_wire_len(plen);
    if plen_wire > buf.remaining() || plen > afi.max_prefixlen() {
        return Err(UpdateMessageError::InvalidNetworkField);
    }

    let prefix = match afi {
        Afi::Ipv4 => {
            let mut prefix_bytes = [0; Ipv4Addr::LENGTH];
            buf.try_copy_to_slice(&mut prefix_bytes[..plen_wire])?;
            let prefix = Ipv4Addr::from(prefix_bytes);
            Ipv4Network::new(prefix, plen)
                .map(|prefix| prefix.apply_mask())
                .map(IpNetwork::V4)
                .map_err(|_| UpdateMessageError::InvalidNetworkField)?
        }
        Afi::Ipv6 => {
            let mut prefix_bytes = [0; Ipv6Addr::LENGTH];
            buf.try_copy_to_slice(&mut prefix_bytes[..plen_wire])?;
            let prefix = Ipv6Addr::from(prefix_bytes);
            Ipv6Network::new(prefix, plen)
                .map(|prefix| prefix.apply_mask())
                .map(IpNetwork::V6)
                .map_err(|_| UpdateMessageError::InvalidNetworkField)?
        }
    };

    Ok(prefix)
}

// Calculates the number of bytes required to encode a prefix.
pub(crate) fn prefix_wire_len(len: u8) -> usize {
    (len as usize).div_ceil(8)
}
