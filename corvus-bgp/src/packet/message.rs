//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use corvus_utils::bytes::{BytesExt, BytesMutExt, TLS_BUF};
use corvus_utils::ip::{Ipv4AddrExt, Ipv6AddrExt};
use enum_as_inner::EnumAsInner;
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use tracing::debug;

use crate::neighbor::PeerType;
use crate::packet::attribute::{Attrs, encode_attr_hdr};
use crate::packet::consts::{
    AddPathMode, Afi, AttrFlags, AttrType, BGP_VERSION, CapabilityCode,
    CeaseSubcode, ErrorCode, GrAfiSafiFlags, GrFlags, MessageHeaderErrorSubcode,
    MessageType, OpenMessageErrorSubcode, OpenParamType, RouteRefreshSubtype,
    Safi, UpdateMessageErrorSubcode,
};
use crate::packet::error::{
    DecodeError, DecodeResult, MessageHeaderError, OpenMessageError,
    RouteRefreshMessageError, UpdateMessageError,
};
use crate::packet::nlri::Nlri;

//
// BGP message.
//
// Encoding format (message header):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// +                                                               +
// |                                                               |
// +                                                               +
// |                           Marker                              |
// +                                                               +
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |          Length               |      Type     |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(EnumAsInner)]
#[derive(Deserialize, Serialize)]
pub enum Message {
    Open(OpenMsg),
    Update(UpdateMsg),
    Notification(NotificationMsg),
    Keepalive(KeepaliveMsg),
    RouteRefresh(RouteRefreshMsg),
    Operational(OperationalMsg),
}

//
// OPEN Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+
// |    Version    |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |     My Autonomous System      |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |           Hold Time           |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                         BGP Identifier                        |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Opt Parm Len  |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// |                                                               |
// |             Optional Parameters (variable)                    |
// |                                                               |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct OpenMsg {
    pub version: u8,
    pub my_as: u16,
    pub holdtime: u16,
    pub identifier: Ipv4Addr,
    pub capabilities: BTreeSet<Capability>,
}

//
// Capabilities Optional Parameter.
//
// Encoding format:
//
// +------------------------------+
// | Capability Code (1 octet)    |
// +------------------------------+
// | Capability Length (1 octet)  |
// +------------------------------+
// | Capability Value (variable)  |
// ~                              ~
// +------------------------------+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum Capability {
    MultiProtocol {
        afi: Afi,
        safi: Safi,
    },
    RouteRefresh,
    ExtendedNextHop(Vec<ExtNexthopTuple>),
    ExtendedMessage,
    GracefulRestart {
        flags: GrFlags,
        restart_time: u16,
        families: Vec<GrTuple>,
    },
    FourOctetAsNumber {
        asn: u32,
    },
    Multisession(Vec<u8>),
    AddPath(BTreeSet<AddPathTuple>),
    EnhancedRouteRefresh,
    Operational,
    Hostname {
        hostname: String,
        domain: Option<String>,
    },
    SoftwareVersion(String),
    // Unrecognized capabilities are retained verbatim instead of aborting
    // the session (RFC 5492).
    Unknown {
        code: u8,
        value: Bytes,
    },
}

// This is a stripped down version of `Capability`, containing only data that
// is relevant in terms of capability negotiation.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NegotiatedCapability {
    MultiProtocol {
        afi: Afi,
        safi: Safi,
    },
    FourOctetAsNumber,
    AddPath {
        afi: Afi,
        safi: Safi,
        send: bool,
        recv: bool,
    },
    RouteRefresh,
    EnhancedRouteRefresh,
    ExtendedMessage,
    GracefulRestart,
    Operational,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct AddPathTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub mode: AddPathMode,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct ExtNexthopTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub nexthop_afi: Afi,
}

#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct GrTuple {
    pub afi: Afi,
    pub safi: Safi,
    pub flags: GrAfiSafiFlags,
}

//
// UPDATE Message.
//
// Encoding format (message body):
//
// +-----------------------------------------------------+
// |   Withdrawn Routes Length (2 octets)                |
// +-----------------------------------------------------+
// |   Withdrawn Routes (variable)                       |
// +-----------------------------------------------------+
// |   Total Path Attribute Length (2 octets)            |
// +-----------------------------------------------------+
// |   Path Attributes (variable)                        |
// +-----------------------------------------------------+
// |   Network Layer Reachability Information (variable) |
// +-----------------------------------------------------+
//
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[skip_serializing_none]
#[derive(Deserialize, Serialize)]
pub struct UpdateMsg {
    pub reach: Option<ReachNlri>,
    pub unreach: Option<UnreachNlri>,
    pub mp_reach: Option<MpReachNlri>,
    pub mp_unreach: Option<MpUnreachNlri>,
    pub attrs: Option<Attrs>,
    // When RFC 7606 "treat-as-withdraw" converted the reachable NLRIs of
    // this message into withdrawals, the type of the attribute that failed.
    #[serde(default)]
    pub malformed_attr: Option<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct ReachNlri {
    pub prefixes: Vec<Nlri>,
    pub nexthop: Ipv4Addr,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct UnreachNlri {
    pub prefixes: Vec<Nlri>,
}

//
// MP_REACH_NLRI attribute payload (RFC 4760).
//
// An empty prefix list is never produced by the decoder; the encoder uses
// it only for graceful-restart End-of-RIB markers via `MpUnreachNlri`.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[skip_serializing_none]
#[derive(Deserialize, Serialize)]
pub struct MpReachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub nexthop: std::net::IpAddr,
    pub ll_nexthop: Option<Ipv6Addr>,
    pub prefixes: Vec<Nlri>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct MpUnreachNlri {
    pub afi: Afi,
    pub safi: Safi,
    pub prefixes: Vec<Nlri>,
}

//
// NOTIFICATION Message.
//
// Encoding format (message body):
//
// 0                   1                   2                   3
// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
// | Error code    | Error subcode |   Data (variable)             |
// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NotificationMsg {
    pub error_code: u8,
    pub error_subcode: u8,
    pub data: Vec<u8>,
}

//
// KEEPALIVE Message.
//
// A KEEPALIVE message consists of only the message header and has a length of
// 19 octets.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct KeepaliveMsg {}

//
// ROUTE-REFRESH Message.
//
// Encoding format (message body):
//
// 0       7      15      23      31
// +-------+-------+-------+-------+
// |      AFI      | Subt. | SAFI  |
// +-------+-------+-------+-------+
//
// RFC 7313 turned the reserved octet into a subtype used to bracket a
// refresh cycle (BoRR/EoRR).
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RouteRefreshMsg {
    pub afi: u16,
    pub safi: u8,
    pub subtype: RouteRefreshSubtype,
}

//
// OPERATIONAL Message (draft-ietf-idr-operational-message).
//
// The draft never progressed; the body is carried verbatim and surfaced to
// the caller, no sub-TLV semantics are implemented.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct OperationalMsg {
    pub body: Bytes,
}

// BGP message encoding context.
pub struct EncodeCxt {
    pub capabilities: BTreeSet<NegotiatedCapability>,
}

// BGP message decoding context.
#[derive(Debug)]
pub struct DecodeCxt {
    pub peer_type: PeerType,
    pub peer_as: u32,
    pub capabilities: BTreeSet<NegotiatedCapability>,
}

// ===== impl Message =====

impl Message {
    pub const MIN_LEN: u16 = 19;
    pub const MAX_LEN: u16 = 4096;
    // RFC 8654
    pub const MAX_LEN_EXT: u16 = 65535;
    const MSG_LEN_POS: std::ops::Range<usize> = 16..18;

    // Encodes BGP message into a bytes buffer.
    pub fn encode(&self, cxt: &EncodeCxt) -> Bytes {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            // Marker field.
            buf.put_u128(u128::MAX);
            // The length field will be initialized later.
            buf.put_u16(0);

            // Message type and body.
            match self {
                Message::Open(msg) => msg.encode(&mut buf),
                Message::Update(msg) => msg.encode(&mut buf, cxt),
                Message::Notification(msg) => msg.encode(&mut buf),
                Message::Keepalive(msg) => msg.encode(&mut buf),
                Message::RouteRefresh(msg) => msg.encode(&mut buf),
                Message::Operational(msg) => msg.encode(&mut buf),
            }

            // Rewrite message length.
            let msg_len = buf.len() as u16;
            buf[Self::MSG_LEN_POS].copy_from_slice(&msg_len.to_be_bytes());

            buf.clone().freeze()
        })
    }

    // Decode buffer into a BGP message.
    //
    // This function panics if the provided buffer doesn't contain an entire
    // message header.
    pub fn decode(data: &[u8], cxt: &DecodeCxt) -> DecodeResult<Self> {
        let mut buf = Bytes::copy_from_slice(data);

        // Parse and validate marker.
        let marker = buf.get_u128();
        if marker != u128::MAX {
            return Err(MessageHeaderError::ConnectionNotSynchronized.into());
        }

        // Parse and validate message length.
        let msg_len = buf.get_u16();
        if msg_len < Self::MIN_LEN || msg_len > max_msg_len(&cxt.capabilities) {
            return Err(MessageHeaderError::BadMessageLength(msg_len).into());
        }

        // Parse message type.
        let msg_type = buf.get_u8();
        let Some(msg_etype) = MessageType::from_u8(msg_type) else {
            return Err(MessageHeaderError::BadMessageType(msg_type).into());
        };

        // Parse message body.
        match msg_etype {
            MessageType::Open => {
                if msg_len < OpenMsg::MIN_LEN {
                    return Err(
                        MessageHeaderError::BadMessageLength(msg_len).into()
                    );
                }
                let msg = OpenMsg::decode(&mut buf)?;
                Ok(Message::Open(msg))
            }
            MessageType::Update => {
                if msg_len < UpdateMsg::MIN_LEN {
                    return Err(
                        MessageHeaderError::BadMessageLength(msg_len).into()
                    );
                }
                let msg = UpdateMsg::decode(&mut buf, cxt)?;
                Ok(Message::Update(msg))
            }
            MessageType::Notification => {
                if msg_len < NotificationMsg::MIN_LEN {
                    return Err(
                        MessageHeaderError::BadMessageLength(msg_len).into()
                    );
                }
                let msg = NotificationMsg::decode(&mut buf)?;
                Ok(Message::Notification(msg))
            }
            MessageType::Keepalive => {
                if msg_len != KeepaliveMsg::LEN {
                    return Err(
                        MessageHeaderError::BadMessageLength(msg_len).into()
                    );
                }
                let msg = KeepaliveMsg::decode(&mut buf)?;
                Ok(Message::Keepalive(msg))
            }
            MessageType::RouteRefresh => {
                if msg_len != RouteRefreshMsg::LEN {
                    return Err(RouteRefreshMessageError::InvalidMessageLength(
                        msg_len,
                    )
                    .into());
                }
                let msg = RouteRefreshMsg::decode(&mut buf)?;
                Ok(Message::RouteRefresh(msg))
            }
            MessageType::Operational => {
                // Only valid once both peers advertised the corresponding
                // capability.
                if !cxt
                    .capabilities
                    .contains(&NegotiatedCapability::Operational)
                {
                    return Err(
                        MessageHeaderError::BadMessageType(msg_type).into()
                    );
                }
                let msg = OperationalMsg::decode(&mut buf)?;
                Ok(Message::Operational(msg))
            }
        }
    }

    // Parses the given buffer to determine if it contains a complete BGP
    // message, and returns the length of the message if successful.
    //
    // A length field below the minimum is reported as a minimum-sized
    // message so that `decode` runs and produces the proper notification
    // instead of stalling the read loop.
    pub fn get_message_len(data: &[u8]) -> Option<usize> {
        // Validate that the buffer contains sufficient space for at least the
        // message header.
        let buf_size = data.len();
        if buf_size < Self::MIN_LEN as usize {
            return None;
        }

        // Ensure the buffer is big enough to hold the entire message.
        let mut buf = Bytes::copy_from_slice(&data[0..Self::MIN_LEN as usize]);
        let _marker = buf.get_u128();
        let msg_len = buf.get_u16();
        if msg_len < Self::MIN_LEN {
            return Some(Self::MIN_LEN as usize);
        }
        if msg_len as usize > buf_size {
            return None;
        }

        // Return the message size.
        Some(msg_len as usize)
    }

    pub fn msg_type(&self) -> MessageType {
        match self {
            Message::Open(_) => MessageType::Open,
            Message::Update(_) => MessageType::Update,
            Message::Notification(_) => MessageType::Notification,
            Message::Keepalive(_) => MessageType::Keepalive,
            Message::RouteRefresh(_) => MessageType::RouteRefresh,
            Message::Operational(_) => MessageType::Operational,
        }
    }
}

// ===== impl OpenMsg =====

impl OpenMsg {
    const MIN_LEN: u16 = 29;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Open as u8);
        buf.put_u8(self.version);
        buf.put_u16(self.my_as);
        buf.put_u16(self.holdtime);
        buf.put_ipv4(&self.identifier);

        // Capabilities.
        let opt_param_len_pos = buf.len();
        buf.put_u8(0);
        for capability in &self.capabilities {
            buf.put_u8(OpenParamType::Capabilities as u8);

            // The "Parm. Length" field will be initialized later.
            let param_len_pos = buf.len();
            buf.put_u8(0);

            // Encode individual capability.
            capability.encode(buf);

            // Rewrite the "Parm. Length" field.
            let param_len = buf.len() - param_len_pos - 1;
            buf[param_len_pos] = param_len as u8;
        }

        // Rewrite the "Opt Parm Len" field.
        let opt_param_len = buf.len() - opt_param_len_pos - 1;
        buf[opt_param_len_pos] = opt_param_len as u8;
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        // Parse and validate BGP version.
        let version = buf.try_get_u8()?;
        if version != BGP_VERSION {
            return Err(
                OpenMessageError::UnsupportedVersion(BGP_VERSION).into()
            );
        }

        // Parse and validate ASN.
        let my_as = buf.try_get_u16()?;
        if my_as == 0 {
            return Err(OpenMessageError::BadPeerAs.into());
        }

        // Parse and validate hold time.
        //
        // Zero disables the hold timer, any other value must be at least
        // three seconds.
        let holdtime = buf.try_get_u16()?;
        if holdtime == 1 || holdtime == 2 {
            return Err(OpenMessageError::UnacceptableHoldTime.into());
        }

        // Parse and validate BGP identifier.
        let identifier = buf.try_get_ipv4()?;
        if identifier.is_unspecified()
            || identifier.is_multicast()
            || identifier.is_broadcast()
        {
            return Err(OpenMessageError::BadBgpIdentifier.into());
        }

        // Parse and validate optional parameters.
        let mut capabilities = BTreeSet::new();
        let opt_param_len = buf.try_get_u8()?;
        if opt_param_len as usize > buf.remaining() {
            return Err(OpenMessageError::MalformedOptParam.into());
        }
        let mut buf_opts = buf.copy_to_bytes(opt_param_len as usize);
        while buf_opts.remaining() > 0 {
            if buf_opts.remaining() < 2 {
                return Err(OpenMessageError::MalformedOptParam.into());
            }
            let param_type = buf_opts.get_u8();
            let param_len = buf_opts.get_u8();
            if param_len as usize > buf_opts.remaining() {
                return Err(OpenMessageError::MalformedOptParam.into());
            }
            let mut buf_param_value =
                buf_opts.copy_to_bytes(param_len as usize);

            // Parse and validate capabilities.
            match OpenParamType::from_u8(param_type) {
                Some(OpenParamType::Capabilities) => {
                    while buf_param_value.remaining() > 0 {
                        if let Some(cap) =
                            Capability::decode(&mut buf_param_value)?
                        {
                            Self::insert_capability(&mut capabilities, cap);
                        }
                    }
                }
                Some(OpenParamType::Authentication) => {
                    // RFC 5492 deprecated the authentication parameter.
                    return Err(OpenMessageError::AuthenticationFailure.into());
                }
                None => {
                    return Err(OpenMessageError::UnsupportedOptParam.into());
                }
            }
        }

        Ok(OpenMsg {
            version,
            my_as,
            holdtime,
            identifier,
            capabilities,
        })
    }

    // Inserts a parsed capability, keeping the first occurrence when a
    // singleton capability code shows up more than once.
    fn insert_capability(
        capabilities: &mut BTreeSet<Capability>,
        cap: Capability,
    ) {
        // Capabilities that may legitimately appear multiple times
        // (one instance per address family).
        let cumulative = matches!(
            cap,
            Capability::MultiProtocol { .. }
                | Capability::AddPath(..)
                | Capability::ExtendedNextHop(..)
                | Capability::Unknown { .. }
        );

        if !cumulative
            && let Some(first) =
                capabilities.iter().find(|c| c.code_u8() == cap.code_u8())
        {
            debug!(code = %cap.code_u8(), first = ?first,
                "duplicate capability, keeping first occurrence");
            return;
        }

        capabilities.insert(cap);
    }

    // Returns the four-octet ASN when advertised, the ASN field otherwise.
    pub fn real_as(&self) -> u32 {
        self.capabilities
            .iter()
            .find_map(|cap| {
                if let Capability::FourOctetAsNumber { asn } = cap {
                    Some(*asn)
                } else {
                    None
                }
            })
            .unwrap_or(self.my_as as u32)
    }

    // Returns the multiprotocol families advertised in this message.
    pub fn mp_families(&self) -> BTreeSet<(Afi, Safi)> {
        self.capabilities
            .iter()
            .filter_map(|cap| {
                if let Capability::MultiProtocol { afi, safi } = cap {
                    Some((*afi, *safi))
                } else {
                    None
                }
            })
            .collect()
    }

    // Returns the ADD-PATH tuples advertised in this message.
    pub fn addpath_tuples(&self) -> BTreeSet<AddPathTuple> {
        self.capabilities
            .iter()
            .filter_map(|cap| {
                if let Capability::AddPath(tuples) = cap {
                    Some(tuples.iter().copied())
                } else {
                    None
                }
            })
            .flatten()
            .collect()
    }

    pub fn has_capability(&self, code: CapabilityCode) -> bool {
        self.capabilities.iter().any(|cap| cap.code() == Some(code))
    }
}

// ===== impl Capability =====

impl Capability {
    fn encode(&self, buf: &mut BytesMut) {
        let start_pos = buf.len();

        match self {
            Capability::MultiProtocol { afi, safi } => {
                buf.put_u8(CapabilityCode::MultiProtocol as u8);
                buf.put_u8(0);
                buf.put_u16(*afi as u16);
                buf.put_u8(0);
                buf.put_u8(*safi as u8);
            }
            Capability::RouteRefresh => {
                buf.put_u8(CapabilityCode::RouteRefresh as u8);
                buf.put_u8(0);
            }
            Capability::ExtendedNextHop(tuples) => {
                buf.put_u8(CapabilityCode::ExtendedNextHop as u8);
                buf.put_u8(0);
                for tuple in tuples {
                    buf.put_u16(tuple.afi as u16);
                    buf.put_u16(tuple.safi as u16);
                    buf.put_u16(tuple.nexthop_afi as u16);
                }
            }
            Capability::ExtendedMessage => {
                buf.put_u8(CapabilityCode::ExtendedMessage as u8);
                buf.put_u8(0);
            }
            Capability::GracefulRestart {
                flags,
                restart_time,
                families,
            } => {
                buf.put_u8(CapabilityCode::GracefulRestart as u8);
                buf.put_u8(0);
                buf.put_u16(
                    ((flags.bits() as u16) << 12) | (restart_time & 0x0fff),
                );
                for family in families {
                    buf.put_u16(family.afi as u16);
                    buf.put_u8(family.safi as u8);
                    buf.put_u8(family.flags.bits());
                }
            }
            Capability::FourOctetAsNumber { asn } => {
                buf.put_u8(CapabilityCode::FourOctetAsNumber as u8);
                buf.put_u8(0);
                buf.put_u32(*asn);
            }
            Capability::Multisession(codes) => {
                buf.put_u8(CapabilityCode::Multisession as u8);
                buf.put_u8(0);
                for code in codes {
                    buf.put_u8(*code);
                }
            }
            Capability::AddPath(tuples) => {
                buf.put_u8(CapabilityCode::AddPath as u8);
                buf.put_u8(0);
                for tuple in tuples {
                    buf.put_u16(tuple.afi as u16);
                    buf.put_u8(tuple.safi as u8);
                    buf.put_u8(tuple.mode as u8);
                }
            }
            Capability::EnhancedRouteRefresh => {
                buf.put_u8(CapabilityCode::EnhancedRouteRefresh as u8);
                buf.put_u8(0);
            }
            Capability::Operational => {
                buf.put_u8(CapabilityCode::Operational as u8);
                buf.put_u8(0);
            }
            Capability::Hostname { hostname, domain } => {
                buf.put_u8(CapabilityCode::Hostname as u8);
                buf.put_u8(0);
                buf.put_u8(hostname.len() as u8);
                buf.put_slice(hostname.as_bytes());
                match domain {
                    Some(domain) => {
                        buf.put_u8(domain.len() as u8);
                        buf.put_slice(domain.as_bytes());
                    }
                    None => buf.put_u8(0),
                }
            }
            Capability::SoftwareVersion(version) => {
                buf.put_u8(CapabilityCode::SoftwareVersion as u8);
                buf.put_u8(0);
                buf.put_u8(version.len() as u8);
                buf.put_slice(version.as_bytes());
            }
            Capability::Unknown { code, value } => {
                buf.put_u8(*code);
                buf.put_u8(0);
                buf.put_slice(value);
            }
        }

        // Rewrite the "Capability Length" field.
        let cap_len = buf.len() - start_pos - 2;
        buf[start_pos + 1] = cap_len as u8;
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Option<Self>> {
        if buf.remaining() < 2 {
            return Err(OpenMessageError::MalformedOptParam.into());
        }
        let cap_type = buf.get_u8();
        let cap_len = buf.get_u8();
        if cap_len as usize > buf.remaining() {
            return Err(OpenMessageError::MalformedOptParam.into());
        }

        let mut buf_cap = buf.copy_to_bytes(cap_len as usize);
        let cap = match CapabilityCode::from_u8(cap_type) {
            Some(CapabilityCode::MultiProtocol) => {
                if cap_len != 4 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let afi = buf_cap.get_u16();
                let Some(afi) = Afi::from_u16(afi) else {
                    // Ignore unknown AFI.
                    return Ok(None);
                };
                let _reserved = buf_cap.get_u8();
                let safi = buf_cap.get_u8();
                let Some(safi) = Safi::from_u8(safi) else {
                    // Ignore unknown SAFI.
                    return Ok(None);
                };

                Capability::MultiProtocol { afi, safi }
            }
            Some(CapabilityCode::RouteRefresh) => {
                if cap_len != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                Capability::RouteRefresh
            }
            Some(CapabilityCode::ExtendedNextHop) => {
                if cap_len % 6 != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let mut tuples = Vec::new();
                while buf_cap.remaining() > 0 {
                    let afi = buf_cap.get_u16();
                    let safi = buf_cap.get_u16();
                    let nexthop_afi = buf_cap.get_u16();
                    let (Some(afi), Some(safi), Some(nexthop_afi)) = (
                        Afi::from_u16(afi),
                        u8::try_from(safi).ok().and_then(Safi::from_u8),
                        Afi::from_u16(nexthop_afi),
                    ) else {
                        // Ignore unknown family.
                        continue;
                    };
                    tuples.push(ExtNexthopTuple {
                        afi,
                        safi,
                        nexthop_afi,
                    });
                }
                Capability::ExtendedNextHop(tuples)
            }
            Some(CapabilityCode::ExtendedMessage) => {
                if cap_len != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                Capability::ExtendedMessage
            }
            Some(CapabilityCode::GracefulRestart) => {
                if cap_len < 2 || (cap_len - 2) % 4 != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let word = buf_cap.get_u16();
                let flags = GrFlags::from_bits_truncate((word >> 12) as u8);
                let restart_time = word & 0x0fff;
                let mut families = Vec::new();
                while buf_cap.remaining() > 0 {
                    let afi = buf_cap.get_u16();
                    let safi = buf_cap.get_u8();
                    let af_flags = buf_cap.get_u8();
                    let (Some(afi), Some(safi)) =
                        (Afi::from_u16(afi), Safi::from_u8(safi))
                    else {
                        // Ignore unknown family.
                        continue;
                    };
                    families.push(GrTuple {
                        afi,
                        safi,
                        flags: GrAfiSafiFlags::from_bits_truncate(af_flags),
                    });
                }
                Capability::GracefulRestart {
                    flags,
                    restart_time,
                    families,
                }
            }
            Some(CapabilityCode::FourOctetAsNumber) => {
                if cap_len != 4 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let asn = buf_cap.get_u32();
                Capability::FourOctetAsNumber { asn }
            }
            Some(CapabilityCode::Multisession) => {
                Capability::Multisession(buf_cap.to_vec())
            }
            Some(CapabilityCode::AddPath) => {
                if cap_len % 4 != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                let mut tuples = BTreeSet::new();
                while buf_cap.remaining() > 0 {
                    let afi = buf_cap.get_u16();
                    let Some(afi) = Afi::from_u16(afi) else {
                        // Ignore unknown AFI.
                        return Ok(None);
                    };
                    let safi = buf_cap.get_u8();
                    let Some(safi) = Safi::from_u8(safi) else {
                        // Ignore unknown SAFI.
                        return Ok(None);
                    };
                    let mode = buf_cap.get_u8();
                    let Some(mode) = AddPathMode::from_u8(mode) else {
                        // Ignore unknown value.
                        return Ok(None);
                    };
                    tuples.insert(AddPathTuple { afi, safi, mode });
                }
                Capability::AddPath(tuples)
            }
            Some(CapabilityCode::EnhancedRouteRefresh) => {
                if cap_len != 0 {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }

                Capability::EnhancedRouteRefresh
            }
            Some(CapabilityCode::Operational) => Capability::Operational,
            Some(CapabilityCode::Hostname) => {
                let hostname_len = buf_cap.try_get_u8()?;
                if hostname_len as usize > buf_cap.remaining() {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }
                let hostname = buf_cap.copy_to_bytes(hostname_len as usize);
                let hostname = String::from_utf8_lossy(&hostname).into_owned();

                let mut domain = None;
                if buf_cap.remaining() > 0 {
                    let domain_len = buf_cap.get_u8();
                    if domain_len as usize > buf_cap.remaining() {
                        return Err(OpenMessageError::MalformedOptParam.into());
                    }
                    if domain_len > 0 {
                        let bytes = buf_cap.copy_to_bytes(domain_len as usize);
                        domain =
                            Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                }

                Capability::Hostname { hostname, domain }
            }
            Some(CapabilityCode::SoftwareVersion) => {
                let version_len = buf_cap.try_get_u8()?;
                if version_len as usize > buf_cap.remaining() {
                    return Err(OpenMessageError::MalformedOptParam.into());
                }
                let version = buf_cap.copy_to_bytes(version_len as usize);
                let version = String::from_utf8_lossy(&version).into_owned();

                Capability::SoftwareVersion(version)
            }
            // Unknown codes (and the pre-standard Multisession alias) are
            // retained verbatim; the session proceeds without them.
            _ => Capability::Unknown {
                code: cap_type,
                value: buf_cap,
            },
        };

        Ok(Some(cap))
    }

    pub fn code(&self) -> Option<CapabilityCode> {
        match self {
            Capability::MultiProtocol { .. } => {
                Some(CapabilityCode::MultiProtocol)
            }
            Capability::RouteRefresh => Some(CapabilityCode::RouteRefresh),
            Capability::ExtendedNextHop(..) => {
                Some(CapabilityCode::ExtendedNextHop)
            }
            Capability::ExtendedMessage => {
                Some(CapabilityCode::ExtendedMessage)
            }
            Capability::GracefulRestart { .. } => {
                Some(CapabilityCode::GracefulRestart)
            }
            Capability::FourOctetAsNumber { .. } => {
                Some(CapabilityCode::FourOctetAsNumber)
            }
            Capability::Multisession(..) => Some(CapabilityCode::Multisession),
            Capability::AddPath { .. } => Some(CapabilityCode::AddPath),
            Capability::EnhancedRouteRefresh => {
                Some(CapabilityCode::EnhancedRouteRefresh)
            }
            Capability::Operational => Some(CapabilityCode::Operational),
            Capability::Hostname { .. } => Some(CapabilityCode::Hostname),
            Capability::SoftwareVersion(..) => {
                Some(CapabilityCode::SoftwareVersion)
            }
            Capability::Unknown { .. } => None,
        }
    }

    fn code_u8(&self) -> u8 {
        match self {
            Capability::Unknown { code, .. } => *code,
            _ => self.code().unwrap().to_u8().unwrap(),
        }
    }
}

// ===== impl NegotiatedCapability =====

impl NegotiatedCapability {
    pub fn code(&self) -> CapabilityCode {
        match self {
            NegotiatedCapability::MultiProtocol { .. } => {
                CapabilityCode::MultiProtocol
            }
            NegotiatedCapability::FourOctetAsNumber => {
                CapabilityCode::FourOctetAsNumber
            }
            NegotiatedCapability::AddPath { .. } => CapabilityCode::AddPath,
            NegotiatedCapability::RouteRefresh => CapabilityCode::RouteRefresh,
            NegotiatedCapability::EnhancedRouteRefresh => {
                CapabilityCode::EnhancedRouteRefresh
            }
            NegotiatedCapability::ExtendedMessage => {
                CapabilityCode::ExtendedMessage
            }
            NegotiatedCapability::GracefulRestart => {
                CapabilityCode::GracefulRestart
            }
            NegotiatedCapability::Operational => CapabilityCode::Operational,
        }
    }
}

// Computes the capabilities shared by both ends of the session.
//
// The ADD-PATH directions are evaluated from the local perspective:
// we may send path identifiers when we advertised Send and the peer
// advertised Receive, and vice versa.
pub fn negotiate_capabilities(
    local: &BTreeSet<Capability>,
    remote: &BTreeSet<Capability>,
) -> BTreeSet<NegotiatedCapability> {
    let mut nego = BTreeSet::new();

    let local_has =
        |code| local.iter().any(|cap: &Capability| cap.code() == Some(code));
    let remote_has =
        |code| remote.iter().any(|cap: &Capability| cap.code() == Some(code));
    let both =
        |code| local_has(code) && remote_has(code);

    // Multiprotocol families.
    let local_mp = mp_families(local);
    let remote_mp = mp_families(remote);
    for (afi, safi) in local_mp.intersection(&remote_mp) {
        nego.insert(NegotiatedCapability::MultiProtocol {
            afi: *afi,
            safi: *safi,
        });
    }

    // ADD-PATH directions.
    let local_ap = addpath_tuples(local);
    let remote_ap = addpath_tuples(remote);
    for (family, local_mode) in &local_ap {
        let Some(remote_mode) = remote_ap.get(family) else {
            continue;
        };
        let send = local_mode.can_send() && remote_mode.can_receive();
        let recv = local_mode.can_receive() && remote_mode.can_send();
        if send || recv {
            nego.insert(NegotiatedCapability::AddPath {
                afi: family.0,
                safi: family.1,
                send,
                recv,
            });
        }
    }

    if both(CapabilityCode::FourOctetAsNumber) {
        nego.insert(NegotiatedCapability::FourOctetAsNumber);
    }
    if both(CapabilityCode::RouteRefresh) {
        nego.insert(NegotiatedCapability::RouteRefresh);
    }
    if both(CapabilityCode::EnhancedRouteRefresh) {
        nego.insert(NegotiatedCapability::EnhancedRouteRefresh);
    }
    if both(CapabilityCode::ExtendedMessage) {
        nego.insert(NegotiatedCapability::ExtendedMessage);
    }
    if both(CapabilityCode::GracefulRestart) {
        nego.insert(NegotiatedCapability::GracefulRestart);
    }
    if both(CapabilityCode::Operational) {
        nego.insert(NegotiatedCapability::Operational);
    }

    nego
}

fn mp_families(caps: &BTreeSet<Capability>) -> BTreeSet<(Afi, Safi)> {
    caps.iter()
        .filter_map(|cap| {
            if let Capability::MultiProtocol { afi, safi } = cap {
                Some((*afi, *safi))
            } else {
                None
            }
        })
        .collect()
}

fn addpath_tuples(
    caps: &BTreeSet<Capability>,
) -> std::collections::BTreeMap<(Afi, Safi), AddPathMode> {
    caps.iter()
        .filter_map(|cap| {
            if let Capability::AddPath(tuples) = cap {
                Some(tuples.iter())
            } else {
                None
            }
        })
        .flatten()
        .map(|tuple| ((tuple.afi, tuple.safi), tuple.mode))
        .collect()
}

impl AddPathMode {
    pub fn can_send(&self) -> bool {
        matches!(self, AddPathMode::Send | AddPathMode::ReceiveSend)
    }

    pub fn can_receive(&self) -> bool {
        matches!(self, AddPathMode::Receive | AddPathMode::ReceiveSend)
    }
}

// ===== encode/decode context helpers =====

pub(crate) fn max_msg_len(caps: &BTreeSet<NegotiatedCapability>) -> u16 {
    if caps.contains(&NegotiatedCapability::ExtendedMessage) {
        Message::MAX_LEN_EXT
    } else {
        Message::MAX_LEN
    }
}

fn four_octet_asn(caps: &BTreeSet<NegotiatedCapability>) -> bool {
    caps.contains(&NegotiatedCapability::FourOctetAsNumber)
}

fn addpath_send(
    caps: &BTreeSet<NegotiatedCapability>,
    afi: Afi,
    safi: Safi,
) -> bool {
    caps.iter().any(|cap| {
        matches!(cap, NegotiatedCapability::AddPath { afi: a, safi: s, send, .. }
            if *a == afi && *s == safi && *send)
    })
}

fn addpath_recv(
    caps: &BTreeSet<NegotiatedCapability>,
    afi: Afi,
    safi: Safi,
) -> bool {
    caps.iter().any(|cap| {
        matches!(cap, NegotiatedCapability::AddPath { afi: a, safi: s, recv, .. }
            if *a == afi && *s == safi && *recv)
    })
}

impl EncodeCxt {
    pub fn four_octet_asn(&self) -> bool {
        four_octet_asn(&self.capabilities)
    }

    pub fn addpath_send(&self, afi: Afi, safi: Safi) -> bool {
        addpath_send(&self.capabilities, afi, safi)
    }

    pub fn max_msg_len(&self) -> u16 {
        max_msg_len(&self.capabilities)
    }
}

impl DecodeCxt {
    pub fn four_octet_asn(&self) -> bool {
        four_octet_asn(&self.capabilities)
    }

    pub fn addpath_recv(&self, afi: Afi, safi: Safi) -> bool {
        addpath_recv(&self.capabilities, afi, safi)
    }

    pub fn max_msg_len(&self) -> u16 {
        max_msg_len(&self.capabilities)
    }
}

// ===== impl UpdateMsg =====

impl UpdateMsg {
    pub const MIN_LEN: u16 = 23;

    fn encode(&self, buf: &mut BytesMut, cxt: &EncodeCxt) {
        buf.put_u8(MessageType::Update as u8);

        // Withdrawn Routes.
        let start_pos = buf.len();
        buf.put_u16(0);
        if let Some(unreach) = &self.unreach {
            let path_ids = cxt.addpath_send(Afi::Ipv4, Safi::Unicast);
            for nlri in &unreach.prefixes {
                nlri.encode(buf, path_ids);
            }

            // Rewrite the "Withdrawn Routes Length" field.
            let len = (buf.len() - start_pos - 2) as u16;
            buf[start_pos..start_pos + 2].copy_from_slice(&len.to_be_bytes());
        }

        // Path Attributes.
        //
        // RFC 7606 - Section 5.1:
        // "The MP_REACH_NLRI or MP_UNREACH_NLRI attribute (if present) SHALL
        // be encoded as the very first path attribute in an UPDATE message".
        let start_pos = buf.len();
        buf.put_u16(0);
        if self.attrs.is_some()
            || self.mp_reach.is_some()
            || self.mp_unreach.is_some()
        {
            if let Some(mp_reach) = &self.mp_reach {
                mp_reach.encode(buf, cxt);
            }
            if let Some(mp_unreach) = &self.mp_unreach {
                mp_unreach.encode(buf, cxt);
            }
            if let Some(attrs) = &self.attrs {
                attrs.encode(buf, &self.reach, cxt);
            }

            // Rewrite the "Total Path Attribute Length" field.
            let len = (buf.len() - start_pos - 2) as u16;
            buf[start_pos..start_pos + 2].copy_from_slice(&len.to_be_bytes());
        }

        // Network Layer Reachability Information.
        if let Some(reach) = &self.reach {
            let path_ids = cxt.addpath_send(Afi::Ipv4, Safi::Unicast);
            for nlri in &reach.prefixes {
                nlri.encode(buf, path_ids);
            }
        }
    }

    pub fn decode(buf: &mut Bytes, cxt: &DecodeCxt) -> DecodeResult<Self> {
        let mut reach = None;
        let mut unreach = None;
        let mut mp_reach = None;
        let mut mp_unreach = None;
        let mut attrs = None;
        let mut nexthop = None;
        let mut malformed_attr = None;

        let path_ids = cxt.addpath_recv(Afi::Ipv4, Safi::Unicast);

        // Withdrawn Routes Length.
        let wdraw_len = buf.try_get_u16()?;
        if wdraw_len as usize > buf.remaining() {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }

        // Withdrawn Routes.
        let mut buf_wdraw = buf.copy_to_bytes(wdraw_len as usize);
        let mut prefixes = Vec::new();
        while buf_wdraw.remaining() > 0 {
            if let Some(nlri) = Nlri::decode(
                &mut buf_wdraw,
                Afi::Ipv4,
                Safi::Unicast,
                path_ids,
            )
            .map_err(DecodeError::from)?
            {
                prefixes.push(nlri);
            }
        }
        if !prefixes.is_empty() {
            unreach = Some(UnreachNlri { prefixes });
        }

        // Total Path Attribute Length.
        if buf.remaining() < 2 {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }
        let attr_len = buf.get_u16();
        if attr_len as usize > buf.remaining() {
            return Err(UpdateMessageError::MalformedAttributeList.into());
        }

        // Path Attributes.
        if attr_len != 0 {
            let mut buf_attr = buf.copy_to_bytes(attr_len as usize);
            let nlri_present = buf.remaining() > 0;
            attrs = Attrs::decode(
                &mut buf_attr,
                cxt,
                &mut nexthop,
                nlri_present,
                &mut mp_unreach,
                &mut mp_reach,
                &mut malformed_attr,
            )?;
        }

        // Network Layer Reachability Information.
        //
        // All prefixes are ignored if the NEXT_HOP attribute is missing.
        let mut prefixes = Vec::new();
        while buf.remaining() > 0 {
            if let Some(nlri) =
                Nlri::decode(buf, Afi::Ipv4, Safi::Unicast, path_ids)
                    .map_err(DecodeError::from)?
            {
                prefixes.push(nlri);
            }
        }
        if !prefixes.is_empty()
            && let Some(nexthop) = nexthop
        {
            reach = Some(ReachNlri { prefixes, nexthop });
        }

        Ok(UpdateMsg {
            reach,
            unreach,
            mp_reach,
            mp_unreach,
            attrs,
            malformed_attr,
        })
    }

    // An UPDATE with no withdrawn routes, no path attributes and no NLRI is
    // the IPv4-unicast End-of-RIB marker (RFC 4724).
    pub fn is_eor(&self) -> Option<(Afi, Safi)> {
        if self.reach.is_none()
            && self.unreach.is_none()
            && self.mp_reach.is_none()
            && self.attrs.is_none()
        {
            match &self.mp_unreach {
                None => return Some((Afi::Ipv4, Safi::Unicast)),
                Some(mp_unreach) if mp_unreach.prefixes.is_empty() => {
                    return Some((mp_unreach.afi, mp_unreach.safi));
                }
                _ => (),
            }
        }
        None
    }
}

// ===== impl MpReachNlri =====

impl MpReachNlri {
    pub const MIN_LEN: u16 = 5;

    pub(crate) fn encode(&self, buf: &mut BytesMut, cxt: &EncodeCxt) {
        // Encode attribute data into a scratch buffer so the length field
        // can use the short form whenever it fits.
        let mut value = BytesMut::new();
        value.put_u16(self.afi as u16);
        value.put_u8(self.safi as u8);

        // Next hop: VPN families prepend a zeroed route distinguisher
        // (RFC 4364 - Section 4.3.2).
        let rd_pad = if self.safi == Safi::LabeledVpn { 8 } else { 0 };
        match &self.nexthop {
            std::net::IpAddr::V4(addr) => {
                value.put_u8((rd_pad + Ipv4Addr::LENGTH) as u8);
                value.put_slice(&vec![0; rd_pad]);
                value.put_ipv4(addr);
            }
            std::net::IpAddr::V6(addr) => {
                let mut nh_len = rd_pad + Ipv6Addr::LENGTH;
                if self.ll_nexthop.is_some() {
                    nh_len += Ipv6Addr::LENGTH;
                }
                value.put_u8(nh_len as u8);
                value.put_slice(&vec![0; rd_pad]);
                value.put_ipv6(addr);
                if let Some(ll_nexthop) = &self.ll_nexthop {
                    value.put_ipv6(ll_nexthop);
                }
            }
        }
        value.put_u8(0);

        // Encode prefixes.
        let path_ids = cxt.addpath_send(self.afi, self.safi);
        for nlri in &self.prefixes {
            nlri.encode(&mut value, path_ids);
        }

        encode_attr_hdr(
            buf,
            AttrFlags::OPTIONAL,
            AttrType::MpReachNlri,
            value.len(),
        );
        buf.put_slice(&value);
    }

    pub(crate) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        mp_reach: &mut Option<Self>,
    ) -> Result<(), crate::packet::error::AttrError> {
        use crate::packet::error::AttrError;

        if buf.remaining() < Self::MIN_LEN as usize {
            return Err(AttrError::Reset);
        }

        // Parse AFI and SAFI.
        let afi = buf.get_u16();
        let safi = buf.get_u8();
        let (Some(afi), Some(safi)) = (Afi::from_u16(afi), Safi::from_u8(safi))
        else {
            // Ignore unknown family.
            return Err(AttrError::Discard);
        };
        if !Nlri::supported(afi, safi) {
            // No registered codec for this family.
            return Err(AttrError::Discard);
        }

        // Parse nexthop(s). VPN families carry a zeroed route distinguisher
        // in front of the address.
        let rd_pad = if safi == Safi::LabeledVpn { 8 } else { 0 };
        let nexthop_len = buf.try_get_u8().map_err(|_| AttrError::Reset)?
            as usize;
        if nexthop_len > buf.remaining() {
            return Err(AttrError::Reset);
        }
        let mut ll_nexthop = None;
        let nexthop = match afi {
            Afi::Ipv4 => {
                if nexthop_len != rd_pad + Ipv4Addr::LENGTH {
                    return Err(AttrError::Reset);
                }
                buf.advance(rd_pad);
                std::net::IpAddr::V4(buf.get_ipv4())
            }
            Afi::Ipv6 => {
                if nexthop_len != rd_pad + Ipv6Addr::LENGTH
                    && nexthop_len != rd_pad + Ipv6Addr::LENGTH * 2
                {
                    return Err(AttrError::Reset);
                }
                buf.advance(rd_pad);
                let nexthop = buf.get_ipv6();
                if nexthop_len == rd_pad + Ipv6Addr::LENGTH * 2 {
                    ll_nexthop = Some(buf.get_ipv6());
                }
                std::net::IpAddr::V6(nexthop)
            }
        };

        // Parse prefixes.
        let _reserved = buf.try_get_u8().map_err(|_| AttrError::Reset)?;
        let path_ids = cxt.addpath_recv(afi, safi);
        let mut prefixes = Vec::new();
        while buf.remaining() > 0 {
            if let Some(nlri) = Nlri::decode(buf, afi, safi, path_ids)
                .map_err(|_| AttrError::Reset)?
            {
                prefixes.push(nlri);
            }
        }

        *mp_reach = Some(MpReachNlri {
            afi,
            safi,
            nexthop,
            ll_nexthop,
            prefixes,
        });

        Ok(())
    }
}

// ===== impl MpUnreachNlri =====

impl MpUnreachNlri {
    pub const MIN_LEN: u16 = 3;

    pub(crate) fn encode(&self, buf: &mut BytesMut, cxt: &EncodeCxt) {
        let mut value = BytesMut::new();
        value.put_u16(self.afi as u16);
        value.put_u8(self.safi as u8);

        let path_ids = cxt.addpath_send(self.afi, self.safi);
        for nlri in &self.prefixes {
            nlri.encode(&mut value, path_ids);
        }

        encode_attr_hdr(
            buf,
            AttrFlags::OPTIONAL,
            AttrType::MpUnreachNlri,
            value.len(),
        );
        buf.put_slice(&value);
    }

    pub(crate) fn decode(
        buf: &mut Bytes,
        cxt: &DecodeCxt,
        mp_unreach: &mut Option<Self>,
    ) -> Result<(), crate::packet::error::AttrError> {
        use crate::packet::error::AttrError;

        if buf.remaining() < Self::MIN_LEN as usize {
            return Err(AttrError::Reset);
        }

        // Parse AFI and SAFI.
        let afi = buf.get_u16();
        let safi = buf.get_u8();
        let (Some(afi), Some(safi)) = (Afi::from_u16(afi), Safi::from_u8(safi))
        else {
            // Ignore unknown family.
            return Err(AttrError::Discard);
        };
        if !Nlri::supported(afi, safi) {
            // No registered codec for this family.
            return Err(AttrError::Discard);
        }

        // Parse prefixes.
        let path_ids = cxt.addpath_recv(afi, safi);
        let mut prefixes = Vec::new();
        while buf.remaining() > 0 {
            if let Some(nlri) = Nlri::decode(buf, afi, safi, path_ids)
                .map_err(|_| AttrError::Reset)?
            {
                prefixes.push(nlri);
            }
        }

        *mp_unreach = Some(MpUnreachNlri {
            afi,
            safi,
            prefixes,
        });

        Ok(())
    }
}

// ===== impl NotificationMsg =====

impl NotificationMsg {
    const MIN_LEN: u16 = 21;

    pub fn new(
        error_code: impl ToPrimitive,
        error_subcode: impl ToPrimitive,
    ) -> Self {
        NotificationMsg {
            error_code: error_code.to_u8().unwrap(),
            error_subcode: error_subcode.to_u8().unwrap(),
            data: Default::default(),
        }
    }

    // Builds a Cease notification carrying an RFC 9003 Shutdown
    // Communication string, truncated at the 255-byte protocol limit.
    pub fn new_with_communication(
        subcode: CeaseSubcode,
        communication: &str,
    ) -> Self {
        let msg = communication.as_bytes();
        let len = msg.len().min(255);
        let mut data = Vec::with_capacity(1 + len);
        data.push(len as u8);
        data.extend_from_slice(&msg[..len]);

        NotificationMsg {
            error_code: ErrorCode::Cease as u8,
            error_subcode: subcode as u8,
            data,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Notification as u8);
        buf.put_u8(self.error_code);
        buf.put_u8(self.error_subcode);
        buf.put_slice(&self.data);
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let error_code = buf.try_get_u8()?;
        let error_subcode = buf.try_get_u8()?;

        Ok(NotificationMsg {
            error_code,
            error_subcode,
            data: buf.to_vec(),
        })
    }

    // Extracts the RFC 9003 Shutdown Communication, when present.
    pub fn shutdown_communication(&self) -> Option<String> {
        if ErrorCode::from_u8(self.error_code) != Some(ErrorCode::Cease)
            || !matches!(
                CeaseSubcode::from_u8(self.error_subcode),
                Some(
                    CeaseSubcode::AdministrativeShutdown
                        | CeaseSubcode::AdministrativeReset
                )
            )
        {
            return None;
        }

        let len = *self.data.first()? as usize;
        let msg = self.data.get(1..1 + len)?;
        Some(String::from_utf8_lossy(msg).into_owned())
    }
}

impl From<DecodeError> for NotificationMsg {
    fn from(error: DecodeError) -> NotificationMsg {
        let error_code;
        let error_subcode;
        let mut data = vec![];

        match error {
            DecodeError::ReadOutOfBounds => {
                error_code = ErrorCode::MessageHeaderError as u8;
                error_subcode = MessageHeaderErrorSubcode::Unspecific as u8;
            }
            DecodeError::MessageHeader(error) => {
                error_code = ErrorCode::MessageHeaderError as u8;
                error_subcode = match error {
                    MessageHeaderError::ReadOutOfBounds => {
                        MessageHeaderErrorSubcode::Unspecific
                    }
                    MessageHeaderError::ConnectionNotSynchronized => {
                        MessageHeaderErrorSubcode::ConnectionNotSynchronized
                    }
                    MessageHeaderError::BadMessageLength(len) => {
                        data = len.to_be_bytes().to_vec();
                        MessageHeaderErrorSubcode::BadMessageLength
                    }
                    MessageHeaderError::BadMessageType(msg_type) => {
                        data = vec![msg_type];
                        MessageHeaderErrorSubcode::BadMessageType
                    }
                } as u8;
            }
            DecodeError::OpenMessage(error) => {
                error_code = ErrorCode::OpenMessageError as u8;
                error_subcode = match error {
                    OpenMessageError::ReadOutOfBounds => {
                        OpenMessageErrorSubcode::Unspecific
                    }
                    OpenMessageError::UnsupportedVersion(version) => {
                        data = (version as u16).to_be_bytes().to_vec();
                        OpenMessageErrorSubcode::UnsupportedVersionNumber
                    }
                    OpenMessageError::BadPeerAs => {
                        OpenMessageErrorSubcode::BadPeerAs
                    }
                    OpenMessageError::BadBgpIdentifier => {
                        OpenMessageErrorSubcode::BadBgpIdentifier
                    }
                    OpenMessageError::UnsupportedOptParam => {
                        OpenMessageErrorSubcode::UnsupportedOptParam
                    }
                    OpenMessageError::AuthenticationFailure => {
                        OpenMessageErrorSubcode::AuthenticationFailure
                    }
                    OpenMessageError::UnacceptableHoldTime => {
                        OpenMessageErrorSubcode::UnacceptableHoldTime
                    }
                    OpenMessageError::UnsupportedCapability => {
                        OpenMessageErrorSubcode::UnsupportedCapability
                    }
                    OpenMessageError::MalformedOptParam => {
                        OpenMessageErrorSubcode::Unspecific
                    }
                } as u8;
            }
            DecodeError::UpdateMessage(error) => {
                error_code = ErrorCode::UpdateMessageError as u8;
                error_subcode = match error {
                    UpdateMessageError::ReadOutOfBounds => {
                        UpdateMessageErrorSubcode::Unspecific
                    }
                    UpdateMessageError::MalformedAttributeList => {
                        UpdateMessageErrorSubcode::MalformedAttributeList
                    }
                    UpdateMessageError::UnrecognizedWellKnownAttribute => {
                        UpdateMessageErrorSubcode::UnrecognizedWellKnownAttribute
                    }
                    UpdateMessageError::OptionalAttributeError => {
                        UpdateMessageErrorSubcode::OptionalAttributeError
                    }
                    UpdateMessageError::InvalidNetworkField => {
                        UpdateMessageErrorSubcode::InvalidNetworkField
                    }
                } as u8;
            }
            DecodeError::RouteRefreshMessage(error) => {
                error_code = ErrorCode::RouteRefreshMessageError as u8;
                error_subcode = match error {
                    RouteRefreshMessageError::InvalidMessageLength(len) => {
                        data = len.to_be_bytes().to_vec();
                        crate::packet::consts::RouteRefreshErrorSubcode::InvalidMessageLength
                    }
                } as u8;
            }
        }

        NotificationMsg {
            error_code,
            error_subcode,
            data,
        }
    }
}

// ===== impl KeepaliveMsg =====

impl KeepaliveMsg {
    const LEN: u16 = 19;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Keepalive as u8);
    }

    pub fn decode(_buf: &mut Bytes) -> DecodeResult<Self> {
        // A KEEPALIVE message consists of only the message header.
        Ok(KeepaliveMsg {})
    }
}

// ===== impl RouteRefreshMsg =====

impl RouteRefreshMsg {
    const LEN: u16 = 23;

    pub fn new(afi: Afi, safi: Safi, subtype: RouteRefreshSubtype) -> Self {
        RouteRefreshMsg {
            afi: afi as u16,
            safi: safi as u8,
            subtype,
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::RouteRefresh as u8);
        buf.put_u16(self.afi);
        buf.put_u8(self.subtype as u8);
        buf.put_u8(self.safi);
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        let afi = buf.try_get_u16()?;
        let subtype = buf.try_get_u8()?;
        // Unknown subtypes are processed as plain refresh requests
        // (RFC 7313 - Section 4.2).
        let subtype = RouteRefreshSubtype::from_u8(subtype)
            .unwrap_or(RouteRefreshSubtype::Normal);
        let safi = buf.try_get_u8()?;
        Ok(RouteRefreshMsg { afi, safi, subtype })
    }

    // Returns the typed address family, when recognized.
    pub fn family(&self) -> Option<(Afi, Safi)> {
        let afi = Afi::from_u16(self.afi)?;
        let safi = Safi::from_u8(self.safi)?;
        Some((afi, safi))
    }
}

// ===== impl OperationalMsg =====

impl OperationalMsg {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(MessageType::Operational as u8);
        buf.put_slice(&self.body);
    }

    pub fn decode(buf: &mut Bytes) -> DecodeResult<Self> {
        Ok(OperationalMsg {
            body: buf.copy_to_bytes(buf.remaining()),
        })
    }
}
