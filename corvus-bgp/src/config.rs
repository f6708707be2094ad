//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

use serde::{Deserialize, Serialize};

use crate::packet::consts::{Afi, Safi};
use crate::rib::Change;

// Default hold time in seconds.
pub const DFLT_HOLDTIME: u16 = 180;
// Default connect retry interval in seconds.
pub const DFLT_CONNECT_RETRY_INTERVAL: u16 = 120;
// Default graceful restart time in seconds (RFC 4724 recommends a value
// no larger than the hold time).
pub const DFLT_GR_RESTART_TIME: u16 = 120;

// Speaker-wide configuration, validated by the caller.
#[derive(Clone, Debug)]
pub struct LocalConfig {
    pub asn: u32,
    pub identifier: Ipv4Addr,
    // TCP port the listener binds to and sessions connect to.
    pub port: u16,
    // Whether to accept inbound connections at all.
    pub listen: bool,
    pub hostname: Option<String>,
    pub domain: Option<String>,
    pub software_version: Option<String>,
    // Attach the raw wire bytes to message events.
    pub raw_message_events: bool,
}

// Per-neighbor configuration, validated by the caller (spec: the core
// trusts its inputs).
#[derive(Debug)]
pub struct NeighborConfig {
    pub remote_addr: IpAddr,
    pub peer_as: u32,
    // Overrides the speaker-wide ASN for this session.
    pub local_as: Option<u32>,
    pub enabled: bool,
    pub passive: bool,
    // Pack multiple IPv4-unicast NLRIs sharing an attribute set into a
    // single UPDATE.
    pub group_updates: bool,
    pub timers: TimersCfg,
    pub transport: TransportCfg,
    pub auth: Option<AuthCfg>,
    pub families: BTreeSet<(Afi, Safi)>,
    pub addpath: BTreeMap<(Afi, Safi), AddPathCfg>,
    pub graceful_restart: Option<GracefulRestartCfg>,
    pub capabilities: CapabilitiesCfg,
    // Routes announced as soon as the session reaches Established.
    pub initial_routes: Vec<Change>,
}

#[derive(Clone, Copy, Debug)]
pub struct TimersCfg {
    pub holdtime: u16,
    // Defaults to a third of the negotiated hold time.
    pub keepalive: Option<u16>,
    pub connect_retry: u16,
}

#[derive(Clone, Debug, Default)]
pub struct TransportCfg {
    // Local address the outgoing connection binds to.
    pub local_addr: Option<IpAddr>,
    pub ebgp_multihop_ttl: Option<u8>,
    // GTSM (RFC 5082) hop count.
    pub ttl_security: Option<u8>,
    pub tcp_mss: Option<u16>,
}

// TCP-MD5 and TCP-AO are mutually exclusive per session.
#[derive(Clone, Debug)]
pub enum AuthCfg {
    Md5 { password: String },
    TcpAo { keys: Vec<TcpAoKey> },
}

#[derive(Clone, Debug)]
pub struct TcpAoKey {
    pub send_id: u8,
    pub recv_id: u8,
    pub algorithm: String,
    pub key: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AddPathCfg {
    pub send: bool,
    pub recv: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct GracefulRestartCfg {
    pub restart_time: u16,
    // Advertise the Restart State bit: set after a control-plane restart
    // that lost routing state.
    pub restart_state: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct CapabilitiesCfg {
    pub asn4: bool,
    pub route_refresh: bool,
    pub enhanced_route_refresh: bool,
    pub extended_message: bool,
    pub multisession: bool,
    pub operational: bool,
}

// ===== impl LocalConfig =====

impl LocalConfig {
    pub fn new(asn: u32, identifier: Ipv4Addr) -> LocalConfig {
        LocalConfig {
            asn,
            identifier,
            port: 179,
            listen: true,
            hostname: None,
            domain: None,
            software_version: None,
            raw_message_events: false,
        }
    }
}

// ===== impl NeighborConfig =====

impl NeighborConfig {
    pub fn new(remote_addr: IpAddr, peer_as: u32) -> NeighborConfig {
        NeighborConfig {
            remote_addr,
            peer_as,
            local_as: None,
            enabled: true,
            passive: false,
            group_updates: true,
            timers: Default::default(),
            transport: Default::default(),
            auth: None,
            families: [(Afi::Ipv4, Safi::Unicast)].into(),
            addpath: Default::default(),
            graceful_restart: None,
            capabilities: Default::default(),
            initial_routes: vec![],
        }
    }
}

// ===== impl TimersCfg =====

impl Default for TimersCfg {
    fn default() -> TimersCfg {
        TimersCfg {
            holdtime: DFLT_HOLDTIME,
            keepalive: None,
            connect_retry: DFLT_CONNECT_RETRY_INTERVAL,
        }
    }
}

// ===== impl GracefulRestartCfg =====

impl Default for GracefulRestartCfg {
    fn default() -> GracefulRestartCfg {
        GracefulRestartCfg {
            restart_time: DFLT_GR_RESTART_TIME,
            restart_state: false,
        }
    }
}

// ===== impl CapabilitiesCfg =====

impl Default for CapabilitiesCfg {
    fn default() -> CapabilitiesCfg {
        CapabilitiesCfg {
            asn4: true,
            route_refresh: true,
            enhanced_route_refresh: false,
            extended_message: false,
            multisession: false,
            operational: false,
        }
    }
}
