//
// Copyright (c) The Corvus Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use num_derive::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};

// Address Family identifier.
//
// IANA registry:
// http://www.iana.org/assignments/address-family-numbers
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(FromPrimitive, ToPrimitive)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Returns the address family of the IP address.
    fn address_family(&self) -> AddressFamily;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;

    // Returns an unspecified address of the given address family.
    fn unspecified(af: AddressFamily) -> IpAddr;
}

// Extension methods for Ipv4Addr.
pub trait Ipv4AddrExt {
    const LENGTH: usize;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;
}

// Extension methods for Ipv6Addr.
pub trait Ipv6AddrExt {
    const LENGTH: usize;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;
}

// Extension methods for IpNetwork.
pub trait IpNetworkExt {
    // Returns the address family of the network.
    fn address_family(&self) -> AddressFamily;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> IpNetwork;

    // Returns true if this is a routable network.
    fn is_routable(&self) -> bool;
}

// Extension methods for Ipv4Network.
pub trait Ipv4NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> Ipv4Network;

    // Returns true if this is a routable network.
    fn is_routable(&self) -> bool;
}

// Extension methods for Ipv6Network.
pub trait Ipv6NetworkExt {
    const MAX_PREFIXLEN: u8;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> Ipv6Network;

    // Returns true if this is a routable network.
    fn is_routable(&self) -> bool;
}

// ===== impl AddressFamily =====

impl AddressFamily {
    // Length of an address of this family in bytes.
    pub fn addr_len(&self) -> usize {
        match self {
            AddressFamily::Ipv4 => Ipv4Addr::LENGTH,
            AddressFamily::Ipv6 => Ipv6Addr::LENGTH,
        }
    }

    // Maximum prefix length of this family in bits.
    pub fn max_prefixlen(&self) -> u8 {
        match self {
            AddressFamily::Ipv4 => Ipv4Network::MAX_PREFIXLEN,
            AddressFamily::Ipv6 => Ipv6Network::MAX_PREFIXLEN,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn is_usable(&self) -> bool {
        match self {
            IpAddr::V4(addr) => addr.is_usable(),
            IpAddr::V6(addr) => addr.is_usable(),
        }
    }

    fn unspecified(af: AddressFamily) -> IpAddr {
        match af {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

// ===== impl Ipv4Addr =====

impl Ipv4AddrExt for Ipv4Addr {
    const LENGTH: usize = 4;

    fn is_usable(&self) -> bool {
        !(self.is_loopback() || self.is_broadcast() || self.is_unspecified())
    }
}

// ===== impl Ipv6Addr =====

impl Ipv6AddrExt for Ipv6Addr {
    const LENGTH: usize = 16;

    fn is_usable(&self) -> bool {
        !(self.is_loopback() || self.is_unspecified())
    }
}

// ===== impl IpNetwork =====

impl IpNetworkExt for IpNetwork {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn apply_mask(&self) -> IpNetwork {
        match self {
            IpNetwork::V4(prefix) => IpNetwork::V4(prefix.apply_mask()),
            IpNetwork::V6(prefix) => IpNetwork::V6(prefix.apply_mask()),
        }
    }

    fn is_routable(&self) -> bool {
        match self {
            IpNetwork::V4(prefix) => prefix.is_routable(),
            IpNetwork::V6(prefix) => prefix.is_routable(),
        }
    }
}

// ===== impl Ipv4Network =====

impl Ipv4NetworkExt for Ipv4Network {
    const MAX_PREFIXLEN: u8 = 32;

    fn apply_mask(&self) -> Ipv4Network {
        Ipv4Network::new(
            Ipv4Addr::from(u32::from(self.ip()) & u32::from(self.mask())),
            self.prefix(),
        )
        // Invalid prefix lengths are rejected at construction time.
        .unwrap()
    }

    fn is_routable(&self) -> bool {
        let addr = self.ip();
        if addr.is_loopback() || addr.is_link_local() {
            return false;
        }
        // The default route is routable, other networks within 0.0.0.0/8
        // aren't.
        if addr.octets()[0] == 0 && self.prefix() != 0 {
            return false;
        }
        true
    }
}

// ===== impl Ipv6Network =====

impl Ipv6NetworkExt for Ipv6Network {
    const MAX_PREFIXLEN: u8 = 128;

    fn apply_mask(&self) -> Ipv6Network {
        Ipv6Network::new(
            Ipv6Addr::from(u128::from(self.ip()) & u128::from(self.mask())),
            self.prefix(),
        )
        // Invalid prefix lengths are rejected at construction time.
        .unwrap()
    }

    fn is_routable(&self) -> bool {
        let addr = self.ip();
        if addr.is_loopback() {
            return false;
        }
        // Link-local unicast (fe80::/10) isn't routable.
        if (addr.segments()[0] & 0xffc0) == 0xfe80 {
            return false;
        }
        true
    }
}
