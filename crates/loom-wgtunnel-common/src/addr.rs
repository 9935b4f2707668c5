// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer service addresses inside the tailnet ULA prefix.

use crate::peer::PeerId;
use ipnet::{IpNet, Ipv6Net};
use std::net::{IpAddr, Ipv6Addr};

pub const SERVICE_PREFIX: &str = "fd7a:115c:a1e0::/48";

const SERVICE_PREFIX_BASE: u128 = 0xfd7a_115c_a1e0_0000_0000_0000_0000_0000;
const SERVICE_PREFIX_LEN: u8 = 48;
const PEER_BITS_MASK: u128 = (1u128 << (128 - SERVICE_PREFIX_LEN as u32)) - 1;

pub fn service_prefix() -> Ipv6Net {
	Ipv6Net::new(Ipv6Addr::from(SERVICE_PREFIX_BASE), SERVICE_PREFIX_LEN)
		.unwrap_or_else(|_| Ipv6Net::default())
}

/// Address for a peer: the 48-bit prefix followed by the last 10 bytes of the
/// peer's UUID.
pub fn service_addr(id: &PeerId) -> Ipv6Addr {
	let bits = u128::from_be_bytes(*id.as_uuid().as_bytes());
	Ipv6Addr::from(SERVICE_PREFIX_BASE | (bits & PEER_BITS_MASK))
}

/// The single-host network a peer is expected to advertise.
pub fn service_net(id: &PeerId) -> IpNet {
	IpNet::V6(Ipv6Net::new(service_addr(id), 128).unwrap_or_else(|_| Ipv6Net::default()))
}

pub fn is_service_addr(addr: IpAddr) -> bool {
	match addr {
		IpAddr::V6(v6) => service_prefix().contains(&v6),
		IpAddr::V4(_) => false,
	}
}
