use std::net::IpAddr;

use lazy_static::lazy_static;

const BOGON_NETS: &[&str] = &[
    "0.0.0.0/8",
    "10.0.0.0/8",
    "100.64.0.0/10",
    "127.0.0.0/8",
    "169.254.0.0/16",
    "172.16.0.0/12",
    "192.0.0.0/24",
    "192.0.2.0/24",
    "192.168.0.0/16",
    "198.18.0.0/15",
    "198.51.100.0/24",
    "203.0.113.0/24",
    "224.0.0.0/4",
    "240.0.0.0/4",
    "255.255.255.255/32",
    "::/128",
    "::1/128",
    "100::/64",
    "2001:2::/48",
    "2001:10::/28",
    "2001:db8::/32",
    "fc00::/7",
    "fe80::/10",
    "ff00::/8",
];

lazy_static! {
    static ref BOGONS: Vec<(IpAddr, u32)> = BOGON_NETS
        .iter()
        .filter_map(|cidr| {
            let (net, bits) = cidr.split_once('/')?;
            Some((net.parse().ok()?, bits.parse().ok()?))
        })
        .collect();
}

fn contains(net: &IpAddr, bits: u32, ip: &IpAddr) -> bool {
    match (net, ip) {
        (IpAddr::V4(net), IpAddr::V4(ip)) => {
            let mask = u32::MAX.checked_shl(32 - bits).unwrap_or(0);
            u32::from(*net) & mask == u32::from(*ip) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(ip)) => {
            let mask = u128::MAX.checked_shl(128 - bits).unwrap_or(0);
            u128::from(*net) & mask == u128::from(*ip) & mask
        }
        _ => false,
    }
}

/// Whether `address` is a reserved or otherwise non-routable IP.
/// Strings that are not IP addresses are never bogons.
pub fn is_bogon(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(ip) => BOGONS.iter().any(|(net, bits)| contains(net, *bits, &ip)),
        Err(_) => false,
    }
}
