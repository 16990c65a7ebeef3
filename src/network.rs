//! Local IPv4 topology: attached subnets, ARP neighbors and seed addresses.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::str::FromStr;

use log::debug;

/// Narrowest prefix we scan; wider local networks are cut to the /24 around us
const MIN_SCAN_PREFIX: u8 = 24;

const ARP_TABLE: &str = "/proc/net/arp";

const STATIC_SEEDS: [Ipv4Addr; 12] = [
    Ipv4Addr::new(192, 168, 0, 10),
    Ipv4Addr::new(192, 168, 0, 100),
    Ipv4Addr::new(192, 168, 0, 200),
    Ipv4Addr::new(192, 168, 1, 10),
    Ipv4Addr::new(192, 168, 1, 100),
    Ipv4Addr::new(192, 168, 1, 200),
    Ipv4Addr::new(10, 0, 0, 10),
    Ipv4Addr::new(10, 0, 0, 100),
    Ipv4Addr::new(10, 0, 0, 200),
    Ipv4Addr::new(10, 10, 10, 10),
    Ipv4Addr::new(10, 10, 10, 100),
    Ipv4Addr::new(10, 10, 10, 200),
];

/// Host octets readers are commonly parked on within a /24
const SEED_HOST_OCTETS: [u8; 8] = [2, 10, 20, 50, 100, 150, 200, 250];

/// IPv4 network prefix, always stored masked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Prefix {
    network: Ipv4Addr,
    len: u8,
}

impl Ipv4Prefix {
    /// Build a prefix, masking off host bits. `len` is clamped to 32.
    pub fn new(addr: Ipv4Addr, len: u8) -> Self {
        let len = len.min(32);
        let network = Ipv4Addr::from(u32::from(addr) & mask_bits(len));
        Self { network, len }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }

    /// Usable host addresses, network and broadcast excluded, at most `limit` of them.
    /// /31 and /32 have none.
    pub fn hosts(&self, limit: usize) -> Vec<Ipv4Addr> {
        if self.len >= 31 {
            return Vec::new();
        }
        let base = u32::from(self.network);
        let host_count = 1u64 << (32 - self.len);
        let last = base as u64 + host_count - 2;

        (base as u64 + 1..=last)
            .take(limit)
            .map(|ip| Ipv4Addr::from(ip as u32))
            .collect()
    }
}

impl fmt::Display for Ipv4Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.len)
    }
}

impl FromStr for Ipv4Prefix {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {:?}", s))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|e| format!("invalid address in {:?}: {}", s, e))?;
        let len: u8 = len
            .trim()
            .parse()
            .map_err(|e| format!("invalid prefix length in {:?}: {}", s, e))?;
        if len > 32 {
            return Err(format!("prefix length {} out of range", len));
        }
        Ok(Self::new(addr, len))
    }
}

fn mask_bits(len: u8) -> u32 {
    if len == 0 { 0 } else { u32::MAX << (32 - len) }
}

/// Usable hosts of `prefix`, capped at `limit`
pub fn hosts_from_prefix(prefix: &Ipv4Prefix, limit: usize) -> Vec<Ipv4Addr> {
    prefix.hosts(limit)
}

/// What the machine itself sits on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalNetwork {
    /// Scan prefixes, at least /24, deduplicated and sorted
    pub prefixes: Vec<Ipv4Prefix>,
    /// Our own IPv4 addresses, never probed
    pub addresses: Vec<Ipv4Addr>,
}

impl LocalNetwork {
    /// Read the non-loopback IPv4 interfaces of this host
    pub fn detect() -> io::Result<Self> {
        let mut entries = Vec::new();
        for iface in if_addrs::get_if_addrs()? {
            if iface.is_loopback() {
                continue;
            }
            if let if_addrs::IfAddr::V4(v4) = &iface.addr {
                let prefix_len = u32::from(v4.netmask).count_ones() as u8;
                debug!("interface {} {}/{}", iface.name, v4.ip, prefix_len);
                entries.push((v4.ip, prefix_len));
            }
        }
        Ok(Self::from_addresses(&entries))
    }

    /// Build from `(address, prefix length)` pairs
    pub fn from_addresses(entries: &[(Ipv4Addr, u8)]) -> Self {
        let mut prefixes = Vec::new();
        let mut addresses = Vec::new();

        for &(ip, len) in entries {
            addresses.push(ip);
            if len == 0 {
                continue;
            }
            let prefix = Ipv4Prefix::new(ip, len.max(MIN_SCAN_PREFIX));
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }

        prefixes.sort_by_key(|p| (u32::from(p.network()), p.prefix_len()));
        Self {
            prefixes,
            addresses,
        }
    }

    /// Every host worth probing: attached subnets first, then ARP neighbors,
    /// then seed guesses. Our own addresses are left out and each host appears once.
    pub fn scan_hosts(&self, host_limit: usize, neighbors: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
        let local: HashSet<Ipv4Addr> = self.addresses.iter().copied().collect();
        let mut seen = HashSet::new();
        let mut hosts = Vec::new();

        let subnet_hosts = self.prefixes.iter().flat_map(|p| p.hosts(host_limit));
        let seeds = seed_addresses(&self.addresses);
        let all = subnet_hosts
            .chain(neighbors.iter().copied())
            .chain(seeds);

        for host in all {
            if local.contains(&host) || !seen.insert(host) {
                continue;
            }
            hosts.push(host);
        }
        hosts
    }
}

/// Neighbors from the kernel ARP cache. Missing table (non-Linux) yields nothing.
pub fn arp_neighbors() -> Vec<Ipv4Addr> {
    match std::fs::read_to_string(ARP_TABLE) {
        Ok(text) => parse_arp_table(&text),
        Err(e) => {
            debug!("arp table unavailable: {}", e);
            Vec::new()
        }
    }
}

/// Parse `/proc/net/arp` text: one header line, then `IP HWtype Flags HWaddr ...` rows.
pub fn parse_arp_table(text: &str) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return None;
            }
            fields[0].parse::<Ipv4Addr>().ok()
        })
        .filter(|addr| !addr.is_loopback() && !addr.is_unspecified())
        .filter(|addr| seen.insert(*addr))
        .collect()
}

/// Common private addresses plus guesses derived from each local address
pub fn seed_addresses(local: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut add = |addr: Ipv4Addr| {
        if seen.insert(addr) {
            out.push(addr);
        }
    };

    for seed in STATIC_SEEDS {
        add(seed);
    }
    for ip in local {
        let [a, b, c, _] = ip.octets();
        for d in SEED_HOST_OCTETS {
            add(Ipv4Addr::new(a, b, c, d));
        }
        for c in 0..3 {
            add(Ipv4Addr::new(a, b, c, 10));
        }
    }
    out
}
