//! LAN discovery of reader endpoints.
//!
//! Every `host x port` pair is dialed by a bounded pool of workers. Open ports
//! are run through [`crate::probe`]; ports that do not answer in protocol are
//! scored on their port number and whatever banner they volunteer.

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::network::{self, LocalNetwork};
use crate::probe::probe_reader;
use crate::transport::ReaderTransport;
use crate::types::duration_millis;

/// Ports reader firmware is known to listen on
const READER_PORTS: [u16; 7] = [2022, 27011, 4001, 5000, 6000, 7000, 10001];
const WEB_PORTS: [u16; 3] = [80, 443, 8080];
const TELNET_PORT: u16 = 23;

const BANNER_KEYWORDS: [&str; 6] = ["rfid", "uhf", "reader", "impinj", "epc", "e710"];
const KEYWORD_SCORE: i32 = 18;
const VERIFIED_BONUS: i32 = 160;

const BANNER_WAIT: Duration = Duration::from_millis(140);
const BANNER_MAX_CHARS: usize = 140;

/// One reachable endpoint that may be a reader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub host: String,
    pub port: u16,
    pub score: i32,
    pub banner: String,
    pub reason: String,
    /// Answered in reader protocol
    pub verified: bool,
    /// Device address from the answering frame, 0 when unverified
    pub reader_address: u8,
    /// `reader18/<probe>` when verified, empty otherwise
    pub protocol: String,
}

impl Candidate {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Scan tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    /// Per dial/probe attempt
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
    pub concurrency: usize,
    pub host_limit_per_interface: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            ports: vec![2022, 27011, 6000, 4001, 10001, 5000],
            timeout: Duration::from_millis(180),
            concurrency: 96,
            host_limit_per_interface: 254,
        }
    }
}

impl ScanOptions {
    /// Replace unset fields with defaults. An empty port list resets everything.
    pub fn normalized(self) -> Self {
        let defaults = Self::default();
        if self.ports.is_empty() {
            return defaults;
        }
        Self {
            timeout: if self.timeout.is_zero() {
                defaults.timeout
            } else {
                self.timeout
            },
            concurrency: if self.concurrency == 0 {
                defaults.concurrency
            } else {
                self.concurrency
            },
            host_limit_per_interface: if self.host_limit_per_interface == 0 {
                defaults.host_limit_per_interface
            } else {
                self.host_limit_per_interface
            },
            ports: self.ports,
        }
    }
}

/// Errors that end a scan
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// No usable IPv4 interface
    #[error("no active IPv4 network interfaces found")]
    NoInterfaces,

    /// Interface list could not be read
    #[error("interface enumeration failed: {0}")]
    Interfaces(#[from] io::Error),

    /// Scan was cancelled; carries what had been found so far, already sorted
    #[error("scan cancelled with {} candidate(s) collected", partial.len())]
    Cancelled { partial: Vec<Candidate> },
}

/// Prior score for a port number
pub fn port_score(port: u16) -> i32 {
    if READER_PORTS.contains(&port) {
        55
    } else if port == TELNET_PORT {
        30
    } else if WEB_PORTS.contains(&port) {
        20
    } else {
        10
    }
}

/// +18 for each reader-ish keyword present in the banner, case-insensitive
pub fn keyword_score(banner: &str) -> i32 {
    let text = banner.to_ascii_lowercase();
    BANNER_KEYWORDS
        .iter()
        .filter(|keyword| text.contains(*keyword))
        .count() as i32
        * KEYWORD_SCORE
}

/// Printable ASCII only: everything else becomes a space, then trim and cut to 140 chars.
pub fn sanitize_banner(raw: &[u8]) -> String {
    let text: String = raw
        .iter()
        .map(|&b| if (32..=126).contains(&b) { b as char } else { ' ' })
        .collect();
    text.trim().chars().take(BANNER_MAX_CHARS).collect()
}

/// Scan every local subnet, ARP neighbor and seed address.
///
/// On cancellation the candidates found so far come back inside
/// [`DiscoveryError::Cancelled`].
pub async fn scan(
    opts: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Candidate>, DiscoveryError> {
    let opts = opts.clone().normalized();

    let local = LocalNetwork::detect()?;
    if local.prefixes.is_empty() {
        return Err(DiscoveryError::NoInterfaces);
    }

    let neighbors = network::arp_neighbors();
    let hosts = local.scan_hosts(opts.host_limit_per_interface, &neighbors);
    info!(
        "scanning {} hosts on {} prefix(es) ({} arp neighbors), ports {:?}",
        hosts.len(),
        local.prefixes.len(),
        neighbors.len(),
        opts.ports
    );

    scan_hosts(hosts, &opts, cancel).await
}

/// Probe an explicit host list on every configured port
pub async fn scan_hosts(
    hosts: Vec<Ipv4Addr>,
    opts: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<Vec<Candidate>, DiscoveryError> {
    let opts = opts.clone().normalized();
    let (job_tx, job_rx) = mpsc::channel::<(Ipv4Addr, u16)>(opts.concurrency);
    let (result_tx, mut result_rx) = mpsc::channel::<Candidate>(opts.concurrency);
    let job_rx = Arc::new(Mutex::new(job_rx));

    for _ in 0..opts.concurrency {
        let job_rx = Arc::clone(&job_rx);
        let result_tx = result_tx.clone();
        let cancel = cancel.clone();
        let timeout = opts.timeout;
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut rx = job_rx.lock().await;
                    tokio::select! {
                        _ = cancel.cancelled() => None,
                        job = rx.recv() => job,
                    }
                };
                let Some((host, port)) = job else { break };

                let found = tokio::select! {
                    _ = cancel.cancelled() => break,
                    found = probe_target(host, port, timeout) => found,
                };
                if let Some(candidate) = found {
                    if result_tx.send(candidate).await.is_err() {
                        break;
                    }
                }
            }
        });
    }
    drop(result_tx);

    let ports = opts.ports.clone();
    let producer_cancel = cancel.clone();
    tokio::spawn(async move {
        for host in hosts {
            for &port in &ports {
                tokio::select! {
                    _ = producer_cancel.cancelled() => return,
                    sent = job_tx.send((host, port)) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    });

    let mut seen = HashSet::new();
    let mut candidates = Vec::new();
    while let Some(candidate) = result_rx.recv().await {
        if seen.insert(candidate.endpoint()) {
            debug!(
                "candidate {} score={} {}",
                candidate.endpoint(),
                candidate.score,
                candidate.reason
            );
            candidates.push(candidate);
        }
    }

    sort_candidates(&mut candidates);

    if cancel.is_cancelled() {
        return Err(DiscoveryError::Cancelled {
            partial: candidates,
        });
    }
    Ok(candidates)
}

/// Score descending, then host, then port
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.host.cmp(&b.host))
            .then_with(|| a.port.cmp(&b.port))
    });
}

/// First verified candidate of a sorted list
pub fn preferred_candidate(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().find(|c| c.verified)
}

pub fn verified_count(candidates: &[Candidate]) -> usize {
    candidates.iter().filter(|c| c.verified).count()
}

/// Dial one endpoint and classify it. Closed or filtered ports yield `None`.
async fn probe_target(host: Ipv4Addr, port: u16, timeout: Duration) -> Option<Candidate> {
    let addr = SocketAddr::from((host, port));
    let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        _ => return None,
    };

    let base = port_score(port);
    let candidate = match probe_reader(&mut stream, timeout).await {
        Some(found) => Candidate {
            host: host.to_string(),
            port,
            score: base + VERIFIED_BONUS,
            banner: String::new(),
            reason: format!(
                "reader protocol: {} addr=0x{:02X}",
                found.protocol, found.address
            ),
            verified: true,
            reader_address: found.address,
            protocol: found.protocol,
        },
        None => {
            let banner = read_banner(&mut stream).await;
            let (score, reason) = if banner.is_empty() {
                (base, "open tcp port")
            } else {
                (base + keyword_score(&banner), "banner matched")
            };
            Candidate {
                host: host.to_string(),
                port,
                score,
                banner,
                reason: reason.to_string(),
                verified: false,
                reader_address: 0,
                protocol: String::new(),
            }
        }
    };
    Some(candidate)
}

async fn read_banner<T: ReaderTransport>(transport: &mut T) -> String {
    let mut buf = [0u8; 256];
    match transport.read(&mut buf, BANNER_WAIT).await {
        Ok(n) if n > 0 => sanitize_banner(&buf[..n]),
        _ => String::new(),
    }
}
