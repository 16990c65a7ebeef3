//! Reader detection over an already open byte pipe.
//!
//! A port counts as a reader only when it answers one of our commands with a
//! checksummed frame echoing the same command code. Anything else is left to
//! banner sniffing by the caller.

use std::time::Duration;

use log::debug;
use tokio::time::Instant;

use crate::protocol::{
    self, BROADCAST_READER_ADDRESS, CMD_GET_READER_INFO, CMD_INVENTORY, DEFAULT_READER_ADDRESS,
};
use crate::transport::ReaderTransport;
use crate::types::Frame;

/// Successful protocol match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeMatch {
    /// Device address reported in the answering frame
    pub address: u8,
    /// `reader18/<probe-name>`
    pub protocol: String,
}

struct Probe {
    name: &'static str,
    expect: u8,
    command: fn(u8) -> Vec<u8>,
}

const PROBES: &[Probe] = &[
    Probe {
        name: "get-info",
        expect: CMD_GET_READER_INFO,
        command: protocol::get_reader_info_command,
    },
    Probe {
        name: "inventory-g2",
        expect: CMD_INVENTORY,
        command: inventory_g2_probe,
    },
    Probe {
        name: "inventory-legacy",
        expect: CMD_INVENTORY,
        command: protocol::inventory_single_command,
    },
];

const PROBE_ADDRESSES: [u8; 2] = [DEFAULT_READER_ADDRESS, BROADCAST_READER_ADDRESS];

/// Read slice inside the per-probe wait
const READ_SLICE: Duration = Duration::from_millis(90);
/// Wait floor used when the attempt timeout is very small
const MIN_PROBE_WAIT: Duration = Duration::from_millis(420);
const SMALL_TIMEOUT: Duration = Duration::from_millis(200);
const STREAM_CAP: usize = 4096;
const STREAM_KEEP: usize = 2048;

fn inventory_g2_probe(address: u8) -> Vec<u8> {
    protocol::inventory_g2_command(address, 0x04, 0x01, 0x00, 0x00, 0x00, 0x80, 0x0A)
}

/// How long to keep reading after one probe command
pub fn probe_wait(timeout: Duration) -> Duration {
    if timeout < SMALL_TIMEOUT {
        MIN_PROBE_WAIT
    } else {
        timeout * 2
    }
}

/// Try get-info, G2 inventory and legacy inventory at address 0x00 and then
/// broadcast, stopping at the first frame whose command matches.
///
/// Returns `None` when nothing answered in protocol.
pub async fn probe_reader<T: ReaderTransport>(
    transport: &mut T,
    timeout: Duration,
) -> Option<ProbeMatch> {
    // Flush once: a late answer to one attempt still counts during the next
    if let Err(e) = transport.clear_input().await {
        debug!("probe input flush failed: {:?}", e);
        return None;
    }
    for probe in PROBES {
        for &address in &PROBE_ADDRESSES {
            let frames = exchange(transport, &(probe.command)(address), timeout).await;
            if let Some(frame) = frames.iter().find(|f| f.command == probe.expect) {
                debug!(
                    "probe {} matched at address 0x{:02X}",
                    probe.name, frame.address
                );
                return Some(ProbeMatch {
                    address: frame.address,
                    protocol: format!("reader18/{}", probe.name),
                });
            }
        }
    }
    None
}

/// Send one command and collect the first batch of frames that decodes.
async fn exchange<T: ReaderTransport>(
    transport: &mut T,
    command: &[u8],
    timeout: Duration,
) -> Vec<Frame> {
    match tokio::time::timeout(timeout, transport.write(command)).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            debug!("probe write failed: {:?}", e);
            return Vec::new();
        }
        Err(_) => return Vec::new(),
    }

    let deadline = Instant::now() + probe_wait(timeout);
    let mut buf = [0u8; 512];
    let mut stream: Vec<u8> = Vec::with_capacity(1024);

    while Instant::now() < deadline {
        let n = match transport.read(&mut buf, READ_SLICE).await {
            Ok(n) => n,
            Err(e) => {
                debug!("probe read failed: {:?}", e);
                return Vec::new();
            }
        };
        if n == 0 {
            continue;
        }

        stream.extend_from_slice(&buf[..n]);
        if stream.len() > STREAM_CAP {
            stream.drain(..stream.len() - STREAM_KEEP);
        }

        let (frames, remaining) = protocol::parse_frames(&stream);
        stream = remaining;
        if !frames.is_empty() {
            return frames;
        }
    }

    Vec::new()
}
