//! Driver for UHFReader18 / ST-8508 networked UHF RFID readers.
//!
//! # Modules
//!
//! - [`protocol`] - frame codec: CRC, command builders, stream parser, response decoders
//! - [`discovery`] - LAN scan that verifies readers by speaking the protocol to them
//! - [`network`] - local subnets, ARP neighbors and seed addresses feeding the scan
//! - [`InventoryController`] / [`Session`] - adaptive inventory loop over one TCP link
//!
//! # Example
//!
//! ```ignore
//! use uhf_reader18::{Command, Endpoint, InventoryConfig, Session, TcpConnection};
//!
//! let mut session = Session::new(TcpConnection::new(), InventoryConfig::default());
//! let mut reports = session.subscribe();
//! let (tx, rx) = tokio::sync::mpsc::channel(8);
//! tx.send(Command::Start).await?;
//! tx.send(Command::Connect(Endpoint::new("192.168.1.200", 6000))).await?;
//! session.run(rx, &cancel).await;
//! ```

mod connection;
mod controller;
pub mod discovery;
pub mod network;
mod probe;
pub mod protocol;
mod session;
mod transport;
mod types;

// Re-exports
pub use connection::{Connection, ConnectionError, Endpoint, TcpConnection};
pub use controller::{
    Effect, Event, FREQUENCY_WINDOWS, InventoryConfig, InventoryController, InventoryEvent,
    InventoryPreset, PROBE_TIMEOUT, TagSnapshot, next_antenna, target_label,
};
pub use discovery::{Candidate, DiscoveryError, ScanOptions};
pub use network::{Ipv4Prefix, LocalNetwork, hosts_from_prefix};
pub use probe::{ProbeMatch, probe_reader, probe_wait};
pub use session::{Command, Session};
pub use transport::ReaderTransport;
pub use types::{
    Frame, InventoryG2Tag, ReaderError, ReaderInfo, SingleInventoryResult, bytes_to_hex,
    format_hex, parse_hex_input,
};
