//! Adaptive inventory loop.
//!
//! [`InventoryController`] is a reducer: every input arrives as an [`Event`],
//! is applied to the controller's state, and comes back out as a list of
//! [`Effect`]s (commands to send, timers to arm, things to report). It never
//! touches a socket or arms a timer itself; [`crate::session`] does that and
//! feeds the outcome back in as further events. The one clock it reads is
//! [`tokio::time::Instant`], to rate-limit raw byte reports while reading.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::connection::{ConnectionError, Endpoint};
use crate::protocol::{
    self, CMD_GET_READER_INFO, CMD_INVENTORY, CMD_INVENTORY_SINGLE, STATUS_ANTENNA_ERROR,
    STATUS_NO_TAG, STATUS_NO_TAG_OR_TIMEOUT, STATUS_SUCCESS,
};
use crate::types::{Frame, ReaderInfo, bytes_to_hex, duration_millis, format_hex};

/// Frequency windows `(high, low)` cycled while nothing has been read yet
pub const FREQUENCY_WINDOWS: [(u8, u8); 3] = [(0x3E, 0x28), (0x37, 0x05), (0x3E, 0x00)];
const FREQUENCY_CYCLE_ROUNDS: u64 = 80;

/// Statuses that mean "ran an inventory round, found nothing"
const NO_TAG_STATUSES: [u8; 5] = [STATUS_NO_TAG, 0x02, 0x03, 0x04, STATUS_NO_TAG_OR_TIMEOUT];

const MIN_TICK: Duration = Duration::from_millis(40);
const SCAN_TIME_UNIT: Duration = Duration::from_millis(100);

const RX_BUFFER_CAP: usize = 8192;
const RX_BUFFER_KEEP: usize = 4096;

/// How long a fresh link may stay silent before it is dropped as not-a-reader
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const RAW_REPORT_INTERVAL: Duration = Duration::from_secs(2);

// Status throttles, in rounds
const STATUS_EVERY: u64 = 24;
const ANTENNA_STATUS_EVERY: u64 = 20;
const SEEN_AGAIN_EVERY: u64 = 12;

const HEX_PREVIEW: usize = 52;

// Command names carried through `Effect::Send` and back in `Event::CommandSent`
pub const SEND_WORK_MODE: &str = "cfg-work-mode";
pub const SEND_SCAN_TIME: &str = "cfg-scan-time";
pub const SEND_ANTENNA_MASK: &str = "cfg-ant-mask";
pub const SEND_POWER: &str = "cfg-power";
pub const SEND_FREQUENCY: &str = "cfg-freq";
pub const SEND_FREQUENCY_CYCLE: &str = "cfg-freq-cycle";
pub const SEND_INVENTORY: &str = "inventory-g2";
pub const SEND_PROBE_INFO: &str = "probe-info";
pub const SEND_RAW: &str = "raw";

/// Inventory tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Device address used until the first inventory answer reveals the real one
    pub address: u8,
    pub q_value: u8,
    /// Gen2 session 0..=3
    pub session: u8,
    /// 0 = A, 1 = B
    pub target: u8,
    /// Antennas to rotate through, bit 0 = antenna 1
    pub antenna_mask: u8,
    /// Reader-side inventory time, 100 ms units
    pub scan_time: u8,
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,
    /// Empty rounds before the target flips; 0 disables
    pub no_tag_ab_threshold: u8,
    pub output_power: u8,
    pub work_mode: Vec<u8>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            address: protocol::DEFAULT_READER_ADDRESS,
            q_value: 4,
            session: 1,
            target: 0,
            antenna_mask: 0x01,
            scan_time: 1,
            poll_interval: Duration::from_millis(60),
            no_tag_ab_threshold: 4,
            output_power: 0x21,
            work_mode: vec![0x00],
        }
    }
}

impl InventoryConfig {
    /// Pull every tunable into its legal range
    pub fn clamped(mut self) -> Self {
        self.q_value = self.q_value.min(15);
        self.session = self.session.min(3);
        self.target &= 0x01;
        self.scan_time = self.scan_time.max(1);
        self.antenna_mask = self.antenna_mask.max(1);
        self.poll_interval = self
            .poll_interval
            .clamp(Duration::from_millis(20), Duration::from_millis(1000));
        self
    }

    /// Tick period: the poll interval, but never shorter than the reader's own
    /// scan time or 40 ms
    pub fn effective_interval(&self) -> Duration {
        let floor = (SCAN_TIME_UNIT * self.scan_time as u32).max(MIN_TICK);
        self.poll_interval.max(floor)
    }
}

/// Canned tunings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InventoryPreset {
    Fast,
    Balanced,
    LongRange,
}

impl InventoryPreset {
    pub fn apply(self, config: &mut InventoryConfig) {
        let (session, scan_time, threshold, poll_ms) = match self {
            Self::Fast => (1, 1, 4, 40),
            Self::Balanced => (1, 2, 4, 70),
            Self::LongRange => (2, 8, 5, 120),
        };
        config.q_value = 4;
        config.session = session;
        config.target = 0;
        config.scan_time = scan_time;
        config.no_tag_ab_threshold = threshold;
        config.poll_interval = Duration::from_millis(poll_ms);
        config.antenna_mask = 0x01;
    }
}

impl fmt::Display for InventoryPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fast => "fast",
            Self::Balanced => "balanced",
            Self::LongRange => "long-range",
        })
    }
}

impl FromStr for InventoryPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "balanced" => Ok(Self::Balanced),
            "long-range" | "longrange" | "long" => Ok(Self::LongRange),
            other => Err(format!("unknown preset {:?}", other)),
        }
    }
}

/// Inputs to the controller
#[derive(Debug)]
pub enum Event {
    Connected(Endpoint),
    ConnectFailed(String),
    Disconnected,
    /// Error surfaced by the link; the link is gone afterwards
    ConnectionError(ConnectionError),
    Start,
    Stop,
    Tick,
    ProbeTimeout,
    /// Chunk of received bytes, in arrival order
    Bytes(Bytes),
    /// Completion of an [`Effect::Send`]
    CommandSent {
        name: &'static str,
        result: Result<usize, String>,
    },
    ApplyTuning(InventoryConfig),
    ApplyPreset(InventoryPreset),
    ProbeReaderInfo,
    SendRaw(Vec<u8>),
}

/// Work for the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send { name: &'static str, bytes: Vec<u8> },
    /// Deliver [`Event::Tick`] after the delay, replacing any pending tick
    ScheduleTick(Duration),
    /// Deliver [`Event::ProbeTimeout`] after the delay
    ScheduleProbeTimeout(Duration),
    Disconnect,
    Report(InventoryEvent),
}

/// Things worth telling the operator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InventoryEvent {
    /// One-line summary of what is going on now
    Status(String),
    Log(String),
    /// Every decoded frame while not reading
    Frame(Frame),
    NewTag {
        epc: String,
        antenna: u16,
        rssi: Option<u8>,
        total: usize,
    },
    ReaderInfo(ReaderInfo),
    Stopped { rounds: u64, unique: usize },
}

/// Most recent tag read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagSnapshot {
    pub epc: String,
    pub antenna: u16,
    pub rssi: Option<u8>,
}

/// Work queued until a link comes up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum PendingAction {
    #[default]
    None,
    StartReading,
    ProbeInfo,
    SendRaw(Vec<u8>),
}

/// State of one reader's inventory loop
#[derive(Debug)]
pub struct InventoryController {
    config: InventoryConfig,
    connected: bool,
    running: bool,
    pending: PendingAction,
    awaiting_probe: bool,

    address: u8,
    auto_address: bool,
    target: u8,
    antenna: u8,
    antenna_cursor: usize,
    frequency_cursor: usize,

    rounds: u64,
    unique_tags: usize,
    no_tag_streak: u32,
    seen: HashSet<String>,
    last_tag: Option<TagSnapshot>,

    rx_buffer: Vec<u8>,
    rx_bytes: u64,
    tx_bytes: u64,
    last_raw_report: Option<Instant>,
}

impl Default for InventoryController {
    fn default() -> Self {
        Self::new(InventoryConfig::default())
    }
}

impl InventoryController {
    pub fn new(config: InventoryConfig) -> Self {
        let config = config.clamped();
        Self {
            address: config.address,
            target: config.target,
            config,
            connected: false,
            running: false,
            pending: PendingAction::None,
            awaiting_probe: false,
            auto_address: true,
            antenna: 0x80,
            antenna_cursor: 0,
            frequency_cursor: 0,
            rounds: 0,
            unique_tags: 0,
            no_tag_streak: 0,
            seen: HashSet::new(),
            last_tag: None,
            rx_buffer: Vec::new(),
            rx_bytes: 0,
            tx_bytes: 0,
            last_raw_report: None,
        }
    }

    pub fn config(&self) -> &InventoryConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Device address commands are sent to
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn target(&self) -> u8 {
        self.target
    }

    /// Antenna selector used by the last inventory command
    pub fn antenna(&self) -> u8 {
        self.antenna
    }

    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Distinct EPCs read since the last start
    pub fn unique_tags(&self) -> usize {
        self.unique_tags
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    pub fn has_seen(&self, epc_hex: &str) -> bool {
        self.seen.contains(epc_hex)
    }

    pub fn last_tag(&self) -> Option<&TagSnapshot> {
        self.last_tag.as_ref()
    }

    pub fn no_tag_streak(&self) -> u32 {
        self.no_tag_streak
    }

    pub fn awaiting_probe(&self) -> bool {
        self.awaiting_probe
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    /// Received bytes still waiting for the rest of their frame
    pub fn rx_buffer_len(&self) -> usize {
        self.rx_buffer.len()
    }

    pub fn effective_interval(&self) -> Duration {
        self.config.effective_interval()
    }

    /// Apply one event and return what has to happen next
    pub fn update(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::Connected(endpoint) => self.on_connected(&endpoint, &mut fx),
            Event::ConnectFailed(message) => {
                // A failed reconnect has already torn down the previous link
                self.pending = PendingAction::None;
                self.connected = false;
                self.running = false;
                self.awaiting_probe = false;
                status(&mut fx, format!("Connect failed: {}", message));
                log_line(&mut fx, format!("connect error: {}", message));
            }
            Event::Disconnected => {
                self.connected = false;
                self.running = false;
                self.awaiting_probe = false;
                status(&mut fx, "Disconnected");
                log_line(&mut fx, "reader disconnected");
            }
            Event::ConnectionError(err) => {
                if !err.is_closed() {
                    log_line(&mut fx, format!("reader error: {}", err));
                }
                self.connected = false;
                self.running = false;
                self.awaiting_probe = false;
                status(&mut fx, "Reader connection closed");
            }
            Event::Start => self.on_start(&mut fx),
            Event::Stop => self.on_stop(&mut fx),
            Event::Tick => self.on_tick(&mut fx),
            Event::ProbeTimeout => {
                if self.awaiting_probe && !self.running {
                    self.awaiting_probe = false;
                    status(&mut fx, "Connected endpoint did not answer reader protocol");
                    log_line(&mut fx, "probe timeout: endpoint is likely not a UHF reader");
                    fx.push(Effect::Disconnect);
                }
            }
            Event::Bytes(chunk) => self.on_bytes(&chunk, &mut fx),
            Event::CommandSent { name, result } => self.on_command_sent(name, result, &mut fx),
            Event::ApplyTuning(config) => self.on_apply_tuning(config, &mut fx),
            Event::ApplyPreset(preset) => {
                preset.apply(&mut self.config);
                self.target = self.config.target;
                status(&mut fx, format!("Preset applied: {}", preset));
                log_line(
                    &mut fx,
                    format!(
                        concat!(
                            "preset {}: q={} s={} target={} scan={} ",
                            "poll={:?} effective={:?} mask=0x{:02X}"
                        ),
                        preset,
                        self.config.q_value,
                        self.config.session,
                        self.target,
                        self.config.scan_time,
                        self.config.poll_interval,
                        self.effective_interval(),
                        self.config.antenna_mask
                    ),
                );
            }
            Event::ProbeReaderInfo => {
                if !self.connected {
                    self.pending = PendingAction::ProbeInfo;
                    status(&mut fx, "Probe Reader Info requested: waiting for connection");
                } else {
                    status(&mut fx, "Sending GetReaderInfo");
                    self.awaiting_probe = true;
                    self.send(
                        &mut fx,
                        SEND_PROBE_INFO,
                        protocol::get_reader_info_command(self.address),
                    );
                }
            }
            Event::SendRaw(bytes) => {
                if !self.connected {
                    self.pending = PendingAction::SendRaw(bytes);
                    status(&mut fx, "Raw command requested: waiting for connection");
                } else {
                    status(&mut fx, format!("Sending {} byte(s)...", bytes.len()));
                    self.send(&mut fx, SEND_RAW, bytes);
                }
            }
        }
        fx
    }

    fn on_connected(&mut self, endpoint: &Endpoint, fx: &mut Vec<Effect>) {
        self.connected = true;
        self.running = false;
        self.awaiting_probe = false;
        self.rx_buffer.clear();
        status(fx, format!("Connected: {}", endpoint));
        log_line(fx, format!("connected: {}", endpoint));

        match std::mem::take(&mut self.pending) {
            PendingAction::StartReading => self.start_reading(fx),
            PendingAction::ProbeInfo => {
                status(fx, "Connected. Sending GetReaderInfo");
                self.awaiting_probe = true;
                self.send(fx, SEND_PROBE_INFO, protocol::get_reader_info_command(self.address));
            }
            PendingAction::SendRaw(bytes) => {
                status(fx, format!("Connected. Sending {} byte(s)...", bytes.len()));
                self.send(fx, SEND_RAW, bytes);
            }
            PendingAction::None => {
                self.awaiting_probe = true;
                self.send(fx, SEND_PROBE_INFO, protocol::get_reader_info_command(self.address));
                fx.push(Effect::ScheduleProbeTimeout(PROBE_TIMEOUT));
            }
        }
    }

    fn on_start(&mut self, fx: &mut Vec<Effect>) {
        if !self.connected {
            self.pending = PendingAction::StartReading;
            status(fx, "Start Reading requested: waiting for connection");
            return;
        }
        if self.running {
            status(fx, "Reading already running");
            return;
        }
        self.start_reading(fx);
    }

    fn start_reading(&mut self, fx: &mut Vec<Effect>) {
        self.running = true;
        self.rounds = 0;
        self.unique_tags = 0;
        self.frequency_cursor = 0;
        self.no_tag_streak = 0;
        self.antenna_cursor = 0;
        if self.config.antenna_mask == 0 {
            self.config.antenna_mask = 0x01;
        }
        self.last_tag = None;
        self.seen.clear();
        self.auto_address = true;
        self.rx_buffer.clear();

        status(fx, "Preparing reader + reading started");
        log_line(
            fx,
            format!(
                "reading started (poll={:?} effective={:?} scan={})",
                self.config.poll_interval,
                self.effective_interval(),
                self.config.scan_time
            ),
        );

        let addr = self.address;
        let (high, low) = FREQUENCY_WINDOWS[0];
        self.send(
            fx,
            SEND_WORK_MODE,
            protocol::set_work_mode_command(addr, &self.config.work_mode),
        );
        self.send(
            fx,
            SEND_SCAN_TIME,
            protocol::set_scan_time_command(addr, self.config.scan_time),
        );
        self.send(
            fx,
            SEND_ANTENNA_MASK,
            protocol::set_antenna_mux_command(addr, self.config.antenna_mask),
        );
        self.send(
            fx,
            SEND_POWER,
            protocol::set_output_power_command(addr, self.config.output_power),
        );
        self.send(
            fx,
            SEND_FREQUENCY,
            protocol::set_frequency_range_command(addr, high, low),
        );
        fx.push(Effect::ScheduleTick(self.effective_interval()));
    }

    fn on_stop(&mut self, fx: &mut Vec<Effect>) {
        if !self.running {
            status(fx, "Reading already stopped");
            return;
        }
        self.running = false;
        status(
            fx,
            format!(
                "Reading stopped. rounds={} tags={}",
                self.rounds, self.unique_tags
            ),
        );
        log_line(fx, "reading stopped");
        fx.push(Effect::Report(InventoryEvent::Stopped {
            rounds: self.rounds,
            unique: self.unique_tags,
        }));
    }

    fn on_tick(&mut self, fx: &mut Vec<Effect>) {
        if !self.running {
            return;
        }
        if !self.connected {
            self.running = false;
            status(fx, "Reading stopped: reader disconnected");
            return;
        }

        self.rounds += 1;
        if self.unique_tags == 0
            && (self.rounds == 1 || self.rounds % FREQUENCY_CYCLE_ROUNDS == 0)
        {
            let (high, low) = FREQUENCY_WINDOWS[self.frequency_cursor % FREQUENCY_WINDOWS.len()];
            self.frequency_cursor += 1;
            self.send(
                fx,
                SEND_FREQUENCY_CYCLE,
                protocol::set_frequency_range_command(self.address, high, low),
            );
        }

        let (antenna, cursor) = next_antenna(self.config.antenna_mask, self.antenna_cursor);
        self.antenna = antenna;
        self.antenna_cursor = cursor;

        let command = protocol::inventory_g2_command(
            self.address,
            self.config.q_value,
            self.config.session,
            0x00,
            0x00,
            self.target,
            self.antenna,
            self.config.scan_time,
        );
        self.send(fx, SEND_INVENTORY, command);
        fx.push(Effect::ScheduleTick(self.effective_interval()));
    }

    fn on_bytes(&mut self, chunk: &[u8], fx: &mut Vec<Effect>) {
        self.rx_bytes += chunk.len() as u64;
        self.rx_buffer.extend_from_slice(chunk);
        if self.rx_buffer.len() > RX_BUFFER_CAP {
            let excess = self.rx_buffer.len() - RX_BUFFER_KEEP;
            self.rx_buffer.drain(..excess);
        }

        let (frames, remaining) = protocol::parse_frames(&self.rx_buffer);
        self.rx_buffer = remaining;

        if frames.is_empty() {
            let due = self
                .last_raw_report
                .is_none_or(|at| at.elapsed() > RAW_REPORT_INTERVAL);
            if !self.running || due {
                log_line(fx, format!("rx raw {}", format_hex(chunk, HEX_PREVIEW)));
                self.last_raw_report = Some(Instant::now());
            }
            return;
        }

        for frame in frames {
            self.handle_frame(&frame, fx);
        }
    }

    fn on_command_sent(
        &mut self,
        name: &'static str,
        result: Result<usize, String>,
        fx: &mut Vec<Effect>,
    ) {
        let sent = match result {
            Ok(sent) => sent,
            Err(e) => {
                if name.starts_with("inventory-") {
                    self.running = false;
                    status(fx, format!("Reading stopped: {}", e));
                    log_line(fx, format!("inventory send error: {}", e));
                } else {
                    status(fx, format!("Command failed: {}", e));
                    log_line(fx, format!("{} error: {}", name, e));
                }
                return;
            }
        };

        self.tx_bytes += sent as u64;
        if name.starts_with("inventory-") {
            if self.running && self.rounds % STATUS_EVERY == 0 {
                status(
                    fx,
                    format!(
                        "Reading... rounds={} unique={}",
                        self.rounds, self.unique_tags
                    ),
                );
            }
            return;
        }
        if name.starts_with("cfg-") {
            return;
        }

        match name {
            SEND_RAW => {
                status(fx, format!("Raw sent ({} bytes)", sent));
                log_line(fx, format!("tx raw {} bytes", sent));
            }
            SEND_PROBE_INFO => {
                status(fx, "GetReaderInfo sent, waiting response");
                log_line(fx, "tx probe reader info");
            }
            _ => status(fx, format!("Sent {} ({} bytes)", name, sent)),
        }
    }

    fn on_apply_tuning(&mut self, config: InventoryConfig, fx: &mut Vec<Effect>) {
        self.config = config.clamped();
        self.target = self.config.target;
        self.antenna_cursor = 0;

        if !self.connected {
            status(fx, "Parameters saved locally (apply when connected)");
            log_line(fx, "inventory tune saved local");
            return;
        }

        status(fx, "Applying inventory parameters...");
        log_line(
            fx,
            format!(
                "apply tune q={} s={} t={} scan={} mask=0x{:02X} poll={:?} effective={:?}",
                self.config.q_value,
                self.config.session,
                self.target,
                self.config.scan_time,
                self.config.antenna_mask,
                self.config.poll_interval,
                self.effective_interval()
            ),
        );
        self.send(
            fx,
            SEND_SCAN_TIME,
            protocol::set_scan_time_command(self.address, self.config.scan_time),
        );
        self.send(
            fx,
            SEND_ANTENNA_MASK,
            protocol::set_antenna_mux_command(self.address, self.config.antenna_mask),
        );
    }

    fn handle_frame(&mut self, frame: &Frame, fx: &mut Vec<Effect>) {
        if !self.running {
            fx.push(Effect::Report(InventoryEvent::Frame(frame.clone())));
        }
        match frame.command {
            CMD_INVENTORY => {
                self.awaiting_probe = false;
                self.latch_address(frame, fx);

                let tags = match protocol::parse_inventory_g2_tags(frame) {
                    Ok(tags) => tags,
                    Err(e) => {
                        self.decode_failure("inventory parse error", &e.to_string(), fx);
                        return;
                    }
                };
                if tags.is_empty() {
                    self.on_inventory_status(frame.status, "inventory", fx);
                    return;
                }

                self.no_tag_streak = 0;
                let mut new_count = 0;
                for tag in tags {
                    if tag.epc.is_empty() {
                        continue;
                    }
                    if self.record_tag(tag.epc_hex(), tag.antenna, Some(tag.rssi), fx) {
                        new_count += 1;
                    }
                }

                if new_count > 0 {
                    status(
                        fx,
                        format!("New tag(s): +{} total={}", new_count, self.unique_tags),
                    );
                } else if self.running && self.rounds % SEEN_AGAIN_EVERY == 0 {
                    if let Some(last) = &self.last_tag {
                        let text = format!("Tag seen again: {}", trim_text(&last.epc, 28));
                        status(fx, text);
                    }
                }
            }

            CMD_INVENTORY_SINGLE => {
                self.awaiting_probe = false;
                self.latch_address(frame, fx);

                if frame.status != STATUS_NO_TAG && frame.status != STATUS_SUCCESS {
                    self.on_inventory_status(frame.status, "single inventory", fx);
                    return;
                }
                let result = match protocol::parse_single_inventory_result(frame) {
                    Ok(result) => result,
                    Err(e) => {
                        self.decode_failure("single inventory parse error", &e.to_string(), fx);
                        return;
                    }
                };
                if result.tag_count == 0 {
                    self.on_no_tag(fx);
                    self.no_tag_status(fx);
                    return;
                }

                self.no_tag_streak = 0;
                let epc = bytes_to_hex(&result.epc);
                if self.record_tag(epc.clone(), u16::from(result.antenna), None, fx) {
                    status(
                        fx,
                        format!(
                            "New tag: ant={} epc={}",
                            result.antenna,
                            trim_text(&epc, 28)
                        ),
                    );
                } else if self.running && self.rounds % STATUS_EVERY == 0 {
                    status(fx, format!("Tag seen again: {}", trim_text(&epc, 28)));
                }
            }

            CMD_GET_READER_INFO => {
                self.awaiting_probe = false;
                if frame.status != STATUS_SUCCESS {
                    log_line(
                        fx,
                        format!("reader info status: 0x{:02X}", frame.status),
                    );
                    return;
                }
                status(fx, "Reader info received");
                match ReaderInfo::parse(frame) {
                    Ok(info) => {
                        log_line(
                            fx,
                            format!(
                                "reader info: version={}.{} type=0x{:02X} power=0x{:02X} scan={}",
                                info.version.0,
                                info.version.1,
                                info.reader_type,
                                info.power,
                                info.scan_time
                            ),
                        );
                        fx.push(Effect::Report(InventoryEvent::ReaderInfo(info)));
                    }
                    Err(_) => log_line(fx, format!("reader info: {}", format_hex(&frame.data, 48))),
                }
            }

            _ => {
                if !self.running {
                    log_line(
                        fx,
                        format!(
                            "rx cmd=0x{:02X} status=0x{:02X} ({})",
                            frame.command,
                            frame.status,
                            protocol::status_label(frame.status)
                        ),
                    );
                }
            }
        }
    }

    /// First inventory-class answer after a start tells us the device address
    fn latch_address(&mut self, frame: &Frame, fx: &mut Vec<Effect>) {
        if self.auto_address {
            self.address = frame.address;
            self.auto_address = false;
            log_line(
                fx,
                format!("inventory address detected: 0x{:02X}", frame.address),
            );
        }
    }

    /// Returns true for a tag not seen since the last start
    fn record_tag(
        &mut self,
        epc: String,
        antenna: u16,
        rssi: Option<u8>,
        fx: &mut Vec<Effect>,
    ) -> bool {
        self.last_tag = Some(TagSnapshot {
            epc: epc.clone(),
            antenna,
            rssi,
        });
        if self.seen.contains(&epc) {
            return false;
        }
        self.seen.insert(epc.clone());
        self.unique_tags += 1;
        fx.push(Effect::Report(InventoryEvent::NewTag {
            epc,
            antenna,
            rssi,
            total: self.unique_tags,
        }));
        true
    }

    fn on_inventory_status(&mut self, status_byte: u8, kind: &str, fx: &mut Vec<Effect>) {
        if NO_TAG_STATUSES.contains(&status_byte) {
            self.on_no_tag(fx);
            self.no_tag_status(fx);
            return;
        }
        if status_byte == STATUS_ANTENNA_ERROR && self.running {
            if self.rounds % ANTENNA_STATUS_EVERY == 0 {
                status(
                    fx,
                    format!("Reading... antenna check (rounds={})", self.rounds),
                );
            }
            return;
        }
        if !self.running {
            log_line(
                fx,
                format!(
                    "{} status: {} (0x{:02X})",
                    kind,
                    protocol::status_label(status_byte),
                    status_byte
                ),
            );
        }
    }

    fn no_tag_status(&self, fx: &mut Vec<Effect>) {
        if self.running && self.rounds % STATUS_EVERY == 0 {
            status(fx, format!("Reading... no tag (rounds={})", self.rounds));
        }
    }

    /// Empty rounds only count while reading. In sessions S2/S3 tags stay
    /// inventoried, so a long enough streak flips the target to wake them.
    fn on_no_tag(&mut self, fx: &mut Vec<Effect>) {
        if !self.running {
            return;
        }
        self.no_tag_streak += 1;
        let threshold = u32::from(self.config.no_tag_ab_threshold);
        if self.config.session <= 1 || threshold == 0 {
            return;
        }
        if self.no_tag_streak >= threshold {
            self.target ^= 0x01;
            self.no_tag_streak = 0;
            log_line(
                fx,
                format!(
                    "no-tag threshold reached, target switched to {}",
                    target_label(self.target)
                ),
            );
        }
    }

    fn decode_failure(&self, what: &str, detail: &str, fx: &mut Vec<Effect>) {
        if self.running {
            debug!("{}: {}", what, detail);
        } else {
            log_line(fx, format!("{}: {}", what, detail));
        }
    }

    fn send(&self, fx: &mut Vec<Effect>, name: &'static str, bytes: Vec<u8>) {
        fx.push(Effect::Send { name, bytes });
    }
}

/// Next antenna selector for `mask`, scanning from bit `cursor`.
///
/// Returns `(0x80 | bit, (bit + 1) % 8)`. An empty mask selects antenna 1 and
/// leaves the cursor where it was.
pub fn next_antenna(mask: u8, cursor: usize) -> (u8, usize) {
    let start = cursor % 8;
    if mask == 0 {
        return (0x80, start);
    }
    for step in 0..8 {
        let bit = (start + step) % 8;
        if mask & (1 << bit) != 0 {
            return (0x80 | bit as u8, (bit + 1) % 8);
        }
    }
    (0x80, start)
}

pub fn target_label(target: u8) -> &'static str {
    if target & 0x01 == 0 { "A" } else { "B" }
}

fn trim_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn status(fx: &mut Vec<Effect>, text: impl Into<String>) {
    fx.push(Effect::Report(InventoryEvent::Status(text.into())));
}

fn log_line(fx: &mut Vec<Effect>, text: impl Into<String>) {
    fx.push(Effect::Report(InventoryEvent::Log(text.into())));
}
