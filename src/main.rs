//! st8508: find UHFReader18 / ST-8508 readers on the LAN and read tags from them.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use uhf_reader18::{
    Candidate, Command, DiscoveryError, Endpoint, InventoryConfig, InventoryEvent, InventoryPreset,
    ReaderInfo, ScanOptions, Session, TcpConnection, discovery, format_hex, parse_hex_input,
    protocol,
};

const DEFAULT_CONFIG: &str = "st8508.toml";

/// st8508 - UHFReader18 network reader tool
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (defaults to ./st8508.toml when present)
    #[arg(short = 'f', long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Scan the local network for readers
    Scan {
        #[command(flatten)]
        scan: ScanArgs,

        /// Probe only these hosts instead of the local subnets
        #[arg(long, value_delimiter = ',')]
        hosts: Vec<Ipv4Addr>,
    },
    /// Run the inventory loop and print every new tag
    Read {
        #[command(flatten)]
        target: TargetArgs,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Tuning preset: fast, balanced or long-range
        #[arg(short, long)]
        preset: Option<InventoryPreset>,
    },
    /// Ask the reader for its module information
    Info {
        #[command(flatten)]
        target: TargetArgs,

        /// How long to wait for the answer, in milliseconds
        #[arg(long, default_value = "1500")]
        wait_ms: u64,
    },
    /// Send raw bytes, e.g. "04 00 21 D9 6A", and print the decoded answers
    Send {
        hex: String,

        #[command(flatten)]
        target: TargetArgs,

        /// How long to listen for answers, in milliseconds
        #[arg(long, default_value = "1500")]
        wait_ms: u64,
    },
}

#[derive(Args, Debug)]
struct ScanArgs {
    /// Ports to probe
    #[arg(long, value_delimiter = ',')]
    ports: Vec<u16>,

    /// Per-attempt timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Parallel probes
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Hosts per interface
    #[arg(long)]
    host_limit: Option<usize>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Reader host; scans for the best verified reader when omitted
    #[arg(long)]
    host: Option<String>,

    #[arg(long, default_value = "6000")]
    port: u16,

    #[command(flatten)]
    scan: ScanArgs,
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    scan: ScanOptions,
    #[serde(default)]
    inventory: InventoryConfig,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

impl ScanArgs {
    /// Command line values override the config file
    fn apply(&self, mut opts: ScanOptions) -> ScanOptions {
        if !self.ports.is_empty() {
            opts.ports = self.ports.clone();
        }
        if let Some(ms) = self.timeout_ms {
            opts.timeout = Duration::from_millis(ms);
        }
        if let Some(concurrency) = self.concurrency {
            opts.concurrency = concurrency;
        }
        if let Some(limit) = self.host_limit {
            opts.host_limit_per_interface = limit;
        }
        opts.normalized()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.clone().or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG);
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => {
            let config = load_config(path)?;
            info!("loaded config from {}", path.display());
            config
        }
        None => ConfigFile::default(),
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, shutting down");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        CliCommand::Scan { scan, hosts } => {
            let opts = scan.apply(file_config.scan);
            let result = if hosts.is_empty() {
                discovery::scan(&opts, &cancel).await
            } else {
                discovery::scan_hosts(hosts, &opts, &cancel).await
            };
            let candidates = keep_partial(result)?;
            print_candidates(&candidates);
        }

        CliCommand::Read {
            target,
            duration,
            preset,
        } => {
            let endpoint = resolve(&target, file_config.scan, &cancel).await?;
            let mut session = Session::new(TcpConnection::new(), file_config.inventory);
            let mut reports = session.subscribe();
            let (tx, rx) = mpsc::channel(8);

            if let Some(preset) = preset {
                tx.send(Command::ApplyPreset(preset)).await?;
            }
            tx.send(Command::Start).await?;
            tx.send(Command::Connect(endpoint)).await?;

            let printer = tokio::spawn(async move {
                while let Some(report) = reports.recv().await {
                    if let InventoryEvent::NewTag {
                        epc, antenna, rssi, ..
                    } = report
                    {
                        match rssi {
                            Some(rssi) => println!("{}\tant={}\trssi={}", epc, antenna, rssi),
                            None => println!("{}\tant={}", epc, antenna),
                        }
                    }
                }
            });
            hold_commands(tx, duration.map(Duration::from_secs), true, &cancel);

            session.run(rx, &cancel).await;
            let controller = session.controller();
            info!(
                "done: rounds={} unique={} rx={}B tx={}B",
                controller.rounds(),
                controller.unique_tags(),
                controller.rx_bytes(),
                controller.tx_bytes()
            );
            drop(session);
            let _ = printer.await;
        }

        CliCommand::Info { target, wait_ms } => {
            let endpoint = resolve(&target, file_config.scan, &cancel).await?;
            let mut session = Session::new(TcpConnection::new(), file_config.inventory);
            let mut reports = session.subscribe();
            let (tx, rx) = mpsc::channel(4);
            tx.send(Command::ProbeReaderInfo).await?;
            tx.send(Command::Connect(endpoint)).await?;
            hold_commands(tx, Some(Duration::from_millis(wait_ms)), false, &cancel);

            session.run(rx, &cancel).await;
            while let Ok(report) = reports.try_recv() {
                if let InventoryEvent::ReaderInfo(info) = report {
                    print_reader_info(&info);
                }
            }
        }

        CliCommand::Send {
            hex,
            target,
            wait_ms,
        } => {
            let payload = parse_hex_input(&hex)?;
            let endpoint = resolve(&target, file_config.scan, &cancel).await?;
            let mut session = Session::new(TcpConnection::new(), file_config.inventory);
            let mut reports = session.subscribe();
            let (tx, rx) = mpsc::channel(4);
            tx.send(Command::SendRaw(payload)).await?;
            tx.send(Command::Connect(endpoint)).await?;
            hold_commands(tx, Some(Duration::from_millis(wait_ms)), false, &cancel);

            session.run(rx, &cancel).await;
            let mut answered = false;
            while let Ok(report) = reports.try_recv() {
                match report {
                    InventoryEvent::Frame(frame) => {
                        answered = true;
                        println!(
                            "addr=0x{:02X} cmd=0x{:02X} status=0x{:02X} ({})  data: {}",
                            frame.address,
                            frame.command,
                            frame.status,
                            protocol::status_label(frame.status),
                            format_hex(&frame.data, 64)
                        );
                    }
                    InventoryEvent::ReaderInfo(info) => print_reader_info(&info),
                    _ => {}
                }
            }
            if !answered {
                println!("no decodable answer within {} ms", wait_ms);
            }
        }
    }

    Ok(())
}

/// Keep the command channel open for `linger`, or until cancelled when `None`.
/// With `stop_first` a Stop is queued before the channel closes.
fn hold_commands(
    tx: mpsc::Sender<Command>,
    linger: Option<Duration>,
    stop_first: bool,
    cancel: &CancellationToken,
) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        match linger {
            Some(linger) => {
                tokio::select! {
                    _ = tokio::time::sleep(linger) => {}
                    _ = cancel.cancelled() => return,
                }
                if stop_first {
                    let _ = tx.send(Command::Stop).await;
                }
            }
            None => cancel.cancelled().await,
        }
    });
}

/// Partial results from an interrupted scan are still worth showing
fn keep_partial(
    result: Result<Vec<Candidate>, DiscoveryError>,
) -> Result<Vec<Candidate>, DiscoveryError> {
    match result {
        Err(DiscoveryError::Cancelled { partial }) => {
            warn!("scan interrupted, {} candidate(s) so far", partial.len());
            Ok(partial)
        }
        other => other,
    }
}

async fn resolve(
    target: &TargetArgs,
    scan_config: ScanOptions,
    cancel: &CancellationToken,
) -> Result<Endpoint, Box<dyn std::error::Error>> {
    if let Some(host) = &target.host {
        return Ok(Endpoint::new(host.clone(), target.port));
    }

    let opts = target.scan.apply(scan_config);
    let candidates = keep_partial(discovery::scan(&opts, cancel).await)?;
    info!(
        "scan finished: {} candidate(s), verified={}",
        candidates.len(),
        discovery::verified_count(&candidates)
    );
    match discovery::preferred_candidate(&candidates) {
        Some(best) => {
            info!("quick connect: {}", best.endpoint());
            Ok(Endpoint::new(best.host.clone(), best.port))
        }
        None => Err("no verified reader found on the local network".into()),
    }
}

fn print_reader_info(info: &ReaderInfo) {
    println!(
        concat!(
            "version {}.{}  type 0x{:02X}  protocols 0x{:02X}  ",
            "freq 0x{:02X}..0x{:02X}  power 0x{:02X}  scan {}"
        ),
        info.version.0,
        info.version.1,
        info.reader_type,
        info.protocols,
        info.min_frequency,
        info.max_frequency,
        info.power,
        info.scan_time
    );
}

fn print_candidates(candidates: &[Candidate]) {
    if candidates.is_empty() {
        println!("no candidates");
        return;
    }
    println!(
        "{:>5}  {:<21}  {:<8}  {:<26}  {}",
        "score", "endpoint", "verified", "protocol", "reason"
    );
    for c in candidates {
        println!(
            "{:>5}  {:<21}  {:<8}  {:<26}  {}",
            c.score,
            c.endpoint(),
            if c.verified { "yes" } else { "no" },
            c.protocol,
            if c.banner.is_empty() {
                c.reason.clone()
            } else {
                format!("{} [{}]", c.reason, c.banner)
            }
        );
    }
}
