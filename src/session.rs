//! Driver that runs an [`InventoryController`] against a live [`Connection`].
//!
//! Everything the controller asks for is carried out here and the outcome is
//! queued back as the next [`Event`], so the controller only ever sees one
//! event at a time. Link I/O happens on a separate task so the event loop keeps
//! serving commands, timers and cancellation while a connect or send is slow.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionError, Endpoint};
use crate::controller::{
    Effect, Event, InventoryConfig, InventoryController, InventoryEvent, InventoryPreset,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const REPLY_DEPTH: usize = 64;

/// Requests accepted by [`Session::run`]
#[derive(Debug, Clone)]
pub enum Command {
    Connect(Endpoint),
    Disconnect,
    Start,
    Stop,
    ProbeReaderInfo,
    SendRaw(Vec<u8>),
    ApplyTuning(InventoryConfig),
    ApplyPreset(InventoryPreset),
}

/// Work for the link task, executed strictly in order
#[derive(Debug)]
enum LinkRequest {
    Connect(Endpoint),
    Send { name: &'static str, bytes: Vec<u8> },
    Disconnect,
}

/// Outcome of one [`LinkRequest`]
enum LinkReply {
    Connected {
        endpoint: Endpoint,
        packets: Option<mpsc::Receiver<Bytes>>,
        errors: Option<mpsc::Receiver<ConnectionError>>,
    },
    ConnectFailed(String),
    Sent {
        name: &'static str,
        result: Result<usize, String>,
    },
    Disconnected,
}

/// Loop state owned by [`Session::run`]
struct Pump {
    queue: VecDeque<Event>,
    requests: mpsc::UnboundedSender<LinkRequest>,
    replies: Option<mpsc::Receiver<LinkReply>>,
    packets: Option<mpsc::Receiver<Bytes>>,
    errors: Option<mpsc::Receiver<ConnectionError>>,
    tick_at: Option<Instant>,
    probe_at: Option<Instant>,
}

impl Pump {
    /// Hand a request to the link task. Fails only when that task is gone.
    fn request(&mut self, request: LinkRequest) {
        if let Err(mpsc::error::SendError(request)) = self.requests.send(request) {
            warn!("link task stopped, dropping {:?}", request);
            let event = match request {
                LinkRequest::Connect(_) => Event::ConnectFailed("link task stopped".into()),
                LinkRequest::Send { name, .. } => Event::CommandSent {
                    name,
                    result: Err("link task stopped".into()),
                },
                LinkRequest::Disconnect => Event::Disconnected,
            };
            self.queue.push_back(event);
        }
    }
}

/// One reader session
pub struct Session<C: Connection> {
    connection: Arc<Mutex<C>>,
    controller: InventoryController,
    subscribers: Vec<mpsc::UnboundedSender<InventoryEvent>>,
}

impl<C: Connection + 'static> Session<C> {
    pub fn new(connection: C, config: InventoryConfig) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
            controller: InventoryController::new(config),
            subscribers: Vec::new(),
        }
    }

    pub fn controller(&self) -> &InventoryController {
        &self.controller
    }

    /// Lock the link. Waits while a connect or send is in flight.
    pub async fn connection(&self) -> MutexGuard<'_, C> {
        self.connection.lock().await
    }

    /// Receive every report the controller produces from now on
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<InventoryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        self.subscribers.retain(|s| !s.is_closed());
        rx
    }

    /// Serve `commands` until the channel closes or `cancel` fires, then stop
    /// reading and drop the link.
    ///
    /// A closed command channel lets already queued link work finish first;
    /// cancellation abandons it.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>, cancel: &CancellationToken) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = mpsc::channel(REPLY_DEPTH);
        let mut link = tokio::spawn(link_task(
            Arc::clone(&self.connection),
            request_rx,
            reply_tx,
        ));

        let mut pump = Pump {
            queue: VecDeque::new(),
            requests: request_tx,
            replies: Some(reply_rx),
            packets: None,
            errors: None,
            tick_at: None,
            probe_at: None,
        };

        let graceful = loop {
            self.drain(&mut pump);

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("session cancelled");
                    break false;
                }
                command = commands.recv() => match command {
                    Some(command) => self.accept(command, &mut pump),
                    None => {
                        debug!("command channel closed");
                        self.drain(&mut pump);
                        break true;
                    }
                },
                reply = recv_or_pending(&mut pump.replies) => match reply {
                    Some(reply) => self.on_reply(reply, &mut pump),
                    None => {
                        warn!("link task ended");
                        pump.replies = None;
                    }
                },
                chunk = recv_or_pending(&mut pump.packets) => match chunk {
                    Some(chunk) => pump.queue.push_back(Event::Bytes(chunk)),
                    None => pump.packets = None,
                },
                error = recv_or_pending(&mut pump.errors) => match error {
                    Some(error) => pump.queue.push_back(Event::ConnectionError(error)),
                    None => pump.errors = None,
                },
                _ = wait_until(pump.tick_at) => {
                    pump.tick_at = None;
                    pump.queue.push_back(Event::Tick);
                }
                _ = wait_until(pump.probe_at) => {
                    pump.probe_at = None;
                    pump.queue.push_back(Event::ProbeTimeout);
                }
            }
        };

        // Closing the request channel ends the link task once its queue is empty
        drop(pump);
        let finished = graceful
            && tokio::select! {
                _ = &mut link => true,
                _ = cancel.cancelled() => false,
            };
        if !finished {
            link.abort();
            let _ = link.await;
        }

        self.shutdown().await;
    }

    fn accept(&mut self, command: Command, pump: &mut Pump) {
        let event = match command {
            Command::Connect(endpoint) => {
                pump.packets = None;
                pump.errors = None;
                pump.request(LinkRequest::Connect(endpoint));
                return;
            }
            Command::Disconnect => {
                self.dispatch(Effect::Disconnect, pump);
                return;
            }
            Command::Start => Event::Start,
            Command::Stop => Event::Stop,
            Command::ProbeReaderInfo => Event::ProbeReaderInfo,
            Command::SendRaw(bytes) => Event::SendRaw(bytes),
            Command::ApplyTuning(config) => Event::ApplyTuning(config),
            Command::ApplyPreset(preset) => Event::ApplyPreset(preset),
        };
        pump.queue.push_back(event);
    }

    fn on_reply(&mut self, reply: LinkReply, pump: &mut Pump) {
        let event = match reply {
            LinkReply::Connected {
                endpoint,
                packets,
                errors,
            } => {
                pump.packets = packets;
                pump.errors = errors;
                Event::Connected(endpoint)
            }
            LinkReply::ConnectFailed(message) => Event::ConnectFailed(message),
            LinkReply::Sent { name, result } => Event::CommandSent { name, result },
            LinkReply::Disconnected => Event::Disconnected,
        };
        pump.queue.push_back(event);
    }

    /// Feed queued events through the controller until nothing is left
    fn drain(&mut self, pump: &mut Pump) {
        while let Some(event) = pump.queue.pop_front() {
            for effect in self.controller.update(event) {
                self.dispatch(effect, pump);
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.controller.is_running() {
            for effect in self.controller.update(Event::Stop) {
                if let Effect::Report(report) = effect {
                    self.report(report);
                }
            }
        }
        let mut connection = self.connection.lock().await;
        if connection.is_connected() {
            if let Err(e) = connection.disconnect().await {
                warn!("disconnect failed: {}", e);
            }
        }
    }

    fn dispatch(&mut self, effect: Effect, pump: &mut Pump) {
        match effect {
            Effect::Send { name, bytes } => pump.request(LinkRequest::Send { name, bytes }),
            Effect::ScheduleTick(delay) => pump.tick_at = Some(Instant::now() + delay),
            Effect::ScheduleProbeTimeout(delay) => pump.probe_at = Some(Instant::now() + delay),
            Effect::Disconnect => {
                pump.packets = None;
                pump.errors = None;
                pump.tick_at = None;
                pump.probe_at = None;
                pump.request(LinkRequest::Disconnect);
            }
            Effect::Report(report) => self.report(report),
        }
    }

    fn report(&mut self, report: InventoryEvent) {
        match &report {
            InventoryEvent::Status(text) => info!("{}", text),
            InventoryEvent::Log(text) => info!("{}", text),
            InventoryEvent::NewTag {
                epc,
                antenna,
                rssi,
                total,
            } => match rssi {
                Some(rssi) => info!(
                    "new tag ant={} epc={} rssi={} total={}",
                    antenna, epc, rssi, total
                ),
                None => info!("new tag ant={} epc={} total={}", antenna, epc, total),
            },
            InventoryEvent::Frame(frame) => debug!("rx frame {:02X?}", frame.raw),
            InventoryEvent::ReaderInfo(info) => debug!("{:?}", info),
            InventoryEvent::Stopped { rounds, unique } => {
                info!("inventory stopped after {} rounds, {} unique tags", rounds, unique)
            }
        }
        self.subscribers.retain(|s| s.send(report.clone()).is_ok());
    }
}

/// Owns all link I/O. Requests run one at a time so sends keep their order.
async fn link_task<C: Connection>(
    connection: Arc<Mutex<C>>,
    mut requests: mpsc::UnboundedReceiver<LinkRequest>,
    replies: mpsc::Sender<LinkReply>,
) {
    while let Some(request) = requests.recv().await {
        let reply = {
            let mut link = connection.lock().await;
            match request {
                LinkRequest::Connect(endpoint) => {
                    match link.connect(&endpoint, CONNECT_TIMEOUT).await {
                        Ok(()) => Some(LinkReply::Connected {
                            packets: link.packets(),
                            errors: link.errors(),
                            endpoint,
                        }),
                        Err(e) => Some(LinkReply::ConnectFailed(e.to_string())),
                    }
                }
                LinkRequest::Send { name, bytes } => {
                    debug!("send {} {:02X?}", name, bytes);
                    let result = link
                        .send_raw(&bytes, SEND_TIMEOUT)
                        .await
                        .map(|()| bytes.len())
                        .map_err(|e| e.to_string());
                    Some(LinkReply::Sent { name, result })
                }
                LinkRequest::Disconnect => match link.disconnect().await {
                    Ok(()) => Some(LinkReply::Disconnected),
                    Err(e) => {
                        warn!("disconnect failed: {}", e);
                        None
                    }
                },
            }
        };

        // After the session loop has exited nobody reads replies; queued work still runs
        if let Some(reply) = reply {
            let _ = replies.send(reply).await;
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
