//! The single consumer of host events.
//!
//! Advertisements, link events and scan timers are all handled on one task,
//! one at a time and in arrival order. Outbound work for the radio goes back
//! out through an [`Outbound`] channel.

use crate::decoder::Decoder;
use crate::device::{DeviceAddress, DeviceTable};
use crate::link::{LinkCommand, LinkEvent, LinkSession, LinkState};
use crate::reading::{Measurement, Reading};
use crate::scan::{ScanCommand, ScanConfig, ScanSession};
use crate::sink::ReadingSink;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

/// One advertisement as seen by the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementFrame {
    pub data: Vec<u8>,
    pub rssi: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Advertisement {
        address: DeviceAddress,
        frame: AdvertisementFrame,
    },
    Link {
        address: DeviceAddress,
        event: LinkEvent,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Scan(ScanCommand),
    Link {
        address: DeviceAddress,
        command: LinkCommand,
    },
}

pub struct Engine<S> {
    devices: Arc<DeviceTable>,
    decoder: Decoder,
    scan: ScanSession,
    links: HashMap<DeviceAddress, LinkSession>,
    sink: S,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl<S: ReadingSink> Engine<S> {
    pub fn new(
        devices: Arc<DeviceTable>,
        decoder: Decoder,
        scan: ScanConfig,
        sink: S,
        outbound: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            devices,
            decoder,
            scan: ScanSession::new(scan),
            links: HashMap::new(),
            sink,
            outbound,
        }
    }

    /// Opens a GATT link to a configured device. Returns false for unknown
    /// devices.
    pub fn connect(&mut self, address: DeviceAddress) -> bool {
        if !self.devices.contains(&address) {
            warn!(%address, "refusing to connect to unconfigured device");
            return false;
        }
        let decoder = self.decoder;
        let actions = self
            .links
            .entry(address)
            .or_insert_with(|| LinkSession::new(address, decoder))
            .connect();
        self.send_link_commands(address, actions.commands);
        true
    }

    pub fn link_state(&self, address: &DeviceAddress) -> Option<LinkState> {
        self.links.get(address).map(LinkSession::state)
    }

    pub fn scan(&self) -> &ScanSession {
        &self.scan
    }

    pub fn start_scan(&mut self, now: Instant) {
        let commands = self.scan.start(now);
        self.send_scan_commands(commands);
    }

    pub fn stop_scan(&mut self) {
        let commands = self.scan.stop();
        self.send_scan_commands(commands);
    }

    /// Runs due scan timers.
    pub fn on_timer(&mut self, now: Instant) {
        let commands = self.scan.poll(now);
        self.send_scan_commands(commands);
    }

    pub fn handle(&mut self, event: HostEvent) {
        match event {
            HostEvent::Advertisement { address, frame } => self.on_advertisement(address, frame),
            HostEvent::Link { address, event } => self.on_link_event(address, event),
        }
    }

    fn on_advertisement(&mut self, address: DeviceAddress, frame: AdvertisementFrame) {
        if !self.devices.contains(&address) || !self.scan.wants(&address) {
            return;
        }
        trace!(%address, rssi = frame.rssi, frame = %hex::encode(&frame.data), "advertisement");
        if let Some(measurement) = self.decoder.decode(&frame.data) {
            self.scan.mark_reported(address);
            self.emit(address, measurement);
        }
    }

    fn on_link_event(&mut self, address: DeviceAddress, event: LinkEvent) {
        let Some(session) = self.links.get_mut(&address) else {
            debug!(%address, ?event, "link event for unknown session");
            return;
        };
        let actions = session.handle(event);
        if session.state() == LinkState::Disconnected {
            self.links.remove(&address);
        }
        self.send_link_commands(address, actions.commands);
        if let Some(measurement) = actions.measurement {
            self.emit(address, measurement);
        }
    }

    fn emit(&mut self, address: DeviceAddress, measurement: Measurement) {
        if let Some(device) = self.devices.get(&address) {
            self.sink.on_reading(device, Reading::now(address, measurement));
        }
    }

    fn send_scan_commands(&self, commands: Vec<ScanCommand>) {
        for command in commands {
            self.send(Outbound::Scan(command));
        }
    }

    fn send_link_commands(&self, address: DeviceAddress, commands: Vec<LinkCommand>) {
        for command in commands {
            self.send(Outbound::Link { address, command });
        }
    }

    fn send(&self, outbound: Outbound) {
        if self.outbound.send(outbound).is_err() {
            debug!("radio command receiver dropped");
        }
    }

    /// Releases every open link.
    fn disconnect_all(&mut self) {
        let addresses: Vec<DeviceAddress> = self.links.keys().copied().collect();
        for address in addresses {
            self.on_link_event(address, LinkEvent::DisconnectRequested);
        }
    }
}

impl<S: ReadingSink + Send + 'static> Engine<S> {
    /// Moves the engine onto its own task, starts scanning and consumes
    /// `events` until stopped or the channel closes.
    pub fn spawn(self, events: mpsc::UnboundedReceiver<HostEvent>) -> EngineHandle<S> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(events, shutdown_rx));
        EngineHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<HostEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> S {
        self.start_scan(Instant::now());
        loop {
            let deadline = self.scan.next_deadline();
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = wait_until(deadline) => self.on_timer(Instant::now()),
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        debug!("host event channel closed");
                        break;
                    }
                },
            }
        }
        self.stop_scan();
        self.disconnect_all();
        self.sink
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Control over a spawned [`Engine`]. Dropping the handle also stops it.
pub struct EngineHandle<S> {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<S>,
}

impl<S> EngineHandle<S> {
    /// Stops scanning, releases links and waits for the engine task to end.
    /// No event is processed after this returns. Gives the sink back.
    pub async fn stop(mut self) -> Result<S, JoinError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.await
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
