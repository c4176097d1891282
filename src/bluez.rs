//! BlueZ side of the event loop: runs discovery and GATT links on request and
//! reports what it sees as [`HostEvent`]s.

use anyhow::{Context, Result};
use bluer::gatt::remote::Characteristic;
use bluer::{
    Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty, DiscoveryFilter,
    DiscoveryTransport,
};
use futures::stream::{BoxStream, SelectAll};
use futures::{Stream, StreamExt};
use mitemp_core::decoder::ad::service_data_structure;
use mitemp_core::link::{
    CharacteristicProperties, DiscoveredCharacteristic, GattError, LinkCommand, LinkEvent,
};
use mitemp_core::{
    AdvertisementFrame, DeviceAddress, DeviceTable, HostEvent, Outbound, ScanCommand,
    uuid_to_u16,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

type Discovery = BoxStream<'static, AdapterEvent>;

/// Serves radio commands until the engine drops its end of the channel.
pub async fn run(
    adapter: Adapter,
    devices: Arc<DeviceTable>,
    mut commands: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<HostEvent>,
) -> Result<()> {
    adapter
        .set_discovery_filter(DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            duplicate_data: true,
            ..Default::default()
        })
        .await
        .context("setting discovery filter")?;

    let mut discovery: Option<Discovery> = None;
    let mut sightings = Sightings::default();
    let mut links: HashMap<DeviceAddress, mpsc::UnboundedSender<LinkCommand>> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Outbound::Scan(ScanCommand::OpenWindow)) => {
                    discovery = match adapter.discover_devices().await {
                        Ok(stream) => {
                            debug!("discovery started");
                            Some(stream.boxed())
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to start discovery");
                            None
                        }
                    };
                }
                Some(Outbound::Scan(ScanCommand::CloseWindow)) => {
                    // dropping the stream ends the discovery session
                    if discovery.take().is_some() {
                        debug!("discovery stopped");
                    }
                    sightings.clear();
                }
                Some(Outbound::Link { address, command }) => {
                    route_link_command(&adapter, &mut links, &events, address, command);
                }
                None => break,
            },
            Some(event) = next_discovered(&mut discovery) => {
                if let AdapterEvent::DeviceAdded(addr) = event {
                    let address = DeviceAddress::new(addr.0);
                    if devices.contains(&address) && !sightings.is_watching(&address) {
                        match watch(&adapter, addr).await {
                            Ok(stream) => sightings.watch(address, stream),
                            Err(e) => debug!(%address, error = %e, "cannot watch device"),
                        }
                    }
                }
            }
            Some((address, event)) = sightings.next() => {
                if let Some(frame) = sightings.frame(address, event) {
                    let _ = events.send(HostEvent::Advertisement { address, frame });
                }
            }
        }
    }

    info!("radio command channel closed");
    Ok(())
}

async fn next_discovered(discovery: &mut Option<Discovery>) -> Option<AdapterEvent> {
    match discovery {
        Some(stream) => {
            let event = stream.next().await;
            if event.is_none() {
                warn!("discovery stream ended");
                *discovery = None;
            }
            event
        }
        None => std::future::pending().await,
    }
}

/// Rebuilds the service data BlueZ parsed out of the advertisement into AD
/// structures, so the frame decoder sees the bytes as sent on air.
fn frame_from_service_data(service_data: &HashMap<Uuid, Vec<u8>>) -> Vec<u8> {
    let mut raw = Vec::new();
    for (uuid, data) in service_data {
        match uuid_to_u16(uuid).and_then(|short| service_data_structure(short, data)) {
            Some(structure) => raw.extend_from_slice(&structure),
            None => trace!(%uuid, "skipping service data without 16-bit uuid"),
        }
    }
    raw
}

async fn watch(adapter: &Adapter, addr: Address) -> bluer::Result<BoxStream<'static, DeviceEvent>> {
    Ok(adapter.device(addr)?.events().await?.boxed())
}

/// Property-change streams of the configured devices seen in the current
/// window.
///
/// Only service data that changes while a window is open becomes a frame.
/// The values BlueZ has cached from earlier advertisements are never read.
#[derive(Default)]
struct Sightings {
    streams: SelectAll<BoxStream<'static, (DeviceAddress, DeviceEvent)>>,
    watched: HashSet<DeviceAddress>,
    rssi: HashMap<DeviceAddress, i16>,
}

impl Sightings {
    fn is_watching(&self, address: &DeviceAddress) -> bool {
        self.watched.contains(address)
    }

    fn watch(&mut self, address: DeviceAddress, stream: BoxStream<'static, DeviceEvent>) {
        self.watched.insert(address);
        self.streams.push(stream.map(move |event| (address, event)).boxed());
    }

    fn clear(&mut self) {
        self.streams.clear();
        self.watched.clear();
        self.rssi.clear();
    }

    async fn next(&mut self) -> Option<(DeviceAddress, DeviceEvent)> {
        self.streams.next().await
    }

    fn frame(&mut self, address: DeviceAddress, event: DeviceEvent) -> Option<AdvertisementFrame> {
        match event {
            DeviceEvent::PropertyChanged(DeviceProperty::Rssi(rssi)) => {
                self.rssi.insert(address, rssi);
                None
            }
            DeviceEvent::PropertyChanged(DeviceProperty::ServiceData(service_data)) => {
                Some(AdvertisementFrame {
                    data: frame_from_service_data(&service_data),
                    rssi: self.rssi.get(&address).copied().unwrap_or(0),
                })
            }
            _ => None,
        }
    }
}

fn route_link_command(
    adapter: &Adapter,
    links: &mut HashMap<DeviceAddress, mpsc::UnboundedSender<LinkCommand>>,
    events: &mpsc::UnboundedSender<HostEvent>,
    address: DeviceAddress,
    command: LinkCommand,
) {
    if !links.contains_key(&address) {
        if command == LinkCommand::Release {
            return;
        }
        let device = match adapter.device(Address(address.octets())) {
            Ok(device) => device,
            Err(e) => {
                warn!(%address, error = %e, "no such device on adapter");
                let _ = events.send(HostEvent::Link {
                    address,
                    event: LinkEvent::LinkLost,
                });
                return;
            }
        };
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drive_link(device, address, rx, events.clone()));
        links.insert(address, tx);
    }
    let release = command == LinkCommand::Release;
    if let Some(link) = links.get(&address) {
        let _ = link.send(command);
    }
    if release {
        links.remove(&address);
    }
}

/// Owns one GATT connection and carries out its commands in order.
async fn drive_link(
    device: Device,
    address: DeviceAddress,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<HostEvent>,
) {
    let report = |event: LinkEvent| {
        let _ = events.send(HostEvent::Link { address, event });
    };

    let mut device_events = match device.events().await {
        Ok(stream) => stream.boxed(),
        Err(e) => {
            warn!(%address, error = %e, "cannot watch device");
            report(LinkEvent::LinkLost);
            return;
        }
    };
    let mut characteristics: HashMap<Uuid, Characteristic> = HashMap::new();
    let mut notifying: HashSet<Uuid> = HashSet::new();
    let mut notifications: SelectAll<BoxStream<'static, (Uuid, Vec<u8>)>> = SelectAll::new();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    LinkCommand::Connect => match device.connect().await {
                        Ok(()) => report(LinkEvent::LinkEstablished),
                        Err(e) => {
                            warn!(%address, error = %e, "connect failed");
                            report(LinkEvent::LinkLost);
                        }
                    },
                    LinkCommand::DiscoverServices => {
                        let result = discover(&device, &mut characteristics)
                            .await
                            .map_err(|e| GattError::Host(e.to_string()));
                        report(LinkEvent::ServicesDiscovered(result));
                    }
                    LinkCommand::EnableNotifications { characteristic } => {
                        let started = match characteristics.get(&characteristic) {
                            Some(ch) => {
                                ch.notify().await.map_err(|e| GattError::Host(e.to_string()))
                            }
                            None => Err(GattError::Host("characteristic not discovered".into())),
                        };
                        match started {
                            Ok(stream) => {
                                notifying.insert(characteristic);
                                notifications.push(tagged(characteristic, stream));
                            }
                            Err(error) => report(LinkEvent::NotificationEnableFailed {
                                characteristic,
                                error,
                            }),
                        }
                    }
                    // BlueZ writes the CCC descriptor itself when a notify
                    // session starts and refuses direct writes to it.
                    LinkCommand::WriteDescriptor { characteristic, .. } => {
                        let result = if notifying.contains(&characteristic) {
                            Ok(())
                        } else {
                            Err(GattError::Host("notify session not running".into()))
                        };
                        report(LinkEvent::DescriptorWritten { characteristic, result });
                    }
                    LinkCommand::Release => {
                        if let Err(e) = device.disconnect().await {
                            debug!(%address, error = %e, "disconnect failed");
                        }
                        break;
                    }
                }
            }
            Some((characteristic, value)) = notifications.next() => {
                report(LinkEvent::CharacteristicChanged { characteristic, value });
            }
            Some(event) = device_events.next() => {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    report(LinkEvent::LinkLost);
                }
            }
        }
    }
    debug!(%address, "link task finished");
}

fn tagged(
    characteristic: Uuid,
    stream: impl Stream<Item = Vec<u8>> + Send + 'static,
) -> BoxStream<'static, (Uuid, Vec<u8>)> {
    stream.map(move |value| (characteristic, value)).boxed()
}

async fn discover(
    device: &Device,
    characteristics: &mut HashMap<Uuid, Characteristic>,
) -> bluer::Result<Vec<DiscoveredCharacteristic>> {
    for _ in 0..20 {
        if device.is_services_resolved().await? {
            break;
        }
        sleep(Duration::from_millis(250)).await;
    }

    let mut discovered = Vec::new();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let flags = characteristic.flags().await?;
            let mut bits = 0;
            if flags.read {
                bits |= CharacteristicProperties::READ;
            }
            if flags.write_without_response {
                bits |= CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
            }
            if flags.write {
                bits |= CharacteristicProperties::WRITE;
            }
            if flags.notify {
                bits |= CharacteristicProperties::NOTIFY;
            }
            if flags.indicate {
                bits |= CharacteristicProperties::INDICATE;
            }
            discovered.push(DiscoveredCharacteristic {
                service: service_uuid,
                uuid,
                properties: CharacteristicProperties(bits),
            });
            characteristics.insert(uuid, characteristic);
        }
    }
    Ok(discovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mitemp_core::uuid_from_u16;

    #[test]
    fn service_data_is_reframed_as_ad_structures() {
        let service_data: HashMap<Uuid, Vec<u8>> = [
            (uuid_from_u16(0xFCD2), vec![0x40, 0x01, 0x5A]),
            (Uuid::from_u128(0xEBE0CCC1_7A0A_4B0C_8A1A_6FF2997DA3A6), vec![0x01]),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            frame_from_service_data(&service_data),
            [0x06, 0x16, 0xD2, 0xFC, 0x40, 0x01, 0x5A]
        );
    }

    #[test]
    fn only_service_data_changes_become_frames() {
        let kitchen = DeviceAddress::new([0xA4, 0xC1, 0x38, 0x00, 0x11, 0x22]);
        let mut sightings = Sightings::default();

        let rssi = DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-64));
        assert_eq!(sightings.frame(kitchen, rssi), None);
        let connected = DeviceEvent::PropertyChanged(DeviceProperty::Connected(true));
        assert_eq!(sightings.frame(kitchen, connected), None);

        let service_data: HashMap<Uuid, Vec<u8>> =
            [(uuid_from_u16(0xFCD2), vec![0x40, 0x01, 0x5A])].into_iter().collect();
        let changed = DeviceEvent::PropertyChanged(DeviceProperty::ServiceData(service_data));
        assert_eq!(
            sightings.frame(kitchen, changed),
            Some(AdvertisementFrame {
                data: vec![0x06, 0x16, 0xD2, 0xFC, 0x40, 0x01, 0x5A],
                rssi: -64,
            })
        );
    }

    #[test]
    fn closing_the_window_forgets_watched_devices() {
        let kitchen = DeviceAddress::new([0xA4, 0xC1, 0x38, 0x00, 0x11, 0x22]);
        let mut sightings = Sightings::default();
        sightings.watch(kitchen, futures::stream::empty().boxed());
        sightings.frame(kitchen, DeviceEvent::PropertyChanged(DeviceProperty::Rssi(-70)));
        assert!(sightings.is_watching(&kitchen));

        sightings.clear();
        assert!(!sightings.is_watching(&kitchen));
        let service_data: HashMap<Uuid, Vec<u8>> =
            [(uuid_from_u16(0xFCD2), vec![0x40])].into_iter().collect();
        let changed = DeviceEvent::PropertyChanged(DeviceProperty::ServiceData(service_data));
        let frame = sightings.frame(kitchen, changed).unwrap();
        assert_eq!(frame.rssi, 0);
    }
}
