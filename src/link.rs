//! GATT notification lifecycle for sensors that need a connection.
//!
//! [`LinkSession`] never talks to a radio. The host stack reports what
//! happened as [`LinkEvent`]s, the session answers with [`LinkCommand`]s for
//! the host to carry out, plus a decoded measurement when a notification
//! carried one.

use crate::decoder::Decoder;
use crate::device::DeviceAddress;
use crate::reading::Measurement;
use crate::uuid_from_u16;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Client Characteristic Configuration descriptor.
pub const CCC_DESCRIPTOR: Uuid = uuid_from_u16(0x2902);

pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringServices,
    ConfiguringNotifications,
    Streaming,
}

/// Characteristic property bits, as in the GATT characteristic declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;

    pub fn notify(&self) -> bool {
        self.0 & Self::NOTIFY != 0
    }

    pub fn indicate(&self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// A failed GATT operation as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GattError {
    #[error("GATT status {0:#04x}")]
    Status(u8),
    #[error("{0}")]
    Host(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LinkEstablished,
    LinkLost,
    DisconnectRequested,
    ServicesDiscovered(Result<Vec<DiscoveredCharacteristic>, GattError>),
    /// Local notification delivery could not be switched on.
    NotificationEnableFailed { characteristic: Uuid, error: GattError },
    DescriptorWritten {
        characteristic: Uuid,
        result: Result<(), GattError>,
    },
    CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkCommand {
    Connect,
    DiscoverServices,
    EnableNotifications { characteristic: Uuid },
    WriteDescriptor {
        characteristic: Uuid,
        descriptor: Uuid,
        value: [u8; 2],
    },
    /// Tear down the link and drop everything held for it.
    Release,
}

/// What the host should do after an event.
#[derive(Debug, Default, PartialEq)]
pub struct Actions {
    pub commands: Vec<LinkCommand>,
    pub measurement: Option<Measurement>,
}

impl Actions {
    fn command(command: LinkCommand) -> Self {
        Self {
            commands: vec![command],
            measurement: None,
        }
    }
}

#[derive(Debug)]
pub struct LinkSession {
    address: DeviceAddress,
    state: LinkState,
    decoder: Decoder,
    pending_descriptor_writes: usize,
    subscribed: Vec<Uuid>,
}

impl LinkSession {
    pub fn new(address: DeviceAddress, decoder: Decoder) -> Self {
        Self {
            address,
            state: LinkState::Disconnected,
            decoder,
            pending_descriptor_writes: 0,
            subscribed: Vec::new(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn pending_descriptor_writes(&self) -> usize {
        self.pending_descriptor_writes
    }

    /// Characteristics notifications were requested for.
    pub fn subscribed(&self) -> &[Uuid] {
        &self.subscribed
    }

    /// Starts connecting. Only valid from `Disconnected`.
    pub fn connect(&mut self) -> Actions {
        if self.state != LinkState::Disconnected {
            debug!(address = %self.address, state = ?self.state, "connect ignored");
            return Actions::default();
        }
        self.transition(LinkState::Connecting);
        Actions::command(LinkCommand::Connect)
    }

    pub fn handle(&mut self, event: LinkEvent) -> Actions {
        match event {
            LinkEvent::LinkEstablished => self.on_link_established(),
            LinkEvent::LinkLost => self.release("link lost"),
            LinkEvent::DisconnectRequested => self.release("disconnect requested"),
            LinkEvent::ServicesDiscovered(result) => self.on_services_discovered(result),
            LinkEvent::NotificationEnableFailed {
                characteristic,
                error,
            } => {
                warn!(
                    address = %self.address,
                    %characteristic,
                    %error,
                    "enabling notifications failed"
                );
                Actions::default()
            }
            LinkEvent::DescriptorWritten {
                characteristic,
                result,
            } => {
                self.on_descriptor_written(characteristic, result);
                Actions::default()
            }
            LinkEvent::CharacteristicChanged {
                characteristic,
                value,
            } => self.on_characteristic_changed(characteristic, &value),
        }
    }

    fn on_link_established(&mut self) -> Actions {
        if self.state != LinkState::Connecting {
            debug!(address = %self.address, state = ?self.state, "unexpected link established");
            return Actions::default();
        }
        self.transition(LinkState::Connected);
        self.transition(LinkState::DiscoveringServices);
        Actions::command(LinkCommand::DiscoverServices)
    }

    fn on_services_discovered(
        &mut self,
        result: Result<Vec<DiscoveredCharacteristic>, GattError>,
    ) -> Actions {
        if self.state != LinkState::DiscoveringServices {
            debug!(address = %self.address, state = ?self.state, "late service discovery result");
            return Actions::default();
        }
        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(error) => {
                warn!(address = %self.address, %error, "service discovery failed");
                self.transition(LinkState::Connected);
                return Actions::default();
            }
        };

        self.transition(LinkState::ConfiguringNotifications);
        let mut commands = Vec::new();
        for characteristic in &characteristics {
            let props = characteristic.properties;
            debug!(
                address = %self.address,
                service = %characteristic.service,
                characteristic = %characteristic.uuid,
                props = format_args!("{:#04x}", props.0),
                "discovered characteristic"
            );
            if !props.notify() && !props.indicate() {
                continue;
            }
            let value = if props.indicate() {
                ENABLE_INDICATION_VALUE
            } else {
                ENABLE_NOTIFICATION_VALUE
            };
            commands.push(LinkCommand::EnableNotifications {
                characteristic: characteristic.uuid,
            });
            commands.push(LinkCommand::WriteDescriptor {
                characteristic: characteristic.uuid,
                descriptor: CCC_DESCRIPTOR,
                value,
            });
            self.subscribed.push(characteristic.uuid);
            self.pending_descriptor_writes += 1;
        }
        info!(
            address = %self.address,
            characteristics = characteristics.len(),
            subscribed = self.subscribed.len(),
            "services discovered"
        );
        self.transition(LinkState::Streaming);
        Actions {
            commands,
            measurement: None,
        }
    }

    fn on_descriptor_written(&mut self, characteristic: Uuid, result: Result<(), GattError>) {
        self.pending_descriptor_writes = self.pending_descriptor_writes.saturating_sub(1);
        match result {
            Ok(()) => debug!(address = %self.address, %characteristic, "notifications enabled"),
            Err(error) => warn!(
                address = %self.address,
                %characteristic,
                %error,
                "CCC descriptor write failed"
            ),
        }
    }

    fn on_characteristic_changed(&mut self, characteristic: Uuid, value: &[u8]) -> Actions {
        if self.state != LinkState::Streaming {
            debug!(address = %self.address, state = ?self.state, "notification outside streaming");
            return Actions::default();
        }
        if !self.subscribed.contains(&characteristic) {
            debug!(
                address = %self.address,
                %characteristic,
                "notification from unsubscribed characteristic"
            );
            return Actions::default();
        }
        trace!(address = %self.address, %characteristic, value = %hex::encode(value), "notification");
        let measurement = self.decoder.decode(value);
        if measurement.is_none() {
            debug!(address = %self.address, %characteristic, "undecodable notification dropped");
        }
        Actions {
            commands: Vec::new(),
            measurement,
        }
    }

    fn release(&mut self, reason: &str) -> Actions {
        if self.state == LinkState::Disconnected {
            return Actions::default();
        }
        info!(address = %self.address, reason, "link closed");
        self.transition(LinkState::Disconnected);
        self.pending_descriptor_writes = 0;
        self.subscribed.clear();
        Actions::command(LinkCommand::Release)
    }

    fn transition(&mut self, next: LinkState) {
        trace!(address = %self.address, from = ?self.state, to = ?next, "link state");
        self.state = next;
    }
}
