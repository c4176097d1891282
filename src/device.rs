use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// 48-bit Bluetooth device address.
///
/// Parsing accepts either case and `:` or `-` separators; display is always
/// upper-case with colons, so two spellings of one address compare equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("expected 6 octets, found {0}")]
    OctetCount(usize),
    #[error("invalid octet {0:?}")]
    Octet(String),
}

impl FromStr for DeviceAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(AddressParseError::OctetCount(parts.len()));
        }
        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(AddressParseError::Octet(part.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| AddressParseError::Octet(part.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A configured sensor: its address and the label readings are reported under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    address: DeviceAddress,
    alias: String,
}

impl Device {
    pub fn new(address: DeviceAddress, alias: impl Into<String>) -> Self {
        Self {
            address,
            alias: alias.into(),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceSpecError {
    #[error("bad address in device spec: {0}")]
    Address(#[from] AddressParseError),
    #[error("empty alias in device spec")]
    EmptyAlias,
}

/// `ADDRESS` or `ADDRESS=ALIAS`; without an alias the address doubles as one.
impl FromStr for Device {
    type Err = DeviceSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((address, alias)) => {
                let alias = alias.trim();
                if alias.is_empty() {
                    return Err(DeviceSpecError::EmptyAlias);
                }
                Ok(Device::new(address.parse()?, alias))
            }
            None => {
                let address: DeviceAddress = s.parse()?;
                Ok(Device::new(address, address.to_string()))
            }
        }
    }
}

/// Read-only lookup of configured devices by normalised address.
#[derive(Debug, Clone, Default)]
pub struct DeviceTable {
    by_address: HashMap<DeviceAddress, Device>,
}

impl DeviceTable {
    /// Builds the table; when an address is listed twice the first entry wins.
    pub fn new(devices: impl IntoIterator<Item = Device>) -> Self {
        let mut by_address: HashMap<DeviceAddress, Device> = HashMap::new();
        for device in devices {
            if let Some(existing) = by_address.get(&device.address) {
                warn!(
                    address = %device.address,
                    kept = existing.alias(),
                    ignored = device.alias(),
                    "duplicate device entry"
                );
                continue;
            }
            by_address.insert(device.address, device);
        }
        Self { by_address }
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&Device> {
        self.by_address.get(address)
    }

    /// Looks up a textual address as reported by a host stack, in any case.
    pub fn lookup(&self, address: &str) -> Option<&Device> {
        address.parse().ok().and_then(|a| self.get(&a))
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.by_address.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.by_address.values()
    }
}
