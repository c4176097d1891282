use crate::device::DeviceAddress;
use serde::{Serialize, Serializer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which wire format a measurement was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameFormat {
    BtHome,
    MiBeacon,
}

/// Sensor values carried by one frame, as decoded.
///
/// Fields a frame did not carry stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub temperature: f32,
    pub humidity: f32,
    pub battery: u8,
    pub voltage: f32,
    pub format: FrameFormat,
}

impl Measurement {
    pub const fn empty(format: FrameFormat) -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            battery: 0,
            voltage: 0.0,
            format,
        }
    }
}

/// A measurement attributed to a device at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub address: DeviceAddress,
    /// Degrees Celsius.
    pub temperature: f32,
    /// Relative humidity, percent.
    pub humidity: f32,
    /// Battery level, percent.
    pub battery: u8,
    /// Battery voltage, volts.
    pub voltage: f32,
    pub format: FrameFormat,
    #[serde(rename = "timestamp_ms", serialize_with = "unix_millis")]
    pub timestamp: SystemTime,
}

impl Reading {
    pub fn new(address: DeviceAddress, measurement: Measurement, timestamp: SystemTime) -> Self {
        Self {
            address,
            temperature: measurement.temperature,
            humidity: measurement.humidity,
            battery: measurement.battery,
            voltage: measurement.voltage,
            format: measurement.format,
            timestamp,
        }
    }

    pub fn now(address: DeviceAddress, measurement: Measurement) -> Self {
        Self::new(address, measurement, SystemTime::now())
    }

    pub fn measurement(&self) -> Measurement {
        Measurement {
            temperature: self.temperature,
            humidity: self.humidity,
            battery: self.battery,
            voltage: self.voltage,
            format: self.format,
        }
    }
}

fn unix_millis<S: Serializer>(timestamp: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    let millis = timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    serializer.serialize_u64(millis)
}
