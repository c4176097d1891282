//! Decoding and scan scheduling for BLE temperature/humidity sensors.
//!
//! Two advertisement formats are understood: BTHome v2 service data and the
//! Xiaomi MiBeacon temperature/humidity frame. Passive sensors are picked up
//! by a duty-cycled scan, sensors that only talk over a GATT link are driven
//! through [`link::LinkSession`]. Both paths feed the same
//! [`decoder::Decoder`] and emit [`reading::Reading`]s into a
//! [`sink::ReadingSink`].

pub mod decoder;
pub mod device;
pub mod engine;
pub mod error;
pub mod link;
pub mod reading;
pub mod scan;
pub mod sink;

pub use decoder::{Decoder, TagMode};
pub use device::{Device, DeviceAddress, DeviceTable};
pub use engine::{AdvertisementFrame, Engine, EngineHandle, HostEvent, Outbound};
pub use error::DecodeError;
pub use reading::{FrameFormat, Measurement, Reading};
pub use scan::{ScanCommand, ScanConfig, ScanSession};
pub use sink::ReadingSink;

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Expands a 16-bit assigned number into a full Bluetooth UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Returns the 16-bit assigned number if `uuid` lives in the Bluetooth base range.
pub fn uuid_to_u16(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let short = (value >> 96) as u16;
    (value & !(0xFFFF_u128 << 96) == BLUETOOTH_BASE_UUID).then_some(short)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuid_expansion() {
        assert_eq!(
            uuid_from_u16(0xFCD2),
            Uuid::from_u128(0x0000FCD2_0000_1000_8000_00805F9B34FB)
        );
        assert_eq!(uuid_to_u16(&uuid_from_u16(0xFE95)), Some(0xFE95));
    }

    #[test]
    fn vendor_uuid_has_no_short_form() {
        let vendor = Uuid::from_u128(0xEBE0CCC1_7A0A_4B0C_8A1A_6FF2997DA3A6);
        assert_eq!(uuid_to_u16(&vendor), None);
    }
}
