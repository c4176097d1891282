//! Where decoded readings go.

use crate::device::{Device, DeviceAddress};
use crate::reading::Reading;
use serde::Serialize;
use std::collections::HashSet;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receiver of decoded readings, called in arrival order from the event loop.
///
/// Implementations must not block; hand heavy work (publishing, storage) to
/// another task.
pub trait ReadingSink {
    fn on_reading(&mut self, device: &Device, reading: Reading);

    /// Called once per device, before its first reading, when wrapped in
    /// [`Announcing`].
    fn announce(&mut self, _device: &Device, _first: &Reading) {}
}

impl<S: ReadingSink + ?Sized> ReadingSink for Box<S> {
    fn on_reading(&mut self, device: &Device, reading: Reading) {
        (**self).on_reading(device, reading)
    }

    fn announce(&mut self, device: &Device, first: &Reading) {
        (**self).announce(device, first)
    }
}

/// Logs each reading at `info`.
#[derive(Debug, Default)]
pub struct LogSink;

impl ReadingSink for LogSink {
    fn on_reading(&mut self, device: &Device, reading: Reading) {
        info!(
            device = device.alias(),
            address = %reading.address,
            temperature = format_args!("{:.2}", reading.temperature),
            humidity = format_args!("{:.2}", reading.humidity),
            battery = reading.battery,
            voltage = format_args!("{:.3}", reading.voltage),
            format = ?reading.format,
            "reading"
        );
    }

    fn announce(&mut self, device: &Device, _first: &Reading) {
        info!(device = device.alias(), address = %device.address(), "new sensor");
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    alias: &'a str,
    #[serde(flatten)]
    reading: &'a Reading,
}

/// Writes one JSON object per reading, newline separated.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_record(&mut self, device: &Device, reading: &Reading) -> std::io::Result<()> {
        let record = JsonRecord {
            alias: device.alias(),
            reading,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl<W: Write> ReadingSink for JsonLinesSink<W> {
    fn on_reading(&mut self, device: &Device, reading: Reading) {
        if let Err(e) = self.write_record(device, &reading) {
            warn!(device = device.alias(), error = %e, "failed to write reading");
        }
    }
}

/// Forwards readings to a channel, for consumers running in their own task.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Reading>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<Reading>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Reading>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReadingSink for ChannelSink {
    fn on_reading(&mut self, device: &Device, reading: Reading) {
        if self.tx.send(reading).is_err() {
            warn!(device = device.alias(), "reading receiver dropped");
        }
    }
}

/// Which devices have reported at least once in this process.
#[derive(Debug, Clone, Default)]
pub struct FirstSeen {
    seen: HashSet<DeviceAddress>,
}

impl FirstSeen {
    /// Records `address`; true the first time only.
    pub fn observe(&mut self, address: DeviceAddress) -> bool {
        self.seen.insert(address)
    }

    pub fn has_seen(&self, address: &DeviceAddress) -> bool {
        self.seen.contains(address)
    }
}

/// Calls [`ReadingSink::announce`] on the inner sink the first time each
/// device reports.
#[derive(Debug, Default)]
pub struct Announcing<S> {
    inner: S,
    first_seen: FirstSeen,
}

impl<S> Announcing<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            first_seen: FirstSeen::default(),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: ReadingSink> ReadingSink for Announcing<S> {
    fn on_reading(&mut self, device: &Device, reading: Reading) {
        if self.first_seen.observe(reading.address) {
            self.inner.announce(device, &reading);
        }
        self.inner.on_reading(device, reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::{FrameFormat, Measurement};
    use std::time::{Duration, UNIX_EPOCH};

    fn kitchen() -> Device {
        "A4:C1:38:00:11:22=kitchen".parse().unwrap()
    }

    fn reading(device: &Device, temperature: f32) -> Reading {
        Reading::new(
            device.address(),
            Measurement {
                temperature,
                ..Measurement::empty(FrameFormat::MiBeacon)
            },
            UNIX_EPOCH + Duration::from_secs(1),
        )
    }

    #[derive(Default)]
    struct Recorder {
        announced: Vec<String>,
        readings: Vec<f32>,
    }

    impl ReadingSink for Recorder {
        fn on_reading(&mut self, _device: &Device, reading: Reading) {
            self.readings.push(reading.temperature);
        }

        fn announce(&mut self, device: &Device, _first: &Reading) {
            self.announced.push(device.alias().to_string());
        }
    }

    #[test]
    fn announces_each_device_once() {
        let kitchen = kitchen();
        let attic: Device = "A4:C1:38:00:33:44=attic".parse().unwrap();
        let mut sink = Announcing::new(Recorder::default());

        sink.on_reading(&kitchen, reading(&kitchen, 20.0));
        sink.on_reading(&kitchen, reading(&kitchen, 21.0));
        sink.on_reading(&attic, reading(&attic, 15.0));

        let recorder = sink.into_inner();
        assert_eq!(recorder.announced, ["kitchen", "attic"]);
        assert_eq!(recorder.readings, [20.0, 21.0, 15.0]);
    }

    #[test]
    fn json_lines_include_alias() {
        let kitchen = kitchen();
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.on_reading(&kitchen, reading(&kitchen, 22.5));
        sink.on_reading(&kitchen, reading(&kitchen, 23.0));

        let out = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["alias"], "kitchen");
        assert_eq!(lines[0]["address"], "A4:C1:38:00:11:22");
        assert_eq!(lines[0]["temperature"], 22.5);
        assert_eq!(lines[1]["format"], "mi_beacon");
    }

    #[test]
    fn channel_sink_forwards() {
        let kitchen = kitchen();
        let (mut sink, mut rx) = ChannelSink::channel();
        sink.on_reading(&kitchen, reading(&kitchen, 19.5));
        assert_eq!(rx.try_recv().unwrap().temperature, 19.5);

        drop(rx);
        // receiver gone: logged, not a panic
        sink.on_reading(&kitchen, reading(&kitchen, 19.5));
    }
}
