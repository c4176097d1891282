use mitemp_core::link::{
    CCC_DESCRIPTOR, CharacteristicProperties, DiscoveredCharacteristic,
    ENABLE_NOTIFICATION_VALUE, LinkCommand, LinkEvent,
};
use mitemp_core::sink::{Announcing, ChannelSink};
use mitemp_core::{
    AdvertisementFrame, Decoder, Device, DeviceAddress, DeviceTable, Engine, FrameFormat,
    HostEvent, Outbound, ScanCommand, ScanConfig, TagMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const KITCHEN: &str = "a4:c1:38:00:11:22";
const ATTIC: &str = "A4:C1:38:00:33:44";
const BALCONY: &str = "a4:c1:38:00:55:66";

fn address(s: &str) -> DeviceAddress {
    s.parse().unwrap()
}

fn devices() -> Arc<DeviceTable> {
    Arc::new(DeviceTable::new([
        format!("{KITCHEN}=kitchen").parse::<Device>().unwrap(),
        format!("{ATTIC}=attic").parse::<Device>().unwrap(),
        format!("{BALCONY}=balcony").parse::<Device>().unwrap(),
    ]))
}

fn bthome_frame() -> Vec<u8> {
    // flags, then BTHome service data: packet id, battery 90, 46.60 °C, 221.36 %
    vec![
        0x02, 0x01, 0x06, 0x0E, 0x16, 0xD2, 0xFC, 0x40, 0x00, 0x01, 0x01, 0x5A, 0x02, 0x34,
        0x12, 0x03, 0x78, 0x56,
    ]
}

fn mibeacon_frame() -> Vec<u8> {
    let mut raw = vec![0x0F, 0x16, 0x95, 0xFE, 0x70, 0x20, 0x0A, 0x01, 0x38];
    raw.resize(16, 0x00);
    raw
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn passive_and_linked_sensors_share_one_pipeline() {
    let (sink, mut readings) = ChannelSink::channel();
    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();

    let mut engine = Engine::new(
        devices(),
        Decoder::new(TagMode::Strict),
        ScanConfig::new(Duration::from_secs(30), Duration::from_secs(5)),
        Announcing::new(sink),
        outbound_tx,
    );
    assert!(engine.connect(address(BALCONY)));
    let handle = engine.spawn(events_rx);
    settle().await;

    let advertise = |addr: &str, data: Vec<u8>| HostEvent::Advertisement {
        address: address(addr),
        frame: AdvertisementFrame { data, rssi: -72 },
    };
    events.send(advertise(KITCHEN, bthome_frame())).unwrap();
    events.send(advertise(ATTIC, mibeacon_frame())).unwrap();
    events.send(advertise("11:22:33:44:55:66", bthome_frame())).unwrap();

    let link = |event| HostEvent::Link {
        address: address(BALCONY),
        event,
    };
    let notify = Uuid::from_u128(0xEBE0CCC1_7A0A_4B0C_8A1A_6FF2997DA3A6);
    events.send(link(LinkEvent::LinkEstablished)).unwrap();
    events
        .send(link(LinkEvent::ServicesDiscovered(Ok(vec![DiscoveredCharacteristic {
            service: notify,
            uuid: notify,
            properties: CharacteristicProperties(CharacteristicProperties::NOTIFY),
        }]))))
        .unwrap();
    events
        .send(link(LinkEvent::CharacteristicChanged {
            characteristic: notify,
            value: mibeacon_frame(),
        }))
        .unwrap();
    settle().await;

    let mut got = Vec::new();
    while let Ok(reading) = readings.try_recv() {
        got.push(reading);
    }
    assert_eq!(got.len(), 3);

    assert_eq!(got[0].address, address(KITCHEN));
    assert_eq!(got[0].format, FrameFormat::BtHome);
    assert_eq!(got[0].battery, 90);
    assert_eq!(got[0].temperature, 46.6);
    assert_eq!(got[0].humidity, 221.36);

    assert_eq!(got[1].address, address(ATTIC));
    assert_eq!(got[1].format, FrameFormat::MiBeacon);
    assert_eq!(got[1].temperature, 26.6);
    assert_eq!(got[1].humidity, 56.0);

    assert_eq!(got[2].address, address(BALCONY));
    assert_eq!(got[2].temperature, 26.6);

    handle.stop().await.unwrap();

    let mut sent = Vec::new();
    while let Ok(command) = outbound.try_recv() {
        sent.push(command);
    }
    assert_eq!(
        sent.first(),
        Some(&Outbound::Link {
            address: address(BALCONY),
            command: LinkCommand::Connect,
        })
    );
    assert!(sent.contains(&Outbound::Scan(ScanCommand::OpenWindow)));
    assert!(sent.contains(&Outbound::Link {
        address: address(BALCONY),
        command: LinkCommand::WriteDescriptor {
            characteristic: notify,
            descriptor: CCC_DESCRIPTOR,
            value: ENABLE_NOTIFICATION_VALUE,
        },
    }));
    assert_eq!(
        sent.last(),
        Some(&Outbound::Link {
            address: address(BALCONY),
            command: LinkCommand::Release,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_never_stop_the_pipeline() {
    let (sink, mut readings) = ChannelSink::channel();
    let (outbound_tx, _outbound) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let handle = Engine::new(
        devices(),
        Decoder::default(),
        ScanConfig::new(Duration::from_secs(30), Duration::from_secs(5)),
        sink,
        outbound_tx,
    )
    .spawn(events_rx);
    settle().await;

    let junk: Vec<Vec<u8>> = vec![
        vec![],
        vec![0xFF],
        vec![0x16, 0xD2, 0xFC, 0x40],
        vec![0x16, 0xD2, 0xFC, 0x40, 0x02, 0x34],
        vec![0x16, 0xD2, 0xFC, 0x40, 0xEE, 0x01, 0x02],
        vec![0x20, 0x16, 0x95, 0xFE, 0x70, 0x20, 0x0A, 0x01, 0x38, 0, 0, 0, 0, 0, 0, 0],
        vec![0xFF; 64],
    ];
    for data in junk {
        events
            .send(HostEvent::Advertisement {
                address: address(KITCHEN),
                frame: AdvertisementFrame { data, rssi: -90 },
            })
            .unwrap();
    }
    events
        .send(HostEvent::Advertisement {
            address: address(KITCHEN),
            frame: AdvertisementFrame {
                data: bthome_frame(),
                rssi: -90,
            },
        })
        .unwrap();
    settle().await;

    let reading = readings.try_recv().unwrap();
    assert_eq!(reading.battery, 90);
    assert!(readings.try_recv().is_err());
    assert!(!handle.is_finished());
    handle.stop().await.unwrap();
}
