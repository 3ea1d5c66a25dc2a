mod common;

use cdc_ecm::{
    EcmHost, EcmHostConfig, EnumerationState, EthernetStatistic, FailedStep, FrameChannel,
    HostEvent, LinkState, PacketFilter, SetupPacket,
};
use common::{
    activated_host, link_up, network_connection, MockBus, Reply, DATA_IN_EP, DATA_OUT_EP,
    ECM_CONFIG, MAC, NOTIFICATION_EP,
};
use smoltcp::phy::{Device, RxToken};
use smoltcp::time::Instant;
use usb_device::UsbError;

fn events(host: &mut EcmHost) -> Vec<HostEvent> {
    std::iter::from_fn(|| host.next_event()).collect()
}

#[test]
fn activation_reads_the_mac_address() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::scripted(&[Reply::Ok, Reply::Ok, Reply::Ok]);
    let mut host = activated_host(&mut bus, &frames);

    assert_eq!(host.mac_address(), Some(MAC));
    assert_eq!(events(&mut host), [HostEvent::ClassActive { mac: MAC }]);
    assert_eq!(
        bus.setups,
        [
            SetupPacket::set_interface(1, 1),
            SetupPacket::set_ethernet_packet_filter(0, PacketFilter::default()),
            SetupPacket::get_string_descriptor(4, 0x0409, 255),
        ]
    );
    assert_eq!(bus.setups[1].value, 0x001E);
    // the link stays down until the function says otherwise
    assert_eq!(host.link_state(), LinkState::Down);
    assert_eq!(bus.in_requests(NOTIFICATION_EP), [16]);
    assert!(bus.in_requests(DATA_IN_EP).is_empty());
}

#[test]
fn busy_requests_are_retried() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::scripted(&[Reply::Busy, Reply::Busy]);
    let mut host = EcmHost::attach(&mut bus, ECM_CONFIG, EcmHostConfig::default()).unwrap();

    host.poll(&mut bus, Instant::from_millis(0), &frames);
    host.poll(&mut bus, Instant::from_millis(1), &frames);
    assert_eq!(host.state(), EnumerationState::SetAltInterface);
    host.poll(&mut bus, Instant::from_millis(2), &frames);
    assert_eq!(host.state(), EnumerationState::SetPacketFilter);
    assert_eq!(bus.requests(), [0x0B, 0x0B, 0x0B]);
}

#[test]
fn failed_step_clears_halt_and_parks() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::scripted(&[Reply::Ok, Reply::Error]);
    let mut host = EcmHost::attach(&mut bus, ECM_CONFIG, EcmHostConfig::default()).unwrap();

    host.poll(&mut bus, Instant::from_millis(0), &frames);
    host.poll(&mut bus, Instant::from_millis(1), &frames);
    assert_eq!(host.state(), EnumerationState::Error);

    host.poll(&mut bus, Instant::from_millis(2), &frames);
    assert_eq!(host.state(), EnumerationState::Idle);
    assert_eq!(bus.setups.last(), Some(&SetupPacket::clear_endpoint_halt(0)));
    assert_eq!(
        events(&mut host),
        [HostEvent::Failed(FailedStep::SetPacketFilter), HostEvent::Recovered]
    );

    // parked until asked to start over
    host.poll(&mut bus, Instant::from_millis(3), &frames);
    assert_eq!(bus.setups.len(), 3);
    assert_eq!(host.transmit(&[0; 60]), Err(UsbError::InvalidState));

    host.restart();
    for t in 4..7 {
        host.poll(&mut bus, Instant::from_millis(t), &frames);
    }
    assert_eq!(host.state(), EnumerationState::SteadyState);
}

#[test]
fn bad_mac_string_fails_activation() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    bus.string_descriptor = vec![4, 3, b'0', 0];
    let mut host = EcmHost::attach(&mut bus, ECM_CONFIG, EcmHostConfig::default()).unwrap();

    for t in 0..3 {
        host.poll(&mut bus, Instant::from_millis(t), &frames);
    }
    assert_eq!(host.state(), EnumerationState::Error);
    assert_eq!(host.mac_address(), None);
}

#[test]
fn without_notifications_the_link_is_up_at_once() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let config = EcmHostConfig {
        listen_notifications: false,
        ..EcmHostConfig::default()
    };
    let mut host = EcmHost::attach(&mut bus, ECM_CONFIG, config).unwrap();
    for t in 0..3 {
        host.poll(&mut bus, Instant::from_millis(t), &frames);
    }

    assert_eq!(host.state(), EnumerationState::TransferData);
    assert_eq!(host.link_state(), LinkState::Up);
    assert!(bus.in_requests(NOTIFICATION_EP).is_empty());
    assert_eq!(bus.in_requests(DATA_IN_EP), [64]);
}

#[test]
fn notifications_drive_the_link() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    link_up(&mut host, &mut bus, &frames);

    let mut speed = vec![0xA1, 0x2A, 0, 0, 0, 0, 8, 0];
    speed.extend_from_slice(&100_000_000u32.to_le_bytes());
    speed.extend_from_slice(&10_000_000u32.to_le_bytes());
    // polls are spaced by the endpoint interval of 32 ms
    bus.deliver(NOTIFICATION_EP, &speed);
    host.poll(&mut bus, Instant::from_millis(50), &frames);
    host.poll(&mut bus, Instant::from_millis(51), &frames);
    bus.deliver(NOTIFICATION_EP, &network_connection(false));
    host.poll(&mut bus, Instant::from_millis(60), &frames);
    host.poll(&mut bus, Instant::from_millis(100), &frames);
    host.poll(&mut bus, Instant::from_millis(101), &frames);

    let speed = host.connection_speed().unwrap();
    assert_eq!(speed.download_bit_rate, 100_000_000);
    assert_eq!(speed.upload_bit_rate, 10_000_000);
    assert_eq!(host.link_state(), LinkState::Down);
    assert_eq!(
        events(&mut host)[1..],
        [
            HostEvent::LinkChanged(LinkState::Up),
            HostEvent::SpeedChanged(speed),
            HostEvent::LinkChanged(LinkState::Down),
        ]
    );
}

#[test]
fn short_packet_closes_the_frame() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    link_up(&mut host, &mut bus, &frames);

    let frame: Vec<u8> = (0..100u8).collect();
    bus.deliver(DATA_IN_EP, &frame[..64]);
    host.poll(&mut bus, Instant::from_millis(11), &frames);
    host.poll(&mut bus, Instant::from_millis(12), &frames);
    assert!(!frames.has_frame());

    bus.deliver(DATA_IN_EP, &frame[64..]);
    host.poll(&mut bus, Instant::from_millis(13), &frames);
    assert_eq!(frames.peek_len(), Some(100));
    assert!(bus.in_requests(DATA_IN_EP).iter().all(|&len| len == 64));

    let mut device = host.net_device(&frames);
    let (rx, _tx) = device.receive(Instant::from_millis(14)).unwrap();
    rx.consume(|buf| assert_eq!(&buf[..], &frame[..]));
    assert!(!frames.has_frame());
}

#[test]
fn transmit_ends_exact_multiples_with_a_zlp() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    events(&mut host);

    host.transmit(&[0x55; 128]).unwrap();
    assert_eq!(host.transmit(&[0x66; 60]), Err(UsbError::WouldBlock));
    for t in 3..10 {
        host.poll(&mut bus, Instant::from_millis(t), &frames);
    }

    let sizes: Vec<usize> = bus.sent(DATA_OUT_EP).iter().map(Vec::len).collect();
    assert_eq!(sizes, [64, 64, 0]);
    assert_eq!(events(&mut host), [HostEvent::TransmitComplete { len: 128 }]);
    assert!(host.can_transmit());
}

#[test]
fn data_path_stall_recovers_its_endpoint() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    events(&mut host);

    bus.stall_on = Some(DATA_OUT_EP);
    host.transmit(&[1; 10]).unwrap();
    host.poll(&mut bus, Instant::from_millis(3), &frames);
    host.poll(&mut bus, Instant::from_millis(4), &frames);
    assert_eq!(host.state(), EnumerationState::Error);

    host.poll(&mut bus, Instant::from_millis(5), &frames);
    assert_eq!(host.state(), EnumerationState::Idle);
    assert_eq!(
        bus.setups.last(),
        Some(&SetupPacket::clear_endpoint_halt(DATA_OUT_EP))
    );
    assert_eq!(
        events(&mut host),
        [
            HostEvent::Failed(FailedStep::DataPath {
                endpoint: DATA_OUT_EP
            }),
            HostEvent::Recovered,
        ]
    );
}

#[test]
fn failure_with_the_link_up_reports_link_down() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    link_up(&mut host, &mut bus, &frames);
    events(&mut host);

    bus.stall_on = Some(DATA_OUT_EP);
    host.transmit(&[1; 10]).unwrap();
    host.poll(&mut bus, Instant::from_millis(11), &frames);
    host.poll(&mut bus, Instant::from_millis(12), &frames);
    host.poll(&mut bus, Instant::from_millis(13), &frames);

    assert_eq!(host.state(), EnumerationState::Idle);
    assert_eq!(host.link_state(), LinkState::Down);
    assert_eq!(
        events(&mut host),
        [
            HostEvent::LinkChanged(LinkState::Down),
            HostEvent::Failed(FailedStep::DataPath {
                endpoint: DATA_OUT_EP
            }),
            HostEvent::Recovered,
        ]
    );

    // the link is already down, restarting adds no event
    host.restart();
    assert_eq!(host.next_event(), None);
}

#[test]
fn class_requests_report_events() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let mut host = activated_host(&mut bus, &frames);
    events(&mut host);

    bus.statistic = 1234;
    host.request_statistic(EthernetStatistic::ReceiveOk).unwrap();
    host.set_packet_filter(PacketFilter::PROMISCUOUS | PacketFilter::DIRECTED)
        .unwrap();
    host.poll(&mut bus, Instant::from_millis(3), &frames);
    host.poll(&mut bus, Instant::from_millis(4), &frames);

    assert_eq!(
        events(&mut host),
        [
            HostEvent::Statistic {
                statistic: EthernetStatistic::ReceiveOk,
                value: 1234
            },
            HostEvent::PacketFilterUpdated(PacketFilter::from_bits(0x05)),
        ]
    );
    assert_eq!(host.packet_filter().bits(), 0x05);
}

#[test]
fn detach_releases_the_pipes() {
    let mut store = [0; 2048];
    let frames = FrameChannel::new(&mut store, 64);
    let mut bus = MockBus::default();
    let host = activated_host(&mut bus, &frames);
    host.detach(&mut bus);
    assert_eq!(bus.closed.len(), 3);
}
