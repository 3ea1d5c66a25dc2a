use heapless::{String, Vec};
#[allow(clippy::wildcard_imports)]
use usb_device::class_prelude::*;
use usb_device::Result;

use crate::bytes::{Buf, BufMut};
use crate::datapath::OutboundFrame;
use crate::notification::{self, Speed};
use crate::reassembler::{ChunkOutcome, FrameChannel};
use crate::request::{
    mac_to_string, EthernetStatistic, PacketFilter, REQ_GET_ENCAPSULATED_RESPONSE,
    REQ_GET_ETHERNET_STATISTIC, REQ_SEND_ENCAPSULATED_COMMAND,
    REQ_SET_ETHERNET_MULTICAST_FILTERS, REQ_SET_ETHERNET_PACKET_FILTER,
};
use crate::{MAX_BULK_PACKET, MAX_SEGMENT_SIZE, USB_CLASS_CDC};

const CDC_SUBCLASS_ECM: u8 = 0x06;
const CDC_PROTOCOL_NONE: u8 = 0x00;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_UNION: u8 = 0x06;
const CDC_TYPE_ETHERNET: u8 = 0x0F;
const CS_INTERFACE: u8 = 0x24;
const USB_CLASS_CDC_DATA: u8 = 0x0a;

/// Multicast addresses remembered from `SET_ETHERNET_MULTICAST_FILTERS`.
const MULTICAST_FILTERS: usize = 16;
/// `wNumberMCFilters`: bit 15 set because filtering is not exact.
const MULTICAST_FILTERS_DESCRIPTOR: u16 = 0x8000 | MULTICAST_FILTERS as u16;
const STATISTICS_SUPPORTED: u32 = 0x1F;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum DeviceState {
    Disabled,
    Disconnected,
    Connected,
}

#[derive(PartialEq, Eq)]
enum HostNotificationState {
    Complete,
    InProgress(HostNotification),
}

#[derive(PartialEq, Eq)]
enum HostNotification {
    Connect,
    Disconnect,
    Speed(Speed),
}

/// Counters reported through `GET_ETHERNET_STATISTIC`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct DeviceStatistics {
    pub transmit_ok: u32,
    pub receive_ok: u32,
    pub transmit_error: u32,
    pub receive_error: u32,
    pub receive_no_buffer: u32,
}

impl DeviceStatistics {
    #[must_use]
    pub fn get(&self, statistic: EthernetStatistic) -> u32 {
        match statistic {
            EthernetStatistic::TransmitOk => self.transmit_ok,
            EthernetStatistic::ReceiveOk => self.receive_ok,
            EthernetStatistic::TransmitError => self.transmit_error,
            EthernetStatistic::ReceiveError => self.receive_error,
            EthernetStatistic::ReceiveNoBuffer => self.receive_no_buffer,
        }
    }

    fn record_chunk(&mut self, outcome: ChunkOutcome) {
        match outcome {
            ChunkOutcome::Frame(_) => self.receive_ok = self.receive_ok.wrapping_add(1),
            ChunkOutcome::Dropped => {
                self.receive_no_buffer = self.receive_no_buffer.wrapping_add(1);
            }
            ChunkOutcome::Pending | ChunkOutcome::Empty | ChunkOutcome::Discarded => {}
        }
    }
}

/// CDC-ECM function for `usb-device`.
///
/// Frames written by the host on the bulk OUT endpoint are reassembled into
/// `frames`. Frames for the host are sent with [`send_frame`](Self::send_frame),
/// one at a time.
pub struct EcmDevice<'a, 'c, B: UsbBus, const LEN: usize> {
    comm_if: InterfaceNumber,
    comm_ep: EndpointIn<'a, B>,
    data_if: InterfaceNumber,
    write_ep: EndpointIn<'a, B>,
    read_ep: EndpointOut<'a, B>,
    mac_address: String<12>,
    mac_address_idx: StringIndex,
    state: DeviceState,
    started: bool,
    request_state: HostNotificationState,
    connection_speed: Option<Speed>,
    packet_filter: PacketFilter,
    multicast_filters: Vec<[u8; 6], MULTICAST_FILTERS>,
    outbound: OutboundFrame,
    frames: &'a FrameChannel<'c, LEN>,
    statistics: DeviceStatistics,
}

impl<'a, 'c, B: UsbBus, const LEN: usize> EcmDevice<'a, 'c, B, LEN> {
    /// `max_packet_size` is used for both bulk endpoints and must not exceed
    /// [`MAX_BULK_PACKET`].
    pub fn new(
        alloc: &'a UsbBusAllocator<B>,
        mac_address: [u8; 6],
        max_packet_size: u16,
        frames: &'a FrameChannel<'c, LEN>,
    ) -> Self {
        let mac_address_idx = alloc.string();
        frames.reset(max_packet_size);

        Self {
            comm_if: alloc.interface(),
            comm_ep: alloc.interrupt(16, 32),
            data_if: alloc.interface(),
            write_ep: alloc.bulk(max_packet_size),
            read_ep: alloc.bulk(max_packet_size),
            mac_address: mac_to_string(mac_address),
            mac_address_idx,
            state: DeviceState::Disabled,
            started: false,
            request_state: HostNotificationState::Complete,
            connection_speed: None,
            packet_filter: PacketFilter::default(),
            multicast_filters: Vec::new(),
            outbound: OutboundFrame::new(),
            frames,
            statistics: DeviceStatistics::default(),
        }
    }

    /// Advertises `mac_address` and lets [`poll`](Self::poll) report the link as
    /// connected once the host enables the data interface.
    pub fn start(&mut self, mac_address: [u8; 6]) {
        self.mac_address = mac_to_string(mac_address);
        self.started = true;
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-device: started as {}", self.mac_address.as_str());
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.outbound.clear();
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-device: stopped");
    }

    /// Moves the link state towards started/stopped and keeps a partly sent
    /// frame going. Call after `UsbDevice::poll`.
    pub fn poll(&mut self) {
        if self.request_state == HostNotificationState::Complete {
            let res = match (self.started, self.state) {
                (true, DeviceState::Disconnected) => self.connect(),
                (false, DeviceState::Connected) => self.disconnect(),
                _ => Ok(()),
            };
            if let Err(_err) = res {
                #[cfg(feature = "defmt")]
                defmt::debug!("ecm-device: link notification deferred: {}", _err);
            }
        }
        let _ = self.write_packet();
    }

    pub fn connect(&mut self) -> Result<()> {
        self.network_connection_notification(true)
    }

    pub fn disconnect(&mut self) -> Result<()> {
        self.network_connection_notification(false)
    }

    fn network_connection_notification(&mut self, connect: bool) -> Result<()> {
        if self.state == DeviceState::Disabled {
            #[cfg(feature = "defmt")]
            defmt::warn!("ecm-device: can't change connection state while disabled");
            return Err(UsbError::WouldBlock);
        }

        if let HostNotificationState::InProgress(_) = self.request_state {
            return Err(UsbError::WouldBlock);
        }

        let data = notification::network_connection(connect, self.comm_if.into());
        self.comm_ep.write(&data)?;

        self.request_state = HostNotificationState::InProgress(if connect {
            HostNotification::Connect
        } else {
            HostNotification::Disconnect
        });
        #[cfg(feature = "defmt")]
        defmt::debug!("ecm-device: sending link {}", connect);
        Ok(())
    }

    pub fn set_connection_speed(
        &mut self,
        download_bit_rate: u32,
        upload_bit_rate: u32,
    ) -> Result<()> {
        if self.state == DeviceState::Disabled {
            #[cfg(feature = "defmt")]
            defmt::warn!("ecm-device: can't set connection speed while disabled");
            return Err(UsbError::WouldBlock);
        }

        if let HostNotificationState::InProgress(_) = self.request_state {
            return Err(UsbError::WouldBlock);
        }

        let speed = Speed {
            upload_bit_rate,
            download_bit_rate,
        };
        let data = notification::connection_speed_change(speed, self.comm_if.into());
        self.comm_ep.write(&data)?;

        self.request_state = HostNotificationState::InProgress(HostNotification::Speed(speed));
        Ok(())
    }

    /// Starts sending `frame` to the host.
    pub fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        if self.state != DeviceState::Connected {
            return Err(UsbError::InvalidState);
        }
        if !self.outbound.is_done() {
            return Err(UsbError::WouldBlock);
        }
        self.outbound.load(frame)?;
        match self.write_packet() {
            Ok(()) | Err(UsbError::WouldBlock) => Ok(()),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn can_send(&self) -> bool {
        self.state == DeviceState::Connected && self.outbound.is_done()
    }

    fn write_packet(&mut self) -> Result<()> {
        if self.outbound.is_done() {
            return Ok(());
        }

        let max_packet_size = self.write_ep.max_packet_size().into();
        let write_ep = &self.write_ep;
        match self
            .outbound
            .write_next(max_packet_size, |packet| write_ep.write(packet))
        {
            Ok(true) => {
                self.statistics.transmit_ok = self.statistics.transmit_ok.wrapping_add(1);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(UsbError::WouldBlock) => Err(UsbError::WouldBlock),
            Err(err) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("ecm-device: frame write failed: {}", err);
                self.statistics.transmit_error = self.statistics.transmit_error.wrapping_add(1);
                Err(err)
            }
        }
    }

    fn read_packet(&mut self) {
        let mut buf = [0; MAX_BULK_PACKET];
        match self.read_ep.read(&mut buf) {
            Ok(len) => {
                let outcome = self.frames.push_chunk(&buf[..len]);
                self.statistics.record_chunk(outcome);
            }
            Err(UsbError::WouldBlock) => {}
            Err(_err) => {
                #[cfg(feature = "defmt")]
                defmt::warn!("ecm-device: read failed: {}", _err);
                self.statistics.receive_error = self.statistics.receive_error.wrapping_add(1);
            }
        }
    }

    #[must_use]
    pub fn connection_speed(&self) -> Option<Speed> {
        self.connection_speed
    }

    #[must_use]
    pub fn state(&self) -> DeviceState {
        self.state
    }

    #[must_use]
    pub fn packet_filter(&self) -> PacketFilter {
        self.packet_filter
    }

    #[must_use]
    pub fn multicast_filters(&self) -> &[[u8; 6]] {
        &self.multicast_filters
    }

    #[must_use]
    pub fn statistics(&self) -> DeviceStatistics {
        self.statistics
    }

    #[must_use]
    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    fn set_multicast_filters(&mut self, count: u16, mut data: &[u8]) -> Result<()> {
        if usize::from(count) > MULTICAST_FILTERS {
            return Err(UsbError::BufferOverflow);
        }
        let mut filters = Vec::new();
        for _ in 0..count {
            let address = data.get_array::<6>().ok_or(UsbError::ParseError)?;
            // capacity checked above
            let _ = filters.push(address);
        }
        self.multicast_filters = filters;
        Ok(())
    }
}

impl<B: UsbBus, const LEN: usize> UsbClass<B> for EcmDevice<'_, '_, B, LEN> {
    fn get_configuration_descriptors(&self, writer: &mut DescriptorWriter) -> Result<()> {
        // Interface Association Descriptor

        writer.iad(
            self.comm_if,
            2,
            USB_CLASS_CDC,
            CDC_SUBCLASS_ECM,
            CDC_PROTOCOL_NONE,
            None,
        )?;

        // Communication Class Interface (interface n)

        writer.interface(self.comm_if, USB_CLASS_CDC, CDC_SUBCLASS_ECM, CDC_PROTOCOL_NONE)?;
        writer.write_with(CS_INTERFACE, write_header)?;
        writer.write_with(CS_INTERFACE, |buf| {
            write_union(buf, self.comm_if.into(), self.data_if.into())
        })?;
        writer.write_with(CS_INTERFACE, |buf| {
            write_ethernet_networking(buf, self.mac_address_idx.into())
        })?;
        writer.endpoint(&self.comm_ep)?;

        // Data Class Interface (interface n+1), alternate setting 0 has no endpoints

        writer.interface_alt(self.data_if, 0, USB_CLASS_CDC_DATA, 0x00, 0x00, None)?;
        writer.interface_alt(self.data_if, 1, USB_CLASS_CDC_DATA, 0x00, 0x00, None)?;
        writer.endpoint(&self.write_ep)?;
        writer.endpoint(&self.read_ep)?;

        #[cfg(feature = "defmt")]
        defmt::debug!("ecm-device: configuration descriptors written");

        Ok(())
    }

    fn control_in(&mut self, transfer: ControlIn<B>) {
        let req = *transfer.request();

        if req.recipient != control::Recipient::Interface
            || req.index != u16::from(u8::from(self.comm_if))
        {
            return;
        }

        match (req.request_type, req.request) {
            (control::RequestType::Class, REQ_GET_ETHERNET_STATISTIC) => {
                if let Some(statistic) = EthernetStatistic::from_selector(req.value) {
                    let value = self.statistics.get(statistic);
                    let _: Result<()> = transfer.accept(|data| {
                        const LEN: usize = 4;
                        if let Some(mut data) = data.get_mut(..LEN) {
                            data.put_u32_le(value);
                            Ok(LEN)
                        } else {
                            Err(UsbError::BufferOverflow)
                        }
                    });
                } else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ecm-device: unknown statistic {}", req.value);
                    let _: Result<()> = transfer.reject();
                }
            }
            (control::RequestType::Class, REQ_GET_ENCAPSULATED_RESPONSE) => {
                let _: Result<()> = transfer.reject();
            }
            _ => {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "ecm-device: unhandled COMMUNICATION interface control_in {} {}",
                    req.request_type,
                    req.request
                );
            }
        }
    }

    fn control_out(&mut self, transfer: ControlOut<B>) {
        const REQ_SET_INTERFACE: u8 = 0x0B;

        let req = *transfer.request();

        if req.recipient != control::Recipient::Interface {
            return;
        }

        if req.index == u16::from(u8::from(self.comm_if)) {
            match (req.request_type, req.request) {
                (control::RequestType::Class, REQ_SET_ETHERNET_PACKET_FILTER) => {
                    self.packet_filter = PacketFilter::from_bits(req.value);
                    #[cfg(feature = "defmt")]
                    defmt::debug!("ecm-device: packet filter {=u16:#x}", req.value);
                    let _: Result<()> = transfer.accept();
                }
                (control::RequestType::Class, REQ_SET_ETHERNET_MULTICAST_FILTERS) => {
                    if self.set_multicast_filters(req.value, transfer.data()).is_ok() {
                        let _: Result<()> = transfer.accept();
                    } else {
                        let _: Result<()> = transfer.reject();
                    }
                }
                (control::RequestType::Class, REQ_SEND_ENCAPSULATED_COMMAND) => {
                    let _: Result<()> = transfer.reject();
                }
                _ => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!(
                        "ecm-device: unhandled COMMUNICATION interface control_out {} {}",
                        req.request_type,
                        req.request
                    );
                }
            }
            return;
        }

        if req.index == u16::from(u8::from(self.data_if))
            && (req.request_type, req.request) == (control::RequestType::Standard, REQ_SET_INTERFACE)
        {
            match req.value {
                0 => {
                    transfer.accept().ok();
                    #[cfg(feature = "defmt")]
                    defmt::info!("ecm-device: data interface disabled");
                    self.reset();
                }
                1 => {
                    #[cfg(feature = "defmt")]
                    defmt::info!("ecm-device: data interface enabled");
                    self.state = DeviceState::Disconnected;
                    transfer.accept().ok();
                }
                _ => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ecm-device: SET_INTERFACE out of range {}", req.value);
                    transfer.reject().ok();
                }
            }
        }
    }

    fn endpoint_out(&mut self, addr: EndpointAddress) {
        if addr == self.read_ep.address() {
            self.read_packet();
        }
    }

    fn endpoint_in_complete(&mut self, addr: EndpointAddress) {
        if addr == self.write_ep.address() {
            let _ = self.write_packet();
            return;
        }
        if addr != self.comm_ep.address() {
            return;
        }

        match core::mem::replace(&mut self.request_state, HostNotificationState::Complete) {
            HostNotificationState::Complete => {
                #[cfg(feature = "defmt")]
                defmt::warn!("ecm-device: endpoint in completed when no request was in progress");
            }
            HostNotificationState::InProgress(HostNotification::Connect) => {
                #[cfg(feature = "defmt")]
                defmt::info!("ecm-device: connected");
                self.state = DeviceState::Connected;
            }
            HostNotificationState::InProgress(HostNotification::Disconnect) => {
                #[cfg(feature = "defmt")]
                defmt::info!("ecm-device: disconnected");
                self.state = DeviceState::Disconnected;
                self.outbound.clear();
            }
            HostNotificationState::InProgress(HostNotification::Speed(speed)) => {
                self.connection_speed = Some(speed);
            }
        }
    }

    fn get_string(&self, index: StringIndex, _lang_id: LangID) -> Option<&str> {
        if index == self.mac_address_idx {
            Some(&self.mac_address)
        } else {
            None
        }
    }

    fn reset(&mut self) {
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-device: reset");
        self.frames.reset(self.read_ep.max_packet_size());
        self.outbound.clear();
        self.state = DeviceState::Disabled;
        self.request_state = HostNotificationState::Complete;
        self.connection_speed = None;
        self.multicast_filters.clear();
    }
}

fn write_header(buf: &mut [u8]) -> Result<usize> {
    const LEN: usize = 3;
    let mut buf = buf.get_mut(..LEN).ok_or(UsbError::BufferOverflow)?;
    buf.put_u8(CDC_TYPE_HEADER); // bDescriptorSubtype
    buf.put_u16_le(0x0110); // bcdCDC (1.10)
    Ok(LEN)
}

fn write_union(buf: &mut [u8], comm_if: u8, data_if: u8) -> Result<usize> {
    const LEN: usize = 3;
    let mut buf = buf.get_mut(..LEN).ok_or(UsbError::BufferOverflow)?;
    buf.put_u8(CDC_TYPE_UNION); // bDescriptorSubtype
    buf.put_u8(comm_if); // bControlInterface
    buf.put_u8(data_if); // bSubordinateInterface0
    Ok(LEN)
}

fn write_ethernet_networking(buf: &mut [u8], mac_address_idx: u8) -> Result<usize> {
    const LEN: usize = 11;
    let mut buf = buf.get_mut(..LEN).ok_or(UsbError::BufferOverflow)?;
    buf.put_u8(CDC_TYPE_ETHERNET); // bDescriptorSubtype
    buf.put_u8(mac_address_idx); // iMACAddress
    buf.put_u32_le(STATISTICS_SUPPORTED); // bmEthernetStatistics
    buf.put_u16_le(MAX_SEGMENT_SIZE); // wMaxSegmentSize
    buf.put_u16_le(MULTICAST_FILTERS_DESCRIPTOR); // wNumberMCFilters
    buf.put_u8(0); // bNumberPowerFilters
    Ok(LEN)
}
