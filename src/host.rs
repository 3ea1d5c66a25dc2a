use heapless::{Deque, Vec};
use smoltcp::phy::{self, Device, DeviceCapabilities, Medium};
use smoltcp::time::{Duration, Instant};
use usb_device::{Result, UsbError};

use crate::bus::{HostBus, PipeId, RequestStatus};
use crate::datapath::{InKind, InPump, PumpResult, TransferState, TxPump};
use crate::descriptor::{EcmDescriptors, EndpointInfo};
use crate::enumeration::{
    Activation, ActivationTarget, Enumeration, EnumerationState, FailedStep,
};
use crate::notification::{LinkState, Notification, Speed};
use crate::reassembler::FrameChannel;
use crate::request::{EthernetStatistic, PacketFilter, SetupPacket, LANG_ID_EN_US};
use crate::{MAX_BULK_PACKET, MAX_SEGMENT_SIZE, MAX_SEGMENT_SIZE_USIZE, NOTIFICATION_BUFFER_SIZE};

const EVENT_QUEUE_DEPTH: usize = 8;
const REQUEST_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct EcmHostConfig {
    pub packet_filter: PacketFilter,
    /// Language of the MAC address string descriptor request.
    pub language_id: u16,
    /// When false the notification endpoint is never polled and the link is
    /// considered up as soon as activation completes.
    pub listen_notifications: bool,
    /// Bytes requested each time the receiver is armed. Defaults to the data
    /// IN max packet size and is rounded up to whole packets.
    pub rx_length: Option<usize>,
}

impl Default for EcmHostConfig {
    fn default() -> Self {
        Self {
            packet_filter: PacketFilter::default(),
            language_id: LANG_ID_EN_US,
            listen_notifications: true,
            rx_length: None,
        }
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum HostEvent {
    /// Activation finished, data may flow.
    ClassActive { mac: [u8; 6] },
    LinkChanged(LinkState),
    SpeedChanged(Speed),
    ResponseAvailable,
    TransmitComplete { len: usize },
    Statistic { statistic: EthernetStatistic, value: u32 },
    PacketFilterUpdated(PacketFilter),
    Failed(FailedStep),
    Recovered,
}

#[derive(Debug, Clone, Copy)]
enum PendingRequest {
    PacketFilter(PacketFilter),
    Statistic(EthernetStatistic),
}

#[derive(Debug, Clone, Copy)]
struct Pipes {
    notification: PipeId,
    data_in: PipeId,
    data_out: PipeId,
}

/// Host side driver for one attached CDC-ECM function.
///
/// Everything is driven by [`poll`](Self::poll). Received data goes into the
/// caller's [`FrameChannel`], which the network stack or a relay drains.
pub struct EcmHost {
    enumeration: Enumeration,
    target: ActivationTarget,
    descriptors: EcmDescriptors,
    pipes: Pipes,
    tx: TxPump,
    rx: InPump,
    notify: InPump,
    rx_length: usize,
    notification_interval: Duration,
    last_notification_poll: Option<Instant>,
    notification_buf: Vec<u8, NOTIFICATION_BUFFER_SIZE>,
    mac_address: Option<[u8; 6]>,
    link: LinkState,
    connection_speed: Option<Speed>,
    requests: Deque<PendingRequest, REQUEST_QUEUE_DEPTH>,
    events: Deque<HostEvent, EVENT_QUEUE_DEPTH>,
}

impl EcmHost {
    /// Binds to the CDC-ECM function described by `config_descriptor`, opens its
    /// pipes and starts activation.
    pub fn attach<B: HostBus>(
        bus: &mut B,
        config_descriptor: &[u8],
        config: EcmHostConfig,
    ) -> Result<Self> {
        let descriptors = EcmDescriptors::parse(config_descriptor)?;
        for ep in [&descriptors.notification, &descriptors.data_in, &descriptors.data_out] {
            if usize::from(ep.max_packet_size) > MAX_BULK_PACKET || ep.max_packet_size == 0 {
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "ecm-host: unsupported max packet size {} on {}",
                    ep.max_packet_size,
                    ep.address
                );
                return Err(UsbError::Unsupported);
            }
        }

        let pipes = open_pipes(bus, &descriptors)?;

        let target = ActivationTarget {
            data_interface: descriptors.data_interface,
            data_alt_setting: descriptors.data_alt_setting,
            comm_interface: descriptors.comm_interface,
            packet_filter: config.packet_filter,
            mac_string_index: descriptors.ethernet.mac_string_index,
            language_id: config.language_id,
            listen_notifications: config.listen_notifications,
        };

        let mut enumeration = Enumeration::new();
        enumeration.start();

        #[cfg(feature = "defmt")]
        defmt::info!("ecm-host: attached, activating");

        Ok(Self {
            enumeration,
            target,
            pipes,
            tx: TxPump::new(descriptors.data_out.max_packet_size),
            rx: InPump::new(InKind::Bulk, descriptors.data_in.max_packet_size),
            notify: InPump::new(InKind::Interrupt, descriptors.notification.max_packet_size),
            rx_length: config
                .rx_length
                .unwrap_or(usize::from(descriptors.data_in.max_packet_size)),
            notification_interval: Duration::from_millis(u64::from(
                descriptors.notification.interval.max(1),
            )),
            last_notification_poll: None,
            notification_buf: Vec::new(),
            mac_address: None,
            link: LinkState::Down,
            connection_speed: None,
            requests: Deque::new(),
            events: Deque::new(),
            descriptors,
        })
    }

    /// Stops every direction and releases the pipes.
    pub fn detach<B: HostBus>(mut self, bus: &mut B) {
        self.tx.stop();
        self.rx.stop();
        self.notify.stop();
        self.enumeration.halt();
        bus.close_pipe(self.pipes.notification);
        bus.close_pipe(self.pipes.data_in);
        bus.close_pipe(self.pipes.data_out);

        #[cfg(feature = "defmt")]
        defmt::info!("ecm-host: detached");
    }

    /// Advances activation and, once active, the notification, receive and
    /// transmit engines and any queued class request.
    pub fn poll<B: HostBus, const LEN: usize>(
        &mut self,
        bus: &mut B,
        now: Instant,
        frames: &FrameChannel<'_, LEN>,
    ) {
        match self.enumeration.poll(bus, &self.target) {
            Some(Activation::Activated(mac)) => self.activated(mac, frames),
            Some(Activation::Failed(step)) => {
                self.link_down();
                self.push_event(HostEvent::Failed(step));
            }
            Some(Activation::Recovered) => self.push_event(HostEvent::Recovered),
            None => {}
        }

        let state = self.enumeration.state();
        if !state.is_active() {
            return;
        }

        if state == EnumerationState::SteadyState {
            self.poll_notifications(bus, now, frames);
        }
        self.poll_receive(bus, frames);
        self.poll_transmit(bus);
        self.poll_requests(bus);
    }

    fn activated<const LEN: usize>(&mut self, mac: [u8; 6], frames: &FrameChannel<'_, LEN>) {
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-host: class active, mac {:02X}", mac);

        self.mac_address = Some(mac);
        self.last_notification_poll = None;
        self.push_event(HostEvent::ClassActive { mac });
        if !self.target.listen_notifications {
            self.set_link(LinkState::Up, frames);
        }
    }

    fn poll_notifications<B: HostBus, const LEN: usize>(
        &mut self,
        bus: &mut B,
        now: Instant,
        frames: &FrameChannel<'_, LEN>,
    ) {
        let due = self
            .last_notification_poll
            .map_or(true, |last| now - last >= self.notification_interval);
        if self.notify.is_idle() && due {
            self.last_notification_poll = Some(now);
            self.notification_buf.clear();
            // idle and not stopped, cannot fail
            let _ = self.notify.arm(NOTIFICATION_BUFFER_SIZE);
        }

        let buf = &mut self.notification_buf;
        let result = self.notify.poll(bus, self.pipes.notification, |chunk| {
            let room = buf.capacity() - buf.len();
            let _ = buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
        });

        match result {
            PumpResult::Pending => {}
            PumpResult::Completed(_) => match Notification::parse(&self.notification_buf) {
                Ok(Some(note)) => self.handle_notification(note, frames),
                Ok(None) => {}
                Err(_) => {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("ecm-host: malformed notification");
                }
            },
            PumpResult::Failed(_) => {
                self.fail(FailedStep::DataPath {
                    endpoint: self.descriptors.notification.address.into(),
                });
            }
        }
    }

    fn handle_notification<const LEN: usize>(
        &mut self,
        note: Notification,
        frames: &FrameChannel<'_, LEN>,
    ) {
        match note {
            Notification::NetworkConnection { link, .. } => self.set_link(link, frames),
            Notification::ResponseAvailable { .. } => {
                self.push_event(HostEvent::ResponseAvailable);
            }
            Notification::ConnectionSpeedChange { speed, .. } => {
                #[cfg(feature = "defmt")]
                defmt::debug!("ecm-host: speed {}", speed);
                self.connection_speed = Some(speed);
                self.push_event(HostEvent::SpeedChanged(speed));
            }
            Notification::Unknown { code: _code } => {
                #[cfg(feature = "defmt")]
                defmt::debug!("ecm-host: ignoring notification {=u8:#x}", _code);
            }
        }
    }

    fn poll_receive<B: HostBus, const LEN: usize>(
        &mut self,
        bus: &mut B,
        frames: &FrameChannel<'_, LEN>,
    ) {
        if self.link == LinkState::Up && self.rx.is_idle() {
            let _ = self.rx.arm(self.rx_length);
        }

        let result = self.rx.poll(bus, self.pipes.data_in, |chunk| {
            frames.push_chunk(chunk);
        });
        if let PumpResult::Failed(_) = result {
            self.fail(FailedStep::DataPath {
                endpoint: self.descriptors.data_in.address.into(),
            });
        }
    }

    fn poll_transmit<B: HostBus>(&mut self, bus: &mut B) {
        match self.tx.poll(bus, self.pipes.data_out) {
            PumpResult::Pending => {}
            PumpResult::Completed(len) => self.push_event(HostEvent::TransmitComplete { len }),
            PumpResult::Failed(_) => self.fail(FailedStep::DataPath {
                endpoint: self.descriptors.data_out.address.into(),
            }),
        }
    }

    fn poll_requests<B: HostBus>(&mut self, bus: &mut B) {
        let Some(&request) = self.requests.front() else {
            return;
        };
        let interface = self.descriptors.comm_interface;

        let mut data = [0; 4];
        let (setup, data) = match request {
            PendingRequest::PacketFilter(filter) => (
                SetupPacket::set_ethernet_packet_filter(interface, filter),
                &mut data[..0],
            ),
            PendingRequest::Statistic(statistic) => (
                SetupPacket::get_ethernet_statistic(interface, statistic),
                &mut data[..],
            ),
        };

        let status = bus.control_request(&setup, data);
        if status == RequestStatus::Busy {
            return;
        }
        self.requests.pop_front();

        match (status, request) {
            (RequestStatus::Ok(_), PendingRequest::PacketFilter(filter)) => {
                self.push_event(HostEvent::PacketFilterUpdated(filter));
            }
            (RequestStatus::Ok(len), PendingRequest::Statistic(statistic)) if len >= 4 => {
                let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                self.push_event(HostEvent::Statistic { statistic, value });
            }
            _ => {
                #[cfg(feature = "defmt")]
                defmt::warn!("ecm-host: class request {} failed", setup.request);
            }
        }
    }

    fn fail(&mut self, step: FailedStep) {
        self.tx.stop();
        self.tx.resume();
        self.enumeration.fail(step);
        self.link_down();
        self.push_event(HostEvent::Failed(step));
    }

    fn link_down(&mut self) {
        if self.link == LinkState::Down {
            return;
        }
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-host: link {}", LinkState::Down);

        self.link = LinkState::Down;
        self.push_event(HostEvent::LinkChanged(LinkState::Down));
    }

    fn set_link<const LEN: usize>(&mut self, link: LinkState, frames: &FrameChannel<'_, LEN>) {
        if link == LinkState::Down {
            self.link_down();
            return;
        }
        if self.link == link {
            return;
        }
        #[cfg(feature = "defmt")]
        defmt::info!("ecm-host: link {}", link);

        self.link = link;
        if link == LinkState::Up {
            frames.reset(self.descriptors.data_in.max_packet_size);
        }
        self.push_event(HostEvent::LinkChanged(link));
    }

    fn push_event(&mut self, event: HostEvent) {
        if self.events.is_full() {
            self.events.pop_front();
        }
        let _ = self.events.push_back(event);
    }

    /// Queues `frame` on the bulk OUT pipe.
    ///
    /// `InvalidState` unless activation has completed, `WouldBlock` while the
    /// previous frame is still being sent.
    pub fn transmit(&mut self, frame: &[u8]) -> Result<()> {
        if !self.enumeration.state().is_active() {
            return Err(UsbError::InvalidState);
        }
        self.tx.load(frame)
    }

    #[must_use]
    pub fn can_transmit(&self) -> bool {
        self.enumeration.state().is_active() && self.tx.state() == TransferState::Idle
    }

    /// Arms the receiver for `length` bytes. While the link is up the receiver
    /// re-arms itself.
    pub fn receive_ready(&mut self, length: usize) -> Result<()> {
        if !self.enumeration.state().is_active() {
            return Err(UsbError::InvalidState);
        }
        self.rx.arm(length)
    }

    pub fn stop_transmit(&mut self) {
        self.tx.stop();
    }

    pub fn resume_transmit(&mut self) {
        self.tx.resume();
    }

    pub fn stop_receive(&mut self) {
        self.rx.stop();
    }

    pub fn resume_receive(&mut self) {
        self.rx.resume();
    }

    pub fn stop_notifications(&mut self) {
        self.notify.stop();
    }

    pub fn resume_notifications(&mut self) {
        self.notify.resume();
    }

    /// Changes the packet filter of an active function.
    pub fn set_packet_filter(&mut self, filter: PacketFilter) -> Result<()> {
        if !self.enumeration.state().is_active() {
            return Err(UsbError::InvalidState);
        }
        self.requests
            .push_back(PendingRequest::PacketFilter(filter))
            .map_err(|_| UsbError::WouldBlock)?;
        self.target.packet_filter = filter;
        Ok(())
    }

    /// Reads one Ethernet statistic counter, reported as [`HostEvent::Statistic`].
    pub fn request_statistic(&mut self, statistic: EthernetStatistic) -> Result<()> {
        if !self.enumeration.state().is_active() {
            return Err(UsbError::InvalidState);
        }
        if self.descriptors.ethernet.statistics & statistic.bitmap_bit() == 0 {
            return Err(UsbError::Unsupported);
        }
        self.requests
            .push_back(PendingRequest::Statistic(statistic))
            .map_err(|_| UsbError::WouldBlock)
    }

    /// Runs activation again, typically after [`HostEvent::Recovered`].
    pub fn restart(&mut self) {
        self.tx.stop();
        self.tx.resume();
        self.rx.stop();
        self.rx.resume();
        self.notify.stop();
        self.notify.resume();
        self.requests.clear();
        self.link_down();
        self.mac_address = None;
        self.enumeration.restart();
    }

    pub fn next_event(&mut self) -> Option<HostEvent> {
        self.events.pop_front()
    }

    #[must_use]
    pub fn state(&self) -> EnumerationState {
        self.enumeration.state()
    }

    /// Only known once the MAC string descriptor was read.
    #[must_use]
    pub fn mac_address(&self) -> Option<[u8; 6]> {
        self.mac_address
    }

    #[must_use]
    pub fn link_state(&self) -> LinkState {
        self.link
    }

    #[must_use]
    pub fn connection_speed(&self) -> Option<Speed> {
        self.connection_speed
    }

    #[must_use]
    pub fn descriptors(&self) -> &EcmDescriptors {
        &self.descriptors
    }

    #[must_use]
    pub fn packet_filter(&self) -> PacketFilter {
        self.target.packet_filter
    }

    /// A [`smoltcp`] device over this adapter and its receive channel.
    pub fn net_device<'h, 'c, const LEN: usize>(
        &'h mut self,
        frames: &'h FrameChannel<'c, LEN>,
    ) -> NetDevice<'h, 'c, LEN> {
        NetDevice { host: self, frames }
    }
}

fn open_pipes<B: HostBus>(bus: &mut B, descriptors: &EcmDescriptors) -> Result<Pipes> {
    fn open<B: HostBus>(bus: &mut B, ep: &EndpointInfo, opened: &[PipeId]) -> Result<PipeId> {
        bus.open_pipe(ep).map_err(|err| {
            #[cfg(feature = "defmt")]
            defmt::error!("ecm-host: cannot open pipe for {}", ep.address);
            for &pipe in opened {
                bus.close_pipe(pipe);
            }
            err
        })
    }

    let notification = open(bus, &descriptors.notification, &[])?;
    let data_out = open(bus, &descriptors.data_out, &[notification])?;
    let data_in = open(bus, &descriptors.data_in, &[notification, data_out])?;
    Ok(Pipes {
        notification,
        data_in,
        data_out,
    })
}

pub struct NetDevice<'h, 'c, const LEN: usize> {
    host: &'h mut EcmHost,
    frames: &'h FrameChannel<'c, LEN>,
}

impl<'h, 'c, const LEN: usize> Device for NetDevice<'h, 'c, LEN> {
    type RxToken<'b> = EcmRxToken<'b, 'c, LEN> where
    Self: 'b;
    type TxToken<'b> = EcmTxToken<'b> where
    Self: 'b;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        if self.host.link == LinkState::Up && self.host.can_transmit() && self.frames.has_frame()
        {
            Some((
                EcmRxToken { frames: self.frames },
                EcmTxToken {
                    host: &mut *self.host,
                },
            ))
        } else {
            None
        }
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        if self.host.link == LinkState::Up && self.host.can_transmit() {
            Some(EcmTxToken {
                host: &mut *self.host,
            })
        } else {
            None
        }
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.max_transmission_unit = MAX_SEGMENT_SIZE.into();
        caps.max_burst_size = Some(1);
        caps.medium = Medium::Ethernet;
        caps
    }
}

pub struct EcmRxToken<'b, 'c, const LEN: usize> {
    frames: &'b FrameChannel<'c, LEN>,
}

impl<'b, 'c, const LEN: usize> phy::RxToken for EcmRxToken<'b, 'c, LEN> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        let mut buf = [0; MAX_SEGMENT_SIZE_USIZE];
        let len = self.frames.pop_frame(&mut buf).unwrap_or(0);
        f(&buf[..len])
    }
}

pub struct EcmTxToken<'b> {
    host: &'b mut EcmHost,
}

impl<'b> phy::TxToken for EcmTxToken<'b> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = [0; MAX_SEGMENT_SIZE_USIZE];
        let len = len.min(buf.len());
        let result = f(&mut buf[..len]);
        if self.host.transmit(&buf[..len]).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("ecm-host: dropped outgoing frame of {} bytes", len);
        }
        result
    }
}
