//! Tunnel between a host role adapter (upstream, facing the USB Ethernet
//! dongle) and a device role adapter (downstream, facing a USB host).
//!
//! Each side reassembles what it receives into its own [`FrameChannel`]. Every
//! [`FrameRelay::tick`] forwards at most one frame per direction.

use usb_device::class_prelude::UsbBus;
use usb_device::Result;

use crate::device::{DeviceState, EcmDevice};
use crate::host::EcmHost;
use crate::notification::LinkState;
use crate::reassembler::FrameChannel;
use crate::MAX_SEGMENT_SIZE_USIZE;

/// One end of the relay.
pub trait FramePort {
    /// Whether frames can currently reach the other side of this port.
    fn is_up(&self) -> bool;

    /// Whether [`send_frame`](Self::send_frame) would accept a frame now.
    fn can_send(&self) -> bool;

    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;
}

pub trait Upstream: FramePort {
    /// MAC address of the linked function, `None` while the link is down.
    fn linked_mac(&self) -> Option<[u8; 6]>;
}

pub trait Downstream: FramePort {
    /// Starts advertising `mac_address` to the USB host.
    fn start(&mut self, mac_address: [u8; 6]);

    fn stop(&mut self);
}

impl FramePort for EcmHost {
    fn is_up(&self) -> bool {
        self.state().is_active() && self.link_state() == LinkState::Up
    }

    fn can_send(&self) -> bool {
        self.can_transmit()
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.transmit(frame)
    }
}

impl Upstream for EcmHost {
    fn linked_mac(&self) -> Option<[u8; 6]> {
        if self.is_up() {
            self.mac_address()
        } else {
            None
        }
    }
}

impl<B: UsbBus, const LEN: usize> FramePort for EcmDevice<'_, '_, B, LEN> {
    fn is_up(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    fn can_send(&self) -> bool {
        EcmDevice::can_send(self)
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        EcmDevice::send_frame(self, frame)
    }
}

impl<B: UsbBus, const LEN: usize> Downstream for EcmDevice<'_, '_, B, LEN> {
    fn start(&mut self, mac_address: [u8; 6]) {
        EcmDevice::start(self, mac_address);
    }

    fn stop(&mut self) {
        EcmDevice::stop(self);
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct RelayStats {
    /// Frames forwarded from upstream to downstream.
    pub downstream: u32,
    /// Frames forwarded from downstream to upstream.
    pub upstream: u32,
    pub dropped: u32,
}

#[derive(PartialEq, Eq)]
enum Forward {
    Idle,
    Sent,
    Dropped,
}

#[derive(Default)]
pub struct FrameRelay {
    started_with: Option<[u8; 6]>,
    stats: RelayStats,
}

impl FrameRelay {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started_with: None,
            stats: RelayStats {
                downstream: 0,
                upstream: 0,
                dropped: 0,
            },
        }
    }

    /// `from_upstream` holds frames received by `up`, `from_downstream` those
    /// received by `down`.
    pub fn tick<U, D, const UL: usize, const DL: usize>(
        &mut self,
        up: &mut U,
        down: &mut D,
        from_upstream: &FrameChannel<'_, UL>,
        from_downstream: &FrameChannel<'_, DL>,
    ) where
        U: Upstream,
        D: Downstream,
    {
        match (up.linked_mac(), self.started_with) {
            (Some(mac), None) => self.start(down, mac),
            (Some(mac), Some(current)) if mac != current => {
                down.stop();
                self.start(down, mac);
            }
            (None, Some(_)) => {
                #[cfg(feature = "defmt")]
                defmt::info!("relay: upstream link lost, stopping downstream");
                down.stop();
                self.started_with = None;
            }
            _ => {}
        }

        let mut buf = [0; MAX_SEGMENT_SIZE_USIZE];
        match forward(from_upstream, down, &mut buf) {
            Forward::Sent => self.stats.downstream = self.stats.downstream.wrapping_add(1),
            Forward::Dropped => self.stats.dropped = self.stats.dropped.wrapping_add(1),
            Forward::Idle => {}
        }
        match forward(from_downstream, up, &mut buf) {
            Forward::Sent => self.stats.upstream = self.stats.upstream.wrapping_add(1),
            Forward::Dropped => self.stats.dropped = self.stats.dropped.wrapping_add(1),
            Forward::Idle => {}
        }
    }

    fn start<D: Downstream>(&mut self, down: &mut D, mac: [u8; 6]) {
        #[cfg(feature = "defmt")]
        defmt::info!("relay: upstream linked, starting downstream as {:02X}", mac);
        down.start(mac);
        self.started_with = Some(mac);
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started_with.is_some()
    }

    #[must_use]
    pub fn stats(&self) -> RelayStats {
        self.stats
    }
}

/// Moves the oldest frame of `frames` to `port`. A busy port leaves the frame
/// queued. A port that is down drops it.
fn forward<P: FramePort, const LEN: usize>(
    frames: &FrameChannel<'_, LEN>,
    port: &mut P,
    buf: &mut [u8],
) -> Forward {
    if !frames.has_frame() {
        return Forward::Idle;
    }
    let up = port.is_up();
    if up && !port.can_send() {
        return Forward::Idle;
    }

    let Ok(len) = frames.pop_frame(buf) else {
        return Forward::Dropped;
    };
    if !up {
        return Forward::Dropped;
    }
    match port.send_frame(&buf[..len]) {
        Ok(()) => Forward::Sent,
        Err(_err) => {
            #[cfg(feature = "defmt")]
            defmt::warn!("relay: dropping {} byte frame: {}", len, _err);
            Forward::Dropped
        }
    }
}
