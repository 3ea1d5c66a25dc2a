//! Communication Device Class Ethernet Control Model (CDC-ECM): a host side
//! class driver, a [usb-device](https://crates.io/crates/usb-device) class for
//! the device side, and a relay that tunnels frames between the two.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::pedantic)]
#![warn(clippy::style)]
#![warn(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![warn(clippy::use_self)]

/*
 * References:
 *   - Universal Serial Bus Class Definitions for Communications Devices - Revision
 *     1.2 (Errata 1) - November 3, 2010
 *   - Universal Serial Bus Communications Class Subclass Specification for Ethernet
 *     Control Model Devices - Revision 1.2 - February 9, 2007
 */

mod buffer;
mod bytes;
mod datapath;
mod queue;

pub mod bus;
pub mod descriptor;
pub mod device;
pub mod enumeration;
pub mod host;
pub mod notification;
pub mod reassembler;
pub mod relay;
pub mod request;

pub use bus::{HostBus, PipeId, RequestStatus, TransferStatus};
pub use datapath::{InKind, InPump, PumpResult, TransferState, TxPump};
pub use descriptor::{EcmDescriptors, EndpointInfo, EthernetFunctional};
pub use device::{DeviceState, DeviceStatistics, EcmDevice};
pub use enumeration::{Activation, ActivationTarget, Enumeration, EnumerationState, FailedStep};
pub use host::{EcmHost, EcmHostConfig, HostEvent, NetDevice};
pub use notification::{LinkState, Notification, Speed};
pub use queue::FRAME_QUEUE_DEPTH;
pub use reassembler::{is_frame_boundary, ChunkOutcome, FrameChannel, FrameReassembler};
pub use relay::{Downstream, FramePort, FrameRelay, RelayStats, Upstream};
pub use request::{
    mac_to_string, parse_mac_descriptor, parse_mac_string, EthernetStatistic, PacketFilter,
    SetupPacket,
};

/// This should be used as `device_class` when building the `UsbDevice`.
pub const USB_CLASS_CDC: u8 = 0x02;

/// Largest Ethernet frame carried, without FCS.
pub const MAX_SEGMENT_SIZE: u16 = 1514;
pub const MAX_SEGMENT_SIZE_USIZE: usize = MAX_SEGMENT_SIZE as usize;

/// Longest notification understood on the interrupt endpoint.
pub const NOTIFICATION_BUFFER_SIZE: usize = 16;

/// Largest supported endpoint max packet size (high speed bulk).
pub const MAX_BULK_PACKET: usize = 512;
