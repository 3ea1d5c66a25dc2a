//! Activation sequence that takes a freshly attached CDC-ECM function to the
//! point where data can flow.
//!
//! Each state issues one control request and polls it on every tick until the
//! bus reports something other than busy. A hard failure moves to
//! [`EnumerationState::Error`], which clears an endpoint halt and parks the
//! machine in [`EnumerationState::Idle`]. Recovery does not re-run the sequence
//! by itself. The owner decides with [`Enumeration::restart`].

use crate::bus::{HostBus, RequestStatus};
use crate::request::{parse_mac_descriptor, PacketFilter, SetupPacket};

const STRING_DESCRIPTOR_MAX_LEN: u16 = 255;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
#[repr(u8)]
pub enum EnumerationState {
    #[default]
    Idle = 0,
    SetAltInterface = 1,
    SetPacketFilter = 2,
    GetStringDescriptor = 3,
    /// Notifications are polled and both data directions are pumped.
    SteadyState = 4,
    /// Like `SteadyState` without the notification endpoint.
    TransferData = 5,
    Error = 6,
}

impl EnumerationState {
    #[allow(non_upper_case_globals)]
    pub const ListenNotifications: Self = Self::SteadyState;

    /// Maps a raw state value, anything unknown is treated as corruption.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::SetAltInterface,
            2 => Self::SetPacketFilter,
            3 => Self::GetStringDescriptor,
            4 => Self::SteadyState,
            5 => Self::TransferData,
            _ => Self::Error,
        }
    }

    /// True once data may flow.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::SteadyState | Self::TransferData)
    }
}

/// The step that took the machine into `Error`.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FailedStep {
    SetAltInterface,
    SetPacketFilter,
    GetStringDescriptor,
    /// A data path transfer failed on this endpoint address.
    DataPath { endpoint: u8 },
}

impl FailedStep {
    fn halted_endpoint(self) -> u8 {
        match self {
            Self::DataPath { endpoint } => endpoint,
            _ => 0,
        }
    }
}

/// Parameters of the activation requests.
#[derive(Debug, Clone, Copy)]
pub struct ActivationTarget {
    pub data_interface: u8,
    pub data_alt_setting: u8,
    pub comm_interface: u8,
    pub packet_filter: PacketFilter,
    pub mac_string_index: u8,
    pub language_id: u16,
    pub listen_notifications: bool,
}

/// What a call to [`Enumeration::poll`] achieved.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Activation {
    /// Steady state reached with this MAC address.
    Activated([u8; 6]),
    Failed(FailedStep),
    /// The halt was cleared and the machine is idle.
    Recovered,
}

#[derive(Debug, Default)]
pub struct Enumeration {
    state: EnumerationState,
    last_failure: Option<FailedStep>,
}

impl Enumeration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> EnumerationState {
        self.state
    }

    #[must_use]
    pub fn last_failure(&self) -> Option<FailedStep> {
        self.last_failure
    }

    /// Kicks an idle machine into the activation sequence.
    pub fn start(&mut self) {
        if self.state == EnumerationState::Idle {
            self.transition(EnumerationState::SetAltInterface);
        }
    }

    /// Runs the whole sequence again from the top.
    pub fn restart(&mut self) {
        self.last_failure = None;
        self.transition(EnumerationState::SetAltInterface);
    }

    /// Forces the machine into `Error` because of `step`.
    pub fn fail(&mut self, step: FailedStep) {
        #[cfg(feature = "defmt")]
        defmt::warn!("ecm-host: {} failed in {}", step, self.state);
        self.last_failure = Some(step);
        self.transition(EnumerationState::Error);
    }

    /// Overwrites the state with a raw value.
    pub fn restore(&mut self, raw: u8) {
        self.state = EnumerationState::from_raw(raw);
    }

    /// Parks the machine without touching the bus.
    pub fn halt(&mut self) {
        self.transition(EnumerationState::Idle);
    }

    pub fn poll<B: HostBus>(&mut self, bus: &mut B, target: &ActivationTarget) -> Option<Activation> {
        match self.state {
            EnumerationState::Idle
            | EnumerationState::SteadyState
            | EnumerationState::TransferData => None,
            EnumerationState::SetAltInterface => {
                let setup =
                    SetupPacket::set_interface(target.data_interface, target.data_alt_setting);
                self.step(bus.control_request(&setup, &mut []), FailedStep::SetAltInterface, |_| {
                    Ok(EnumerationState::SetPacketFilter)
                })
            }
            EnumerationState::SetPacketFilter => {
                let setup = SetupPacket::set_ethernet_packet_filter(
                    target.comm_interface,
                    target.packet_filter,
                );
                self.step(bus.control_request(&setup, &mut []), FailedStep::SetPacketFilter, |_| {
                    Ok(EnumerationState::GetStringDescriptor)
                })
            }
            EnumerationState::GetStringDescriptor => {
                let setup = SetupPacket::get_string_descriptor(
                    target.mac_string_index,
                    target.language_id,
                    STRING_DESCRIPTOR_MAX_LEN,
                );
                let mut buf = [0; STRING_DESCRIPTOR_MAX_LEN as usize];
                let status = bus.control_request(&setup, &mut buf);
                let mut mac = None;
                let activation = self.step(status, FailedStep::GetStringDescriptor, |len| {
                    let parsed = parse_mac_descriptor(&buf[..len.min(buf.len())])?;
                    mac = Some(parsed);
                    Ok(if target.listen_notifications {
                        EnumerationState::SteadyState
                    } else {
                        EnumerationState::TransferData
                    })
                });
                match (activation, mac) {
                    (None, Some(mac)) => Some(Activation::Activated(mac)),
                    (activation, _) => activation,
                }
            }
            EnumerationState::Error => {
                let endpoint = self.last_failure.map_or(0, FailedStep::halted_endpoint);
                let setup = SetupPacket::clear_endpoint_halt(endpoint);
                match bus.control_request(&setup, &mut []) {
                    RequestStatus::Ok(_) => {
                        self.transition(EnumerationState::Idle);
                        Some(Activation::Recovered)
                    }
                    _ => None,
                }
            }
        }
    }

    /// Applies a request outcome: stay on busy, fail on error, otherwise move to
    /// the state returned by `next`.
    fn step(
        &mut self,
        status: RequestStatus,
        failed: FailedStep,
        next: impl FnOnce(usize) -> usb_device::Result<EnumerationState>,
    ) -> Option<Activation> {
        match status {
            RequestStatus::Busy => None,
            RequestStatus::Ok(len) => match next(len) {
                Ok(state) => {
                    self.transition(state);
                    None
                }
                Err(_) => {
                    self.fail(failed);
                    Some(Activation::Failed(failed))
                }
            },
            RequestStatus::NotSupported | RequestStatus::Error => {
                self.fail(failed);
                Some(Activation::Failed(failed))
            }
        }
    }

    fn transition(&mut self, state: EnumerationState) {
        if self.state != state {
            #[cfg(feature = "defmt")]
            defmt::debug!("ecm-host: {} -> {}", self.state, state);
            self.state = state;
        }
    }
}
