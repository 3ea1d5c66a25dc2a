use usb_device::{Result, UsbError};

use crate::bytes::{Buf, BufMut};

pub(crate) const REQ_TYPE_DEVICE_TO_HOST: u8 = 0xA1;

const NOTE_TYPE_NETWORK_CONNECTION: u8 = 0x00;
const NOTE_TYPE_RESPONSE_AVAILABLE: u8 = 0x01;
const NOTE_TYPE_CONNECTION_SPEED_CHANGE: u8 = 0x2A;

/// Length of a `NETWORK_CONNECTION` notification.
pub const NETWORK_CONNECTION_LEN: usize = 8;
/// Length of a `CONNECTION_SPEED_CHANGE` notification including its payload.
pub const CONNECTION_SPEED_CHANGE_LEN: usize = 16;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Speed {
    pub upload_bit_rate: u32,
    pub download_bit_rate: u32,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum LinkState {
    #[default]
    Down,
    Up,
}

impl From<bool> for LinkState {
    fn from(connected: bool) -> Self {
        if connected {
            Self::Up
        } else {
            Self::Down
        }
    }
}

/// A class notification received on the interrupt endpoint.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Notification {
    NetworkConnection { link: LinkState, interface: u16 },
    ResponseAvailable { interface: u16 },
    ConnectionSpeedChange { speed: Speed, interface: u16 },
    /// A well-formed notification this driver does not act on.
    Unknown { code: u8 },
}

impl Notification {
    /// Decodes one notification.
    ///
    /// Returns `Ok(None)` when the packet does not carry the class notification
    /// request type. Such packets are ignored, not errors.
    pub fn parse(mut data: &[u8]) -> Result<Option<Self>> {
        let Some(request_type) = data.get_u8() else {
            return Ok(None);
        };
        if request_type != REQ_TYPE_DEVICE_TO_HOST {
            return Ok(None);
        }

        let code = data.get_u8().ok_or(UsbError::ParseError)?;
        let value = data.get_u16_le().ok_or(UsbError::ParseError)?;
        let interface = data.get_u16_le().ok_or(UsbError::ParseError)?;
        let length = data.get_u16_le().ok_or(UsbError::ParseError)?;

        let note = match code {
            NOTE_TYPE_NETWORK_CONNECTION => Self::NetworkConnection {
                link: LinkState::from(value != 0),
                interface,
            },
            NOTE_TYPE_RESPONSE_AVAILABLE => Self::ResponseAvailable { interface },
            NOTE_TYPE_CONNECTION_SPEED_CHANGE => {
                if length < 8 {
                    return Err(UsbError::ParseError);
                }
                let download_bit_rate = data.get_u32_le().ok_or(UsbError::ParseError)?;
                let upload_bit_rate = data.get_u32_le().ok_or(UsbError::ParseError)?;
                Self::ConnectionSpeedChange {
                    speed: Speed {
                        upload_bit_rate,
                        download_bit_rate,
                    },
                    interface,
                }
            }
            code => Self::Unknown { code },
        };
        Ok(Some(note))
    }
}

pub(crate) fn network_connection(connected: bool, interface: u8) -> [u8; NETWORK_CONNECTION_LEN] {
    let mut data = [0x00; NETWORK_CONNECTION_LEN];
    let mut writer = &mut data[..];
    writer.put_u8(REQ_TYPE_DEVICE_TO_HOST); // bmRequestType
    writer.put_u8(NOTE_TYPE_NETWORK_CONNECTION); // bNotificationType
    writer.put_u16_le(connected.into()); // wValue
    writer.put_u16_le(interface.into()); // wIndex
    writer.put_u16_le(0x00); // wLength
    data
}

pub(crate) fn connection_speed_change(
    speed: Speed,
    interface: u8,
) -> [u8; CONNECTION_SPEED_CHANGE_LEN] {
    let mut data = [0x00; CONNECTION_SPEED_CHANGE_LEN];
    let mut writer = &mut data[..];
    writer.put_u8(REQ_TYPE_DEVICE_TO_HOST);
    writer.put_u8(NOTE_TYPE_CONNECTION_SPEED_CHANGE);
    writer.put_u16_le(0);
    writer.put_u16_le(interface.into());
    writer.put_u16_le(0x08);
    writer.put_u32_le(speed.download_bit_rate);
    writer.put_u32_le(speed.upload_bit_rate);
    data
}
