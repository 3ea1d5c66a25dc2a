//! Standard and CDC-ECM class control requests issued by the host driver, plus
//! the MAC address string codec.

use heapless::String;
use usb_device::{Result, UsbError};

use crate::bytes::{Buf, BufMut};

const REQ_TYPE_HOST_TO_DEVICE_STANDARD_INTERFACE: u8 = 0x01;
const REQ_TYPE_HOST_TO_DEVICE_STANDARD_ENDPOINT: u8 = 0x02;
const REQ_TYPE_DEVICE_TO_HOST_STANDARD_DEVICE: u8 = 0x80;
const REQ_TYPE_HOST_TO_DEVICE_CLASS_INTERFACE: u8 = 0x21;
const REQ_TYPE_DEVICE_TO_HOST_CLASS_INTERFACE: u8 = 0xA1;

const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_GET_DESCRIPTOR: u8 = 0x06;
const REQ_SET_INTERFACE: u8 = 0x0B;

pub(crate) const REQ_SEND_ENCAPSULATED_COMMAND: u8 = 0x00;
pub(crate) const REQ_GET_ENCAPSULATED_RESPONSE: u8 = 0x01;
pub(crate) const REQ_SET_ETHERNET_MULTICAST_FILTERS: u8 = 0x40;
pub(crate) const REQ_SET_ETHERNET_PACKET_FILTER: u8 = 0x43;
pub(crate) const REQ_GET_ETHERNET_STATISTIC: u8 = 0x44;

const FEATURE_ENDPOINT_HALT: u16 = 0x00;
const DESCRIPTOR_TYPE_STRING: u8 = 0x03;

/// Language id used for string descriptor requests unless configured otherwise.
pub const LANG_ID_EN_US: u16 = 0x0409;

/// An 8-byte SETUP packet.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut data = [0; 8];
        let mut writer = &mut data[..];
        writer.put_u8(self.request_type);
        writer.put_u8(self.request);
        writer.put_u16_le(self.value);
        writer.put_u16_le(self.index);
        writer.put_u16_le(self.length);
        data
    }

    /// True for requests that move data from the device to the host.
    #[must_use]
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }

    #[must_use]
    pub fn set_interface(interface: u8, alt_setting: u8) -> Self {
        Self {
            request_type: REQ_TYPE_HOST_TO_DEVICE_STANDARD_INTERFACE,
            request: REQ_SET_INTERFACE,
            value: alt_setting.into(),
            index: interface.into(),
            length: 0,
        }
    }

    #[must_use]
    pub fn clear_endpoint_halt(endpoint: u8) -> Self {
        Self {
            request_type: REQ_TYPE_HOST_TO_DEVICE_STANDARD_ENDPOINT,
            request: REQ_CLEAR_FEATURE,
            value: FEATURE_ENDPOINT_HALT,
            index: endpoint.into(),
            length: 0,
        }
    }

    #[must_use]
    pub fn get_string_descriptor(index: u8, lang_id: u16, length: u16) -> Self {
        Self {
            request_type: REQ_TYPE_DEVICE_TO_HOST_STANDARD_DEVICE,
            request: REQ_GET_DESCRIPTOR,
            value: (u16::from(DESCRIPTOR_TYPE_STRING) << 8) | u16::from(index),
            index: lang_id,
            length,
        }
    }

    #[must_use]
    pub fn set_ethernet_packet_filter(interface: u8, filter: PacketFilter) -> Self {
        Self {
            request_type: REQ_TYPE_HOST_TO_DEVICE_CLASS_INTERFACE,
            request: REQ_SET_ETHERNET_PACKET_FILTER,
            value: filter.bits(),
            index: interface.into(),
            length: 0,
        }
    }

    /// The data stage is `count` consecutive 6-byte multicast addresses.
    #[must_use]
    pub fn set_ethernet_multicast_filters(interface: u8, count: u16) -> Self {
        Self {
            request_type: REQ_TYPE_HOST_TO_DEVICE_CLASS_INTERFACE,
            request: REQ_SET_ETHERNET_MULTICAST_FILTERS,
            value: count,
            index: interface.into(),
            length: count.saturating_mul(6),
        }
    }

    #[must_use]
    pub fn get_ethernet_statistic(interface: u8, statistic: EthernetStatistic) -> Self {
        Self {
            request_type: REQ_TYPE_DEVICE_TO_HOST_CLASS_INTERFACE,
            request: REQ_GET_ETHERNET_STATISTIC,
            value: statistic.selector(),
            index: interface.into(),
            length: 4,
        }
    }

    #[must_use]
    pub fn send_encapsulated_command(interface: u8, length: u16) -> Self {
        Self {
            request_type: REQ_TYPE_HOST_TO_DEVICE_CLASS_INTERFACE,
            request: REQ_SEND_ENCAPSULATED_COMMAND,
            value: 0,
            index: interface.into(),
            length,
        }
    }

    #[must_use]
    pub fn get_encapsulated_response(interface: u8, length: u16) -> Self {
        Self {
            request_type: REQ_TYPE_DEVICE_TO_HOST_CLASS_INTERFACE,
            request: REQ_GET_ENCAPSULATED_RESPONSE,
            value: 0,
            index: interface.into(),
            length,
        }
    }
}

/// `SET_ETHERNET_PACKET_FILTER` bitmap.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PacketFilter(u16);

impl PacketFilter {
    pub const PROMISCUOUS: Self = Self(1 << 0);
    pub const ALL_MULTICAST: Self = Self(1 << 1);
    pub const DIRECTED: Self = Self(1 << 2);
    pub const BROADCAST: Self = Self(1 << 3);
    pub const MULTICAST: Self = Self(1 << 4);

    const MASK: u16 = 0x1F;

    /// Unknown bits are cleared.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits & Self::MASK)
    }

    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for PacketFilter {
    fn default() -> Self {
        Self::DIRECTED | Self::BROADCAST | Self::MULTICAST | Self::ALL_MULTICAST
    }
}

impl core::ops::BitOr for PacketFilter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Ethernet statistics counters (ECM 1.2, table 9) supported by this crate.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum EthernetStatistic {
    TransmitOk,
    ReceiveOk,
    TransmitError,
    ReceiveError,
    ReceiveNoBuffer,
}

impl EthernetStatistic {
    pub const ALL: [Self; 5] = [
        Self::TransmitOk,
        Self::ReceiveOk,
        Self::TransmitError,
        Self::ReceiveError,
        Self::ReceiveNoBuffer,
    ];

    /// Feature selector used as `wValue`.
    #[must_use]
    pub const fn selector(self) -> u16 {
        match self {
            Self::TransmitOk => 1,
            Self::ReceiveOk => 2,
            Self::TransmitError => 3,
            Self::ReceiveError => 4,
            Self::ReceiveNoBuffer => 5,
        }
    }

    #[must_use]
    pub fn from_selector(selector: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.selector() == selector)
    }

    /// Bit in the functional descriptor's `bmEthernetStatistics`.
    #[must_use]
    pub const fn bitmap_bit(self) -> u32 {
        1 << (self.selector() - 1)
    }
}

/// Decodes a MAC address from its 12 hex digit string form.
pub fn parse_mac_string(digits: &[u8]) -> Result<[u8; 6]> {
    fn nibble(c: u8) -> Result<u8> {
        match c {
            b'0'..=b'9' => Ok(c - b'0'),
            b'A'..=b'F' => Ok(c - b'A' + 0xA),
            b'a'..=b'f' => Ok(c - b'a' + 0xA),
            _ => Err(UsbError::ParseError),
        }
    }

    if digits.len() != 12 {
        return Err(UsbError::ParseError);
    }
    let mut mac = [0; 6];
    for (byte, pair) in mac.iter_mut().zip(digits.chunks_exact(2)) {
        *byte = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Ok(mac)
}

/// Decodes the MAC address out of a raw string descriptor (UTF-16LE).
pub fn parse_mac_descriptor(mut descriptor: &[u8]) -> Result<[u8; 6]> {
    let length = descriptor.get_u8().ok_or(UsbError::ParseError)?;
    let kind = descriptor.get_u8().ok_or(UsbError::ParseError)?;
    if kind != DESCRIPTOR_TYPE_STRING || usize::from(length) < 2 + 24 {
        return Err(UsbError::ParseError);
    }

    let mut digits = [0; 12];
    for digit in &mut digits {
        let unit = descriptor.get_u16_le().ok_or(UsbError::ParseError)?;
        *digit = u8::try_from(unit).map_err(|_| UsbError::ParseError)?;
    }
    parse_mac_string(&digits)
}

/// Formats a MAC address as the 12 upper case hex digits used in the
/// `iMACAddress` string descriptor.
#[must_use]
pub fn mac_to_string(mac_address: [u8; 6]) -> String<12> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";

    let mut s = String::new();
    for byte in mac_address {
        for n in [byte >> 4, byte & 0xF] {
            // 12 digits always fit
            let _ = s.push(char::from(HEX[usize::from(n)]));
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_string_decodes_pairwise() {
        assert_eq!(
            parse_mac_string(b"0A1B2C3D4E5F"),
            Ok([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F])
        );
        assert_eq!(
            parse_mac_string(b"0a1b2c3d4e5f"),
            Ok([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F])
        );
    }

    #[test]
    fn bad_mac_strings() {
        assert_eq!(parse_mac_string(b"0A1B2C3D4E5"), Err(UsbError::ParseError));
        assert_eq!(parse_mac_string(b"0A1B2C3D4E5G"), Err(UsbError::ParseError));
    }

    #[test]
    fn mac_string_formatting() {
        let mac = [0x02, 0xAB, 0x00, 0x10, 0xFE, 0x7C];
        assert_eq!(mac_to_string(mac).as_str(), "02AB0010FE7C");
        assert_eq!(parse_mac_string(mac_to_string(mac).as_bytes()), Ok(mac));
    }

    #[test]
    fn mac_from_utf16_descriptor() {
        let mut descriptor = [0u8; 26];
        descriptor[0] = 26;
        descriptor[1] = 3;
        for (i, c) in b"0A1B2C3D4E5F".iter().enumerate() {
            descriptor[2 + i * 2] = *c;
        }
        assert_eq!(
            parse_mac_descriptor(&descriptor),
            Ok([0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F])
        );

        descriptor[1] = 2;
        assert_eq!(parse_mac_descriptor(&descriptor), Err(UsbError::ParseError));
        descriptor[1] = 3;
        assert_eq!(
            parse_mac_descriptor(&descriptor[..20]),
            Err(UsbError::ParseError)
        );
    }

    #[test]
    fn setup_packet_layouts() {
        assert_eq!(
            SetupPacket::set_interface(1, 1).to_bytes(),
            [0x01, 0x0B, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::set_ethernet_packet_filter(0, PacketFilter::default()).to_bytes(),
            [0x21, 0x43, 0x1E, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::get_string_descriptor(4, LANG_ID_EN_US, 255).to_bytes(),
            [0x80, 0x06, 0x04, 0x03, 0x09, 0x04, 0xFF, 0x00]
        );
        assert_eq!(
            SetupPacket::clear_endpoint_halt(0x81).to_bytes(),
            [0x02, 0x01, 0x00, 0x00, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            SetupPacket::get_ethernet_statistic(0, EthernetStatistic::ReceiveError).to_bytes(),
            [0xA1, 0x44, 0x04, 0x00, 0x00, 0x00, 0x04, 0x00]
        );
        assert_eq!(
            SetupPacket::set_ethernet_multicast_filters(0, 2).to_bytes(),
            [0x21, 0x40, 0x02, 0x00, 0x00, 0x00, 0x0C, 0x00]
        );
        assert!(SetupPacket::get_encapsulated_response(0, 64).is_in());
        assert!(!SetupPacket::send_encapsulated_command(0, 64).is_in());
    }

    #[test]
    fn statistic_selectors() {
        assert_eq!(
            EthernetStatistic::from_selector(5),
            Some(EthernetStatistic::ReceiveNoBuffer)
        );
        assert_eq!(EthernetStatistic::from_selector(6), None);
        assert_eq!(EthernetStatistic::TransmitOk.bitmap_bit(), 0b1);
        assert_eq!(EthernetStatistic::ReceiveNoBuffer.bitmap_bit(), 0b1_0000);
    }

    #[test]
    fn packet_filter_bits() {
        let filter = PacketFilter::default();
        assert_eq!(filter.bits(), 0x1E);
        assert!(filter.contains(PacketFilter::DIRECTED));
        assert!(!filter.contains(PacketFilter::PROMISCUOUS));
        assert_eq!(PacketFilter::from_bits(0xFF).bits(), 0x1F);
    }
}
