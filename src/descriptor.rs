//! Extraction of the CDC-ECM function from a raw configuration descriptor.

use usb_device::endpoint::{EndpointAddress, EndpointType};
use usb_device::{Result, UsbError};

use crate::bytes::Buf;

const DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
const DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
const CS_INTERFACE: u8 = 0x24;

const CDC_SUBCLASS_ECM: u8 = 0x06;
const CDC_TYPE_HEADER: u8 = 0x00;
const CDC_TYPE_UNION: u8 = 0x06;
const CDC_TYPE_ETHERNET: u8 = 0x0F;
const USB_CLASS_CDC_DATA: u8 = 0x0A;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EndpointInfo {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    pub max_packet_size: u16,
    /// Polling interval in frames, only meaningful for interrupt endpoints.
    pub interval: u8,
}

/// Fields of the Ethernet Networking functional descriptor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EthernetFunctional {
    pub mac_string_index: u8,
    pub statistics: u32,
    pub max_segment_size: u16,
    pub multicast_filters: u16,
    pub power_filters: u8,
}

impl EthernetFunctional {
    /// Whether the function can filter multicast addresses exactly.
    #[must_use]
    pub fn perfect_multicast_filtering(&self) -> bool {
        self.multicast_filters & 0x8000 == 0
    }

    #[must_use]
    pub fn multicast_filter_count(&self) -> u16 {
        self.multicast_filters & 0x7FFF
    }
}

/// Everything the host driver needs from the configuration descriptor.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct EcmDescriptors {
    pub comm_interface: u8,
    pub notification: EndpointInfo,
    pub cdc_version: u16,
    pub ethernet: EthernetFunctional,
    pub data_interface: u8,
    pub data_alt_setting: u8,
    pub data_in: EndpointInfo,
    pub data_out: EndpointInfo,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Other,
    Comm,
    Data { interface: u8, alt: u8 },
}

#[derive(Default)]
struct DataCandidate {
    interface: u8,
    alt: u8,
    data_in: Option<EndpointInfo>,
    data_out: Option<EndpointInfo>,
}

impl EcmDescriptors {
    /// Walks every descriptor in `config` and collects the first CDC-ECM function.
    pub fn parse(config: &[u8]) -> Result<Self> {
        let mut rest = config;
        let mut section = Section::Other;

        let mut comm_interface = None;
        let mut notification = None;
        let mut cdc_version = None;
        let mut union_slave = None;
        let mut ethernet = None;
        let mut data = DataCandidate::default();
        let mut data_found = false;

        while rest.has_remaining() {
            let length = usize::from(rest.take(1).ok_or(UsbError::ParseError)?[0]);
            if length < 2 {
                return Err(UsbError::ParseError);
            }
            let mut desc = rest.take(length - 1).ok_or(UsbError::ParseError)?;
            let kind = desc.get_u8().ok_or(UsbError::ParseError)?;

            match kind {
                DESCRIPTOR_TYPE_INTERFACE => {
                    let number = desc.get_u8().ok_or(UsbError::ParseError)?;
                    let alt = desc.get_u8().ok_or(UsbError::ParseError)?;
                    let _num_endpoints = desc.get_u8().ok_or(UsbError::ParseError)?;
                    let class = desc.get_u8().ok_or(UsbError::ParseError)?;
                    let subclass = desc.get_u8().ok_or(UsbError::ParseError)?;

                    section = if class == crate::USB_CLASS_CDC
                        && subclass == CDC_SUBCLASS_ECM
                        && comm_interface.is_none()
                    {
                        comm_interface = Some(number);
                        Section::Comm
                    } else if class == USB_CLASS_CDC_DATA
                        && comm_interface.is_some()
                        && !data_found
                        && union_slave.map_or(true, |slave| slave == number)
                    {
                        data = DataCandidate {
                            interface: number,
                            alt,
                            ..DataCandidate::default()
                        };
                        Section::Data { interface: number, alt }
                    } else {
                        Section::Other
                    };
                }
                CS_INTERFACE if section == Section::Comm => {
                    let subtype = desc.get_u8().ok_or(UsbError::ParseError)?;
                    match subtype {
                        CDC_TYPE_HEADER => {
                            cdc_version = Some(desc.get_u16_le().ok_or(UsbError::ParseError)?);
                        }
                        CDC_TYPE_UNION => {
                            let _master = desc.get_u8().ok_or(UsbError::ParseError)?;
                            union_slave = Some(desc.get_u8().ok_or(UsbError::ParseError)?);
                        }
                        CDC_TYPE_ETHERNET => {
                            ethernet = Some(EthernetFunctional {
                                mac_string_index: desc.get_u8().ok_or(UsbError::ParseError)?,
                                statistics: desc.get_u32_le().ok_or(UsbError::ParseError)?,
                                max_segment_size: desc
                                    .get_u16_le()
                                    .ok_or(UsbError::ParseError)?,
                                multicast_filters: desc
                                    .get_u16_le()
                                    .ok_or(UsbError::ParseError)?,
                                power_filters: desc.get_u8().ok_or(UsbError::ParseError)?,
                            });
                        }
                        _ => {}
                    }
                }
                DESCRIPTOR_TYPE_ENDPOINT => {
                    let endpoint = parse_endpoint(desc)?;
                    match (section, endpoint) {
                        (Section::Comm, Some(ep))
                            if ep.kind == EndpointType::Interrupt
                                && ep.address.is_in()
                                && notification.is_none() =>
                        {
                            notification = Some(ep);
                        }
                        (Section::Data { interface, alt }, Some(ep))
                            if ep.kind == EndpointType::Bulk
                                && interface == data.interface
                                && alt == data.alt =>
                        {
                            if ep.address.is_in() {
                                data.data_in = Some(ep);
                            } else {
                                data.data_out = Some(ep);
                            }
                            data_found = data.data_in.is_some() && data.data_out.is_some();
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        let parsed = Self {
            comm_interface: comm_interface.ok_or(UsbError::ParseError)?,
            notification: notification.ok_or(UsbError::ParseError)?,
            cdc_version: cdc_version.ok_or(UsbError::ParseError)?,
            ethernet: ethernet.ok_or(UsbError::ParseError)?,
            data_interface: data.interface,
            data_alt_setting: data.alt,
            data_in: data.data_in.ok_or(UsbError::ParseError)?,
            data_out: data.data_out.ok_or(UsbError::ParseError)?,
        };

        #[cfg(feature = "defmt")]
        defmt::debug!(
            "ecm-host: comm if {} data if {} alt {} mac idx {}",
            parsed.comm_interface,
            parsed.data_interface,
            parsed.data_alt_setting,
            parsed.ethernet.mac_string_index
        );

        Ok(parsed)
    }
}

/// Parses an endpoint descriptor body. Isochronous and control endpoints are
/// reported as `None`.
fn parse_endpoint(mut desc: &[u8]) -> Result<Option<EndpointInfo>> {
    let address = desc.get_u8().ok_or(UsbError::ParseError)?;
    let attributes = desc.get_u8().ok_or(UsbError::ParseError)?;
    let max_packet_size = desc.get_u16_le().ok_or(UsbError::ParseError)? & 0x07FF;
    let interval = desc.get_u8().ok_or(UsbError::ParseError)?;

    let kind = match attributes & 0x03 {
        0x02 => EndpointType::Bulk,
        0x03 => EndpointType::Interrupt,
        _ => return Ok(None),
    };

    Ok(Some(EndpointInfo {
        address: EndpointAddress::from(address),
        kind,
        max_packet_size,
        interval,
    }))
}
