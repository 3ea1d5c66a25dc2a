#![allow(dead_code)]

use std::collections::VecDeque;

use cdc_ecm::{
    EcmHost, EcmHostConfig, EndpointInfo, EnumerationState, FrameChannel, HostBus, LinkState,
    PipeId, RequestStatus, SetupPacket, TransferStatus,
};
use smoltcp::time::Instant;
use usb_device::{Result, UsbError};

pub const MAC: [u8; 6] = [0x0A, 0x1B, 0x2C, 0x3D, 0x4E, 0x5F];

pub const NOTIFICATION_EP: u8 = 0x81;
pub const DATA_IN_EP: u8 = 0x82;
pub const DATA_OUT_EP: u8 = 0x02;

/// Configuration descriptor of a full speed adapter: notification endpoint
/// 0x81, bulk endpoints 0x82/0x02 with 64 byte packets, MAC in string 4.
#[rustfmt::skip]
pub const ECM_CONFIG: &[u8] = &[
    0x09, 0x02, 0x50, 0x00, 0x02, 0x01, 0x00, 0xC0, 0x32,
    0x09, 0x04, 0x00, 0x00, 0x01, 0x02, 0x06, 0x00, 0x00,
    0x05, 0x24, 0x00, 0x10, 0x01,
    0x05, 0x24, 0x06, 0x00, 0x01,
    0x0D, 0x24, 0x0F, 0x04, 0x1F, 0x00, 0x00, 0x00, 0xEA, 0x05, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x81, 0x03, 0x10, 0x00, 0x20,
    0x09, 0x04, 0x01, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x00,
    0x09, 0x04, 0x01, 0x01, 0x02, 0x0A, 0x00, 0x00, 0x00,
    0x07, 0x05, 0x82, 0x02, 0x40, 0x00, 0x00,
    0x07, 0x05, 0x02, 0x02, 0x40, 0x00, 0x00,
];

/// String descriptor carrying `mac` as 12 UTF-16LE hex digits.
pub fn mac_descriptor(mac: [u8; 6]) -> Vec<u8> {
    let digits: String = mac.iter().map(|b| format!("{b:02X}")).collect();
    let mut desc = vec![2 + 2 * digits.len() as u8, 0x03];
    for c in digits.bytes() {
        desc.extend_from_slice(&[c, 0]);
    }
    desc
}

pub fn network_connection(connected: bool) -> Vec<u8> {
    vec![0xA1, 0x00, u8::from(connected), 0x00, 0x00, 0x00, 0x00, 0x00]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ok,
    Busy,
    Error,
}

#[derive(Default)]
struct Pipe {
    address: u8,
    submitted: bool,
    incoming: VecDeque<Vec<u8>>,
    current: Vec<u8>,
    sent: Vec<Vec<u8>>,
    in_requests: Vec<u16>,
}

/// Host controller double. Control replies are scripted, IN pipes deliver the
/// queued chunks one per submitted transfer, OUT pipes record what was sent.
pub struct MockBus {
    pub replies: VecDeque<Reply>,
    /// Used once `replies` runs out.
    pub default_reply: Reply,
    pub setups: Vec<SetupPacket>,
    pub string_descriptor: Vec<u8>,
    pub statistic: u32,
    pub closed: Vec<PipeId>,
    /// Endpoint whose next transfer stalls.
    pub stall_on: Option<u8>,
    pipes: Vec<Pipe>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self {
            replies: VecDeque::new(),
            default_reply: Reply::Ok,
            setups: Vec::new(),
            string_descriptor: mac_descriptor(MAC),
            statistic: 0,
            closed: Vec::new(),
            stall_on: None,
            pipes: Vec::new(),
        }
    }
}

impl MockBus {
    pub fn scripted(replies: &[Reply]) -> Self {
        Self {
            replies: replies.iter().copied().collect(),
            ..Self::default()
        }
    }

    fn pipe_for(&mut self, address: u8) -> &mut Pipe {
        self.pipes
            .iter_mut()
            .find(|p| p.address == address)
            .expect("endpoint was never opened")
    }

    /// Queues one completed IN transfer on `address`.
    pub fn deliver(&mut self, address: u8, chunk: &[u8]) {
        self.pipe_for(address).incoming.push_back(chunk.to_vec());
    }

    pub fn sent(&mut self, address: u8) -> Vec<Vec<u8>> {
        self.pipe_for(address).sent.clone()
    }

    pub fn in_requests(&mut self, address: u8) -> Vec<u16> {
        self.pipe_for(address).in_requests.clone()
    }

    pub fn requests(&self) -> Vec<u8> {
        self.setups.iter().map(|s| s.request).collect()
    }
}

impl HostBus for MockBus {
    fn control_request(&mut self, setup: &SetupPacket, data: &mut [u8]) -> RequestStatus {
        self.setups.push(*setup);
        match self.replies.pop_front().unwrap_or(self.default_reply) {
            Reply::Busy => RequestStatus::Busy,
            Reply::Error => RequestStatus::Error,
            Reply::Ok if !setup.is_in() => RequestStatus::Ok(0),
            Reply::Ok => {
                let source = match setup.request {
                    0x06 => self.string_descriptor.clone(),
                    0x44 => self.statistic.to_le_bytes().to_vec(),
                    _ => Vec::new(),
                };
                let len = source.len().min(data.len()).min(usize::from(setup.length));
                data[..len].copy_from_slice(&source[..len]);
                RequestStatus::Ok(len)
            }
        }
    }

    fn open_pipe(&mut self, endpoint: &EndpointInfo) -> Result<PipeId> {
        let id = u8::try_from(self.pipes.len()).map_err(|_| UsbError::EndpointOverflow)?;
        self.pipes.push(Pipe {
            address: endpoint.address.into(),
            ..Pipe::default()
        });
        Ok(PipeId(id))
    }

    fn close_pipe(&mut self, pipe: PipeId) {
        self.closed.push(pipe);
    }

    fn submit_bulk_out(&mut self, pipe: PipeId, data: &[u8]) {
        let pipe = &mut self.pipes[usize::from(pipe.0)];
        pipe.sent.push(data.to_vec());
        pipe.submitted = true;
    }

    fn submit_bulk_in(&mut self, pipe: PipeId, length: u16) {
        let pipe = &mut self.pipes[usize::from(pipe.0)];
        pipe.in_requests.push(length);
        pipe.submitted = true;
    }

    fn submit_interrupt_in(&mut self, pipe: PipeId, length: u16) {
        self.submit_bulk_in(pipe, length);
    }

    fn transfer_status(&mut self, pipe: PipeId) -> TransferStatus {
        let pipe = &mut self.pipes[usize::from(pipe.0)];
        if !pipe.submitted {
            return TransferStatus::Busy;
        }
        if self.stall_on == Some(pipe.address) {
            self.stall_on = None;
            pipe.submitted = false;
            return TransferStatus::Stall;
        }
        if pipe.address & 0x80 == 0 {
            pipe.submitted = false;
            return TransferStatus::Done;
        }
        match pipe.incoming.pop_front() {
            Some(chunk) => {
                pipe.current = chunk;
                pipe.submitted = false;
                TransferStatus::Done
            }
            None => TransferStatus::Busy,
        }
    }

    fn last_transfer_size(&self, pipe: PipeId) -> usize {
        self.pipes[usize::from(pipe.0)].current.len()
    }

    fn read_received(&mut self, pipe: PipeId, buf: &mut [u8]) -> usize {
        let current = &self.pipes[usize::from(pipe.0)].current;
        let n = buf.len().min(current.len());
        buf[..n].copy_from_slice(&current[..n]);
        n
    }
}

/// Attaches to [`ECM_CONFIG`] and runs activation to the steady state.
pub fn activated_host<const LEN: usize>(
    bus: &mut MockBus,
    frames: &FrameChannel<'_, LEN>,
) -> EcmHost {
    let mut host = EcmHost::attach(bus, ECM_CONFIG, EcmHostConfig::default()).unwrap();
    for t in 0..3 {
        host.poll(bus, Instant::from_millis(t), frames);
    }
    assert_eq!(host.state(), EnumerationState::SteadyState);
    host
}

/// Reports the link as up and polls until the host has seen it.
pub fn link_up<const LEN: usize>(
    host: &mut EcmHost,
    bus: &mut MockBus,
    frames: &FrameChannel<'_, LEN>,
) {
    bus.deliver(NOTIFICATION_EP, &network_connection(true));
    host.poll(bus, Instant::from_millis(10), frames);
    assert_eq!(host.link_state(), LinkState::Up);
}
