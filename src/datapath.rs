//! Per-direction transfer engines. Each engine owns at most one transfer on its
//! pipe and is advanced by calling `poll` once per tick.

use heapless::Vec;
use usb_device::{Result, UsbError};

use crate::bus::{HostBus, PipeId, TransferStatus};
use crate::{MAX_BULK_PACKET, MAX_SEGMENT_SIZE_USIZE};

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum TransferState {
    #[default]
    Idle,
    /// A transfer has to be submitted.
    Active,
    /// A transfer was submitted and is awaiting completion.
    ActiveWait,
    /// The direction is stopped and will not be armed.
    Stop,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum PumpResult {
    Pending,
    /// The sequence finished, with the total number of bytes moved.
    Completed(usize),
    Failed(TransferStatus),
}

/// A frame being written out in max-packet-size chunks.
///
/// The sequence always ends in a short packet, so a frame whose length is a
/// multiple of the packet size is followed by a zero-length packet.
pub(crate) struct OutboundFrame {
    data: Vec<u8, MAX_SEGMENT_SIZE_USIZE>,
    offset: usize,
    terminated: bool,
}

impl OutboundFrame {
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            offset: 0,
            terminated: true,
        }
    }

    pub fn load(&mut self, frame: &[u8]) -> Result<()> {
        self.data.clear();
        self.data
            .extend_from_slice(frame)
            .map_err(|()| UsbError::BufferOverflow)?;
        self.offset = 0;
        self.terminated = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_done(&self) -> bool {
        self.terminated
    }

    /// Next packet to send, empty for the terminating zero-length packet.
    pub fn chunk(&self, max_packet_size: usize) -> &[u8] {
        let end = (self.offset + max_packet_size).min(self.data.len());
        &self.data[self.offset..end]
    }

    pub fn advance(&mut self, written: usize, max_packet_size: usize) {
        self.offset += written;
        if written < max_packet_size {
            self.terminated = true;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.offset = 0;
        self.terminated = true;
    }

    /// Offers the next packet to `write`, which returns how much it accepted.
    ///
    /// Returns `Ok(true)` once the terminating packet went out. `WouldBlock`
    /// leaves the frame untouched, other errors abandon it.
    pub fn write_next(
        &mut self,
        max_packet_size: usize,
        write: impl FnOnce(&[u8]) -> Result<usize>,
    ) -> Result<bool> {
        if self.terminated {
            return Ok(true);
        }
        match write(self.chunk(max_packet_size)) {
            Ok(written) => {
                self.advance(written, max_packet_size);
                Ok(self.terminated)
            }
            Err(UsbError::WouldBlock) => Err(UsbError::WouldBlock),
            Err(err) => {
                self.clear();
                Err(err)
            }
        }
    }
}

/// Bulk OUT engine.
pub struct TxPump {
    state: TransferState,
    frame: OutboundFrame,
    max_packet_size: usize,
    in_flight: usize,
}

impl TxPump {
    /// A `max_packet_size` of 0 is treated as 1.
    #[must_use]
    pub fn new(max_packet_size: u16) -> Self {
        Self {
            state: TransferState::Idle,
            frame: OutboundFrame::new(),
            max_packet_size: usize::from(max_packet_size.max(1)),
            in_flight: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Queues `frame`. Only one frame can be in flight.
    pub fn load(&mut self, frame: &[u8]) -> Result<()> {
        match self.state {
            TransferState::Idle => {}
            TransferState::Stop => return Err(UsbError::InvalidState),
            TransferState::Active | TransferState::ActiveWait => {
                return Err(UsbError::WouldBlock)
            }
        }
        self.frame.load(frame)?;
        self.state = TransferState::Active;
        Ok(())
    }

    pub fn poll<B: HostBus>(&mut self, bus: &mut B, pipe: PipeId) -> PumpResult {
        match self.state {
            TransferState::Idle | TransferState::Stop => PumpResult::Pending,
            TransferState::Active => {
                let chunk = self.frame.chunk(self.max_packet_size);
                self.in_flight = chunk.len();
                bus.submit_bulk_out(pipe, chunk);
                self.state = TransferState::ActiveWait;
                PumpResult::Pending
            }
            TransferState::ActiveWait => match bus.transfer_status(pipe) {
                TransferStatus::Done => {
                    self.frame.advance(self.in_flight, self.max_packet_size);
                    if self.frame.is_done() {
                        self.state = TransferState::Idle;
                        PumpResult::Completed(self.frame.len())
                    } else {
                        self.state = TransferState::Active;
                        PumpResult::Pending
                    }
                }
                TransferStatus::Busy => PumpResult::Pending,
                TransferStatus::NotReady => {
                    self.state = TransferState::Active;
                    PumpResult::Pending
                }
                status @ (TransferStatus::Error | TransferStatus::Stall) => {
                    self.frame.clear();
                    self.state = TransferState::Idle;
                    PumpResult::Failed(status)
                }
            },
        }
    }

    /// Aborts any frame in flight and refuses new ones until resumed.
    pub fn stop(&mut self) {
        self.frame.clear();
        self.state = TransferState::Stop;
    }

    pub fn resume(&mut self) {
        if self.state == TransferState::Stop {
            self.state = TransferState::Idle;
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum InKind {
    Bulk,
    Interrupt,
}

/// Bulk or interrupt IN engine.
///
/// Every completed transfer is handed to the caller's sink. A sequence goes on
/// while the requested length is not exhausted and the last transfer filled a
/// whole packet.
pub struct InPump {
    state: TransferState,
    kind: InKind,
    max_packet_size: usize,
    remaining: usize,
    received: usize,
    buf: [u8; MAX_BULK_PACKET],
}

impl InPump {
    /// `max_packet_size` is clamped to `1..=MAX_BULK_PACKET`.
    #[must_use]
    pub fn new(kind: InKind, max_packet_size: u16) -> Self {
        Self {
            state: TransferState::Idle,
            kind,
            max_packet_size: usize::from(max_packet_size).clamp(1, MAX_BULK_PACKET),
            remaining: 0,
            received: 0,
            buf: [0; MAX_BULK_PACKET],
        }
    }

    #[must_use]
    pub fn state(&self) -> TransferState {
        self.state
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.state == TransferState::Idle
    }

    /// Starts a sequence of up to `length` bytes, rounded up to whole packets.
    pub fn arm(&mut self, length: usize) -> Result<()> {
        match self.state {
            TransferState::Idle => {}
            TransferState::Stop => return Err(UsbError::InvalidState),
            TransferState::Active | TransferState::ActiveWait => {
                return Err(UsbError::WouldBlock)
            }
        }
        self.remaining = length
            .max(1)
            .div_ceil(self.max_packet_size)
            .saturating_mul(self.max_packet_size);
        self.received = 0;
        self.state = TransferState::Active;
        Ok(())
    }

    pub fn poll<B, F>(&mut self, bus: &mut B, pipe: PipeId, mut sink: F) -> PumpResult
    where
        B: HostBus,
        F: FnMut(&[u8]),
    {
        match self.state {
            TransferState::Idle | TransferState::Stop => PumpResult::Pending,
            TransferState::Active => {
                let len = u16::try_from(self.remaining.min(self.max_packet_size))
                    .unwrap_or(u16::MAX);
                match self.kind {
                    InKind::Bulk => bus.submit_bulk_in(pipe, len),
                    InKind::Interrupt => bus.submit_interrupt_in(pipe, len),
                }
                self.state = TransferState::ActiveWait;
                PumpResult::Pending
            }
            TransferState::ActiveWait => match bus.transfer_status(pipe) {
                TransferStatus::Done => {
                    let size = bus.last_transfer_size(pipe).min(self.max_packet_size);
                    let n = bus.read_received(pipe, &mut self.buf[..size]);
                    sink(&self.buf[..n]);

                    self.received += n;
                    self.remaining = self.remaining.saturating_sub(n);
                    if self.remaining > 0 && n == self.max_packet_size {
                        self.state = TransferState::Active;
                        PumpResult::Pending
                    } else {
                        self.state = TransferState::Idle;
                        PumpResult::Completed(self.received)
                    }
                }
                TransferStatus::Busy => PumpResult::Pending,
                TransferStatus::NotReady => {
                    self.state = TransferState::Active;
                    PumpResult::Pending
                }
                status @ (TransferStatus::Error | TransferStatus::Stall) => {
                    self.state = TransferState::Idle;
                    PumpResult::Failed(status)
                }
            },
        }
    }

    pub fn stop(&mut self) {
        self.remaining = 0;
        self.state = TransferState::Stop;
    }

    pub fn resume(&mut self) {
        if self.state == TransferState::Stop {
            self.state = TransferState::Idle;
        }
    }
}
