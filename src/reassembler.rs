//! Recovers Ethernet frames from a stream of bulk transfer chunks.
//!
//! A CDC-ECM function ends every frame with a transfer shorter than the
//! endpoint's max packet size, zero-length when the frame is an exact multiple
//! of it. Completed frames are appended to a byte ring and their lengths to a
//! FIFO in the same order, so the consumer pops one length and exactly that many
//! bytes.

use core::cell::RefCell;

use critical_section::Mutex;
use usb_device::{Result, UsbError};

use crate::buffer::RingBuffer;
use crate::queue::{FrameLengthQueue, FRAME_QUEUE_DEPTH};

/// Result of feeding one completed transfer to the reassembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkOutcome {
    /// The chunk was a full packet, the frame continues.
    Pending,
    /// A frame of this many bytes was completed and queued.
    Frame(usize),
    /// A short chunk ended a frame that had no bytes.
    Empty,
    /// The in-progress frame did not fit in the ring or the length queue.
    Dropped,
    /// Chunk belongs to a frame that was already dropped.
    Discarded,
}

/// Frame boundary rule for a transfer of `cur` bytes following one of `prev`
/// bytes on an endpoint with max packet size `max_packet`.
#[must_use]
#[allow(clippy::nonminimal_bool)]
pub fn is_frame_boundary(prev: usize, cur: usize, max_packet: usize) -> bool {
    (prev == max_packet && cur < max_packet) || (prev < max_packet && cur < max_packet)
}

pub struct FrameReassembler<'a, const LEN: usize> {
    ring: RingBuffer<'a, LEN>,
    lengths: FrameLengthQueue<FRAME_QUEUE_DEPTH>,
    max_packet_size: usize,
    prev_len: usize,
    accumulated: usize,
    discarding: bool,
    dropped: u32,
}

impl<'a, const LEN: usize> FrameReassembler<'a, LEN> {
    pub fn new(store: &'a mut [u8; LEN], max_packet_size: u16) -> Self {
        Self {
            ring: RingBuffer::new(store),
            lengths: FrameLengthQueue::new(),
            max_packet_size: usize::from(max_packet_size),
            prev_len: 0,
            accumulated: 0,
            discarding: false,
            dropped: 0,
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> ChunkOutcome {
        let cur = chunk.len();
        let short = cur < self.max_packet_size;

        if self.discarding {
            self.prev_len = cur;
            self.discarding = !short;
            return ChunkOutcome::Discarded;
        }

        if self.ring.push_slice(chunk).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "frames: ring overflow, dropping frame after {} bytes",
                self.accumulated + cur
            );
            self.drop_current();
            self.prev_len = cur;
            self.discarding = !short;
            return ChunkOutcome::Dropped;
        }
        self.accumulated += cur;

        let boundary = is_frame_boundary(self.prev_len, cur, self.max_packet_size);
        self.prev_len = cur;
        if !boundary {
            return ChunkOutcome::Pending;
        }

        let len = core::mem::take(&mut self.accumulated);
        if len == 0 {
            return ChunkOutcome::Empty;
        }
        if self.lengths.push(len).is_err() {
            #[cfg(feature = "defmt")]
            defmt::warn!("frames: length queue full, dropping {} byte frame", len);
            self.ring.rewind(len);
            self.dropped = self.dropped.wrapping_add(1);
            return ChunkOutcome::Dropped;
        }
        ChunkOutcome::Frame(len)
    }

    /// Moves the oldest completed frame into `out`.
    ///
    /// `WouldBlock` when no frame is queued, in which case nothing changes. A
    /// frame longer than `out` is consumed and reported as `BufferOverflow`.
    pub fn pop_frame(&mut self, out: &mut [u8]) -> Result<usize> {
        let len = self.lengths.peek().ok_or(UsbError::WouldBlock)?;
        self.lengths.pop();

        let res = if len > out.len() {
            self.ring.skip(len).and(Err(UsbError::BufferOverflow))
        } else {
            self.ring.pop_into(&mut out[..len]).map(|()| len)
        };

        if self.ring.is_empty() {
            self.ring.clear();
        }
        res
    }

    pub fn peek_len(&self) -> Option<usize> {
        self.lengths.peek()
    }

    pub fn pending_frames(&self) -> usize {
        self.lengths.len()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Forgets every queued and partial frame.
    pub fn reset(&mut self, max_packet_size: u16) {
        self.ring.clear();
        self.lengths.clear();
        self.max_packet_size = usize::from(max_packet_size);
        self.prev_len = 0;
        self.accumulated = 0;
        self.discarding = false;
    }

    fn drop_current(&mut self) {
        self.ring.rewind(self.accumulated);
        self.accumulated = 0;
        self.dropped = self.dropped.wrapping_add(1);
    }
}

/// A [`FrameReassembler`] shared between the transfer completion path and the
/// consumer loop.
pub struct FrameChannel<'a, const LEN: usize> {
    inner: Mutex<RefCell<FrameReassembler<'a, LEN>>>,
}

impl<'a, const LEN: usize> FrameChannel<'a, LEN> {
    pub fn new(store: &'a mut [u8; LEN], max_packet_size: u16) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(FrameReassembler::new(store, max_packet_size))),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut FrameReassembler<'a, LEN>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    pub fn push_chunk(&self, chunk: &[u8]) -> ChunkOutcome {
        self.with(|r| r.push_chunk(chunk))
    }

    pub fn pop_frame(&self, out: &mut [u8]) -> Result<usize> {
        self.with(|r| r.pop_frame(out))
    }

    pub fn peek_len(&self) -> Option<usize> {
        self.with(|r| r.peek_len())
    }

    pub fn has_frame(&self) -> bool {
        self.peek_len().is_some()
    }

    pub fn pending_frames(&self) -> usize {
        self.with(|r| r.pending_frames())
    }

    pub fn dropped(&self) -> u32 {
        self.with(|r| r.dropped())
    }

    pub fn max_packet_size(&self) -> usize {
        self.with(|r| r.max_packet_size())
    }

    pub fn reset(&self, max_packet_size: u16) {
        self.with(|r| r.reset(max_packet_size));
    }
}
