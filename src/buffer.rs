use usb_device::{Result, UsbError};

/// Fixed-capacity byte ring over caller supplied storage.
///
/// The cursors only ever move forward (modulo the capacity). The exceptions are
/// [`clear`](Self::clear) and [`rewind`](Self::rewind), which the frame reassembler
/// uses to drop a frame that is still being written.
pub(crate) struct RingBuffer<'a, const LEN: usize> {
    store: &'a mut [u8; LEN],
    read_ptr: usize,
    write_ptr: usize,
}

impl<'a, const LEN: usize> RingBuffer<'a, LEN> {
    pub fn new(store: &'a mut [u8; LEN]) -> Self {
        Self {
            store,
            read_ptr: 0,
            write_ptr: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        LEN
    }

    pub fn unread(&self) -> usize {
        self.write_ptr.wrapping_sub(self.read_ptr)
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.unread()
    }

    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    /// Appends `data`. Nothing is written if it does not fit, unread bytes are
    /// never overwritten.
    pub fn push_slice(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.free() {
            return Err(UsbError::BufferOverflow);
        }
        if data.is_empty() {
            return Ok(());
        }

        let start = self.write_ptr % LEN;
        let first = data.len().min(LEN - start);
        let (head, tail) = data.split_at(first);
        self.store[start..start + first].copy_from_slice(head);
        self.store[..tail.len()].copy_from_slice(tail);

        self.write_ptr = self.write_ptr.wrapping_add(data.len());
        Ok(())
    }

    /// Moves exactly `out.len()` unread bytes into `out`.
    pub fn pop_into(&mut self, out: &mut [u8]) -> Result<()> {
        if out.len() > self.unread() {
            return Err(UsbError::InvalidState);
        }
        if out.is_empty() {
            return Ok(());
        }

        let start = self.read_ptr % LEN;
        let first = out.len().min(LEN - start);
        let (head, tail) = out.split_at_mut(first);
        head.copy_from_slice(&self.store[start..start + first]);
        let tail_len = tail.len();
        tail.copy_from_slice(&self.store[..tail_len]);

        self.read_ptr = self.read_ptr.wrapping_add(out.len());
        Ok(())
    }

    /// Discards `len` unread bytes from the read side.
    pub fn skip(&mut self, len: usize) -> Result<()> {
        if len > self.unread() {
            return Err(UsbError::InvalidState);
        }
        self.read_ptr = self.read_ptr.wrapping_add(len);
        Ok(())
    }

    /// Takes back the last `len` written bytes.
    pub fn rewind(&mut self, len: usize) {
        let len = len.min(self.unread());
        self.write_ptr = self.write_ptr.wrapping_sub(len);
    }

    pub fn clear(&mut self) {
        self.read_ptr = 0;
        self.write_ptr = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_to_overwrite_unread_data() {
        let mut store = [0u8; 8];
        let mut ring = RingBuffer::new(&mut store);
        ring.push_slice(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(ring.push_slice(&[7, 8, 9]), Err(UsbError::BufferOverflow));
        assert_eq!(ring.unread(), 6);
        ring.push_slice(&[7, 8]).unwrap();
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn wraps_around_the_end_of_storage() {
        let mut store = [0u8; 8];
        let mut ring = RingBuffer::new(&mut store);
        ring.push_slice(&[0; 6]).unwrap();
        ring.skip(6).unwrap();

        ring.push_slice(&[1, 2, 3, 4, 5]).unwrap();
        let mut out = [0u8; 5];
        ring.pop_into(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5]);
        assert!(ring.is_empty());
    }

    #[test]
    fn rewind_drops_only_the_tail() {
        let mut store = [0u8; 16];
        let mut ring = RingBuffer::new(&mut store);
        ring.push_slice(b"abc").unwrap();
        ring.push_slice(b"defg").unwrap();
        ring.rewind(4);
        assert_eq!(ring.unread(), 3);

        let mut out = [0u8; 3];
        ring.pop_into(&mut out).unwrap();
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn reading_past_unread_is_rejected() {
        let mut store = [0u8; 4];
        let mut ring = RingBuffer::new(&mut store);
        ring.push_slice(&[9]).unwrap();
        let mut out = [0u8; 2];
        assert_eq!(ring.pop_into(&mut out), Err(UsbError::InvalidState));
        assert_eq!(ring.skip(2), Err(UsbError::InvalidState));
        assert_eq!(ring.unread(), 1);
    }

    #[test]
    fn zero_capacity_ring_accepts_nothing() {
        let mut store = [0u8; 0];
        let mut ring = RingBuffer::new(&mut store);
        assert_eq!(ring.push_slice(&[]), Ok(()));
        assert_eq!(ring.push_slice(&[1]), Err(UsbError::BufferOverflow));
        assert_eq!(ring.pop_into(&mut []), Ok(()));
        assert!(ring.is_empty());
    }
}
