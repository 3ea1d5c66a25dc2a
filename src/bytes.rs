// Little-endian cursor helpers for descriptors, setup packets and notifications.
// hat tip to tokio-rs/bytes

pub(crate) trait BufMut {
    /// Copies `src` in and advances. Panics if `src` does not fit, callers
    /// size their buffers from constants.
    fn put_slice(&mut self, src: &[u8]);

    fn put_u8(&mut self, n: u8) {
        self.put_slice(&[n]);
    }

    fn put_u16_le(&mut self, n: u16) {
        self.put_slice(&n.to_le_bytes());
    }

    fn put_u32_le(&mut self, n: u32) {
        self.put_slice(&n.to_le_bytes());
    }
}

pub(crate) trait Buf<'a> {
    fn remaining(&self) -> usize;

    fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Splits off the next `size` bytes, or `None` if fewer remain.
    fn take(&mut self, size: usize) -> Option<&'a [u8]>;

    fn get_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N)?);
        Some(out)
    }

    fn get_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn get_u16_le(&mut self) -> Option<u16> {
        self.get_array().map(u16::from_le_bytes)
    }

    fn get_u32_le(&mut self) -> Option<u32> {
        self.get_array().map(u32::from_le_bytes)
    }
}

impl BufMut for &mut [u8] {
    fn put_slice(&mut self, src: &[u8]) {
        // use mem::take to make lifetimes happy
        let (head, tail) = core::mem::take(self).split_at_mut(src.len());
        head.copy_from_slice(src);
        *self = tail;
    }
}

impl<'a> Buf<'a> for &'a [u8] {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if size > self.len() {
            return None;
        }
        let (head, tail) = self.split_at(size);
        *self = tail;
        Some(head)
    }
}
