use heapless::Deque;

/// Number of completed frames that can wait for the consumer.
pub const FRAME_QUEUE_DEPTH: usize = 8;

/// FIFO of completed frame lengths.
///
/// Entries are in the same order as the frame bytes in the paired ring, so
/// popping a length and then that many bytes never crosses a frame boundary.
pub(crate) struct FrameLengthQueue<const N: usize = FRAME_QUEUE_DEPTH> {
    lengths: Deque<usize, N>,
}

impl<const N: usize> FrameLengthQueue<N> {
    pub const fn new() -> Self {
        Self {
            lengths: Deque::new(),
        }
    }

    /// Records a completed frame. Hands the length back if the queue is full.
    pub fn push(&mut self, len: usize) -> Result<(), usize> {
        self.lengths.push_back(len)
    }

    pub fn peek(&self) -> Option<usize> {
        self.lengths.front().copied()
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.lengths.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn clear(&mut self) {
        self.lengths.clear();
    }
}
