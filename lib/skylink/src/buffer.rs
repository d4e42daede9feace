//! Contiguous FIFO between UART ingestion and the processor thread.
//!
//! Backed by a mirrored deque so the readable region is always one slice,
//! which keeps the line scanner free of wrap-around handling.

use slice_deque::SliceDeque;

use flint::logging::{warn, Logger};

type ByteDeque = SliceDeque<u8>;

pub(crate) struct RxRing {
    data: ByteDeque,
    size: usize,
    dropped: u64,
    log: Logger,
}

impl RxRing {
    pub fn new(size: usize, log: Logger) -> RxRing {
        let mut data = ByteDeque::new();
        data.reserve(size);
        RxRing {
            data,
            size,
            dropped: 0,
            log,
        }
    }

    /// The number of bytes waiting to be processed.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes discarded due to ring overflow since creation.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append incoming bytes. Bytes beyond the ring capacity are discarded;
    /// the scanner must stay bounded even if the platform floods us.
    pub fn ingress(&mut self, bytes: &[u8]) -> usize {
        let free = self.size - self.data.len();
        let take = bytes.len().min(free);

        self.data.extend(bytes[..take].iter().copied());

        if take < bytes.len() {
            self.dropped += (bytes.len() - take) as u64;
            warn!(self.log, "rx ring overflow, bytes discarded";
                  "discarded" => bytes.len() - take,
                  "total_dropped" => self.dropped);
        }
        take
    }

    /// The readable region as one contiguous slice.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// Release the first `count` processed bytes.
    #[inline]
    pub fn consume(&mut self, count: usize) {
        debug_assert!(count <= self.data.len());
        unsafe { self.data.move_head(count as isize) }
    }

    #[inline]
    pub fn clear(&mut self) {
        let len = self.len();
        self.consume(len);
    }
}
