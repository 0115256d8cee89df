//! Command sequence numbers
//!
//! Every command carries a one-byte sequence number that the reader echoes in
//! its response. The counter wraps from 255 back to 0.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Shared sequence number generator
///
/// Thread-safe and can be cloned cheaply (Arc internally); clones hand out
/// numbers from the same sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter {
    next: Arc<AtomicU8>,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the sequence at `first`
    pub fn starting_at(first: u8) -> Self {
        Self {
            next: Arc::new(AtomicU8::new(first)),
        }
    }

    /// Take the next sequence number
    pub fn next(&self) -> u8 {
        // fetch_add wraps on overflow
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// Number the next call to [`next`](Self::next) will return
    pub fn peek(&self) -> u8 {
        self.next.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.next.store(0, Ordering::Release);
    }
}

/// Whether `actual` was handed out before `expected`
///
/// The half of the sequence space behind `expected` counts as earlier, so a
/// reply to an abandoned command is told apart from one that matches nothing
/// sent.
pub fn precedes(actual: u8, expected: u8) -> bool {
    (1..=127).contains(&expected.wrapping_sub(actual))
}
