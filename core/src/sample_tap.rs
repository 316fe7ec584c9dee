//! Sample-capture tap (spec §2 item 5, §4.5 step 4, §5 "single-slot handshake").
//!
//! Single-producer (processing worker) / single-consumer (UI thread) handshake: the consumer
//! sets a request with a requested length, the producer copies a prefix of the next raw disk
//! buffer into a snapshot and marks it available, and the consumer must clear `available`
//! before issuing another request.

use std::sync::Mutex;

struct SampleTapState {
    requested_len: Option<usize>,
    available: Option<Vec<u8>>,
}

pub struct SampleTap {
    state: Mutex<SampleTapState>,
}

impl SampleTap {
    pub fn new() -> Self {
        SampleTap {
            state: Mutex::new(SampleTapState {
                requested_len: None,
                available: None,
            }),
        }
    }

    /// Consumer side: requests a prefix of the next disk buffer. Overwrites any still-pending
    /// request; does not block.
    pub fn queue_request(&self, n_bytes: usize) {
        let mut state = self.state.lock().unwrap();
        state.requested_len = Some(n_bytes);
    }

    /// Consumer side: takes the available sample, if any, clearing it so a later request can
    /// be answered.
    pub fn poll(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().available.take()
    }

    /// Producer side: if a request is pending and fits within `buffer`, copies the prefix and
    /// marks it available. No-op otherwise (spec §4.5 step 4: "If a sample request is pending
    /// and its requested length is <= disk buffer size").
    pub fn try_fulfill(&self, buffer: &[u8]) {
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.requested_len {
            if n <= buffer.len() {
                state.available = Some(buffer[..n].to_vec());
                state.requested_len = None;
            }
        }
    }
}

impl Default for SampleTap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_cleared_once_fulfilled() {
        let tap = SampleTap::new();
        tap.queue_request(4);
        let buffer = [1u8, 2, 3, 4, 5, 6];
        tap.try_fulfill(&buffer);
        assert_eq!(tap.poll(), Some(vec![1, 2, 3, 4]));
        assert_eq!(tap.poll(), None);
        // Fulfilling again without a new request is a no-op.
        tap.try_fulfill(&buffer);
        assert_eq!(tap.poll(), None);
    }

    #[test]
    fn oversized_request_is_ignored_until_a_large_enough_buffer_arrives() {
        let tap = SampleTap::new();
        tap.queue_request(100);
        tap.try_fulfill(&[0u8; 10]);
        assert_eq!(tap.poll(), None);
        tap.try_fulfill(&[0u8; 200]);
        assert!(tap.poll().is_some());
    }
}
