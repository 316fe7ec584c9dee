//! Synthetic bulk-IN endpoint used by the property and scenario tests in spec §8. Serves a
//! precomputed byte stream out of memory instead of real hardware, with hooks to inject the
//! failure modes the scenarios require (delayed completion for S5, a corrupted marker for S4).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use super::endpoint::{BulkInEndpoint, Completion, CompletionStatus, EndpointInfo, SlotHandle, TransferTarget};

/// One pending completion, held back for `delay_submits` additional `drain` calls before it
/// becomes visible -- the mechanism spec §8 S5 uses to simulate a slow 5th completion.
struct Pending {
    completion: Completion,
    delay_submits: u32,
}

pub struct SimulatedEndpoint {
    max_packet_size_bytes: usize,
    stream: Vec<u8>,
    cursor: Mutex<usize>,
    pending: Mutex<Vec<Pending>>,
    cancelled: Mutex<HashSet<SlotHandle>>,
    submit_index: Mutex<usize>,
    /// Maps a 0-based submit index to the number of extra `drain` calls its completion should
    /// be held back for (spec §8 S5: "delays its 5th completion by 10x transfer time").
    delays: HashMap<usize, u32>,
    pub vendor_log: Mutex<Vec<(u8, u16)>>,
}

impl SimulatedEndpoint {
    pub fn new(max_packet_size_bytes: usize, stream: Vec<u8>) -> Self {
        SimulatedEndpoint {
            max_packet_size_bytes,
            stream,
            cursor: Mutex::new(0),
            pending: Mutex::new(Vec::new()),
            cancelled: Mutex::new(HashSet::new()),
            submit_index: Mutex::new(0),
            delays: HashMap::new(),
            vendor_log: Mutex::new(Vec::new()),
        }
    }

    /// Configures the `n`th (0-based) submitted transfer to hold its completion back for
    /// `extra_drains` additional `drain()` calls.
    pub fn with_delay(mut self, n: usize, extra_drains: u32) -> Self {
        self.delays.insert(n, extra_drains);
        self
    }
}

impl BulkInEndpoint for SimulatedEndpoint {
    fn connect(&mut self, _preferred_device_path: Option<&str>) -> anyhow::Result<EndpointInfo> {
        Ok(EndpointInfo {
            max_packet_size_bytes: self.max_packet_size_bytes,
            max_single_transfer_bytes: None,
        })
    }

    unsafe fn submit(&self, slot: SlotHandle, target: TransferTarget) -> anyhow::Result<()> {
        let mut cursor = self.cursor.lock().unwrap();
        let available = self.stream.len().saturating_sub(*cursor);
        let n = available.min(target.len);
        if n > 0 {
            let src = &self.stream[*cursor..*cursor + n];
            let dst = std::slice::from_raw_parts_mut(target.ptr, n);
            dst.copy_from_slice(src);
        }
        *cursor += n;

        let index = {
            let mut idx = self.submit_index.lock().unwrap();
            let current = *idx;
            *idx += 1;
            current
        };

        let status = if n == target.len {
            CompletionStatus::Completed
        } else {
            CompletionStatus::Failed
        };

        self.pending.lock().unwrap().push(Pending {
            completion: Completion {
                slot,
                status,
                bytes_transferred: n,
            },
            delay_submits: self.delays.get(&index).copied().unwrap_or(0),
        });

        Ok(())
    }

    fn cancel(&self, slot: SlotHandle) {
        self.cancelled.lock().unwrap().insert(slot);
        let mut pending = self.pending.lock().unwrap();
        for p in pending.iter_mut() {
            if p.completion.slot == slot {
                p.completion.status = CompletionStatus::Cancelled;
            }
        }
    }

    fn drain(&self, _timeout: Duration) -> Vec<Completion> {
        let mut pending = self.pending.lock().unwrap();
        let mut ready = Vec::new();
        let mut still_pending = Vec::new();
        for mut p in pending.drain(..) {
            if p.delay_submits > 0 {
                p.delay_submits -= 1;
                still_pending.push(p);
            } else {
                ready.push(p.completion);
            }
        }
        *pending = still_pending;
        ready
    }

    fn send_vendor_command(&self, request_code: u8, value: u16) -> anyhow::Result<()> {
        self.vendor_log.lock().unwrap().push((request_code, value));
        Ok(())
    }
}

/// Builds a synthetic stream of `sample_count` 16-bit little-endian samples with a valid
/// monotone 6-bit sequence marker advancing every `2^16` samples, carrying `payload(i)` as the
/// low 10 bits of sample `i`. Used by property test 1 and scenarios S1/S4/S5/S6.
pub fn synthetic_sequence_stream(sample_count: usize, payload: impl Fn(usize) -> u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(sample_count * 2);
    for i in 0..sample_count {
        let marker = ((i >> 16) & 0x3F) as u16;
        let value = payload(i) & 0x3FF;
        let word = value | (marker << 10);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}

/// Builds a synthetic test-pattern stream wrapping at `wrap_at` (1021 or 1024), with a valid
/// sequence marker as well so both checks can run together (spec S2/S3).
pub fn synthetic_test_pattern_stream(sample_count: usize, wrap_at: u16) -> Vec<u8> {
    synthetic_sequence_stream(sample_count, |i| (i as u64 % wrap_at as u64) as u16)
}
