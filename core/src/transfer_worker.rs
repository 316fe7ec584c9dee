//! USB Transfer Stage (spec §4.3): keeps a fleet of asynchronous bulk-IN transfers in flight
//! against the disk buffer ring, discarding the warmup window and resubmitting each slot against
//! the next disk buffer `diskBufferTransferSpan` ahead once its completion is observed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::buffer::{DiskBuffer, Wait};
use crate::error::{ensure_index, program_flow_error, TransferResult};
use crate::geometry::CaptureGeometry;
use crate::progress::{ProgressCell, ResultLatch};
use crate::usb::{BulkInEndpoint, CompletionStatus, TransferTarget};

/// How long the worker waits without seeing *any* completion before concluding the device has
/// stalled. Spec §4.3 step 1 frames buffer-underflow as "previous slot already completed when
/// queueing next"; this crate's abstract endpoint reports completions through `drain` rather
/// than synchronously on resubmission, so the equivalent signal here is fleet liveness: with the
/// full fleet in flight, a completion should arrive well within this window on every capture
/// device this core targets.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);
const TEARDOWN_DRAIN_ATTEMPTS: usize = 256;

#[derive(Clone, Copy)]
struct SlotTarget {
    disk_buffer_index: usize,
    intra_buffer_offset: usize,
    last_in_buffer: bool,
}

pub struct TransferWorkerConfig {
    pub geometry: CaptureGeometry,
    pub stall_timeout: Duration,
}

impl TransferWorkerConfig {
    pub fn new(geometry: CaptureGeometry) -> Self {
        TransferWorkerConfig {
            geometry,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

/// Runs the USB Transfer Stage to completion. Returns the `TransferResult` the controller should
/// merge with the processing worker's outcome; failures are latched into `result_latch` before
/// they are returned so a concurrently-blocked processing worker can be unblocked promptly by the
/// controller's poisoning response (spec §4.2 step 4).
pub fn run(
    config: &TransferWorkerConfig,
    disk_buffers: &[DiskBuffer],
    endpoint: &dyn BulkInEndpoint,
    progress: &ProgressCell,
    result_latch: &ResultLatch,
    stop_requested: &AtomicBool,
    dump_all: &AtomicBool,
) -> TransferResult {
    let geometry = &config.geometry;
    let slot_count = geometry.simultaneous_transfers;
    let mut slots = initial_slots(geometry);

    for (slot, target) in slots.iter().enumerate() {
        if submit_slot(disk_buffers, endpoint, slot, target, geometry.transfer_size).is_err() {
            return result_latch.latch_and_return(teardown(endpoint, slot_count, TransferResult::UsbTransferFailure));
        }
    }

    let mut outstanding = slot_count;
    let mut remaining_warmup = geometry.warmup_completions();
    let mut complete = false;
    let mut last_progress = Instant::now();

    while outstanding > 0 {
        let completions = endpoint.drain(DRAIN_POLL_INTERVAL);
        if completions.is_empty() {
            if !complete && last_progress.elapsed() > config.stall_timeout {
                return result_latch.latch_and_return(teardown(endpoint, slot_count, TransferResult::BufferUnderflow));
            }
            continue;
        }
        last_progress = Instant::now();

        for completion in completions {
            outstanding -= 1;
            let slot = completion.slot;
            let target = slots[slot];

            if completion.status == CompletionStatus::Cancelled {
                continue;
            }
            if completion.status == CompletionStatus::Failed
                || completion.bytes_transferred != geometry.transfer_size
            {
                return result_latch
                    .latch_and_return(teardown(endpoint, slot_count, TransferResult::UsbTransferFailure));
            }
            if dump_all.load(Ordering::SeqCst) {
                return result_latch.latch_and_return(teardown(endpoint, slot_count, TransferResult::ForcedAbort));
            }

            if remaining_warmup > 0 {
                remaining_warmup -= 1;
            } else {
                progress.record_transfer_completed();
                if target.last_in_buffer {
                    if !disk_buffers[target.disk_buffer_index].mark_full() {
                        eprintln!("transfer_worker(): {}", program_flow_error!());
                        return result_latch
                            .latch_and_return(teardown(endpoint, slot_count, TransferResult::ProgramError));
                    }
                    if stop_requested.load(Ordering::SeqCst) {
                        complete = true;
                    }
                }
            }

            if complete {
                continue;
            }

            let next_buffer =
                (target.disk_buffer_index + geometry.disk_buffer_transfer_span) % geometry.disk_buffer_count;
            let next = SlotTarget {
                disk_buffer_index: next_buffer,
                ..target
            };

            if next.intra_buffer_offset == 0 {
                match disk_buffers[next.disk_buffer_index].wait_until_empty() {
                    Wait::Poisoned => return result_latch.latch_and_return(TransferResult::ForcedAbort),
                    Wait::Ready => {}
                }
            }

            if submit_slot(disk_buffers, endpoint, slot, &next, geometry.transfer_size).is_err() {
                return result_latch
                    .latch_and_return(teardown(endpoint, slot_count, TransferResult::UsbTransferFailure));
            }
            slots[slot] = next;
            outstanding += 1;
        }
    }

    TransferResult::Success
}

/// Computes each slot's initial disk-buffer/offset assignment (spec §4.3 "Startup warmup").
///
/// Warmup discards the first `warmup_completions()` completions in arrival order, which (for
/// slots submitted in index order) are slots `0..warmup_buffers`. Left unshifted, those slots'
/// own buffers (`0..warmup_buffers`) would be exactly the ones silently eaten by warmup, and the
/// fleet would publish buffer `warmup_buffers` first instead of buffer 0. Shifting every slot's
/// initial disk buffer backward by the warmup count (mod `disk_buffer_count`) moves the buffers
/// warmup burns through to the end of the ring, so the first buffer to survive warmup and
/// actually get published is buffer 0, matching `processing_worker::run`'s assumption that
/// `buffer_index` starts at 0.
fn initial_slots(geometry: &CaptureGeometry) -> Vec<SlotTarget> {
    let warmup_buffers = geometry.disk_buffer_count.min(4);
    (0..geometry.simultaneous_transfers)
        .map(|k| {
            let span_index = k % geometry.disk_buffer_transfer_span;
            let offset_index = k / geometry.disk_buffer_transfer_span;
            let disk_buffer_index = (span_index + geometry.disk_buffer_count - warmup_buffers)
                % geometry.disk_buffer_count;
            SlotTarget {
                disk_buffer_index,
                intra_buffer_offset: offset_index * geometry.transfer_size,
                last_in_buffer: offset_index + 1 == geometry.transfers_per_disk_buffer,
            }
        })
        .collect()
}

fn submit_slot(
    disk_buffers: &[DiskBuffer],
    endpoint: &dyn BulkInEndpoint,
    slot: usize,
    target: &SlotTarget,
    transfer_size: usize,
) -> anyhow::Result<()> {
    use anyhow::Context as _;
    let buffer = &ensure_index!(disk_buffers[target.disk_buffer_index]);
    // SAFETY: spec §5 "Ordering" guarantees transfers within one disk buffer are produced in
    // strictly increasing offset order and buffers are recycled only after the processing worker
    // has emptied them, so this range never overlaps a live transfer or processing-worker read.
    let slice = unsafe { buffer.storage.slice_mut(target.intra_buffer_offset, transfer_size) };
    let transfer_target = TransferTarget {
        ptr: slice.as_mut_ptr(),
        len: slice.len(),
    };
    // SAFETY: `transfer_target` stays valid and exclusively owned by this transfer until its
    // completion is drained above.
    unsafe { endpoint.submit(slot, transfer_target) }
}

/// Cancels every slot and pumps completions until the fleet has drained, then returns `result`
/// unchanged (spec §4.3 "Teardown").
fn teardown(endpoint: &dyn BulkInEndpoint, slot_count: usize, result: TransferResult) -> TransferResult {
    for slot in 0..slot_count {
        endpoint.cancel(slot);
    }
    for _ in 0..TEARDOWN_DRAIN_ATTEMPTS {
        if endpoint.drain(DRAIN_POLL_INTERVAL).is_empty() {
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::SimulatedEndpoint;
    use std::sync::atomic::AtomicBool;

    fn geometry_for_test() -> CaptureGeometry {
        // Small packet size keeps the synthetic stream a manageable size for a unit test.
        CaptureGeometry::calculate(16, Some(64), 5 * 64, false, 0).unwrap()
    }

    #[test]
    fn initial_slots_skip_over_the_buffers_warmup_will_discard() {
        let geometry = geometry_for_test();
        // disk_buffer_count=5, span=4, warmup_buffers=min(5,4)=4: every slot's initial buffer is
        // shifted one past what it would be unshifted (0,1,2,3 -> 1,2,3,4), leaving buffer 0 free
        // for the first slot to resubmit into once warmup has been paid off.
        let slots = initial_slots(&geometry);
        let assigned: Vec<usize> = slots.iter().map(|s| s.disk_buffer_index).collect();
        assert_eq!(assigned, vec![1, 2, 3, 4]);
        assert!(slots.iter().all(|s| s.last_in_buffer));
    }

    #[test]
    fn buffer_zero_is_not_swallowed_by_warmup() {
        let geometry = geometry_for_test();
        let total_bytes = geometry.disk_buffer_size * geometry.disk_buffer_count * 2;
        let stream = vec![0xCDu8; total_bytes];
        let endpoint = SimulatedEndpoint::new(16, stream);
        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();
        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        let stop_requested = AtomicBool::new(true);
        let dump_all = AtomicBool::new(false);
        let config = TransferWorkerConfig::new(geometry);

        let result = run(
            &config,
            &disk_buffers,
            &endpoint,
            &progress,
            &latch,
            &stop_requested,
            &dump_all,
        );
        assert_eq!(result, TransferResult::Success);

        // disk_buffer_count=5, span=4, warmup_buffers=4: warmup burns through the *shifted*
        // buffers 1..4, so the first real (non-discarded) pass publishes buffers 0..3, in that
        // order, and leaves buffer 4 untouched. Before the fix, warmup instead burned through
        // buffers 0..3 and the first real pass published buffer 4 before buffer 0 -- i.e. buffer
        // 0 would still be Empty here and buffer 4 would be Full.
        for published in 0..geometry.disk_buffer_transfer_span {
            assert!(disk_buffers[published].is_full(), "buffer {published} should be published");
        }
        assert!(
            !disk_buffers[geometry.disk_buffer_count - 1].is_full(),
            "the highest-indexed buffer should be the one warmup leaves untouched, not buffer 0"
        );
    }

    #[test]
    fn clean_stream_completes_with_success() {
        let geometry = geometry_for_test();
        let total_bytes = geometry.disk_buffer_size * geometry.disk_buffer_count * 2;
        let stream = vec![0xABu8; total_bytes];
        let endpoint = SimulatedEndpoint::new(16, stream);
        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();
        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        let stop_requested = AtomicBool::new(true);
        let dump_all = AtomicBool::new(false);

        // Pre-empty every buffer's downstream slot isn't needed: the processing side is absent
        // in this unit test, so mark every buffer empty eagerly is unnecessary -- wait_until_empty
        // is only reached once the ring has wrapped once, which this short stream does not do
        // before `complete` latches at the very first buffer boundary with stop already requested.
        let config = TransferWorkerConfig::new(geometry);
        let result = run(
            &config,
            &disk_buffers,
            &endpoint,
            &progress,
            &latch,
            &stop_requested,
            &dump_all,
        );
        assert_eq!(result, TransferResult::Success);
    }

    #[test]
    fn short_read_is_reported_as_failure() {
        let geometry = geometry_for_test();
        // Stream shorter than one transfer's worth guarantees a short read on the first submit.
        let stream = vec![0u8; geometry.transfer_size / 2];
        let endpoint = SimulatedEndpoint::new(16, stream);
        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();
        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        let stop_requested = AtomicBool::new(false);
        let dump_all = AtomicBool::new(false);
        let config = TransferWorkerConfig::new(geometry);

        let result = run(
            &config,
            &disk_buffers,
            &endpoint,
            &progress,
            &latch,
            &stop_requested,
            &dump_all,
        );
        assert_eq!(result, TransferResult::UsbTransferFailure);
        assert_eq!(latch.current(), TransferResult::UsbTransferFailure);
    }
}
