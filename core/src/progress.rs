//! Capture progress snapshot (spec §3 "CaptureState", §9 REDESIGN FLAGS "Global mutable state").
//!
//! The original exposes each counter as its own `std::atomic`, which lets a reader observe a
//! torn combination (e.g. `bytesWritten` from one buffer alongside `minSample` from the next).
//! This crate groups every counter into one struct behind a single mutex, so a reader's
//! `snapshot()` is always a value some single point in the pipeline's history actually held.

use std::sync::Mutex;

use crate::error::TransferResult;

/// The controller's public progress counters, all advancing monotonically except `result`,
/// which starts at `Running` and is latched exactly once (spec §7).
#[derive(Debug, Clone, Copy)]
pub struct CaptureProgress {
    pub transfers_completed: u64,
    pub disk_buffers_written: u64,
    pub bytes_written: u64,
    pub min_sample: u16,
    pub max_sample: u16,
    pub clipped_min_count: u64,
    pub clipped_max_count: u64,
    pub had_sequence_numbers: bool,
    pub result: TransferResult,
    /// Whether `record_metrics` has observed its first buffer yet. Tracked independently of
    /// `disk_buffers_written`: the processing worker records a buffer's metrics a full iteration
    /// before it records that buffer's write completing (see `processing_worker::run`), so
    /// `disk_buffers_written == 0` is still true while the *second* buffer's metrics are being
    /// recorded and is not a valid "first buffer" signal.
    min_sample_seen: bool,
}

impl Default for CaptureProgress {
    fn default() -> Self {
        CaptureProgress {
            transfers_completed: 0,
            disk_buffers_written: 0,
            bytes_written: 0,
            min_sample: 0,
            max_sample: 0,
            clipped_min_count: 0,
            clipped_max_count: 0,
            had_sequence_numbers: false,
            result: TransferResult::Running,
            min_sample_seen: false,
        }
    }
}

/// Thread-safe home for `CaptureProgress`, shared between the two worker threads (writers) and
/// the controller's query accessors (reader).
pub struct ProgressCell {
    inner: Mutex<CaptureProgress>,
}

impl ProgressCell {
    pub fn new() -> Self {
        ProgressCell {
            inner: Mutex::new(CaptureProgress::default()),
        }
    }

    pub fn snapshot(&self) -> CaptureProgress {
        *self.inner.lock().unwrap()
    }

    pub fn record_transfer_completed(&self) {
        self.inner.lock().unwrap().transfers_completed += 1;
    }

    pub fn record_buffer_written(&self, bytes: u64) {
        let mut state = self.inner.lock().unwrap();
        state.disk_buffers_written += 1;
        state.bytes_written += bytes;
    }

    pub fn record_metrics(&self, metrics: crate::sequence::SampleMetrics) {
        let mut state = self.inner.lock().unwrap();
        if !state.min_sample_seen || metrics.min < state.min_sample {
            state.min_sample = metrics.min;
            state.min_sample_seen = true;
        }
        state.max_sample = state.max_sample.max(metrics.max);
        state.clipped_min_count += metrics.clipped_min_count as u64;
        state.clipped_max_count += metrics.clipped_max_count as u64;
    }

    pub fn set_had_sequence_numbers(&self, had: bool) {
        self.inner.lock().unwrap().had_sequence_numbers = had;
    }

    /// Restores every counter to its starting value, for the next `start()` in a
    /// start-stop-start cycle (spec §6 "Capture is one-shot... start → stop → start again is
    /// supported").
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = CaptureProgress::default();
    }
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self::new()
    }
}

/// First-failure-wins latch for the terminal `TransferResult` (spec §7 "Controller latches the
/// first error code reported... subsequent errors during teardown are logged but do not
/// overwrite the latched code").
pub struct ResultLatch<'a> {
    progress: &'a ProgressCell,
}

impl<'a> ResultLatch<'a> {
    pub fn new(progress: &'a ProgressCell) -> Self {
        ResultLatch { progress }
    }

    /// Latches `result` if and only if no non-`Running` result has been latched yet.
    pub fn latch(&self, result: TransferResult) {
        let mut state = self.progress.inner.lock().unwrap();
        if state.result == TransferResult::Running {
            state.result = result;
        }
    }

    pub fn current(&self) -> TransferResult {
        self.progress.inner.lock().unwrap().result
    }

    /// Convenience for worker exit points: latches `result` and hands it straight back so a
    /// call site can write `return latch.latch_and_return(TransferResult::X);`.
    pub fn latch_and_return(&self, result: TransferResult) -> TransferResult {
        self.latch(result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_wins() {
        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        latch.latch(TransferResult::BufferUnderflow);
        latch.latch(TransferResult::FileWriteError);
        assert_eq!(latch.current(), TransferResult::BufferUnderflow);
    }

    #[test]
    fn metrics_accumulate_across_buffers() {
        let progress = ProgressCell::new();
        progress.record_metrics(crate::sequence::SampleMetrics {
            min: 10,
            max: 900,
            clipped_min_count: 1,
            clipped_max_count: 0,
        });
        progress.record_buffer_written(1024);
        progress.record_metrics(crate::sequence::SampleMetrics {
            min: 0,
            max: 1023,
            clipped_min_count: 2,
            clipped_max_count: 3,
        });
        let snap = progress.snapshot();
        assert_eq!(snap.min_sample, 0);
        assert_eq!(snap.max_sample, 1023);
        assert_eq!(snap.clipped_min_count, 3);
        assert_eq!(snap.clipped_max_count, 3);
    }

    #[test]
    fn min_sample_survives_the_real_one_buffer_lagged_call_order() {
        // processing_worker::run records a buffer's metrics a full iteration before it records
        // that buffer's write completing: metrics(buf0), metrics(buf1), write(buf0),
        // metrics(buf2), write(buf1), ... So when buffer 1's metrics are recorded,
        // `disk_buffers_written` is still 0 -- buffer 0's lower minimum must not be clobbered.
        let progress = ProgressCell::new();
        let sample = |min: u16, max: u16| crate::sequence::SampleMetrics {
            min,
            max,
            clipped_min_count: 0,
            clipped_max_count: 0,
        };

        progress.record_metrics(sample(5, 900)); // buf0
        progress.record_metrics(sample(50, 900)); // buf1, written before buf0's write is recorded
        progress.record_buffer_written(1024); // buf0's write completes
        progress.record_metrics(sample(20, 900)); // buf2
        progress.record_buffer_written(1024); // buf1's write completes

        let snap = progress.snapshot();
        assert_eq!(snap.min_sample, 5, "buf0's true minimum must survive buf1's later, higher minimum");
        assert_eq!(snap.disk_buffers_written, 2);
    }
}
