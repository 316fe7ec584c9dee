//! Processing Stage, fused with the Disk Writer Stage (spec §4.5, §4.6): validates sequence
//! markers, updates running sample metrics, optionally verifies a test pattern, services the
//! sample tap, converts the raw payload, and dispatches it to a [`DiskWriter`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::buffer::{DiskBuffer, Wait};
use crate::error::TransferResult;
use crate::format::{self, CaptureFormat};
use crate::geometry::CaptureGeometry;
use crate::progress::{ProgressCell, ResultLatch};
use crate::sample_tap::SampleTap;
use crate::sequence::{SequenceChecker, TestPatternVerifier};
use crate::writer::{DiskWriter, WriteTarget};

pub struct ProcessingWorkerConfig {
    pub geometry: CaptureGeometry,
    pub format: CaptureFormat,
    pub test_mode: bool,
}

struct PendingWrite {
    disk_buffer_index: usize,
    bytes: usize,
}

/// Runs the Processing + Disk Writer stages to completion. `conversion_buffers` is the pair of
/// alternating scratch buffers the spec's overlapped-write mode requires to keep a pending
/// write's source memory valid (spec §3 "ConversionBuffer"); a blocking writer simply never lets
/// more than one submission be outstanding, so the same pair serves both modes.
pub fn run(
    config: &ProcessingWorkerConfig,
    disk_buffers: &[DiskBuffer],
    conversion_buffers: &mut [Vec<u8>; 2],
    mut writer: Box<dyn DiskWriter>,
    sample_tap: &SampleTap,
    progress: &ProgressCell,
    result_latch: &ResultLatch,
    stop_requested: &AtomicBool,
    dump_all: &AtomicBool,
) -> TransferResult {
    let mut sequence = SequenceChecker::new();
    let mut test_pattern = config.test_mode.then(TestPatternVerifier::new);
    let mut conversion_index = 0usize;
    let mut buffer_index = 0usize;
    let mut pending: Option<PendingWrite> = None;

    loop {
        if dump_all.load(Ordering::SeqCst) {
            writer.cancel_outstanding();
            return result_latch.latch_and_return(TransferResult::ForcedAbort);
        }

        let buffer = &disk_buffers[buffer_index];
        if stop_requested.load(Ordering::SeqCst) && !buffer.is_full() {
            return finish(writer.as_mut(), disk_buffers, progress, result_latch, &sequence, pending);
        }

        match buffer.wait_until_full() {
            Wait::Poisoned => {
                writer.cancel_outstanding();
                return result_latch.latch_and_return(TransferResult::ForcedAbort);
            }
            Wait::Ready => {}
        }

        // SAFETY: the buffer transitioned to `Full`, so the USB worker holds no live `slice_mut`
        // into it until this worker calls `mark_empty` below.
        let raw = unsafe { buffer.storage.slice_mut(0, buffer.storage.len()) };

        let metrics = match sequence.process(raw) {
            Ok(m) => m,
            Err(()) => return result_latch.latch_and_return(TransferResult::SequenceMismatch),
        };
        progress.record_metrics(metrics);

        if let Some(verifier) = test_pattern.as_mut() {
            if verifier.verify(raw).is_err() {
                return result_latch.latch_and_return(TransferResult::VerificationError);
            }
        }

        sample_tap.try_fulfill(raw);

        let output = &mut conversion_buffers[conversion_index][..];
        let written = format::convert(config.format, raw, output);

        if let Some(p) = pending.take() {
            match writer.collect() {
                Ok(()) => {
                    disk_buffers[p.disk_buffer_index].mark_empty();
                    progress.record_buffer_written(p.bytes as u64);
                }
                Err(_) => {
                    writer.cancel_outstanding();
                    return result_latch.latch_and_return(TransferResult::FileWriteError);
                }
            }
        }

        // SAFETY: `output` is the conversion buffer not currently owned by any in-flight write
        // (the other index is); it stays unmodified until its own `collect()` call above.
        let submitted = unsafe {
            writer.submit(WriteTarget {
                ptr: output.as_ptr(),
                len: written,
            })
        };
        if submitted.is_err() {
            return result_latch.latch_and_return(TransferResult::FileWriteError);
        }
        pending = Some(PendingWrite {
            disk_buffer_index: buffer_index,
            bytes: written,
        });

        conversion_index ^= 1;
        buffer_index = (buffer_index + 1) % config.geometry.disk_buffer_count;
    }
}

/// Flushes any outstanding write and publishes the terminal result (spec §4.5 "Graceful exit").
fn finish(
    writer: &mut dyn DiskWriter,
    disk_buffers: &[DiskBuffer],
    progress: &ProgressCell,
    result_latch: &ResultLatch,
    sequence: &SequenceChecker,
    pending: Option<PendingWrite>,
) -> TransferResult {
    if let Some(p) = pending {
        match writer.collect() {
            Ok(()) => {
                disk_buffers[p.disk_buffer_index].mark_empty();
                progress.record_buffer_written(p.bytes as u64);
            }
            Err(_) => {
                writer.cancel_outstanding();
                return result_latch.latch_and_return(TransferResult::FileWriteError);
            }
        }
    }
    progress.set_had_sequence_numbers(sequence.had_sequence_numbers());
    TransferResult::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::simulated::synthetic_sequence_stream;
    use crate::writer::BlockingWriter;
    use std::io::Read;
    use std::sync::atomic::AtomicBool;

    fn small_geometry() -> CaptureGeometry {
        CaptureGeometry::calculate(16, Some(64), 4 * 64, false, 0).unwrap()
    }

    fn fill_buffer(buffer: &DiskBuffer, data: &[u8]) {
        unsafe {
            let slice = buffer.storage.slice_mut(0, data.len());
            slice.copy_from_slice(data);
        }
        buffer.mark_full();
    }

    #[test]
    fn clean_capture_flushes_and_reports_success() {
        let geometry = small_geometry();
        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();

        let samples_per_buffer = geometry.disk_buffer_size / 2;
        let stream = synthetic_sequence_stream(samples_per_buffer, |i| (i % 1024) as u16);
        fill_buffer(&disk_buffers[0], &stream);

        let path = std::env::temp_dir().join(format!("capture-core-proc-{}.bin", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        let writer: Box<dyn DiskWriter> = Box::new(BlockingWriter::new(file));

        let conv_size = CaptureFormat::Signed16Bit.conversion_buffer_size(geometry.disk_buffer_size);
        let mut conversion_buffers = [vec![0u8; conv_size], vec![0u8; conv_size]];

        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        let sample_tap = SampleTap::new();
        let stop_requested = AtomicBool::new(true);
        let dump_all = AtomicBool::new(false);

        let config = ProcessingWorkerConfig {
            geometry,
            format: CaptureFormat::Signed16Bit,
            test_mode: false,
        };

        let result = run(
            &config,
            &disk_buffers,
            &mut conversion_buffers,
            writer,
            &sample_tap,
            &progress,
            &latch,
            &stop_requested,
            &dump_all,
        );
        assert_eq!(result, TransferResult::Success);
        assert_eq!(progress.snapshot().disk_buffers_written, 1);

        let mut contents = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents.len(), geometry.disk_buffer_size);
        std::fs::remove_file(&path).unwrap();
    }

    /// Builds a raw little-endian sample stream with an explicit marker per sample, independent
    /// of the 2^16 real-world cadence, so a small test buffer can still trip bootstrap detection.
    fn build_marked_stream(markers_and_values: &[(u8, u16)]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(markers_and_values.len() * 2);
        for &(marker, value) in markers_and_values {
            let word = (value & 0x3FF) | ((marker as u16 & 0x3F) << 10);
            buf.extend_from_slice(&word.to_le_bytes());
        }
        buf
    }

    #[test]
    fn sequence_mismatch_is_detected_and_latched() {
        // Bigger than `small_geometry`'s buffer so the marker flip at sample 10 (mirroring
        // `sequence::tests::strips_marker_bits_in_place`) lands well before bootstrap's scan
        // limit, and a later sample can still disagree with the now-synced counter.
        let geometry = CaptureGeometry::calculate(16, Some(48), 4 * 48, false, 0).unwrap();
        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();

        let samples_per_buffer = geometry.disk_buffer_size / 2;
        let mut samples: Vec<(u8, u16)> = (0..samples_per_buffer).map(|_| (0u8, 42u16)).collect();
        for entry in samples.iter_mut().skip(10) {
            entry.0 = 1;
        }
        // Corrupt the last sample's marker so it disagrees with the now-synced counter.
        samples.last_mut().unwrap().0 = 5;
        let stream = build_marked_stream(&samples);
        fill_buffer(&disk_buffers[0], &stream);

        let path = std::env::temp_dir().join(format!("capture-core-proc-err-{}.bin", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        let writer: Box<dyn DiskWriter> = Box::new(BlockingWriter::new(file));

        let conv_size = CaptureFormat::Signed16Bit.conversion_buffer_size(geometry.disk_buffer_size);
        let mut conversion_buffers = [vec![0u8; conv_size], vec![0u8; conv_size]];

        let progress = ProgressCell::new();
        let latch = ResultLatch::new(&progress);
        let sample_tap = SampleTap::new();
        let stop_requested = AtomicBool::new(false);
        let dump_all = AtomicBool::new(false);

        let config = ProcessingWorkerConfig {
            geometry,
            format: CaptureFormat::Signed16Bit,
            test_mode: false,
        };

        let result = run(
            &config,
            &disk_buffers,
            &mut conversion_buffers,
            writer,
            &sample_tap,
            &progress,
            &latch,
            &stop_requested,
            &dump_all,
        );
        assert_eq!(result, TransferResult::SequenceMismatch);
        assert_eq!(latch.current(), TransferResult::SequenceMismatch);
        std::fs::remove_file(&path).unwrap();
    }
}
