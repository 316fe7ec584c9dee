//! Capture Controller (spec §4.2): the single coordinating actor that opens the device, sizes
//! and pins the buffer ring, elevates scheduling priority, starts the two worker stages,
//! monitors their health, and publishes the final [`TransferResult`].

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::buffer::DiskBuffer;
use crate::error::{StartError, TransferResult};
use crate::format::CaptureFormat;
use crate::geometry::CaptureGeometry;
use crate::pinning::{self, PinGuard};
use crate::priority;
use crate::processing_worker::{self, ProcessingWorkerConfig};
use crate::progress::{CaptureProgress, ProgressCell, ResultLatch};
use crate::sample_tap::SampleTap;
use crate::transfer_worker::{self, TransferWorkerConfig};
use crate::usb::vendor;
use crate::usb::BulkInEndpoint;
use crate::writer::{BlockingWriter, DiskWriter, OverlappedWriter};

const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Parameters for one `start()` call (spec §4.2's `start` parameter list).
pub struct StartOptions {
    pub file_path: PathBuf,
    pub format: CaptureFormat,
    pub preferred_device_path: Option<String>,
    pub test_mode: bool,
    pub use_small_transfers: bool,
    pub use_overlapped_io: bool,
    pub usb_queue_bytes: usize,
    pub disk_queue_bytes: usize,
}

/// One capture per process (spec §6 "Orchestrator-facing API": one-shot, start → stop → start
/// again is supported, overlapping captures are not).
pub struct CaptureController {
    progress: Arc<ProgressCell>,
    sample_tap: Arc<SampleTap>,
    running: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    dump_all: Arc<AtomicBool>,
    controller_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CaptureController {
    pub fn new() -> Self {
        CaptureController {
            progress: Arc::new(ProgressCell::new()),
            sample_tap: Arc::new(SampleTap::new()),
            running: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            dump_all: Arc::new(AtomicBool::new(false)),
            controller_thread: Mutex::new(None),
        }
    }

    pub fn in_progress(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> CaptureProgress {
        self.progress.snapshot()
    }

    pub fn result(&self) -> TransferResult {
        self.progress.snapshot().result
    }

    pub fn queue_buffer_sample(&self, n_bytes: usize) {
        self.sample_tap.queue_request(n_bytes);
    }

    pub fn poll_buffer_sample(&self) -> Option<Vec<u8>> {
        self.sample_tap.poll()
    }

    /// Connects to `endpoint`, sizes and pins the buffer ring, opens the output file, and spawns
    /// the controller thread. Returns synchronously; the capture itself runs in the background.
    pub fn start(
        &self,
        mut endpoint: Box<dyn BulkInEndpoint>,
        options: StartOptions,
    ) -> Result<(), StartError> {
        if self.running.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(StartError::AlreadyRunning);
        }

        let result = self.try_start(&mut *endpoint, &options);

        match result {
            Ok((geometry, disk_buffers, writer)) => {
                self.progress.reset();
                self.stop_requested.store(false, Ordering::SeqCst);
                self.dump_all.store(false, Ordering::SeqCst);

                let endpoint: Arc<dyn BulkInEndpoint> = Arc::from(endpoint);
                let config_bits = configure_bits(options.test_mode);
                if let Err(e) = endpoint
                    .send_vendor_command(vendor::CONFIGURE, config_bits)
                    .and_then(|_| endpoint.send_vendor_command(vendor::START_COLLECTION, vendor::START_VALUE))
                {
                    self.running.store(false, Ordering::SeqCst);
                    return Err(StartError::Connection(e));
                }

                self.spawn_controller_thread(geometry, disk_buffers, endpoint, options.format, options.test_mode, writer);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    fn try_start(
        &self,
        endpoint: &mut dyn BulkInEndpoint,
        options: &StartOptions,
    ) -> Result<(CaptureGeometry, Arc<Vec<DiskBuffer>>, Box<dyn DiskWriter>), StartError> {
        let info = endpoint
            .connect(options.preferred_device_path.as_deref())
            .map_err(StartError::Connection)?;

        let geometry = CaptureGeometry::calculate(
            info.max_packet_size_bytes,
            info.max_single_transfer_bytes,
            options.disk_queue_bytes,
            options.use_small_transfers,
            options.usb_queue_bytes,
        )?;

        let file = File::create(&options.file_path).map_err(|e| StartError::FileCreation(e.into()))?;
        let writer: Box<dyn DiskWriter> = if options.use_overlapped_io {
            Box::new(OverlappedWriter::new(file))
        } else {
            Box::new(BlockingWriter::new(file))
        };

        let disk_buffers: Vec<DiskBuffer> = (0..geometry.disk_buffer_count)
            .map(|_| DiskBuffer::new(geometry.disk_buffer_size))
            .collect();

        Ok((geometry, Arc::new(disk_buffers), writer))
    }

    fn spawn_controller_thread(
        &self,
        geometry: CaptureGeometry,
        disk_buffers: Arc<Vec<DiskBuffer>>,
        endpoint: Arc<dyn BulkInEndpoint>,
        format: CaptureFormat,
        test_mode: bool,
        writer: Box<dyn DiskWriter>,
    ) {
        let progress = self.progress.clone();
        let sample_tap = self.sample_tap.clone();
        let running = self.running.clone();
        let stop_requested = self.stop_requested.clone();
        let dump_all = self.dump_all.clone();

        let handle = thread::spawn(move || {
            let pin_guards = pin_all(&disk_buffers);
            let (_priority_guard, priority_result) = priority::elevate_current_thread();
            if let Err(e) = priority_result {
                eprintln!("capture-core: priority elevation failed: {e}");
            }

            let usb_handle = {
                let disk_buffers = disk_buffers.clone();
                let endpoint = endpoint.clone();
                let progress = progress.clone();
                let stop_requested = stop_requested.clone();
                let dump_all = dump_all.clone();
                thread::spawn(move || {
                    let latch = ResultLatch::new(&progress);
                    let config = TransferWorkerConfig::new(geometry);
                    transfer_worker::run(
                        &config,
                        &disk_buffers,
                        endpoint.as_ref(),
                        &progress,
                        &latch,
                        &stop_requested,
                        &dump_all,
                    )
                })
            };

            let processing_handle = {
                let disk_buffers = disk_buffers.clone();
                let progress = progress.clone();
                let sample_tap = sample_tap.clone();
                let stop_requested = stop_requested.clone();
                let dump_all = dump_all.clone();
                thread::spawn(move || {
                    let conv_size = format.conversion_buffer_size(geometry.disk_buffer_size);
                    let mut conversion_buffers = [vec![0u8; conv_size], vec![0u8; conv_size]];
                    let _conversion_pins: Vec<PinGuard> = conversion_buffers
                        .iter()
                        .map(|buf| {
                            let (guard, result) = pinning::pin(buf.as_ptr(), buf.len());
                            if let Err(e) = result {
                                eprintln!("capture-core: failed to pin conversion buffer: {e}");
                            }
                            guard
                        })
                        .collect();

                    let latch = ResultLatch::new(&progress);
                    let config = ProcessingWorkerConfig {
                        geometry,
                        format,
                        test_mode,
                    };
                    processing_worker::run(
                        &config,
                        &disk_buffers,
                        &mut conversion_buffers,
                        writer,
                        &sample_tap,
                        &progress,
                        &latch,
                        &stop_requested,
                        &dump_all,
                    )
                })
            };

            // Watchdog: escalate to a forced abort the moment either worker latches a failure
            // while the other is still running, so the survivor isn't stuck waiting on a disk
            // buffer flag the dead worker will never flip again (spec §4.2 step 4).
            let latch = ResultLatch::new(&progress);
            loop {
                let usb_done = usb_handle.is_finished();
                let processing_done = processing_handle.is_finished();
                if usb_done && processing_done {
                    break;
                }
                if latch.current() != TransferResult::Running && !dump_all.load(Ordering::SeqCst) {
                    stop_requested.store(true, Ordering::SeqCst);
                    dump_all.store(true, Ordering::SeqCst);
                    for buffer in disk_buffers.iter() {
                        buffer.poison();
                    }
                }
                thread::sleep(WATCHDOG_POLL_INTERVAL);
            }

            let _ = usb_handle.join();
            let _ = processing_handle.join();
            latch.latch(TransferResult::Success);

            let _ = endpoint.send_vendor_command(vendor::STOP_COLLECTION, vendor::STOP_VALUE);

            drop(pin_guards);
            running.store(false, Ordering::SeqCst);
        });

        *self.controller_thread.lock().unwrap() = Some(handle);
    }

    /// Idempotent graceful stop (spec §4.2 `stop()`): signals cooperative shutdown and blocks
    /// until the controller thread has fully unwound.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.controller_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for CaptureController {
    fn default() -> Self {
        Self::new()
    }
}

fn configure_bits(test_mode: bool) -> u16 {
    if test_mode {
        vendor::CONFIG_TEST_PATTERN
    } else {
        0
    }
}

fn pin_all(disk_buffers: &[DiskBuffer]) -> Vec<PinGuard> {
    disk_buffers
        .iter()
        .map(|buffer| {
            let (guard, result) = pinning::pin(buffer.storage.as_slice().as_ptr(), buffer.storage.len());
            if let Err(e) = result {
                eprintln!("capture-core: failed to pin disk buffer: {e}");
            }
            guard
        })
        .collect()
}
