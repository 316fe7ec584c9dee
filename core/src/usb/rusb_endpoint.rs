//! `rusb`/libusb-backed implementation of [`BulkInEndpoint`].
//!
//! Grounded on `tool/src/usb_device.rs`'s device-open and endpoint-discovery sequence (same
//! vendor/product lookup, `claim_interface`, bulk endpoint scan) and on
//! `UsbDeviceLibUsb.cpp`'s `SendVendorSpecificCommand` (control transfer type `0x40`, no data
//! stage) from the original implementation.
//!
//! `rusb`'s safe API only exposes synchronous bulk transfers, not libusb's asynchronous
//! transfer queue directly. Spec §4.1 allows either "endpoint owns its own dispatch thread" or
//! a pump model; this backend realizes the asynchronous fleet of pre-queued transfers as a
//! small fixed pool of reader threads, each performing a blocking `read_bulk` call per submitted
//! slot and reporting the result back through a channel that `drain` pumps. Timeouts are
//! disabled (`Duration::ZERO`, which libusb treats as "wait forever"), matching spec §5's "the
//! abstract transfer has no per-request timeout".

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use rusb::{Direction, TransferType, UsbContext};

use super::endpoint::{BulkInEndpoint, Completion, CompletionStatus, EndpointInfo, SlotHandle, TransferTarget};

const READER_POOL_SIZE: usize = 8;

struct ReadJob {
    slot: SlotHandle,
    ptr: *mut u8,
    len: usize,
}

// SAFETY: see `TransferTarget`; the submitter guarantees exclusive ownership of the pointee
// until the matching completion is observed.
unsafe impl Send for ReadJob {}

pub struct RusbEndpoint {
    vendor_id: u16,
    product_id: u16,
    handle: Option<Arc<rusb::DeviceHandle<rusb::Context>>>,
    endpoint_in: u8,
    job_tx: Option<Sender<ReadJob>>,
    completion_rx: Option<Mutex<Receiver<Completion>>>,
    cancelled: Arc<Mutex<HashSet<SlotHandle>>>,
    workers: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl RusbEndpoint {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        RusbEndpoint {
            vendor_id,
            product_id,
            handle: None,
            endpoint_in: 0,
            job_tx: None,
            completion_rx: None,
            cancelled: Arc::new(Mutex::new(HashSet::new())),
            workers: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn find_device(
        context: &rusb::Context,
        vendor_id: u16,
        product_id: u16,
        preferred_device_path: Option<&str>,
    ) -> anyhow::Result<rusb::Device<rusb::Context>> {
        let devices = context.devices().context("Failed to enumerate USB devices")?;
        let mut matching = Vec::new();
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            if desc.vendor_id() == vendor_id && desc.product_id() == product_id {
                matching.push(device);
            }
        }

        if matching.is_empty() {
            bail!("No matching capture device found");
        }

        if let Some(path) = preferred_device_path {
            for device in &matching {
                let bus = device.bus_number();
                let address = device.address();
                if format!("{bus}-{address}") == path {
                    return Ok(device.clone());
                }
            }
        }

        Ok(matching.into_iter().next().unwrap())
    }
}

impl Drop for RusbEndpoint {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.job_tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl BulkInEndpoint for RusbEndpoint {
    fn connect(&mut self, preferred_device_path: Option<&str>) -> anyhow::Result<EndpointInfo> {
        let context = rusb::Context::new().context("Failed to initialise libusb context")?;
        let device = Self::find_device(&context, self.vendor_id, self.product_id, preferred_device_path)?;

        let mut handle = device.open().context("Failed to open capture device")?;
        // This seems to be optional for Linux but is required for Windows.
        handle
            .claim_interface(0)
            .context("Failed to claim USB interface")?;

        let config_desc = device
            .config_descriptor(0)
            .context("Failed to read device configuration descriptor")?;

        let mut endpoint_in = None;
        let mut max_packet_size_bytes = 0usize;
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                for endpoint_desc in interface_desc.endpoint_descriptors() {
                    if endpoint_desc.direction() == Direction::In
                        && endpoint_desc.transfer_type() == TransferType::Bulk
                    {
                        endpoint_in = Some(endpoint_desc.address());
                        max_packet_size_bytes = endpoint_desc.max_packet_size() as usize;
                    }
                }
            }
        }
        let endpoint_in = endpoint_in.context("Bulk IN endpoint missing from device descriptor")?;

        let handle = Arc::new(handle);
        self.handle = Some(handle.clone());
        self.endpoint_in = endpoint_in;

        let (job_tx, job_rx) = mpsc::channel::<ReadJob>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (completion_tx, completion_rx) = mpsc::channel::<Completion>();

        for _ in 0..READER_POOL_SIZE {
            let job_rx = job_rx.clone();
            let completion_tx = completion_tx.clone();
            let handle = handle.clone();
            let cancelled = self.cancelled.clone();
            let shutdown = self.shutdown.clone();
            self.workers.push(thread::spawn(move || {
                reader_loop(job_rx, completion_tx, handle, endpoint_in, cancelled, shutdown)
            }));
        }

        self.job_tx = Some(job_tx);
        self.completion_rx = Some(Mutex::new(completion_rx));

        Ok(EndpointInfo {
            max_packet_size_bytes,
            // libusb exposes no portable single-transfer maximum; the core falls back to its
            // own conservative 2 MiB cap (spec §4.1, and `UsbDeviceLibUsb::CalculateDesiredBufferCountAndSize`).
            max_single_transfer_bytes: None,
        })
    }

    unsafe fn submit(&self, slot: SlotHandle, target: TransferTarget) -> anyhow::Result<()> {
        let job_tx = self
            .job_tx
            .as_ref()
            .context("submit() called before connect()")?;
        job_tx
            .send(ReadJob {
                slot,
                ptr: target.ptr,
                len: target.len,
            })
            .map_err(|_| anyhow::anyhow!("USB reader pool has shut down"))
    }

    fn cancel(&self, slot: SlotHandle) {
        self.cancelled.lock().unwrap().insert(slot);
    }

    fn drain(&self, timeout: Duration) -> Vec<Completion> {
        let Some(rx) = &self.completion_rx else {
            return Vec::new();
        };
        let rx = rx.lock().unwrap();
        let mut completions = Vec::new();
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() && !completions.is_empty() {
                break;
            }
            match rx.recv_timeout(remaining.max(Duration::from_millis(1))) {
                Ok(completion) => completions.push(completion),
                Err(_) => break,
            }
            if std::time::Instant::now() >= deadline {
                break;
            }
        }
        completions
    }

    fn send_vendor_command(&self, request_code: u8, value: u16) -> anyhow::Result<()> {
        let handle = self
            .handle
            .as_ref()
            .context("send_vendor_command() called before connect()")?;
        let request_type = rusb::request_type(
            rusb::Direction::Out,
            rusb::RequestType::Vendor,
            rusb::Recipient::Device,
        );
        handle
            .write_control(request_type, request_code, value, 0, &[], Duration::ZERO)
            .context("Vendor control transfer failed")?;
        Ok(())
    }
}

fn reader_loop(
    job_rx: Arc<Mutex<Receiver<ReadJob>>>,
    completion_tx: Sender<Completion>,
    handle: Arc<rusb::DeviceHandle<rusb::Context>>,
    endpoint_in: u8,
    cancelled: Arc<Mutex<HashSet<SlotHandle>>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        let job = {
            let rx = job_rx.lock().unwrap();
            rx.recv_timeout(Duration::from_millis(200))
        };
        let job = match job {
            Ok(job) => job,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => return,
        };

        if cancelled.lock().unwrap().remove(&job.slot) {
            let _ = completion_tx.send(Completion {
                slot: job.slot,
                status: CompletionStatus::Cancelled,
                bytes_transferred: 0,
            });
            continue;
        }

        // SAFETY: the submitter guarantees `job.ptr[..job.len]` is valid and exclusively owned
        // by this transfer until the completion below is observed.
        let buf = unsafe { std::slice::from_raw_parts_mut(job.ptr, job.len) };
        let result = handle.read_bulk(endpoint_in, buf, Duration::ZERO);

        let completion = match result {
            Ok(n) if n == job.len => Completion {
                slot: job.slot,
                status: CompletionStatus::Completed,
                bytes_transferred: n,
            },
            Ok(n) => Completion {
                slot: job.slot,
                status: CompletionStatus::Failed,
                bytes_transferred: n,
            },
            Err(_) => Completion {
                slot: job.slot,
                status: CompletionStatus::Failed,
                bytes_transferred: 0,
            },
        };
        let _ = completion_tx.send(completion);
    }
}
