use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use capture_core::{
    CaptureController, CaptureFormat, RusbEndpoint, StartOptions, TransferResult,
};
use clap::Parser;

/// Domesday Duplicator RF capture device, per the FX3 firmware descriptor.
const DEVICE_VENDOR_ID: u16 = 0x1d50;
const DEVICE_PRODUCT_ID: u16 = 0x603b;

const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(author, about, long_about = None)]
struct Args {
    /// Destination file for the captured RF samples.
    output: PathBuf,

    /// Output packing: 16 (signed 16-bit), 10 (unsigned 10-bit), 10-4 (4:1 decimated 10-bit).
    #[arg(short, long, default_value = "16")]
    format: OutputFormat,

    /// Run the capture against the device's on-board test pattern instead of real RF input.
    #[arg(short, long, default_value_t = false)]
    test_mode: bool,

    /// Use many small USB transfers per disk buffer instead of one large transfer.
    #[arg(short = 's', long, default_value_t = false)]
    small_transfers: bool,

    /// Use overlapped (background-thread) disk writes instead of blocking writes.
    #[arg(short = 'o', long, default_value_t = false)]
    overlapped_io: bool,

    /// Total USB in-flight queue size in bytes, used only with `--small-transfers`.
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    usb_queue_bytes: usize,

    /// Total disk buffer queue size in bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    disk_queue_bytes: usize,

    /// Stop the capture automatically after this many seconds (0 = run until Ctrl-C).
    #[arg(long, default_value_t = 0)]
    duration_secs: u64,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[value(name = "16")]
    Signed16,
    #[value(name = "10")]
    Unsigned10,
    #[value(name = "10-4")]
    Unsigned10Decimated,
}

impl From<OutputFormat> for CaptureFormat {
    fn from(value: OutputFormat) -> Self {
        match value {
            OutputFormat::Signed16 => CaptureFormat::Signed16Bit,
            OutputFormat::Unsigned10 => CaptureFormat::Unsigned10Bit,
            OutputFormat::Unsigned10Decimated => CaptureFormat::Unsigned10Bit4to1Decimation,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let endpoint = Box::new(RusbEndpoint::new(DEVICE_VENDOR_ID, DEVICE_PRODUCT_ID));
    let options = StartOptions {
        file_path: args.output.clone(),
        format: args.format.into(),
        preferred_device_path: None,
        test_mode: args.test_mode,
        use_small_transfers: args.small_transfers,
        use_overlapped_io: args.overlapped_io,
        usb_queue_bytes: args.usb_queue_bytes,
        disk_queue_bytes: args.disk_queue_bytes,
    };

    let controller = CaptureController::new();
    controller
        .start(endpoint, options)
        .context("failed to start capture")?;

    println!("capture started, writing to {}", args.output.display());

    let deadline = (args.duration_secs > 0)
        .then(|| std::time::Instant::now() + Duration::from_secs(args.duration_secs));

    while controller.in_progress() {
        thread::sleep(PROGRESS_POLL_INTERVAL);
        let snapshot = controller.snapshot();
        println!(
            "buffers={} bytes={} min={} max={} clipped_lo={} clipped_hi={}",
            snapshot.disk_buffers_written,
            snapshot.bytes_written,
            snapshot.min_sample,
            snapshot.max_sample,
            snapshot.clipped_min_count,
            snapshot.clipped_max_count,
        );
        if deadline.is_some_and(|d| std::time::Instant::now() >= d) {
            println!("requested duration elapsed, stopping");
            controller.stop();
            break;
        }
    }

    match controller.result() {
        TransferResult::Success => {
            println!("capture finished successfully");
            Ok(())
        }
        other => bail!("capture ended with error: {other}"),
    }
}
