//! Host-side capture pipeline for a LaserDisc RF digitizer: pulls raw samples off a USB bulk-IN
//! endpoint, validates and converts them, and writes the result to disk, while publishing
//! progress counters and a one-shot start/stop control surface to a caller-supplied UI.

pub mod buffer;
pub mod controller;
pub mod error;
pub mod format;
pub mod geometry;
pub mod pinning;
pub mod priority;
pub mod processing_worker;
pub mod progress;
pub mod sample_tap;
pub mod sequence;
pub mod transfer_worker;
pub mod usb;
pub mod writer;

pub use controller::{CaptureController, StartOptions};
pub use error::{StartError, TransferResult};
pub use format::CaptureFormat;
pub use geometry::CaptureGeometry;
pub use progress::CaptureProgress;
pub use usb::{BulkInEndpoint, EndpointInfo, RusbEndpoint, SimulatedEndpoint};
pub use writer::{BlockingWriter, DiskWriter, OverlappedWriter};
