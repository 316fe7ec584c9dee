//! Abstract bulk-IN endpoint capability (spec §4.1). Consumed, not implemented, by the two
//! worker stages; implemented by [`super::rusb_endpoint::RusbEndpoint`] for real hardware and
//! [`super::simulated::SimulatedEndpoint`] for the property/scenario tests in spec §8.

use std::time::Duration;

/// Identifies one in-flight submission to `drain`'s caller. Corresponds 1:1 with a
/// `crate::buffer::TransferSlot` index.
pub type SlotHandle = usize;

#[derive(Debug, Clone, Copy)]
pub struct EndpointInfo {
    pub max_packet_size_bytes: usize,
    /// `None` when the backend exposes no hard single-transfer limit; the core then falls back
    /// to the conservative 2 MiB cap (spec §4.1).
    pub max_single_transfer_bytes: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Completed,
    Cancelled,
    /// Covers both a hard transfer error and a short read ("short reads are reported as
    /// failure", spec §4.1 and §9 Open Questions).
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub slot: SlotHandle,
    pub status: CompletionStatus,
    pub bytes_transferred: usize,
}

/// A raw pointer+length pair, `Send` because the caller guarantees the pointed-to memory
/// outlives the transfer and is exclusively owned by it until the matching completion is
/// drained (the same invariant `buffer::DiskBufferStorage::slice_mut` documents).
pub struct TransferTarget {
    pub ptr: *mut u8,
    pub len: usize,
}

unsafe impl Send for TransferTarget {}

/// The capability set spec §4.1 requires of a bulk-IN endpoint.
pub trait BulkInEndpoint: Send {
    fn connect(&mut self, preferred_device_path: Option<&str>) -> anyhow::Result<EndpointInfo>;

    /// Schedules an asynchronous read of exactly `target.len` bytes into `target.ptr`.
    /// Completion is reported later through `drain`, not via a callback parameter, matching
    /// idiomatic Rust ownership better than the original's `std::function` callback while
    /// preserving "fires exactly once, asynchronously" semantics.
    ///
    /// # Safety
    /// `target.ptr` must remain valid and written only by this transfer until its completion is
    /// observed via `drain`.
    unsafe fn submit(&self, slot: SlotHandle, target: TransferTarget) -> anyhow::Result<()>;

    /// Requests cancellation of `slot`. Completion still fires, with `CompletionStatus::Cancelled`
    /// (best-effort: a transfer already fully complete may still report `Completed`).
    fn cancel(&self, slot: SlotHandle);

    /// Processes completions that arrive within `timeout`, returning however many were ready.
    /// Never blocks past `timeout`; may return an empty vector.
    fn drain(&self, timeout: Duration) -> Vec<Completion>;

    fn send_vendor_command(&self, request_code: u8, value: u16) -> anyhow::Result<()>;
}

/// Vendor request codes and the configuration bit field (spec §4.8).
pub mod vendor {
    pub const START_COLLECTION: u8 = 0xB5;
    pub const STOP_COLLECTION: u8 = 0xB5;
    pub const CONFIGURE: u8 = 0xB6;

    pub const START_VALUE: u16 = 1;
    pub const STOP_VALUE: u16 = 0;

    pub const CONFIG_TEST_PATTERN: u16 = 1 << 0;
    pub const CONFIG_PAL: u16 = 1 << 1;
    pub const CONFIG_DC_OFFSET_COMPENSATION: u16 = 1 << 2;
}
