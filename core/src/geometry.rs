//! Disk-buffer and USB-transfer sizing (spec §4.4, §4.3 "Sizing").

use crate::error::StartError;

/// 2 MiB cap used when the backend exposes no hard single-transfer limit (spec §4.1).
const CONSERVATIVE_TRANSFER_CAP: usize = 2 * 1024 * 1024;
const SMALL_TRANSFER_TARGET: usize = 128 * 1024;

/// Derived sizing for one capture: how many disk buffers, how big, and how USB transfers are
/// split across them. Computed once in `CaptureController::start` and shared read-only by both
/// worker threads.
#[derive(Debug, Clone, Copy)]
pub struct CaptureGeometry {
    pub disk_buffer_size: usize,
    pub disk_buffer_count: usize,
    pub transfer_size: usize,
    pub transfers_per_disk_buffer: usize,
    pub disk_buffer_transfer_span: usize,
    pub simultaneous_transfers: usize,
}

impl CaptureGeometry {
    /// Computes `diskBufferSize`/`diskBufferCount` per spec §4.4, then the transfer split per
    /// §4.3 depending on `use_small_transfers`.
    pub fn calculate(
        max_packet_size_bytes: usize,
        max_single_transfer_bytes: Option<usize>,
        disk_queue_bytes: usize,
        use_small_transfers: bool,
        usb_queue_bytes: usize,
    ) -> Result<Self, StartError> {
        let cap = max_single_transfer_bytes
            .unwrap_or(CONSERVATIVE_TRANSFER_CAP)
            .min(CONSERVATIVE_TRANSFER_CAP);
        let disk_buffer_size = (cap / max_packet_size_bytes) * max_packet_size_bytes;
        let disk_buffer_count = disk_queue_bytes / disk_buffer_size;

        if disk_buffer_count < 3 {
            return Err(StartError::UsbMemoryLimit { disk_buffer_count });
        }

        let (transfer_size, transfers_per_disk_buffer, disk_buffer_transfer_span) =
            if !use_small_transfers {
                (disk_buffer_size, 1, disk_buffer_count - 1)
            } else {
                let transfer_size =
                    (SMALL_TRANSFER_TARGET / max_packet_size_bytes) * max_packet_size_bytes;
                let transfers_per_disk_buffer = disk_buffer_size / transfer_size;
                let span = (usb_queue_bytes / disk_buffer_size).min(disk_buffer_count - 2);
                (transfer_size, transfers_per_disk_buffer, span)
            };

        Ok(CaptureGeometry {
            disk_buffer_size,
            disk_buffer_count,
            transfer_size,
            transfers_per_disk_buffer,
            disk_buffer_transfer_span,
            simultaneous_transfers: transfers_per_disk_buffer * disk_buffer_transfer_span,
        })
    }

    /// Number of initial completions to discard during fleet warmup (spec §4.3 "Startup warmup").
    pub fn warmup_completions(&self) -> usize {
        self.disk_buffer_count.min(4) * self.transfers_per_disk_buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_transfer_per_buffer_when_small_transfers_disabled() {
        let geo = CaptureGeometry::calculate(512, None, 256 * 1024 * 1024, false, 0).unwrap();
        assert_eq!(geo.disk_buffer_size, 2 * 1024 * 1024);
        assert_eq!(geo.disk_buffer_count, 128);
        assert_eq!(geo.transfers_per_disk_buffer, 1);
        assert_eq!(geo.disk_buffer_transfer_span, 127);
        assert_eq!(geo.simultaneous_transfers, 127);
    }

    #[test]
    fn small_transfers_split_each_buffer() {
        let geo =
            CaptureGeometry::calculate(512, None, 256 * 1024 * 1024, true, 16 * 1024 * 1024)
                .unwrap();
        assert_eq!(geo.transfer_size, 128 * 1024);
        assert_eq!(geo.transfers_per_disk_buffer, 16);
        assert_eq!(geo.disk_buffer_transfer_span, 8);
        assert_eq!(geo.simultaneous_transfers, 128);
    }

    #[test]
    fn too_few_buffers_is_rejected() {
        let result = CaptureGeometry::calculate(512, None, 2 * 1024 * 1024, false, 0);
        assert!(matches!(result, Err(StartError::UsbMemoryLimit { .. })));
    }

    #[test]
    fn respects_backend_transfer_limit() {
        let geo = CaptureGeometry::calculate(512, Some(512 * 1024), 32 * 1024 * 1024, false, 0)
            .unwrap();
        assert_eq!(geo.disk_buffer_size, 512 * 1024);
    }
}
