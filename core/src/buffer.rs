//! Disk buffer storage and the full/empty/poison handoff between the USB and processing
//! workers (spec §3 "DiskBuffer", §5 "Shared resources and mutation rules").
//!
//! Ordering invariants enforced by the callers in `transfer_worker`/`processing_worker` (buffers
//! produced and consumed strictly in index order; transfers within one buffer produced strictly
//! in offset order) are what make it sound for several in-flight transfers to write disjoint
//! byte ranges of the same buffer without a lock: no two transfers targeting the same buffer
//! ever overlap in their offset range, and the processing worker never reads a buffer until its
//! last transfer's completion set `full`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

/// Raw storage for one disk buffer. Interior mutability is `unsafe` because multiple USB
/// transfer completions write disjoint sub-slices concurrently; see the module invariant above.
pub struct DiskBufferStorage {
    data: UnsafeCell<Box<[u8]>>,
}

// SAFETY: callers of `slice_mut` only ever request disjoint, non-overlapping ranges while the
// buffer is in the `Filling` state (see `DiskBuffer`), and `as_slice` is only called by the
// processing worker after the buffer transitions to `Full`, by which point no writer holds a
// `slice_mut` borrow.
unsafe impl Sync for DiskBufferStorage {}

impl DiskBufferStorage {
    fn new(size: usize) -> Self {
        DiskBufferStorage {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        }
    }

    pub fn len(&self) -> usize {
        // SAFETY: length never changes after construction; reading it never aliases a writer.
        unsafe { (*self.data.get()).len() }
    }

    /// Returns a mutable view of `offset..offset+len`.
    ///
    /// # Safety
    /// The caller must ensure no other live reference (mutable or shared) overlaps this range
    /// for the duration of its use.
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        let base = (*self.data.get()).as_mut_ptr();
        std::slice::from_raw_parts_mut(base.add(offset), len)
    }

    /// Returns a shared view of the whole buffer. Valid only while the buffer is `Full` and no
    /// USB transfer still holds a `slice_mut` into it.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { &*self.data.get() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Empty,
    Full,
}

/// One disk buffer plus its full/empty handoff flag and a poison flag every wait checks first
/// (REDESIGN FLAGS: "a cleaner rewrite exposes a poison flag that every wait on a buffer checks
/// first, making the fan-out explicit" in place of the original's fire-then-clear dance).
pub struct DiskBuffer {
    pub storage: DiskBufferStorage,
    state: Mutex<BufferState>,
    condvar: Condvar,
    poisoned: AtomicBool,
}

/// Outcome of waiting on a disk buffer's flag.
pub enum Wait {
    Ready,
    Poisoned,
}

impl DiskBuffer {
    pub fn new(size: usize) -> Self {
        DiskBuffer {
            storage: DiskBufferStorage::new(size),
            state: Mutex::new(BufferState::Empty),
            condvar: Condvar::new(),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Forced-teardown escape hatch: releases every waiter on this buffer immediately (spec
    /// §4.2 step 4, §5 "Forced stop").
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        self.condvar.notify_all();
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Transitions `Empty -> Full`. A `Full -> Full` transition is a fatal `ProgramError`
    /// (spec §3 invariants) and is reported via the returned `bool` (`true` on success).
    pub fn mark_full(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == BufferState::Full {
            return false;
        }
        *state = BufferState::Full;
        self.condvar.notify_all();
        true
    }

    /// Non-blocking peek at the current state, used by the processing worker's graceful-stop
    /// check (spec §4.5 "either the current iteration's buffer is already full... or the buffer
    /// is empty") to decide without blocking whether there is still data to flush.
    pub fn is_full(&self) -> bool {
        *self.state.lock().unwrap() == BufferState::Full
    }

    /// Clears `full`, releasing the USB worker if it is waiting for this buffer to empty.
    pub fn mark_empty(&self) {
        let mut state = self.state.lock().unwrap();
        *state = BufferState::Empty;
        self.condvar.notify_all();
    }

    /// Blocks until this buffer is full or the capture is poisoned.
    pub fn wait_until_full(&self) -> Wait {
        if self.is_poisoned() {
            return Wait::Poisoned;
        }
        let mut state = self.state.lock().unwrap();
        while *state != BufferState::Full {
            if self.is_poisoned() {
                return Wait::Poisoned;
            }
            state = self.condvar.wait(state).unwrap();
        }
        Wait::Ready
    }

    /// Blocks until this buffer is empty or the capture is poisoned (spec §4.3 step 6: the USB
    /// worker waits for the writer to finish with a buffer before resubmitting into it).
    pub fn wait_until_empty(&self) -> Wait {
        if self.is_poisoned() {
            return Wait::Poisoned;
        }
        let mut state = self.state.lock().unwrap();
        while *state != BufferState::Empty {
            if self.is_poisoned() {
                return Wait::Poisoned;
            }
            state = self.condvar.wait(state).unwrap();
        }
        Wait::Ready
    }
}

/// One entry in the ring of in-flight USB requests (spec §3 "TransferSlot").
#[derive(Debug, Clone, Copy)]
pub struct TransferSlot {
    pub disk_buffer_index: usize,
    pub intra_buffer_offset: usize,
    pub len: usize,
    pub last_in_buffer: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_to_full_transition_is_rejected() {
        let buf = DiskBuffer::new(16);
        assert!(buf.mark_full());
        assert!(!buf.mark_full());
    }

    #[test]
    fn is_full_reflects_state_without_blocking() {
        let buf = DiskBuffer::new(16);
        assert!(!buf.is_full());
        buf.mark_full();
        assert!(buf.is_full());
        buf.mark_empty();
        assert!(!buf.is_full());
    }

    #[test]
    fn poison_releases_both_waiter_polarities() {
        let buf = DiskBuffer::new(16);
        buf.poison();
        assert!(matches!(buf.wait_until_full(), Wait::Poisoned));
        assert!(matches!(buf.wait_until_empty(), Wait::Poisoned));
    }

    #[test]
    fn disjoint_slices_do_not_alias() {
        let storage = DiskBufferStorage::new(8);
        unsafe {
            let a = storage.slice_mut(0, 4);
            let b = storage.slice_mut(4, 4);
            a[0] = 1;
            b[0] = 2;
        }
        assert_eq!(storage.as_slice(), &[1, 0, 0, 0, 2, 0, 0, 0]);
    }
}
