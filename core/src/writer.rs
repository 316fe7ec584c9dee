//! Disk writer capability (spec §4.6, §9 REDESIGN FLAGS "Platform-conditional overlapped I/O...
//! A correct design offers two writer implementations behind a capability interface
//! (submit+collect), selected at runtime; the blocking mode is a trivial implementation (submit
//! waits, collect returns immediately)").

use std::fs::File;
use std::io::Write;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

/// A pointer+length pair submitted for writing. `Send` under the same contract as
/// `usb::TransferTarget`: the caller guarantees the pointee stays valid and unmodified until
/// the matching `collect()` returns.
pub struct WriteTarget {
    pub ptr: *const u8,
    pub len: usize,
}

unsafe impl Send for WriteTarget {}

/// Submit+collect capability for writing one converted disk buffer to the capture file.
pub trait DiskWriter: Send {
    /// Submits `target` for writing. Blocking implementations write synchronously before
    /// returning; overlapped implementations queue the write and return immediately.
    ///
    /// # Safety
    /// `target.ptr[..target.len]` must stay valid and unchanged until the matching `collect()`
    /// call returns.
    unsafe fn submit(&mut self, target: WriteTarget) -> anyhow::Result<()>;

    /// Collects the result of the previously submitted write. A no-op returning `Ok(())`
    /// immediately if nothing is outstanding.
    fn collect(&mut self) -> anyhow::Result<()>;

    /// Cancels any outstanding write without necessarily waiting for it to land on disk (spec
    /// §4.6: "cancel any outstanding I/O on the file" on a write failure or forced abort).
    fn cancel_outstanding(&mut self);

    fn bytes_written(&self) -> u64;
}

/// Trivial implementation: `submit` writes synchronously, `collect` is a no-op.
pub struct BlockingWriter {
    file: File,
    bytes_written: u64,
}

impl BlockingWriter {
    pub fn new(file: File) -> Self {
        BlockingWriter {
            file,
            bytes_written: 0,
        }
    }
}

impl DiskWriter for BlockingWriter {
    unsafe fn submit(&mut self, target: WriteTarget) -> anyhow::Result<()> {
        let data = std::slice::from_raw_parts(target.ptr, target.len);
        self.file.write_all(data)?;
        self.bytes_written += target.len as u64;
        Ok(())
    }

    fn collect(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn cancel_outstanding(&mut self) {}

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

struct WriteJob {
    ptr: *const u8,
    len: usize,
}
unsafe impl Send for WriteJob {}

/// Submits writes on a background thread and collects the *previous* submission's result on
/// the next call, letting one buffer be written while the next is converted (spec §4.6
/// "Overlapped mode"). The two alternating conversion buffers that make this safe without
/// copying live in `processing_worker`, not here.
pub struct OverlappedWriter {
    job_tx: Sender<WriteJob>,
    result_rx: Receiver<anyhow::Result<usize>>,
    worker: Option<thread::JoinHandle<()>>,
    outstanding: bool,
    bytes_written: u64,
}

impl OverlappedWriter {
    pub fn new(mut file: File) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<WriteJob>();
        let (result_tx, result_rx) = mpsc::channel::<anyhow::Result<usize>>();

        let worker = thread::spawn(move || {
            while let Ok(job) = job_rx.recv() {
                // SAFETY: the submitter upholds `WriteTarget`'s validity contract for the
                // lifetime of this write.
                let data = unsafe { std::slice::from_raw_parts(job.ptr, job.len) };
                let result = file
                    .write_all(data)
                    .map(|_| job.len)
                    .map_err(anyhow::Error::from);
                if result_tx.send(result).is_err() {
                    return;
                }
            }
        });

        OverlappedWriter {
            job_tx,
            result_rx,
            worker: Some(worker),
            outstanding: false,
            bytes_written: 0,
        }
    }
}

impl DiskWriter for OverlappedWriter {
    unsafe fn submit(&mut self, target: WriteTarget) -> anyhow::Result<()> {
        self.job_tx.send(WriteJob {
            ptr: target.ptr,
            len: target.len,
        })?;
        self.outstanding = true;
        Ok(())
    }

    fn collect(&mut self) -> anyhow::Result<()> {
        if !self.outstanding {
            return Ok(());
        }
        self.outstanding = false;
        match self.result_rx.recv() {
            Ok(Ok(n)) => {
                self.bytes_written += n as u64;
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => anyhow::bail!("overlapped writer thread terminated unexpectedly"),
        }
    }

    fn cancel_outstanding(&mut self) {
        if self.outstanding {
            let _ = self.result_rx.recv();
            self.outstanding = false;
        }
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl Drop for OverlappedWriter {
    fn drop(&mut self) {
        self.cancel_outstanding();
        if let Some(worker) = self.worker.take() {
            drop(self.job_tx.clone());
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn blocking_writer_writes_synchronously() {
        let path = std::env::temp_dir().join(format!("capture-core-test-{}.bin", std::process::id()));
        let file = File::create(&path).unwrap();
        let mut writer = BlockingWriter::new(file);
        let data = vec![1u8, 2, 3, 4];
        unsafe {
            writer
                .submit(WriteTarget {
                    ptr: data.as_ptr(),
                    len: data.len(),
                })
                .unwrap();
        }
        writer.collect().unwrap();
        assert_eq!(writer.bytes_written(), 4);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn overlapped_writer_collects_previous_submission() {
        let path = std::env::temp_dir().join(format!("capture-core-test-ovl-{}.bin", std::process::id()));
        let file = File::create(&path).unwrap();
        let mut writer = OverlappedWriter::new(file);

        let first = vec![1u8, 2, 3];
        let second = vec![4u8, 5, 6, 7];

        unsafe {
            writer
                .submit(WriteTarget {
                    ptr: first.as_ptr(),
                    len: first.len(),
                })
                .unwrap();
        }
        writer.collect().unwrap();
        unsafe {
            writer
                .submit(WriteTarget {
                    ptr: second.as_ptr(),
                    len: second.len(),
                })
                .unwrap();
        }
        writer.collect().unwrap();

        assert_eq!(writer.bytes_written(), 7);
        drop(writer);

        let mut contents = Vec::new();
        File::open(&path).unwrap().read_to_end(&mut contents).unwrap();
        assert_eq!(contents, [1, 2, 3, 4, 5, 6, 7]);
        std::fs::remove_file(&path).unwrap();
    }
}
