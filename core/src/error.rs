use std::fmt;

macro_rules! program_flow_error {
    () => {
        format!("Program flow error at {}:{}", file!(), line!())
    };
}

macro_rules! index_out_of_bounds {
    () => {
        format!("Slice Index out of bounds at {}:{}", file!(), line!())
    };
}

macro_rules! ensure_index {
    ($a:ident [ $b:expr ]) => {
        *$a.get($b).with_context(|| index_out_of_bounds!())?
    };
}

pub(crate) use ensure_index;
pub(crate) use index_out_of_bounds;
pub(crate) use program_flow_error;

/// Terminal or in-progress outcome of a capture, as reported by the orchestrator-facing
/// `CaptureController::result`.
///
/// `Running` is the only non-terminal value. Every worker thread failure latches one of the
/// remaining variants onto the controller; the first one latched wins (see
/// [`crate::progress::ResultLatch`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferResult {
    Running,
    Success,
    FileCreationError,
    BufferUnderflow,
    ConnectionFailure,
    UsbMemoryLimit,
    UsbTransferFailure,
    FileWriteError,
    SequenceMismatch,
    VerificationError,
    ProgramError,
    ForcedAbort,
}

impl fmt::Display for TransferResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Pre-flight failure returned synchronously from `CaptureController::start`.
///
/// These never reach a worker thread: no threads are spawned until `start` has already
/// validated the device connection, output file, and buffer geometry.
#[derive(Debug)]
pub enum StartError {
    AlreadyRunning,
    Connection(anyhow::Error),
    FileCreation(anyhow::Error),
    UsbMemoryLimit { disk_buffer_count: usize },
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyRunning => write!(f, "a capture is already in progress"),
            StartError::Connection(e) => write!(f, "failed to connect to capture device: {e}"),
            StartError::FileCreation(e) => write!(f, "failed to create capture file: {e}"),
            StartError::UsbMemoryLimit { disk_buffer_count } => write!(
                f,
                "disk buffer queue too small: only {disk_buffer_count} buffers fit, need at least 3"
            ),
        }
    }
}

impl std::error::Error for StartError {}

impl StartError {
    pub fn as_transfer_result(&self) -> TransferResult {
        match self {
            StartError::AlreadyRunning => TransferResult::Running,
            StartError::Connection(_) => TransferResult::ConnectionFailure,
            StartError::FileCreation(_) => TransferResult::FileCreationError,
            StartError::UsbMemoryLimit { .. } => TransferResult::UsbMemoryLimit,
        }
    }
}
