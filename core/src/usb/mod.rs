pub mod endpoint;
pub mod rusb_endpoint;
pub mod simulated;

pub use endpoint::{vendor, BulkInEndpoint, Completion, CompletionStatus, EndpointInfo, SlotHandle, TransferTarget};
pub use rusb_endpoint::RusbEndpoint;
pub use simulated::SimulatedEndpoint;
