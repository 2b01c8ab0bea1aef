pub mod handle;
pub mod format;
pub mod records;
pub mod wire;

pub use handle::{HandleId, NativeHandle, ObjectKind, ThreadId};
pub use records::{ApiCallId, CallRecord, FillMemoryRecord, StateSnapshot, TraceBlock};
pub use wire::WireError;
