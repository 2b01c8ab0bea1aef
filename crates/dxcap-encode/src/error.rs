use dxcap_protocol::HandleId;

use crate::sink::SinkError;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("{0} dispatch table already initialized")]
    DispatchAlreadyInitialized(&'static str),

    #[error("{0} dispatch table not initialized")]
    DispatchNotInitialized(&'static str),

    #[error("state tracking is disabled")]
    TrackingDisabled,

    #[error("native handle {0:#x} is null")]
    NullHandle(u64),

    #[error("native handle {native:#x} already registered as {existing}")]
    DuplicateRegistration { native: u64, existing: HandleId },

    #[error("trace sink error: {0}")]
    Sink(#[from] SinkError),
}
