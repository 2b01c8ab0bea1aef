//! Screenshot rendering.
//!
//! The manager hands each requested frame to a [`FrameRenderer`] right after
//! the application's present returns. [`AsyncFrameRenderer`] moves the work
//! to a dedicated thread so present latency does not include encoding.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError};
use tracing::{debug, warn};

use dxcap_protocol::{HandleId, NativeHandle};

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("renderer unavailable: {0}")]
    Unavailable(String),

    #[error("frame capture failed: {0}")]
    Capture(String),

    #[error("screenshot queue is full")]
    QueueFull,

    #[error("screenshot worker has exited")]
    Disconnected,
}

pub trait FrameRenderer: Send + Sync {
    /// Capture the swapchain's current back buffer for `frame`.
    fn capture_frame(
        &self,
        swap_chain: HandleId,
        native: NativeHandle,
        frame: u32,
    ) -> Result<(), RenderError>;
}

struct FrameRequest {
    swap_chain: HandleId,
    native: NativeHandle,
    frame: u32,
}

/// Queues capture requests for a worker thread running the inner renderer.
/// Requests beyond the queue depth are rejected rather than blocking present.
pub struct AsyncFrameRenderer {
    sender: Option<Sender<FrameRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl AsyncFrameRenderer {
    pub fn spawn(inner: Arc<dyn FrameRenderer>, queue_depth: usize) -> Result<Self, RenderError> {
        let (sender, receiver) = crossbeam_channel::bounded::<FrameRequest>(queue_depth.max(1));
        let worker = std::thread::Builder::new()
            .name("dxcap-screenshot".to_string())
            .spawn(move || {
                for request in receiver.iter() {
                    if let Err(e) =
                        inner.capture_frame(request.swap_chain, request.native, request.frame)
                    {
                        warn!(
                            "screenshot of frame {} for swapchain {} failed: {}",
                            request.frame, request.swap_chain, e
                        );
                    }
                }
                debug!("screenshot worker exiting");
            })
            .map_err(|e| RenderError::Unavailable(e.to_string()))?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

impl FrameRenderer for AsyncFrameRenderer {
    fn capture_frame(
        &self,
        swap_chain: HandleId,
        native: NativeHandle,
        frame: u32,
    ) -> Result<(), RenderError> {
        let sender = self.sender.as_ref().ok_or(RenderError::Disconnected)?;
        sender
            .try_send(FrameRequest {
                swap_chain,
                native,
                frame,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => RenderError::QueueFull,
                TrySendError::Disconnected(_) => RenderError::Disconnected,
            })
    }
}

impl Drop for AsyncFrameRenderer {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop once the queue drains.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("screenshot worker panicked");
            }
        }
    }
}
