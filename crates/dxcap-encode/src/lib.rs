//! D3D12/DXGI capture layer core.
//!
//! Sits between an application and the native driver API. The generated
//! entry-point stubs forward every call and report it to the
//! [`CaptureManager`], which records the call and keeps a model of every live
//! API object so a complete state snapshot can be written at any point.
//!
//! Usage from the loader:
//! - `init_from_environment(..)` on the first intercepted call
//! - install the native tables with `init_device_dispatch` / `init_present_dispatch`
//! - `CaptureManager::destroy_instance()` when the layer is unloaded

pub mod call_scope;
pub mod capture_manager;
pub mod command;
pub mod command_handles;
pub mod descriptor;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod object_info;
pub mod renderer;
pub mod resource;
pub mod sink;
pub mod state_tracker;
pub mod swapchain;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use dxcap_core::config::{default_config_path, CaptureConfig};

pub use call_scope::{CallScope, ParameterBuffer};
pub use capture_manager::{CaptureManager, CaptureMode};
pub use command_handles::{CommandArgs, HandleExtractorTable, HandleRef};
pub use dispatch::{DeviceDispatch, NoWriteWatch, PresentDispatch, WriteWatch};
pub use error::CaptureError;
pub use object_info::ObjectInfo;
pub use renderer::{AsyncFrameRenderer, FrameRenderer, RenderError};
pub use resource::{CommittedResourceArgs, PlacedResourceArgs};
pub use sink::{FileTraceSink, MemoryTraceSink, SinkError, TraceSink};
pub use state_tracker::{StateTracker, StateTracking};
pub use swapchain::ResizeArgs;

/// Acquire the process-wide manager, creating it from the environment on
/// first use: logging from `DXCAP_LOG`, configuration from `DXCAP_CONFIG`
/// (or `./dxcap.toml`), and a trace file at the configured or default path.
/// A screenshot renderer, when given, runs on its own worker thread.
pub fn init_from_environment(
    renderer: Option<Arc<dyn FrameRenderer>>,
) -> anyhow::Result<Arc<CaptureManager>> {
    dxcap_common::logging::init_logging();

    CaptureManager::create_instance(|| -> anyhow::Result<CaptureManager> {
        let config_path = default_config_path();
        let config = CaptureConfig::load_or_default(&config_path);

        let trace_path = config
            .capture
            .trace_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(dxcap_common::platform::default_trace_path);
        let sink = FileTraceSink::create(&trace_path, config.capture.compress)
            .with_context(|| format!("failed to create trace file {}", trace_path.display()))?;

        info!(
            "dxcap capture layer starting on {} (config: {})",
            dxcap_common::platform::platform_name(),
            config_path
        );
        let renderer = match renderer {
            Some(inner) => {
                let worker = AsyncFrameRenderer::spawn(inner, config.screenshots.queue_depth)
                    .context("failed to start screenshot worker")?;
                Some(Arc::new(worker) as Arc<dyn FrameRenderer>)
            }
            None => None,
        };
        Ok(CaptureManager::new(config, Arc::new(sink), renderer))
    })
}
