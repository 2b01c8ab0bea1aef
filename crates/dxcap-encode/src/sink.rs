use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use dxcap_protocol::records::{CallRecord, FillMemoryRecord, StateSnapshot, TraceBlock};
use dxcap_protocol::wire::{self, WireError};
use dxcap_protocol::ApiCallId;

/// Destination for capture output.
///
/// Implementations must accept records from any thread; records from one
/// thread are written in the order that thread produced them.
pub trait TraceSink: Send + Sync {
    fn write_call(&self, record: CallRecord) -> Result<(), SinkError>;

    fn write_fill_memory(&self, record: FillMemoryRecord) -> Result<(), SinkError>;

    fn write_state(&self, snapshot: StateSnapshot) -> Result<(), SinkError>;

    fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("wire encoding failed: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trace file writer. Blocks are framed with the wire codec and appended
/// under a single lock, so frames from different threads never interleave.
pub struct FileTraceSink {
    path: PathBuf,
    compress: bool,
    writer: Mutex<BufWriter<File>>,
}

impl FileTraceSink {
    pub fn create(path: &Path, compress: bool) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        info!("writing trace to {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            compress,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_block(&self, block: &TraceBlock) -> Result<(), SinkError> {
        let frame = wire::encode_block(block, self.compress)?;
        self.writer.lock().write_all(&frame)?;
        Ok(())
    }
}

impl TraceSink for FileTraceSink {
    fn write_call(&self, record: CallRecord) -> Result<(), SinkError> {
        self.write_block(&TraceBlock::Call(record))
    }

    fn write_fill_memory(&self, record: FillMemoryRecord) -> Result<(), SinkError> {
        self.write_block(&TraceBlock::FillMemory(record))
    }

    fn write_state(&self, snapshot: StateSnapshot) -> Result<(), SinkError> {
        debug!(
            "writing state snapshot: frame={}, objects={}",
            snapshot.frame,
            snapshot.objects.len()
        );
        self.write_block(&TraceBlock::State(snapshot))?;
        self.flush()
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.writer.lock().flush()?;
        Ok(())
    }
}

impl Drop for FileTraceSink {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_mut().flush() {
            warn!("failed to flush trace {}: {}", self.path.display(), e);
        }
    }
}

/// In-memory sink that keeps every block, for inspection.
#[derive(Default)]
pub struct MemoryTraceSink {
    blocks: Mutex<Vec<TraceBlock>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blocks(&self) -> Vec<TraceBlock> {
        self.blocks.lock().clone()
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        self.blocks
            .lock()
            .iter()
            .filter_map(|b| match b {
                TraceBlock::Call(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn calls_of(&self, call_id: ApiCallId) -> Vec<CallRecord> {
        self.calls()
            .into_iter()
            .filter(|r| r.call_id == call_id)
            .collect()
    }

    pub fn fill_memory(&self) -> Vec<FillMemoryRecord> {
        self.blocks
            .lock()
            .iter()
            .filter_map(|b| match b {
                TraceBlock::FillMemory(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn snapshots(&self) -> Vec<StateSnapshot> {
        self.blocks
            .lock()
            .iter()
            .filter_map(|b| match b {
                TraceBlock::State(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.blocks.lock().clear();
    }
}

impl TraceSink for MemoryTraceSink {
    fn write_call(&self, record: CallRecord) -> Result<(), SinkError> {
        self.blocks.lock().push(TraceBlock::Call(record));
        Ok(())
    }

    fn write_fill_memory(&self, record: FillMemoryRecord) -> Result<(), SinkError> {
        self.blocks.lock().push(TraceBlock::FillMemory(record));
        Ok(())
    }

    fn write_state(&self, snapshot: StateSnapshot) -> Result<(), SinkError> {
        self.blocks.lock().push(TraceBlock::State(snapshot));
        Ok(())
    }
}
