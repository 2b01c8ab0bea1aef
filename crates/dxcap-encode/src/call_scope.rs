//! Per-thread call scope.
//!
//! Every intercepted entry point opens a [`CallScope`] on entry. Scopes nest
//! when the application's call re-enters the layer (a native implementation
//! calling another intercepted entry point), and the nesting depth tells the
//! hooks whether they are looking at the application's own call (depth 1) or
//! at an internal one. Each scope owns a parameter buffer that the stub fills
//! and the manager drains into the call record when the scope ends.
//!
//! State lives in a thread-local and is dropped at thread exit; no other
//! thread can observe it.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use dxcap_protocol::{ApiCallId, NativeHandle, ThreadId};

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static THREAD_STATE: RefCell<ThreadCallState> = RefCell::new(ThreadCallState::new());
}

struct CallFrame {
    parameters: ParameterBuffer,
}

struct ThreadCallState {
    thread_id: ThreadId,
    frames: Vec<CallFrame>,
    /// Buffers of finished frames, reused to avoid an allocation per call.
    spare: Vec<ParameterBuffer>,
}

impl ThreadCallState {
    fn new() -> Self {
        Self {
            thread_id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
            frames: Vec::new(),
            spare: Vec::new(),
        }
    }
}

/// Capture thread id of the calling thread.
pub fn current_thread_id() -> ThreadId {
    THREAD_STATE.with(|state| state.borrow().thread_id)
}

/// Number of intercepted calls currently active on the calling thread.
pub fn current_depth() -> u32 {
    THREAD_STATE.with(|state| state.borrow().frames.len() as u32)
}

/// Guard for one intercepted call on the current thread.
///
/// Dropping the guard closes the call and restores the previous depth,
/// whichever path the hook takes out of the entry point.
pub struct CallScope {
    call_id: ApiCallId,
    depth: u32,
    thread_id: ThreadId,
    // Tied to the thread whose depth counter it incremented.
    _not_send: PhantomData<*const ()>,
}

impl CallScope {
    pub(crate) fn enter(call_id: ApiCallId) -> Self {
        THREAD_STATE.with(|state| {
            let mut state = state.borrow_mut();
            let mut parameters = state.spare.pop().unwrap_or_default();
            parameters.clear();
            state.frames.push(CallFrame { parameters });
            CallScope {
                call_id,
                depth: state.frames.len() as u32,
                thread_id: state.thread_id,
                _not_send: PhantomData,
            }
        })
    }

    pub fn call_id(&self) -> ApiCallId {
        self.call_id
    }

    /// Nesting depth of this call; 1 for the application's own call.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn is_top_level(&self) -> bool {
        self.depth == 1
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// Append encoded parameters to this call's buffer.
    ///
    /// The buffer is taken out of thread-local storage while `f` runs, so the
    /// closure may itself issue intercepted calls.
    pub fn encode<F>(&self, f: F)
    where
        F: FnOnce(&mut ParameterBuffer),
    {
        let index = self.depth as usize - 1;
        let mut buffer = THREAD_STATE.with(|state| {
            let mut state = state.borrow_mut();
            state
                .frames
                .get_mut(index)
                .map(|frame| std::mem::take(&mut frame.parameters))
        });
        let Some(buf) = buffer.as_mut() else {
            return;
        };
        f(buf);
        THREAD_STATE.with(|state| {
            if let Some(frame) = state.borrow_mut().frames.get_mut(index) {
                frame.parameters = buffer.take().unwrap_or_default();
            }
        });
    }

    /// Copy of the parameters encoded so far.
    pub fn parameters(&self) -> Vec<u8> {
        let index = self.depth as usize - 1;
        THREAD_STATE.with(|state| {
            state
                .borrow()
                .frames
                .get(index)
                .map(|frame| frame.parameters.as_bytes().to_vec())
                .unwrap_or_default()
        })
    }

    /// Move the encoded parameters out, leaving the buffer empty.
    pub(crate) fn take_parameters(&self) -> Vec<u8> {
        let index = self.depth as usize - 1;
        THREAD_STATE.with(|state| {
            state
                .borrow_mut()
                .frames
                .get_mut(index)
                .map(|frame| frame.parameters.take_bytes())
                .unwrap_or_default()
        })
    }
}

impl Drop for CallScope {
    fn drop(&mut self) {
        // try_with: the thread-local may already be gone during thread teardown.
        let _ = THREAD_STATE.try_with(|state| {
            let mut state = state.borrow_mut();
            let keep = self.depth as usize - 1;
            while state.frames.len() > keep {
                if let Some(frame) = state.frames.pop() {
                    state.spare.push(frame.parameters);
                }
            }
        });
    }
}

/// Encoded parameter bytes of one call.
#[derive(Debug, Default, Clone)]
pub struct ParameterBuffer {
    bytes: Vec<u8>,
}

impl ParameterBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<T: bytemuck::Pod>(&mut self, value: &T) {
        self.bytes.extend_from_slice(bytemuck::bytes_of(value));
    }

    pub fn push_u32(&mut self, value: u32) {
        self.push(&value);
    }

    pub fn push_u64(&mut self, value: u64) {
        self.push(&value);
    }

    pub fn push_handle(&mut self, handle: NativeHandle) {
        self.push(&handle);
    }

    /// Length-prefixed array.
    pub fn push_slice<T: bytemuck::Pod>(&mut self, values: &[T]) {
        self.push_u32(values.len() as u32);
        self.bytes.extend_from_slice(bytemuck::cast_slice(values));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    fn take_bytes(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.bytes)
    }
}
