use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use dxcap_protocol::handle::{HandleId, NativeHandle};

use crate::error::CoreError;

/// Mapping from native interface pointers to capture ids.
/// Native pointer values are recycled by the driver once an object dies;
/// capture ids are not, so a stale id can never alias a new object.
pub struct HandleMap {
    native_to_id: DashMap<NativeHandle, HandleId>,
}

impl HandleMap {
    pub fn new() -> Self {
        Self {
            native_to_id: DashMap::new(),
        }
    }

    /// Bind a native handle to a capture id. Fails if the native handle is
    /// already bound; the existing binding is left untouched.
    pub fn insert(&self, native: NativeHandle, id: HandleId) -> Result<(), CoreError> {
        match self.native_to_id.entry(native) {
            Entry::Occupied(existing) => Err(CoreError::DuplicateHandle(*existing.get())),
            Entry::Vacant(slot) => {
                slot.insert(id);
                Ok(())
            }
        }
    }

    /// Look up a capture id by native handle.
    pub fn to_id(&self, native: NativeHandle) -> Option<HandleId> {
        self.native_to_id.get(&native).map(|v| *v)
    }

    /// Remove a binding by native handle.
    pub fn remove_by_native(&self, native: NativeHandle) -> Option<HandleId> {
        self.native_to_id.remove(&native).map(|(_, id)| id)
    }

    /// Return number of active bindings.
    pub fn len(&self) -> usize {
        self.native_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.native_to_id.is_empty()
    }
}

impl Default for HandleMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Capture id allocator. Ids increase monotonically and are never reused.
pub struct HandleAllocator {
    next_id: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self {
            // Zero is HandleId::NULL
            next_id: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self) -> HandleId {
        HandleId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}
