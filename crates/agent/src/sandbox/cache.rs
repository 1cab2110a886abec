//! Process-wide cache of live sandbox handles.
//!
//! Successive tool calls within one run reuse a single connection per
//! sandbox id. Entries are added on create/get and evicted on stop.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::sandbox::platform::SandboxHandle;

#[derive(Default)]
pub struct HandleCache {
    inner: Mutex<HashMap<String, Arc<dyn SandboxHandle>>>,
}

impl HandleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, sandbox_id: &str) -> Option<Arc<dyn SandboxHandle>> {
        self.inner.lock().get(sandbox_id).cloned()
    }

    pub fn insert(&self, handle: Arc<dyn SandboxHandle>) {
        self.inner
            .lock()
            .insert(handle.sandbox_id().to_string(), handle);
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<Arc<dyn SandboxHandle>> {
        self.inner.lock().remove(sandbox_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
