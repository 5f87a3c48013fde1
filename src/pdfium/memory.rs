//! Tracked allocator over the native heap
//!
//! Every block the layer hands to the engine goes through [`MemoryManager`]
//! so the live total can be bounded and leaks can be reported. Blocks the
//! engine allocates for itself (pages, text pages) are not tracked here.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{NativePtr, PdfiumModule};
use crate::error::{EngineError, Result};

/// Ceiling on tracked native memory: 2 GiB
pub const MAX_TOTAL_MEMORY: usize = 2 * 1024 * 1024 * 1024;

/// One live heap block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub ptr: NativePtr,
    pub size: usize,
    pub timestamp: DateTime<Utc>,
    /// Captured only with verbose diagnostics
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Allocator statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub total_allocated: usize,
    pub allocation_count: usize,
    /// Empty unless verbose diagnostics are enabled
    pub allocations: Vec<Allocation>,
}

#[derive(Default)]
struct MemoryState {
    allocations: HashMap<NativePtr, Allocation>,
    total_allocated: usize,
}

/// Tracked malloc/free with a global byte ceiling
pub struct MemoryManager {
    module: Arc<dyn PdfiumModule>,
    state: Mutex<MemoryState>,
    max_total: usize,
    verbose: bool,
}

impl MemoryManager {
    pub fn new(module: Arc<dyn PdfiumModule>) -> Self {
        Self::with_limit(module, MAX_TOTAL_MEMORY, false)
    }

    /// Create an allocator with a custom ceiling and diagnostics mode
    pub fn with_limit(module: Arc<dyn PdfiumModule>, max_total: usize, verbose: bool) -> Self {
        Self {
            module,
            state: Mutex::new(MemoryState::default()),
            max_total,
            verbose,
        }
    }

    /// Allocate `size` bytes on the native heap
    pub fn malloc(&self, size: usize) -> Result<NativePtr> {
        let mut state = self.state.lock();

        let requested = state.total_allocated.saturating_add(size);
        if requested > self.max_total {
            return Err(EngineError::OutOfMemory {
                requested,
                limit: self.max_total,
            });
        }

        let ptr = self.module.malloc(size);
        if ptr.is_null() {
            return Err(EngineError::AllocationFailed(size));
        }

        let stack = self
            .verbose
            .then(|| std::backtrace::Backtrace::force_capture().to_string());

        state.allocations.insert(
            ptr,
            Allocation {
                ptr,
                size,
                timestamp: Utc::now(),
                stack,
            },
        );
        state.total_allocated += size;

        debug!(%ptr, size, total = state.total_allocated, "malloc");
        Ok(ptr)
    }

    /// Allocate and zero-fill
    pub fn malloc_zeroed(&self, size: usize) -> Result<NativePtr> {
        let ptr = self.malloc(size)?;
        if !self.module.heap_write(ptr, &vec![0u8; size]) {
            self.free(ptr);
            return Err(EngineError::AllocationFailed(size));
        }
        Ok(ptr)
    }

    /// Allocate a block and copy `bytes` into it
    pub fn alloc_bytes(&self, bytes: &[u8]) -> Result<NativePtr> {
        let ptr = self.malloc(bytes.len())?;
        if !self.module.heap_write(ptr, bytes) {
            self.free(ptr);
            return Err(EngineError::AllocationFailed(bytes.len()));
        }
        Ok(ptr)
    }

    /// Copy `len` bytes out of a tracked block
    pub fn read(&self, ptr: NativePtr, len: usize) -> Result<Vec<u8>> {
        self.module
            .heap_read(ptr, len)
            .ok_or_else(|| EngineError::NotFound(format!("heap block {ptr}")))
    }

    /// Free a block. Untracked pointers are still forwarded to the heap.
    pub fn free(&self, ptr: NativePtr) {
        {
            let mut state = self.state.lock();
            match state.allocations.remove(&ptr) {
                Some(allocation) => {
                    state.total_allocated -= allocation.size;
                    debug!(%ptr, size = allocation.size, total = state.total_allocated, "free");
                }
                None => warn!(%ptr, "Freeing untracked pointer"),
            }
        }

        self.module.free(ptr);
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            total_allocated: state.total_allocated,
            allocation_count: state.allocations.len(),
            allocations: if self.verbose {
                state.allocations.values().cloned().collect()
            } else {
                Vec::new()
            },
        }
    }

    /// Log every live allocation and return how many there are
    pub fn check_leaks(&self) -> usize {
        let state = self.state.lock();
        if !state.allocations.is_empty() {
            warn!(
                count = state.allocations.len(),
                "Potential memory leak: unfreed allocations"
            );
            for allocation in state.allocations.values() {
                warn!(
                    ptr = %allocation.ptr,
                    size = allocation.size,
                    stack = allocation.stack.as_deref().unwrap_or(""),
                    "  unfreed"
                );
            }
        }
        state.allocations.len()
    }

    pub fn limit(&self) -> usize {
        self.max_total
    }
}
