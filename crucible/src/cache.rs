//! Compile Cache: a single-flight, content-addressed cache mapping a
//! Kernel Fingerprint to the backend-compiled [`CompiledKernel`] it
//! names. A concurrent second caller for a fingerprint already being built
//! blocks on the first caller's result instead of triggering a second
//! compile; a failed build evicts its own fingerprint so the next caller
//! gets a fresh attempt rather than a permanently poisoned entry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crucible_core::error::{CompileStage, Error, Result};

use crate::backend::CompiledKernel;
use crate::fingerprint::Fingerprint;

/// What a `clear` call evicts. This cache's only artifact is the
/// final [`CompiledKernel`] — it never separately retains pre-lowering IR
/// or debug metadata as distinct objects — so `IrNodesOnly` and
/// `DebugInfoOnly` are accepted but have nothing of their own to evict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearMode {
    All,
    CompiledKernelsOnly,
    IrNodesOnly,
    DebugInfoOnly,
}

enum SlotState {
    Pending,
    Built(Arc<CompiledKernel>),
    Failed(String),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

/// Owns the fingerprint → compiled-kernel map. One instance lives per
/// [`crate::Context`](crate::context::Context), which owns the single
/// process-wide Compile Cache.
pub struct CompileCache {
    disabled: bool,
    slots: Mutex<HashMap<Fingerprint, Arc<Slot>>>,
}

impl CompileCache {
    pub fn new() -> CompileCache {
        CompileCache { disabled: false, slots: Mutex::new(HashMap::new()) }
    }

    /// A cache that never retains anything, for
    /// `ContextProperties::disable_kernel_cache`: every call to
    /// `get_or_build` recompiles.
    pub fn disabled() -> CompileCache {
        CompileCache { disabled: true, slots: Mutex::new(HashMap::new()) }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the cached kernel for `fingerprint`, building it with
    /// `builder` on a cache miss. Only the caller that actually wins the
    /// race to create the slot runs `builder`; every other concurrent
    /// caller for the same fingerprint blocks until that build settles.
    pub fn get_or_build(
        &self,
        fingerprint: Fingerprint,
        builder: impl FnOnce() -> Result<CompiledKernel>,
    ) -> Result<Arc<CompiledKernel>> {
        if self.disabled {
            return builder().map(Arc::new);
        }

        let (slot, is_new) = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get(&fingerprint) {
                (slot.clone(), false)
            } else {
                let slot = Arc::new(Slot { state: Mutex::new(SlotState::Pending), ready: Condvar::new() });
                slots.insert(fingerprint, slot.clone());
                (slot, true)
            }
        };

        if is_new {
            let result = builder();
            let mut state = slot.state.lock();
            match result {
                Ok(kernel) => {
                    let kernel = Arc::new(kernel);
                    *state = SlotState::Built(kernel.clone());
                    slot.ready.notify_all();
                    Ok(kernel)
                }
                Err(e) => {
                    let message = e.to_string();
                    *state = SlotState::Failed(message);
                    slot.ready.notify_all();
                    drop(state);
                    // Errors aren't `Clone`, so waiters can only be handed a
                    // reconstructed error carrying the same message (see
                    // DESIGN.md). Evicting the slot also means the next
                    // caller gets a clean retry instead of an entry wedged
                    // in `Failed` forever.
                    self.slots.lock().remove(&fingerprint);
                    Err(e)
                }
            }
        } else {
            let mut state = slot.state.lock();
            loop {
                match &*state {
                    SlotState::Pending => slot.ready.wait(&mut state),
                    SlotState::Built(kernel) => return Ok(kernel.clone()),
                    SlotState::Failed(message) => {
                        return Err(Error::compilation_failed(CompileStage::Codegen, message.clone()));
                    }
                }
            }
        }
    }

    pub fn clear(&self, mode: ClearMode) {
        match mode {
            ClearMode::All | ClearMode::CompiledKernelsOnly => {
                self.slots.lock().clear();
            }
            ClearMode::IrNodesOnly | ClearMode::DebugInfoOnly => {}
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CompileCache {
    fn default() -> Self {
        CompileCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ArgKind, CompiledTarget};
    use crate::device::DeviceClass;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn dummy_kernel(fingerprint: Fingerprint) -> CompiledKernel {
        CompiledKernel {
            target: CompiledTarget::Source("kernel void k() {}".to_string()),
            entry_symbol: "k".to_string(),
            argument_layout: Vec::<ArgKind>::new(),
            static_shared_memory_bytes: 0,
            fingerprint,
        }
    }

    fn test_fingerprint() -> Fingerprint {
        crate::fingerprint::compute(&crate::fingerprint::FingerprintInputs {
            entry_name: "k",
            type_args: &[],
            device_class: DeviceClass::Cpu,
            props: &crate::config::ContextProperties::new(),
        })
    }

    #[test]
    fn a_cache_hit_does_not_rebuild() {
        let cache = CompileCache::new();
        let fp = test_fingerprint();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_build(fp, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(dummy_kernel(fp))
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_disabled_cache_always_rebuilds() {
        let cache = CompileCache::disabled();
        let fp = test_fingerprint();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_build(fp, || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(dummy_kernel(fp))
                })
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn clearing_forces_a_fresh_build() {
        let cache = CompileCache::new();
        let fp = test_fingerprint();
        let calls = AtomicUsize::new(0);
        let build = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(dummy_kernel(fp))
        };
        cache.get_or_build(fp, build).unwrap();
        cache.clear(ClearMode::All);
        cache.get_or_build(fp, build).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn ir_nodes_only_and_debug_info_only_do_not_evict_compiled_kernels() {
        let cache = CompileCache::new();
        let fp = test_fingerprint();
        cache.get_or_build(fp, || Ok(dummy_kernel(fp))).unwrap();
        cache.clear(ClearMode::IrNodesOnly);
        cache.clear(ClearMode::DebugInfoOnly);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn a_failed_build_is_evicted_so_the_next_caller_can_retry() {
        let cache = CompileCache::new();
        let fp = test_fingerprint();
        let attempt = AtomicUsize::new(0);
        let first = cache.get_or_build(fp, || {
            attempt.fetch_add(1, Ordering::SeqCst);
            Err(Error::compilation_failed(CompileStage::Codegen, "boom"))
        });
        assert!(first.is_err());
        let second = cache.get_or_build(fp, || {
            attempt.fetch_add(1, Ordering::SeqCst);
            Ok(dummy_kernel(fp))
        });
        assert!(second.is_ok());
        assert_eq!(attempt.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_callers_for_the_same_fingerprint_single_flight() {
        let cache = Arc::new(CompileCache::new());
        let fp = test_fingerprint();
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                thread::spawn(move || {
                    cache
                        .get_or_build(fp, || {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(10));
                            Ok(dummy_kernel(fp))
                        })
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
