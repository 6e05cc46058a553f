//! Stream & Launcher: the owner of one accelerator's allocations and
//! launch queue. A `Stream` is the only thing a caller allocates memory
//! through or launches kernels on; `Context` is what hands one out.

use std::sync::Arc;

use parking_lot::Mutex;

use crucible_core::error::{Error, Result};
use crucible_core::index::Index3D;
use crucible_core::view::ViewElement;

use crate::backend::{ArgKind, Backend, CompiledKernel, CompiledTarget};
use crate::buffer::MemoryBuffer;
use crate::cache::CompileCache;
use crate::config::ContextProperties;
use crate::context::KernelHandle;
use crate::device::DeviceInfo;
use crate::fingerprint::{self, FingerprintInputs};
use crate::value::{IntoDynView, RtValue};

/// A dynamic shared-memory request attached to one launch, on top of the
/// compiled kernel's static `LocalMemory.Allocate` requests.
#[derive(Debug, Clone, Copy)]
pub struct DynamicSharedMemory {
    pub elem_count: i64,
    pub elem_size: u32,
}

impl DynamicSharedMemory {
    pub fn bytes(&self) -> u64 {
        (self.elem_count.max(0) as u64) * (self.elem_size as u64)
    }
}

/// The launch geometry: a 1D/2D/3D grid of groups, each with its own
/// extent, plus an optional dynamic shared-memory request.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub grid_dim: Index3D,
    pub group_dim: Index3D,
    pub dynamic_shared_memory: Option<DynamicSharedMemory>,
}

impl KernelConfig {
    pub fn new(grid_dim: Index3D, group_dim: Index3D) -> KernelConfig {
        KernelConfig { grid_dim, group_dim, dynamic_shared_memory: None }
    }

    pub fn with_dynamic_shared_memory(mut self, request: DynamicSharedMemory) -> KernelConfig {
        self.dynamic_shared_memory = Some(request);
        self
    }
}

/// A `KernelConfig` paired with the static shared-memory specification the
/// compiled kernel itself carries, so validation sees the whole picture
/// (launch geometry and static shared-memory spec together) at once.
#[derive(Debug, Clone)]
pub struct RuntimeKernelConfig {
    pub config: KernelConfig,
    pub static_shared_memory_bytes: u32,
}

impl RuntimeKernelConfig {
    pub fn total_shared_memory_bytes(&self) -> u64 {
        let dynamic = self.config.dynamic_shared_memory.map(|d| d.bytes()).unwrap_or(0);
        self.static_shared_memory_bytes as u64 + dynamic
    }
}

/// `compute_grid_stride_kernel_config`: picks a grid that covers
/// `total_elements` with at most `device.max_grid_size` groups, each
/// processing up to `device.grid_stride_factor` elements per lane so the
/// grid doesn't need to be launched wider than the device can usefully
/// schedule. Returns the config plus how many grid-stride sweeps each
/// lane must perform to cover its share of `total_elements`.
pub fn compute_grid_stride_kernel_config(
    device: &DeviceInfo,
    total_elements: i64,
) -> (KernelConfig, i32) {
    let group_x = device.preferred_group_size.max(1);
    let k = (device.grid_stride_factor.max(1)) as i64;
    let elements_per_full_grid_sweep = (group_x as i64) * k;

    let ideal_grid_x = if total_elements <= 0 {
        1
    } else {
        ceil_div(total_elements, elements_per_full_grid_sweep).max(1)
    };
    let grid_x = ideal_grid_x.min(device.max_grid_size as i64).max(1) as i32;

    let total_lanes = (grid_x as i64) * (group_x as i64);
    let iterations_per_lane = if total_elements <= 0 { 1 } else { ceil_div(total_elements, total_lanes).max(1) as i32 };

    let config = KernelConfig::new(Index3D::new(grid_x, 1, 1), Index3D::new(group_x, 1, 1));
    (config, iterations_per_lane)
}

fn ceil_div(a: i64, b: i64) -> i64 {
    if b <= 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Pre-allocation planning: lets a kernel-building caller (the
/// Scan/Reduce Engine's `plan`) register the temporary buffers a launch
/// will need before a `Stream` actually allocates them, so a single
/// `OutOfMemory` check can cover the whole plan instead of failing
/// halfway through a sequence of allocations.
#[derive(Debug, Clone)]
pub struct AllocationRequest {
    pub label: String,
    pub elem_size: i64,
    pub count: i64,
}

impl AllocationRequest {
    pub fn bytes(&self) -> i64 {
        self.elem_size.saturating_mul(self.count.max(0))
    }
}

#[derive(Debug, Clone, Default)]
pub struct AllocationBuilder {
    requests: Vec<AllocationRequest>,
}

impl AllocationBuilder {
    pub fn new() -> AllocationBuilder {
        AllocationBuilder::default()
    }

    pub fn request(&mut self, label: impl Into<String>, elem_size: i64, count: i64) {
        self.requests.push(AllocationRequest { label: label.into(), elem_size, count });
    }

    pub fn requests(&self) -> &[AllocationRequest] {
        &self.requests
    }

    pub fn total_bytes(&self) -> i64 {
        self.requests.iter().map(AllocationRequest::bytes).sum()
    }
}

/// A scoped, RAII-released temporary buffer.
/// `MemoryBuffer<T>`'s own `Drop` already disposes the underlying
/// allocation, so this wrapper's only job is to give `Stream` a named,
/// ergonomic return type for `allocate_temporary`.
pub struct ScopedBuffer<T: ViewElement> {
    buffer: MemoryBuffer<T>,
}

impl<T: ViewElement> ScopedBuffer<T> {
    pub fn view(&self) -> crucible_core::view::ArrayView<T> {
        self.buffer.as_view()
    }

    pub fn len(&self) -> i64 {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Owns one accelerator's allocations and launch queue. Every
/// launch on a `Stream` runs to completion before `launch` returns — the
/// CPU Emulator backend has no asynchronous execution model of its own
/// (groups are interpreted one at a time), so there is never anything
/// actually "in flight" for `synchronize` to wait on; it exists as the
/// documented join point a backend with real asynchronous dispatch would
/// need.
pub struct Stream {
    accelerator_id: u64,
    device: Arc<DeviceInfo>,
    backend: Arc<dyn Backend>,
    cache: Arc<CompileCache>,
    props: ContextProperties,
    poisoned: Mutex<Option<String>>,
}

impl Stream {
    pub(crate) fn new(
        accelerator_id: u64,
        device: Arc<DeviceInfo>,
        backend: Arc<dyn Backend>,
        cache: Arc<CompileCache>,
        props: ContextProperties,
    ) -> Stream {
        Stream { accelerator_id, device, backend, cache, props, poisoned: Mutex::new(None) }
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn accelerator_id(&self) -> u64 {
        self.accelerator_id
    }

    pub fn properties(&self) -> &ContextProperties {
        &self.props
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.lock().is_some()
    }

    /// Clears a poisoned stream's latched error. A poisoned stream accepts
    /// new work again only after this explicit reset.
    pub fn reset(&self) {
        *self.poisoned.lock() = None;
    }

    /// Poisons the stream directly, so every subsequent `launch` fails with
    /// `Canceled` until `reset` is called.
    pub fn cancel(&self) {
        *self.poisoned.lock() = Some("stream canceled".to_string());
    }

    fn check_alive(&self) -> Result<()> {
        if self.poisoned.lock().is_some() {
            return Err(Error::Canceled);
        }
        Ok(())
    }

    fn poison_from(&self, error: &Error) {
        if error.poisons_stream() {
            *self.poisoned.lock() = Some(error.to_string());
        }
    }

    pub fn allocate<T: ViewElement>(&self, elems: i64) -> Result<MemoryBuffer<T>> {
        self.check_alive()?;
        MemoryBuffer::allocate(self.accelerator_id, elems)
    }

    /// Scoped acquisition: the returned [`ScopedBuffer`] releases its
    /// allocation when dropped, on every exit path including a panic
    /// unwinding through the caller, since release is `MemoryBuffer`'s
    /// `Drop` impl rather than anything this method does explicitly.
    pub fn allocate_temporary<T: ViewElement>(&self, elems: i64) -> Result<ScopedBuffer<T>> {
        self.check_alive()?;
        Ok(ScopedBuffer { buffer: MemoryBuffer::allocate(self.accelerator_id, elems)? })
    }

    /// Runs `f` over a freshly allocated temporary view, releasing the
    /// allocation before returning regardless of whether `f` succeeds.
    pub fn with_temporary<T: ViewElement, R>(
        &self,
        elems: i64,
        f: impl FnOnce(&crucible_core::view::ArrayView<T>) -> Result<R>,
    ) -> Result<R> {
        let scoped = self.allocate_temporary::<T>(elems)?;
        f(&scoped.view())
    }

    fn validate_config(&self, config: &KernelConfig, static_shared_memory_bytes: u32) -> Result<()> {
        let grid = &config.grid_dim;
        let group = &config.group_dim;
        if grid.x <= 0 || grid.y <= 0 || grid.z <= 0 {
            return Err(Error::config_invalid("grid_dim components must be positive"));
        }
        if group.x <= 0 || group.y <= 0 || group.z <= 0 {
            return Err(Error::config_invalid("group_dim components must be positive"));
        }
        if !self.device.group_dim_fits(group) {
            return Err(Error::config_invalid(format!(
                "group_dim size {} exceeds device max_group_size {}",
                group.size(),
                self.device.max_group_size
            )));
        }
        let runtime_config =
            RuntimeKernelConfig { config: config.clone(), static_shared_memory_bytes };
        let total_shared = runtime_config.total_shared_memory_bytes();
        if total_shared > self.device.max_shared_memory_bytes as u64 {
            return Err(Error::config_invalid(format!(
                "requested shared memory {} bytes exceeds device limit {} bytes",
                total_shared, self.device.max_shared_memory_bytes
            )));
        }
        Ok(())
    }

    fn compiled_kernel(&self, handle: &KernelHandle) -> Result<Arc<CompiledKernel>> {
        if handle.device_class() != self.device.class {
            return Err(Error::AcceleratorUnavailable {
                detail: format!(
                    "kernel {} was declared for {:?} but this stream targets {:?}",
                    handle.entry_name(),
                    handle.device_class(),
                    self.device.class
                ),
            });
        }

        let fingerprint = fingerprint::compute(&FingerprintInputs {
            entry_name: handle.entry_name(),
            type_args: &handle.type_args_refs(),
            device_class: self.device.class,
            props: &self.props,
        });
        handle.set_fingerprint(fingerprint);
        handle.set_state(crate::context::KernelState::Fingerprinted);

        let module = handle.module().clone();
        let device = self.device.clone();
        let props = self.props.clone();
        let backend = self.backend.clone();
        handle.set_state(crate::context::KernelState::Building);
        let result = self.cache.get_or_build(fingerprint, move || {
            backend.compile(&module, &device, &props, fingerprint)
        });
        match &result {
            Ok(_) => handle.set_state(crate::context::KernelState::Built),
            Err(_) => handle.set_state(crate::context::KernelState::Failed),
        }
        result
    }

    /// Marshals `args`, compiles (or fetches from cache) the kernel named
    /// by `handle`, and runs it to completion. Each argument is either a
    /// scalar [`RtValue`] or a view erased through [`crate::value::DynView`].
    ///
    /// Only a failure of the kernel body itself poisons the Stream.
    /// Compilation, argument-layout, and launch-configuration failures are
    /// synchronous API errors (nothing ever ran) and are simply surfaced to
    /// the caller, who may retry the same `launch` call with corrected
    /// arguments on the same, still-usable Stream.
    pub fn launch(&self, handle: &KernelHandle, config: &KernelConfig, args: Vec<RtValue>) -> Result<()> {
        self.check_alive()?;

        let kernel = self.compiled_kernel(handle)?;
        self.validate_layout(&kernel, &args)?;
        self.validate_config(config, kernel.static_shared_memory_bytes)?;

        let result = match &kernel.target {
            CompiledTarget::Interpreted(module) => crate::backend::cpu_emulator::execute(
                &module.function,
                config.grid_dim.x,
                config.group_dim.x,
                self.device.warp_size,
                &args,
            ),
            CompiledTarget::Source(source) => {
                log::info!(
                    "acknowledging launch of {} on {:?} ({} bytes of generated source; dispatch to a driver is out of scope)",
                    kernel.entry_symbol,
                    self.device.class,
                    source.len()
                );
                Ok(())
            }
        };

        if let Err(e) = &result {
            self.poison_from(e);
        }
        result
    }

    fn validate_layout(&self, kernel: &CompiledKernel, args: &[RtValue]) -> Result<()> {
        if kernel.argument_layout.len() != args.len() {
            return Err(Error::config_invalid(format!(
                "kernel {} expects {} arguments, {} were supplied",
                kernel.entry_symbol,
                kernel.argument_layout.len(),
                args.len()
            )));
        }
        for (i, (kind, value)) in kernel.argument_layout.iter().zip(args.iter()).enumerate() {
            let ok = match (kind, value) {
                (ArgKind::Scalar(_), RtValue::Bool(_) | RtValue::Int(_) | RtValue::Float(_)) => true,
                (ArgKind::View(_), RtValue::View(_)) => true,
                _ => false,
            };
            if !ok {
                return Err(Error::config_invalid(format!(
                    "argument {} does not match the kernel's declared parameter kind",
                    i
                )));
            }
        }
        Ok(())
    }

    /// A join point for a backend with real asynchronous dispatch; on this
    /// runtime's backends every `launch` already runs to completion
    /// synchronously, so this only surfaces a latched error if the stream
    /// is poisoned.
    pub fn synchronize(&self) -> Result<()> {
        self.check_alive()
    }
}

/// Wraps a typed view as an [`RtValue::View`] argument for [`Stream::launch`].
pub fn arg_view<T: IntoDynView + ViewElement>(view: crucible_core::view::ArrayView<T>) -> RtValue {
    RtValue::View(T::into_dyn_view(view))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInfo;

    #[test]
    fn grid_stride_config_covers_every_element_at_least_once() {
        let device = DeviceInfo::cpu_emulator();
        let (config, iterations) = compute_grid_stride_kernel_config(&device, 1_048_576);
        let covered = (config.grid_dim.size()) * (config.group_dim.size()) * iterations as i64;
        assert!(covered >= 1_048_576);
        assert!(config.grid_dim.x >= 1 && config.group_dim.x >= 1);
    }

    #[test]
    fn grid_stride_config_handles_zero_elements() {
        let device = DeviceInfo::cpu_emulator();
        let (config, iterations) = compute_grid_stride_kernel_config(&device, 0);
        assert_eq!(config.grid_dim.x, 1);
        assert_eq!(iterations, 1);
    }

    #[test]
    fn grid_stride_config_never_exceeds_max_grid_size() {
        let mut device = DeviceInfo::cpu_emulator();
        device.max_grid_size = 4;
        let (config, _) = compute_grid_stride_kernel_config(&device, 10_000_000);
        assert!(config.grid_dim.x <= 4);
    }

    #[test]
    fn allocation_builder_sums_requested_bytes() {
        let mut builder = AllocationBuilder::new();
        builder.request("a", 4, 10);
        builder.request("b", 8, 5);
        assert_eq!(builder.total_bytes(), 40 + 40);
    }
}
