//! Context: the top-level entry point. Owns the device registry, the
//! single process-wide Compile Cache, and is the only thing that can mint a
//! `Stream` or a `KernelHandle`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crucible_core::error::{Error, Result};

use crate::backend::cpu_emulator::CpuEmulatorBackend;
use crate::backend::opencl::OpenClBackend;
use crate::backend::ptx::PtxBackend;
use crate::backend::Backend;
use crate::cache::{CompileCache, ClearMode};
use crate::config::ContextProperties;
use crate::device::{DeviceClass, DeviceInfo};
use crate::fingerprint::Fingerprint;
use crate::ir::Module;
use crate::stream::Stream;

/// A declared kernel's progress through compilation: Declared →
/// Fingerprinted → Building → Built | Failed; Built → Evicted on a cache
/// clear; Failed → Evicted immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelState {
    Declared,
    Fingerprinted,
    Building,
    Built,
    Failed,
    Evicted,
}

struct KernelHandleInner {
    entry_name: String,
    type_args: Vec<String>,
    device_class: DeviceClass,
    module: Arc<Module>,
    state: Mutex<KernelState>,
    fingerprint: Mutex<Option<Fingerprint>>,
}

/// A declared kernel: the IR module plus its identity (entry name, type
/// arguments, target device class) a `Stream` needs to fingerprint, build,
/// and launch it. Cheap to clone — it is an `Arc` around its shared state.
#[derive(Clone)]
pub struct KernelHandle {
    inner: Arc<KernelHandleInner>,
}

impl KernelHandle {
    pub fn entry_name(&self) -> &str {
        &self.inner.entry_name
    }

    pub fn type_args_refs(&self) -> Vec<&str> {
        self.inner.type_args.iter().map(|s| s.as_str()).collect()
    }

    pub fn device_class(&self) -> DeviceClass {
        self.inner.device_class
    }

    pub fn module(&self) -> Arc<Module> {
        self.inner.module.clone()
    }

    pub fn state(&self) -> KernelState {
        *self.inner.state.lock()
    }

    pub(crate) fn set_state(&self, state: KernelState) {
        *self.inner.state.lock() = state;
    }

    pub(crate) fn set_fingerprint(&self, fingerprint: Fingerprint) {
        *self.inner.fingerprint.lock() = Some(fingerprint);
    }

    pub fn fingerprint(&self) -> Option<Fingerprint> {
        *self.inner.fingerprint.lock()
    }
}

struct RegisteredDevice {
    info: Arc<DeviceInfo>,
    backend: Arc<dyn Backend>,
}

/// An `AcceleratorCreated` observer: called with every device a `Context`
/// has already registered at subscription time, then again for every
/// device `register_device` adds afterward.
type AcceleratorObserver = dyn Fn(&DeviceInfo) + Send + Sync;

/// The top-level entry point. One `Context` owns a device registry
/// populated at construction (the CPU emulator always, plus whatever GPU
/// placeholders the caller registers), the single Compile Cache every
/// `Stream` it mints shares, and the next opaque accelerator id handed to
/// each new `Stream`.
pub struct Context {
    devices: Vec<RegisteredDevice>,
    cache: Arc<CompileCache>,
    props: ContextProperties,
    next_accelerator_id: AtomicU64,
    kernels: Mutex<HashMap<String, KernelHandle>>,
    observers: Mutex<Vec<Arc<AcceleratorObserver>>>,
}

impl Context {
    /// A context with just the CPU emulator registered — the configuration
    /// every caller gets unless they also register GPU devices.
    pub fn new(props: ContextProperties) -> Context {
        let props = props.normalize();
        let cache =
            if props.disable_kernel_cache { Arc::new(CompileCache::disabled()) } else { Arc::new(CompileCache::new()) };
        Context {
            devices: vec![RegisteredDevice {
                info: Arc::new(DeviceInfo::cpu_emulator()),
                backend: Arc::new(CpuEmulatorBackend),
            }],
            cache,
            props,
            next_accelerator_id: AtomicU64::new(1),
            kernels: Mutex::new(HashMap::new()),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers an additional device (a PTX- or OpenCL-served accelerator)
    /// so `get_device`/`get_preferred_device`/`open_stream` can see it, and
    /// raises `AcceleratorCreated` for every observer currently subscribed
    /// via [`Context::on_accelerator_created`]. Build-once: intended to run
    /// during `Context` construction, before any `Stream` is opened, since
    /// the Context's device mapping is build-once/read-many after
    /// construction.
    pub fn register_device(mut self, device: DeviceInfo) -> Context {
        let backend: Arc<dyn Backend> = match device.class {
            DeviceClass::Cpu => Arc::new(CpuEmulatorBackend),
            DeviceClass::Ptx => Arc::new(PtxBackend),
            DeviceClass::OpenCl => Arc::new(OpenClBackend),
        };
        let info = Arc::new(device);
        for observer in self.observers.lock().iter() {
            observer(&info);
        }
        self.devices.push(RegisteredDevice { info, backend });
        self
    }

    /// Subscribes `observer` to this `Context`'s `AcceleratorCreated`
    /// event (spec §4.J). `observer` is invoked once for every device
    /// already registered (the CPU emulator, plus anything an earlier
    /// `register_device` call already added) and again for every device a
    /// later `register_device` call adds — so a subscriber sees the whole
    /// device registry regardless of when in the construction chain it
    /// subscribes.
    pub fn on_accelerator_created(&self, observer: impl Fn(&DeviceInfo) + Send + Sync + 'static) {
        let observer: Arc<AcceleratorObserver> = Arc::new(observer);
        for device in &self.devices {
            observer(&device.info);
        }
        self.observers.lock().push(observer);
    }

    pub fn properties(&self) -> &ContextProperties {
        &self.props
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> + '_ {
        self.devices.iter().map(|d| d.info.as_ref())
    }

    /// The first registered device of `class`, if any.
    pub fn get_device(&self, class: DeviceClass) -> Result<Arc<DeviceInfo>> {
        self.devices
            .iter()
            .find(|d| d.info.class == class)
            .map(|d| d.info.clone())
            .ok_or_else(|| Error::AcceleratorUnavailable { detail: format!("no device of class {:?} registered", class) })
    }

    /// Ranks devices by `memory_bytes` descending, falling back to the
    /// CPU/debug device when no accelerator exists. `prefer_cpu` puts the CPU
    /// emulator first regardless of its memory figure; `matching_only`
    /// restricts the ranking to a single `DeviceClass` before falling back.
    /// Never empty: a `Context` always has the CPU emulator registered.
    pub fn get_preferred_device(&self, prefer_cpu: bool, matching_only: Option<DeviceClass>) -> Vec<Arc<DeviceInfo>> {
        let candidates = self.devices.iter().filter(|d| matching_only.map_or(true, |class| d.info.class == class));

        let (debug, accelerators): (Vec<_>, Vec<_>) = candidates.partition(|d| d.info.class.is_debug_device());
        let mut accelerators: Vec<_> = accelerators;
        accelerators.sort_by(|a, b| b.info.memory_bytes.cmp(&a.info.memory_bytes));

        let mut ranked: Vec<Arc<DeviceInfo>> = if prefer_cpu {
            debug.iter().chain(accelerators.iter()).map(|d| d.info.clone()).collect()
        } else {
            accelerators.iter().chain(debug.iter()).map(|d| d.info.clone()).collect()
        };

        if ranked.is_empty() {
            // `matching_only` excluded everything, including the CPU
            // emulator: fall back to the unfiltered CPU/debug device.
            if let Some(cpu) = self.devices.iter().find(|d| d.info.class.is_debug_device()) {
                ranked.push(cpu.info.clone());
            }
        }
        ranked
    }

    fn find_backend(&self, class: DeviceClass) -> Result<(Arc<DeviceInfo>, Arc<dyn Backend>)> {
        self.devices
            .iter()
            .find(|d| d.info.class == class)
            .map(|d| (d.info.clone(), d.backend.clone()))
            .ok_or_else(|| Error::AcceleratorUnavailable { detail: format!("no device of class {:?} registered", class) })
    }

    /// Mints a `Stream` bound to the first registered device of `class`,
    /// sharing this context's Compile Cache and `ContextProperties`.
    pub fn open_stream(&self, class: DeviceClass) -> Result<Stream> {
        let (device, backend) = self.find_backend(class)?;
        let accelerator_id = self.next_accelerator_id.fetch_add(1, Ordering::Relaxed);
        log::info!("opening stream {} on {} ({:?})", accelerator_id, device.name, class);
        Ok(Stream::new(accelerator_id, device, backend, self.cache.clone(), self.props.clone()))
    }

    /// Registers `module` as a declared kernel named `entry_name`,
    /// monomorphised over `type_args`, targeting `device_class`. A second
    /// `declare_kernel` call with the same `entry_name` replaces the first:
    /// declaration is by name, so a re-declaration is a redefinition, not
    /// an error.
    pub fn declare_kernel(
        &self,
        module: Module,
        type_args: Vec<String>,
        device_class: DeviceClass,
    ) -> KernelHandle {
        let handle = KernelHandle {
            inner: Arc::new(KernelHandleInner {
                entry_name: module.entry_name.clone(),
                type_args,
                device_class,
                module: Arc::new(module),
                state: Mutex::new(KernelState::Declared),
                fingerprint: Mutex::new(None),
            }),
        };
        self.kernels.lock().insert(handle.inner.entry_name.clone(), handle.clone());
        handle
    }

    pub fn kernel(&self, entry_name: &str) -> Option<KernelHandle> {
        self.kernels.lock().get(entry_name).cloned()
    }

    /// Clears the Compile Cache and marks every declared kernel `Evicted`.
    pub fn clear_cache(&self, mode: ClearMode) {
        self.cache.clear(mode);
        if matches!(mode, ClearMode::All | ClearMode::CompiledKernelsOnly) {
            for handle in self.kernels.lock().values() {
                if matches!(handle.state(), KernelState::Built) {
                    handle.set_state(KernelState::Evicted);
                }
            }
        }
    }

    pub fn compile_cache(&self) -> &Arc<CompileCache> {
        &self.cache
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new(ContextProperties::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OpenClVersion;
    use crate::ir::builder::build_module;
    use crate::ir::module::Terminator;
    use crate::ir::types::ValueType;

    fn trivial_module(name: &str) -> Module {
        build_module(name, |b| {
            b.set_return_type(ValueType::Unit);
            b.new_block();
            b.terminate(Terminator::Return(None));
        })
    }

    #[test]
    fn a_fresh_context_only_has_the_cpu_emulator() {
        let ctx = Context::default();
        assert!(ctx.get_device(DeviceClass::Cpu).is_ok());
        assert!(ctx.get_device(DeviceClass::Ptx).is_err());
    }

    #[test]
    fn preferred_device_falls_back_to_cpu_when_nothing_else_is_registered() {
        let ctx = Context::default();
        let ranked = ctx.get_preferred_device(false, None);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].class, DeviceClass::Cpu);
    }

    #[test]
    fn preferred_device_ranks_registered_gpus_by_memory_descending() {
        let ctx = Context::default()
            .register_device(DeviceInfo::opencl_placeholder("small", 1024, OpenClVersion::V2_0))
            .register_device(DeviceInfo::ptx_placeholder("big", 1024 * 1024));
        let ranked = ctx.get_preferred_device(false, None);
        assert_eq!(ranked[0].class, DeviceClass::Ptx);
        assert_eq!(ranked[1].class, DeviceClass::OpenCl);
        assert_eq!(ranked[2].class, DeviceClass::Cpu);
    }

    #[test]
    fn preferred_device_prefer_cpu_puts_the_emulator_first() {
        let ctx = Context::default().register_device(DeviceInfo::ptx_placeholder("big", 1024 * 1024));
        let ranked = ctx.get_preferred_device(true, None);
        assert_eq!(ranked[0].class, DeviceClass::Cpu);
        assert_eq!(ranked[1].class, DeviceClass::Ptx);
    }

    #[test]
    fn preferred_device_matching_only_filters_to_one_class() {
        let ctx = Context::default()
            .register_device(DeviceInfo::opencl_placeholder("gpu", 1024, OpenClVersion::V2_0))
            .register_device(DeviceInfo::ptx_placeholder("big", 1024 * 1024));
        let ranked = ctx.get_preferred_device(false, Some(DeviceClass::OpenCl));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].class, DeviceClass::OpenCl);
    }

    #[test]
    fn declaring_a_kernel_makes_it_retrievable_by_name() {
        let ctx = Context::default();
        let handle = ctx.declare_kernel(trivial_module("noop"), vec![], DeviceClass::Cpu);
        assert_eq!(handle.state(), KernelState::Declared);
        assert!(ctx.kernel("noop").is_some());
        assert!(ctx.kernel("missing").is_none());
    }

    #[test]
    fn clearing_the_cache_evicts_built_kernels() {
        let ctx = Context::default();
        let handle = ctx.declare_kernel(trivial_module("noop2"), vec![], DeviceClass::Cpu);
        handle.set_state(KernelState::Built);
        ctx.clear_cache(ClearMode::All);
        assert_eq!(handle.state(), KernelState::Evicted);
    }

    #[test]
    fn open_stream_fails_for_an_unregistered_device_class() {
        let ctx = Context::default();
        assert!(ctx.open_stream(DeviceClass::Ptx).is_err());
    }

    #[test]
    fn open_stream_succeeds_for_the_cpu_emulator() {
        let ctx = Context::default();
        assert!(ctx.open_stream(DeviceClass::Cpu).is_ok());
    }

    #[test]
    fn subscribing_replays_already_registered_devices() {
        let ctx = Context::default().register_device(DeviceInfo::ptx_placeholder("big", 1024));
        let seen: Arc<Mutex<Vec<DeviceClass>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_observer = seen.clone();
        ctx.on_accelerator_created(move |device| seen_for_observer.lock().push(device.class));
        assert_eq!(*seen.lock(), vec![DeviceClass::Cpu, DeviceClass::Ptx]);
    }

    #[test]
    fn subscribing_then_registering_notifies_the_new_device_too() {
        let ctx = Context::default();
        let seen: Arc<Mutex<Vec<DeviceClass>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_for_observer = seen.clone();
        ctx.on_accelerator_created(move |device| seen_for_observer.lock().push(device.class));
        let ctx = ctx.register_device(DeviceInfo::opencl_placeholder("gpu", 1024, OpenClVersion::V2_0));
        assert_eq!(*seen.lock(), vec![DeviceClass::Cpu, DeviceClass::OpenCl]);
        assert!(ctx.get_device(DeviceClass::OpenCl).is_ok());
    }
}
