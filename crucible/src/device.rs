//! Device registry: `DeviceClass` and `DeviceInfo`, giving `Context` and
//! `compute_grid_stride_kernel_config` something concrete to consult.

use crucible_core::Index3D;

/// Which backend a device is served by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceClass {
    /// The CPU emulator: always present, the reference/testing oracle.
    Cpu,
    /// An NVIDIA accelerator targeted via the PTX backend.
    Ptx,
    /// An accelerator targeted via the OpenCL-C backend.
    OpenCl,
}

impl DeviceClass {
    pub fn is_debug_device(&self) -> bool {
        matches!(self, DeviceClass::Cpu)
    }
}

/// The OpenCL-C version negotiated with a device, for devices served by
/// the OpenCL backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OpenClVersion {
    V1_0,
    V1_1,
    V1_2,
    V2_0,
}

/// Static and queryable facts about one accelerator. Populated once at
/// `Context` construction and never mutated afterward: the device mapping
/// is build-once, read-many.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub class: DeviceClass,
    pub name: String,
    /// Device memory size in bytes, used to rank candidates in
    /// `get_preferred_device`, which ranks non-debug devices by memory
    /// size descending.
    pub memory_bytes: u64,
    pub max_group_size: i32,
    pub preferred_group_size: i32,
    pub warp_size: i32,
    pub max_grid_size: i32,
    /// `K` in `compute_grid_stride_kernel_config`: the number of
    /// elements each thread processes per grid-stride step before the
    /// grid is considered "full".
    pub grid_stride_factor: i32,
    /// Whether this device can run the Scan/Reduce Engine's single-pass
    /// path, i.e. has device-wide atomics/fences cheap enough for
    /// the `SequentialGroupExecutor` spin protocol.
    pub supports_single_pass_scan: bool,
    pub opencl_version: Option<OpenClVersion>,
    /// Upper bound on `static_shared_memory_bytes + dynamic_shared_memory`
    /// a single launch may request.
    pub max_shared_memory_bytes: u32,
}

impl DeviceInfo {
    pub fn cpu_emulator() -> DeviceInfo {
        DeviceInfo {
            class: DeviceClass::Cpu,
            name: "cpu-emulator".to_string(),
            memory_bytes: sys_memory_estimate(),
            max_group_size: 1024,
            preferred_group_size: 256,
            warp_size: 32,
            max_grid_size: i32::MAX,
            grid_stride_factor: 4,
            supports_single_pass_scan: true,
            opencl_version: None,
            max_shared_memory_bytes: 48 * 1024,
        }
    }

    /// A placeholder entry for a discovered PTX-capable device. Real
    /// discovery (driver bindings) is out of scope; callers that do
    /// have a driver layer populate this from the driver's device query
    /// instead of calling this constructor.
    pub fn ptx_placeholder(name: impl Into<String>, memory_bytes: u64) -> DeviceInfo {
        DeviceInfo {
            class: DeviceClass::Ptx,
            name: name.into(),
            memory_bytes,
            max_group_size: 1024,
            preferred_group_size: 256,
            warp_size: 32,
            max_grid_size: i32::MAX,
            grid_stride_factor: 8,
            supports_single_pass_scan: true,
            opencl_version: None,
            max_shared_memory_bytes: 48 * 1024,
        }
    }

    pub fn opencl_placeholder(
        name: impl Into<String>,
        memory_bytes: u64,
        version: OpenClVersion,
    ) -> DeviceInfo {
        DeviceInfo {
            class: DeviceClass::OpenCl,
            name: name.into(),
            memory_bytes,
            max_group_size: 256,
            preferred_group_size: 128,
            warp_size: 32,
            max_grid_size: i32::MAX,
            grid_stride_factor: 8,
            supports_single_pass_scan: version >= OpenClVersion::V2_0,
            opencl_version: Some(version),
            max_shared_memory_bytes: 32 * 1024,
        }
    }

    pub fn group_dim_fits(&self, group_dim: &Index3D) -> bool {
        group_dim.size() <= self.max_group_size as i64
    }
}

fn sys_memory_estimate() -> u64 {
    // The CPU emulator has no real VRAM figure; a constant stand-in keeps
    // `get_preferred_device`'s memory-size ranking well-defined without a
    // platform-specific sysinfo dependency for a figure with no real meaning
    // on an emulator.
    8u64 * 1024 * 1024 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_device_is_the_debug_device() {
        assert!(DeviceClass::Cpu.is_debug_device());
        assert!(!DeviceClass::Ptx.is_debug_device());
    }

    #[test]
    fn opencl_pre_2_0_lacks_single_pass_scan() {
        let dev = DeviceInfo::opencl_placeholder("test", 1024, OpenClVersion::V1_2);
        assert!(!dev.supports_single_pass_scan);
        let dev2 = DeviceInfo::opencl_placeholder("test", 1024, OpenClVersion::V2_0);
        assert!(dev2.supports_single_pass_scan);
    }
}
