// gpu/device.rs — wgpu device enumeration and per-device context.
//
// Responsibilities:
//   - Enumerate Vulkan adapters and open one `GpuDevice` per physical
//     GPU, rejecting CPU/software renderers with a tiered fallback.
//   - Report a per-device memory budget the scheduler can partition
//     against (wgpu exposes no "total VRAM", see MEMORY BUDGET below).
//   - Provide `WorkgroupSize` and ceiling-division dispatch helpers for
//     the 2-D and 3-D kernels.
//
// ADAPTER SELECTION:
// wgpu's default `request_adapter` uses power-preference heuristics
// that may grab llvmpipe/softpipe on headless boxes (where the software
// renderer appears as a valid Vulkan device). We enumerate explicitly,
// prefer real hardware, and only fall back to software when nothing
// else exists — a reconstruction on llvmpipe is useless but a test run
// on it is not.
//
// MEMORY BUDGET:
// Vulkan-via-wgpu reports buffer limits, not physical VRAM. We use
// `max_buffer_size` (clamped by `max_storage_buffer_binding_size`) as
// the budget a single sub-volume allocation must fit into, which is
// exactly the constraint the scheduler's halving loop enforces. An
// operator who knows better can override the budget per device before
// planning.
//
// NEW WGPU CONCEPTS:
// - `pollster::block_on` — runs an async fn to completion on the
//   current thread. wgpu's adapter/device API is async because WebGPU
//   maps to JS Promises; for native Vulkan we just block.
// - Field drop order: Rust drops struct fields in declaration order.
//   The shared `wgpu::Instance` is held behind an `Arc` declared last
//   in `GpuDevice`, so device-level objects never outlive the Vulkan
//   instance they were created from.

use std::fmt;
use std::sync::Arc;

use log::info;

use crate::scheduler::DeviceMemory;

// ---------------------------------------------------------------------------
// Workgroup sizing
// ---------------------------------------------------------------------------

/// Workgroup configuration for the 2-D detector kernels (weighting,
/// pad/apply/crop) and the 3-D back-projection kernel (z depth 1 per
/// workgroup, sliced by dispatch).
///
/// 16×8 = 128 invocations: four 32-wide NVIDIA warps or two 64-wide AMD
/// waves, with the 16-wide x dimension matching row-major detector
/// lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkgroupSize {
    pub x: u32,
    pub y: u32,
}

impl WorkgroupSize {
    pub const DEFAULT: WorkgroupSize = WorkgroupSize { x: 16, y: 8 };

    /// Invocations per workgroup.
    #[inline]
    pub fn total(&self) -> u32 {
        self.x * self.y
    }
}

impl fmt::Display for WorkgroupSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}×{} ({} invocations)", self.x, self.y, self.total())
    }
}

/// Workgroup width of the row-parallel FFT kernel (one invocation per
/// detector row; the kernel loops over the transform internally).
pub const FFT_WORKGROUP: u32 = 64;

// ---------------------------------------------------------------------------
// Adapter info
// ---------------------------------------------------------------------------

/// Cached adapter information for logging and debugging.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub vendor: u32,
    pub device: u32,
    pub device_type: wgpu::DeviceType,
    pub backend: wgpu::Backend,
}

impl fmt::Display for AdapterInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}, {:?})",
            self.name, self.backend, self.device_type
        )
    }
}

// ---------------------------------------------------------------------------
// GpuDevice
// ---------------------------------------------------------------------------

/// One opened GPU: device, queue, identity and memory budget.
///
/// Create the whole set via [`enumerate_devices`]; the `id` is the
/// index the scheduler's plan refers to. Hold the devices for the
/// lifetime of the run — opening them is expensive, everything created
/// from them is cheap.
pub struct GpuDevice {
    /// Plan-facing device id (position in the enumeration order).
    pub id: usize,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: AdapterInfo,
    pub workgroup_size: WorkgroupSize,
    /// Bytes a single device allocation may occupy. Defaults to the
    /// adapter's buffer limits; override before planning if the real
    /// budget is known.
    pub memory_budget: usize,
    /// Keeps the shared `wgpu::Instance` alive until every device is
    /// dropped. Never accessed directly.
    _instance: Arc<wgpu::Instance>,
}

impl GpuDevice {
    /// Dispatch dimensions covering a `w × h` grid with the active
    /// workgroup size (ceiling division — the shader guards the edge).
    pub fn dispatch_2d(&self, w: u32, h: u32) -> (u32, u32) {
        let dx = (w + self.workgroup_size.x - 1) / self.workgroup_size.x;
        let dy = (h + self.workgroup_size.y - 1) / self.workgroup_size.y;
        (dx, dy)
    }

    /// Dispatch dimensions for a `w × h × d` voxel grid: 2-D workgroups
    /// sliced along z, one workgroup layer per slice.
    pub fn dispatch_3d(&self, w: u32, h: u32, d: u32) -> (u32, u32, u32) {
        let (dx, dy) = self.dispatch_2d(w, h);
        (dx, dy, d)
    }

    /// Dispatch width for the row-parallel FFT kernel.
    pub fn dispatch_rows(&self, rows: u32) -> u32 {
        (rows + FFT_WORKGROUP - 1) / FFT_WORKGROUP
    }

    /// Bake the workgroup dimensions into a WGSL source template.
    ///
    /// naga does not support `override` expressions inside
    /// `@workgroup_size()`, so the shader files carry `{{WG_X}}`,
    /// `{{WG_Y}}` and `{{WG_ROWS}}` placeholder tokens instead.
    pub fn specialize_shader(&self, template: &str) -> String {
        template
            .replace("{{WG_X}}", &self.workgroup_size.x.to_string())
            .replace("{{WG_Y}}", &self.workgroup_size.y.to_string())
            .replace("{{WG_ROWS}}", &FFT_WORKGROUP.to_string())
    }
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpuDevice #{} {{ adapter: {}, budget: {} MiB, workgroup: {} }}",
            self.id,
            self.adapter_info,
            self.memory_budget >> 20,
            self.workgroup_size
        )
    }
}

/// Scheduler inputs for a set of opened devices.
pub fn device_memories(devices: &[GpuDevice]) -> Vec<DeviceMemory> {
    devices
        .iter()
        .map(|d| DeviceMemory {
            id: d.id,
            bytes: d.memory_budget,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Enumeration
// ---------------------------------------------------------------------------

/// Open every usable Vulkan GPU, hardware first.
///
/// Tier 1 takes discrete, integrated and virtual GPUs (plus `Other`,
/// which covers translation layers like dzn on WSL2); tier 2 — only if
/// tier 1 is empty — takes whatever is left, software renderers
/// included, so CI without real GPUs can still exercise the path.
///
/// # Errors
/// `GpuError::NoAdapters` if no Vulkan adapter exists at all;
/// `GpuError::DeviceRequest` if every adapter refuses a device.
pub fn enumerate_devices() -> Result<Vec<GpuDevice>, GpuError> {
    pollster::block_on(enumerate_async())
}

async fn enumerate_async() -> Result<Vec<GpuDevice>, GpuError> {
    let flags = if cfg!(debug_assertions) {
        wgpu::InstanceFlags::VALIDATION
            | wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    } else {
        wgpu::InstanceFlags::ALLOW_UNDERLYING_NONCOMPLIANT_ADAPTER
    };

    let instance = Arc::new(wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::VULKAN,
        flags,
        ..Default::default()
    }));

    let all: Vec<wgpu::Adapter> = instance.enumerate_adapters(wgpu::Backends::VULKAN);
    if all.is_empty() {
        return Err(GpuError::NoAdapters);
    }
    for a in &all {
        let i = a.get_info();
        info!(
            "Vulkan adapter: {} ({:?}, {:?})",
            i.name, i.backend, i.device_type
        );
    }

    let (hardware, software): (Vec<wgpu::Adapter>, Vec<wgpu::Adapter>) =
        all.into_iter().partition(|a| {
            matches!(
                a.get_info().device_type,
                wgpu::DeviceType::DiscreteGpu
                    | wgpu::DeviceType::IntegratedGpu
                    | wgpu::DeviceType::VirtualGpu
                    | wgpu::DeviceType::Other
            )
        });
    let chosen = if hardware.is_empty() { software } else { hardware };

    let mut devices = Vec::new();
    let mut last_err: Option<wgpu::RequestDeviceError> = None;

    for adapter in chosen {
        let raw = adapter.get_info();
        let limits = adapter.limits();

        match adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("konrad"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::default(),
                },
                None,
            )
            .await
        {
            Ok((device, queue)) => {
                let budget = (limits.max_buffer_size as usize)
                    .min(limits.max_storage_buffer_binding_size as usize);
                let id = devices.len();
                devices.push(GpuDevice {
                    id,
                    device,
                    queue,
                    adapter_info: AdapterInfo {
                        name: raw.name.clone(),
                        vendor: raw.vendor,
                        device: raw.device,
                        device_type: raw.device_type,
                        backend: raw.backend,
                    },
                    workgroup_size: WorkgroupSize::DEFAULT,
                    memory_budget: budget,
                    _instance: instance.clone(),
                });
            }
            Err(e) => last_err = Some(e),
        }
    }

    if devices.is_empty() {
        return Err(match last_err {
            Some(e) => GpuError::DeviceRequest(e),
            None => GpuError::NoAdapters,
        });
    }
    for d in &devices {
        info!("{d}");
    }
    Ok(devices)
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from GPU device enumeration.
#[derive(Debug)]
pub enum GpuError {
    /// No Vulkan adapter visible at all. Check the driver stack;
    /// `vulkaninfo` should list at least one device.
    NoAdapters,
    /// Every adapter refused a device (driver issue, unsupported
    /// limits, ...). Carries the last refusal.
    DeviceRequest(wgpu::RequestDeviceError),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::NoAdapters => write!(
                f,
                "no Vulkan adapter found; ensure Vulkan is installed and \
                 `vulkaninfo` lists a device"
            ),
            GpuError::DeviceRequest(e) => write!(f, "device request failed: {e}"),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::DeviceRequest(e) => Some(e),
            GpuError::NoAdapters => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
