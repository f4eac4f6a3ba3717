// gpu/backproject.rs — GPU back-projection stage and sub-volume merge.
//
// The device keeps one zeroed storage buffer per assigned sub-volume
// for the whole run (wgpu zero-initializes buffers, so no explicit
// clear pass is needed). Every filtered projection is accumulated into
// every slab the device owns with one dispatch per (projection, slab)
// pair; the voxel grid maps to invocations 1:1 and no atomics are
// involved — a voxel belongs to exactly one invocation per dispatch.
//
// After the sentinel, `readback` pulls each slab to the host where the
// driver merges it into the output volume. That device→host copy is
// the only blocking synchronization of the whole stage.

use wgpu::util::DeviceExt;

use crate::geometry::{DetectorGeometry, VolumeGeometry};
use crate::gpu::device::GpuDevice;
use crate::gpu::projection::GpuProjection;
use crate::scheduler::SubVolumeDesc;
use crate::volume::SubVolume;
use crate::weight::{h_min, v_min};

/// Uniform block for backproject.wgsl (96 bytes).
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct BpParams {
    dim_x: u32,
    dim_y: u32,
    dim_z_local: u32,
    z_offset: u32,
    width: u32,
    height: u32,
    pitch: u32,
    _pad0: u32,
    vx: f32,
    vy: f32,
    vz: f32,
    _pad1: f32,
    x0: f32,
    y0: f32,
    z0: f32,
    _pad2: f32,
    d_so: f32,
    d_sd: f32,
    h_min: f32,
    v_min: f32,
    l_px_row: f32,
    l_px_col: f32,
    sin_phi: f32,
    cos_phi: f32,
}

/// One z-slab resident on a GPU.
pub struct GpuSubVolume {
    pub buffer: wgpu::Buffer,
    pub desc: SubVolumeDesc,
    pub dim_x: u32,
    pub dim_y: u32,
}

impl GpuSubVolume {
    /// Allocate a zeroed slab buffer for one plan entry.
    pub fn new(gpu: &GpuDevice, vol: &VolumeGeometry, desc: SubVolumeDesc) -> Self {
        let bytes = vol.dim_x as u64
            * vol.dim_y as u64
            * desc.dim_z_local as u64
            * std::mem::size_of::<f32>() as u64;
        let buffer = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuSubVolume"),
            size: bytes,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        GpuSubVolume {
            buffer,
            desc,
            dim_x: vol.dim_x,
            dim_y: vol.dim_y,
        }
    }

    /// Copy the slab back to the host for the merge.
    ///
    /// **Blocking** — this is the end-of-run synchronization point.
    pub fn readback(&self, gpu: &GpuDevice) -> SubVolume {
        let voxels = self.dim_x as usize * self.dim_y as usize * self.desc.dim_z_local as usize;
        let bytes = (voxels * std::mem::size_of::<f32>()) as u64;

        let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuSubVolume::readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuSubVolume::readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &readback_buf, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).expect("readback channel closed");
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .expect("readback callback never fired")
            .expect("readback map failed");

        let mapped = slice.get_mapped_range();
        let mut sub = SubVolume::new(
            self.dim_x,
            self.dim_y,
            self.desc.dim_z_local,
            self.desc.z_offset,
            self.desc.device,
        );
        sub.as_mut_slice()
            .copy_from_slice(bytemuck::cast_slice(&mapped));
        drop(mapped);
        readback_buf.unmap();
        sub
    }
}

/// Compiled back-projection pipeline for one device.
pub struct GpuBackprojector {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    det: DetectorGeometry,
    vol: VolumeGeometry,
}

impl GpuBackprojector {
    pub fn new(gpu: &GpuDevice, det: &DetectorGeometry, vol: &VolumeGeometry) -> Self {
        let shader_src = gpu.specialize_shader(include_str!("../shaders/backproject.wgsl"));
        let shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("backproject.wgsl"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuBackprojector BGL"),
                entries: &[
                    // Binding 0 — filtered projection, read-only.
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: true },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // Binding 1 — sub-volume accumulator.
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // Binding 2 — params uniform.
                    wgpu::BindGroupLayoutEntry {
                        binding: 2,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Uniform,
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                ],
            });

        let layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuBackprojector pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });
        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("backproject"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "backproject",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        GpuBackprojector {
            pipeline,
            bgl,
            det: *det,
            vol: *vol,
        }
    }

    /// Accumulate one filtered projection into one slab.
    pub fn run(
        &self,
        gpu: &GpuDevice,
        proj: &GpuProjection,
        sub: &GpuSubVolume,
        sin_phi: f32,
        cos_phi: f32,
    ) {
        let det = &self.det;
        let vol = &self.vol;
        let params = BpParams {
            dim_x: vol.dim_x,
            dim_y: vol.dim_y,
            dim_z_local: sub.desc.dim_z_local,
            z_offset: sub.desc.z_offset,
            width: proj.width,
            height: proj.height,
            pitch: proj.pitch,
            _pad0: 0,
            vx: vol.l_vx_x,
            vy: vol.l_vx_y,
            vz: vol.l_vx_z,
            _pad1: 0.0,
            x0: -(vol.dim_x as f32 * vol.l_vx_x) / 2.0 + vol.l_vx_x / 2.0,
            y0: -(vol.dim_y as f32 * vol.l_vx_y) / 2.0 + vol.l_vx_y / 2.0,
            z0: -(vol.dim_z as f32 * vol.l_vx_z) / 2.0 + vol.l_vx_z / 2.0,
            _pad2: 0.0,
            d_so: det.d_so.abs(),
            d_sd: det.d_sd(),
            h_min: h_min(det),
            v_min: v_min(det),
            l_px_row: det.l_px_row,
            l_px_col: det.l_px_col,
            sin_phi,
            cos_phi,
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("BpParams"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuBackprojector bind group"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: proj.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: sub.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuBackprojector::run"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("backproject"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (dx, dy, dz) = gpu.dispatch_3d(vol.dim_x, vol.dim_y, sub.desc.dim_z_local);
            pass.dispatch_workgroups(dx, dy, dz);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backproject::backproject as cpu_backproject;
    use crate::projection::Image;
    use crate::scheduler::SubVolumeDesc;

    #[test]
    fn test_params_layout() {
        assert_eq!(std::mem::size_of::<BpParams>(), 96);
    }

    #[test]
    #[ignore = "requires a Vulkan adapter"]
    fn inner_gpu_matches_cpu_backprojection() {
        let det = DetectorGeometry {
            n_row: 32,
            n_col: 32,
            l_px_row: 1.0,
            l_px_col: 1.0,
            delta_s: 0.0,
            delta_t: 0.0,
            d_so: 100.0,
            d_od: 100.0,
            n_proj: 1,
            rot_angle: 1.0,
        };
        let vol = crate::geometry::calculate_volume_geometry(&det);
        let devices = crate::gpu::device::enumerate_devices().expect("need a GPU");
        let gpu = &devices[0];

        let mut img = Image::new(det.n_row as usize, det.n_col as usize);
        img.set(16, 16, 1.0);
        img.set(5, 20, 0.5);

        let (sin_phi, cos_phi) = (0.3f32.sin(), 0.3f32.cos());

        // CPU reference.
        let mut cpu_sub = SubVolume::new(vol.dim_x, vol.dim_y, vol.dim_z, 0, 0);
        cpu_backproject(&mut cpu_sub, &img, &det, &vol, sin_phi, cos_phi);

        // GPU.
        let desc = SubVolumeDesc {
            index: 0,
            device: 0,
            dim_z_local: vol.dim_z,
            z_offset: 0,
            row_top: 0,
            row_bottom: det.n_col - 1,
        };
        let proj = GpuProjection::upload(gpu, &img, 0);
        let bp = GpuBackprojector::new(gpu, &det, &vol);
        let gpu_sub = GpuSubVolume::new(gpu, &vol, desc);
        bp.run(gpu, &proj, &gpu_sub, sin_phi, cos_phi);
        let result = gpu_sub.readback(gpu);

        for (i, (&g, &c)) in result
            .as_slice()
            .iter()
            .zip(cpu_sub.as_slice())
            .enumerate()
        {
            assert!(
                (g - c).abs() <= 1e-5 * c.abs().max(1e-3),
                "voxel {i}: GPU {g} vs CPU {c}"
            );
        }
        println!("GPU_TEST_OK");
    }
}
