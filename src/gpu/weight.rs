// gpu/weight.rs — GPU cosine weighting stage.
//
// Drop-in GPU counterpart of weight::apply_weights: one dispatch over
// the detector grid, in place on the projection's storage buffer. The
// pipeline is compiled once per device at stage start; per projection
// only a bind group and a tiny uniform buffer are created.

use wgpu::util::DeviceExt;

use crate::geometry::DetectorGeometry;
use crate::gpu::device::GpuDevice;
use crate::gpu::projection::GpuProjection;
use crate::weight::{h_min, v_min};

/// Uniform block for weight.wgsl. Layout must match `WeightParams`
/// there: three u32 + pad, then five f32 + three pads = 48 bytes.
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct WeightParams {
    width: u32,
    height: u32,
    pitch: u32,
    _pad0: u32,
    d_sd: f32,
    h_min: f32,
    v_min: f32,
    l_px_row: f32,
    l_px_col: f32,
    _pad1: f32,
    _pad2: f32,
    _pad3: f32,
}

/// Compiled weighting pipeline for one device.
pub struct GpuWeighter {
    pipeline: wgpu::ComputePipeline,
    bgl: wgpu::BindGroupLayout,
    det: DetectorGeometry,
}

impl GpuWeighter {
    pub fn new(gpu: &GpuDevice, det: &DetectorGeometry) -> Self {
        let shader_src = gpu.specialize_shader(include_str!("../shaders/weight.wgsl"));
        let shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("weight.wgsl"),
                source: wgpu::ShaderSource::Wgsl(shader_src.into()),
            });

        let bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuWeighter BGL"),
                entries: &[
                    // Binding 0 — projection buffer, read-write.
                    wgpu::BindGroupLayoutEntry {
                        binding: 0,
                        visibility: wgpu::ShaderStages::COMPUTE,
                        ty: wgpu::BindingType::Buffer {
                            ty: wgpu::BufferBindingType::Storage { read_only: false },
                            has_dynamic_offset: false,
                            min_binding_size: None,
                        },
                        count: None,
                    },
                    // Binding 1 — params uniform.
                    wgpu::BindGroupLayoutEntry {
                        binding: 1,
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
                label: Some("GpuWeighter pipeline layout"),
                bind_group_layouts: &[&bgl],
                push_constant_ranges: &[],
            });

        let pipeline = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("weight_main"),
                layout: Some(&layout),
                module: &shader,
                entry_point: "weight_main",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        GpuWeighter {
            pipeline,
            bgl,
            det: *det,
        }
    }

    /// Weight one projection in place. Asynchronous on the device
    /// timeline; ordering against later stages comes from queue order.
    pub fn run(&self, gpu: &GpuDevice, proj: &GpuProjection) {
        let params = WeightParams {
            width: proj.width,
            height: proj.height,
            pitch: proj.pitch,
            _pad0: 0,
            d_sd: self.det.d_sd(),
            h_min: h_min(&self.det),
            v_min: v_min(&self.det),
            l_px_row: self.det.l_px_row,
            l_px_col: self.det.l_px_col,
            _pad1: 0.0,
            _pad2: 0.0,
            _pad3: 0.0,
        };
        let params_buf = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("WeightParams"),
                contents: bytemuck::bytes_of(&params),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let bind_group = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuWeighter bind group"),
            layout: &self.bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: proj.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params_buf.as_entire_binding(),
                },
            ],
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuWeighter::run"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("weight_main"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            let (dx, dy) = gpu.dispatch_2d(proj.width, proj.height);
            pass.dispatch_workgroups(dx, dy, 1);
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
    use crate::projection::Image;
    use crate::weight::weight_at;

    #[test]
    fn test_params_layout() {
        // Must match the 48-byte WGSL uniform struct.
        assert_eq!(std::mem::size_of::<WeightParams>(), 48);
    }

    #[test]
    #[ignore = "requires a Vulkan adapter"]
    fn inner_gpu_matches_cpu_weight_map() {
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
        let devices = crate::gpu::device::enumerate_devices().expect("need a GPU");
        let gpu = &devices[0];

        let mut ones = Image::new(32, 32);
        ones.fill(1.0);
        let proj = GpuProjection::upload(gpu, &ones, 0);

        let weighter = GpuWeighter::new(gpu, &det);
        weighter.run(gpu, &proj);

        let out = proj.readback(gpu);
        for t in 0..32u32 {
            for s in 0..32u32 {
                let expected = weight_at(&det, s, t);
                let got = out.get(s as usize, t as usize);
                assert!(
                    (got - expected).abs() <= 1e-5 * expected,
                    "GPU weight mismatch at ({s},{t}): {got} vs {expected}"
                );
            }
        }
        println!("GPU_TEST_OK");
    }
}
