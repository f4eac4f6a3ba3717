// gpu/filter.rs — GPU ramp-filtering stage.
//
// Per projection: pad → forward FFT → multiply by the cached response →
// inverse FFT → crop/normalize, all recorded into one encoder and
// submitted together. The frequency response is built once on the CPU
// (filter::frequency_filter — it is a startup cost, not a per-
// projection one) and uploaded to the device at stage start.
//
// SHAPE CACHING
// ──────────────
// Compute pipelines are compiled once per device. The complex work
// buffer and the parameter uniforms depend on the projection shape
// (width, height, pitch); they are cached per shape instead of being
// reallocated per projection. With a fixed detector there is exactly
// one shape for the whole run — the map exists so a mixed-shape source
// cannot silently corrupt the work buffer.

use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::filter::{frequency_filter, padded_length};
use crate::geometry::DetectorGeometry;
use crate::gpu::device::GpuDevice;
use crate::gpu::projection::GpuProjection;

/// Uniform block for filter.wgsl (16 bytes).
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FilterParams {
    width: u32,
    height: u32,
    pitch: u32,
    len: u32,
}

/// Uniform block for fft.wgsl (16 bytes).
#[repr(C)]
#[derive(Copy, Clone, bytemuck::Pod, bytemuck::Zeroable)]
struct FftParams {
    rows: u32,
    len: u32,
    log2_len: u32,
    inverse: u32,
}

/// Per-shape device resources: the complex work buffer and the uniform
/// blocks describing it.
struct ShapeCache {
    work: wgpu::Buffer,
    filter_params: wgpu::Buffer,
    fft_forward: wgpu::Buffer,
    fft_inverse: wgpu::Buffer,
}

/// Compiled filtering stage for one device.
pub struct GpuFilter {
    pad: wgpu::ComputePipeline,
    apply: wgpu::ComputePipeline,
    crop: wgpu::ComputePipeline,
    filter_bgl: wgpu::BindGroupLayout,
    fft: wgpu::ComputePipeline,
    fft_bgl: wgpu::BindGroupLayout,
    response: wgpu::Buffer,
    len: u32,
    shapes: HashMap<(u32, u32, u32), ShapeCache>,
}

impl GpuFilter {
    /// Compile the pipelines and upload the frequency response for this
    /// detector.
    pub fn new(gpu: &GpuDevice, det: &DetectorGeometry) -> Self {
        let len = padded_length(det.n_col);
        let response_host = frequency_filter(len, det.l_px_row);
        let response = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("ramp response"),
                contents: bytemuck::cast_slice(&response_host),
                usage: wgpu::BufferUsages::STORAGE,
            });

        // --- filter.wgsl: pad / apply_response / crop_scale ---
        let filter_src = gpu.specialize_shader(include_str!("../shaders/filter.wgsl"));
        let filter_shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("filter.wgsl"),
                source: wgpu::ShaderSource::Wgsl(filter_src.into()),
            });

        let storage_entry = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };
        let uniform_entry = |binding| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let filter_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuFilter BGL"),
                entries: &[
                    storage_entry(0, false), // projection
                    storage_entry(1, false), // work
                    storage_entry(2, true),  // response
                    uniform_entry(3),
                ],
            });
        let filter_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuFilter pipeline layout"),
                bind_group_layouts: &[&filter_bgl],
                push_constant_ranges: &[],
            });

        let make_pipeline = |entry: &str| {
            gpu.device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(entry),
                    layout: Some(&filter_layout),
                    module: &filter_shader,
                    entry_point: entry,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    cache: None,
                })
        };
        let pad = make_pipeline("pad");
        let apply = make_pipeline("apply_response");
        let crop = make_pipeline("crop_scale");

        // --- fft.wgsl ---
        let fft_src = gpu.specialize_shader(include_str!("../shaders/fft.wgsl"));
        let fft_shader = gpu
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("fft.wgsl"),
                source: wgpu::ShaderSource::Wgsl(fft_src.into()),
            });
        let fft_bgl = gpu
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("GpuFilter FFT BGL"),
                entries: &[storage_entry(0, false), uniform_entry(1)],
            });
        let fft_layout = gpu
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("GpuFilter FFT pipeline layout"),
                bind_group_layouts: &[&fft_bgl],
                push_constant_ranges: &[],
            });
        let fft = gpu
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("fft_rows"),
                layout: Some(&fft_layout),
                module: &fft_shader,
                entry_point: "fft_rows",
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            });

        GpuFilter {
            pad,
            apply,
            crop,
            filter_bgl,
            fft,
            fft_bgl,
            response,
            len: len as u32,
            shapes: HashMap::new(),
        }
    }

    /// Padded transform length L.
    #[inline]
    pub fn padded_len(&self) -> u32 {
        self.len
    }

    fn ensure_shape(&mut self, gpu: &GpuDevice, proj: &GpuProjection) {
        let key = (proj.width, proj.height, proj.pitch);
        let len = self.len;
        self.shapes.entry(key).or_insert_with(|| {
            let work_bytes =
                proj.height as u64 * len as u64 * 2 * std::mem::size_of::<f32>() as u64;
            let work = gpu.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("GpuFilter work"),
                size: work_bytes,
                usage: wgpu::BufferUsages::STORAGE,
                mapped_at_creation: false,
            });
            let filter_params = gpu
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: Some("FilterParams"),
                    contents: bytemuck::bytes_of(&FilterParams {
                        width: proj.width,
                        height: proj.height,
                        pitch: proj.pitch,
                        len,
                    }),
                    usage: wgpu::BufferUsages::UNIFORM,
                });
            let fft_params = |inverse: u32| {
                gpu.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some("FftParams"),
                        contents: bytemuck::bytes_of(&FftParams {
                            rows: proj.height,
                            len,
                            log2_len: len.trailing_zeros(),
                            inverse,
                        }),
                        usage: wgpu::BufferUsages::UNIFORM,
                    })
            };
            ShapeCache {
                work,
                filter_params,
                fft_forward: fft_params(0),
                fft_inverse: fft_params(1),
            }
        });
    }

    /// Filter one projection in place on the device.
    pub fn run(&mut self, gpu: &GpuDevice, proj: &GpuProjection) {
        let len = self.len;
        self.ensure_shape(gpu, proj);
        let shape = &self.shapes[&(proj.width, proj.height, proj.pitch)];

        let filter_bind = gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("GpuFilter bind group"),
            layout: &self.filter_bgl,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: proj.buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: shape.work.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.response.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: shape.filter_params.as_entire_binding(),
                },
            ],
        });
        let fft_bind = |params: &wgpu::Buffer| {
            gpu.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("GpuFilter FFT bind group"),
                layout: &self.fft_bgl,
                entries: &[
                    wgpu::BindGroupEntry {
                        binding: 0,
                        resource: shape.work.as_entire_binding(),
                    },
                    wgpu::BindGroupEntry {
                        binding: 1,
                        resource: params.as_entire_binding(),
                    },
                ],
            })
        };
        let fwd_bind = fft_bind(&shape.fft_forward);
        let inv_bind = fft_bind(&shape.fft_inverse);

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuFilter::run"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("ramp filter"),
                timestamp_writes: None,
            });

            let (px, py) = gpu.dispatch_2d(len, proj.height);
            let rows = gpu.dispatch_rows(proj.height);
            let (cx, cy) = gpu.dispatch_2d(proj.width, proj.height);

            pass.set_pipeline(&self.pad);
            pass.set_bind_group(0, &filter_bind, &[]);
            pass.dispatch_workgroups(px, py, 1);

            pass.set_pipeline(&self.fft);
            pass.set_bind_group(0, &fwd_bind, &[]);
            pass.dispatch_workgroups(rows, 1, 1);

            pass.set_pipeline(&self.apply);
            pass.set_bind_group(0, &filter_bind, &[]);
            pass.dispatch_workgroups(px, py, 1);

            pass.set_pipeline(&self.fft);
            pass.set_bind_group(0, &inv_bind, &[]);
            pass.dispatch_workgroups(rows, 1, 1);

            pass.set_pipeline(&self.crop);
            pass.set_bind_group(0, &filter_bind, &[]);
            pass.dispatch_workgroups(cx, cy, 1);
        }
        gpu.queue.submit(std::iter::once(encoder.finish()));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
