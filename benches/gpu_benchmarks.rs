// benches/gpu_benchmarks.rs — GPU kernel benchmarks.
//
// Mirrors benchmarks.rs so each stage has a CPU/GPU pair for direct
// comparison:
//
//   cargo bench --bench gpu_benchmarks
//
// Without a Vulkan adapter the whole suite is skipped (not failed), so
// `cargo bench` stays green on CI boxes.
//
// CRITERION + GPU CAVEAT
// ───────────────────────
// Wall time includes CPU-side overhead (bind groups, submit) plus the
// poll(Wait) that drains the queue. That is the honest per-projection
// cost: the pipeline cannot hand a projection downstream before its
// dispatches are queued, and the merge cannot start before the queue
// drains. Warmup absorbs lazy shader compilation on first dispatch.

use criterion::{criterion_group, criterion_main, Criterion};

use konrad::geometry::{calculate_volume_geometry, DetectorGeometry};
use konrad::gpu::backproject::{GpuBackprojector, GpuSubVolume};
use konrad::gpu::device::{enumerate_devices, GpuDevice};
use konrad::gpu::filter::GpuFilter;
use konrad::gpu::projection::GpuProjection;
use konrad::gpu::weight::GpuWeighter;
use konrad::projection::Image;
use konrad::scheduler::SubVolumeDesc;

fn detector(n: u32) -> DetectorGeometry {
    DetectorGeometry {
        n_row: n,
        n_col: n,
        l_px_row: 0.4,
        l_px_col: 0.4,
        delta_s: 0.0,
        delta_t: 0.0,
        d_so: 300.0,
        d_od: 500.0,
        n_proj: 360,
        rot_angle: 1.0,
    }
}

fn make_projection(n: u32) -> Image {
    let n = n as usize;
    let mut img = Image::new(n, n);
    for t in 0..n {
        for s in 0..n {
            img.set(s, t, ((s * 31 + t * 17) % 251) as f32 / 251.0);
        }
    }
    img
}

fn first_gpu() -> Option<GpuDevice> {
    match enumerate_devices() {
        Ok(mut devices) => Some(devices.remove(0)),
        Err(e) => {
            eprintln!("[gpu_benchmarks] no GPU, skipping: {e}");
            None
        }
    }
}

fn bench_gpu_stages(c: &mut Criterion) {
    let Some(gpu) = first_gpu() else { return };

    let n = 256u32;
    let det = detector(n);
    let vol = calculate_volume_geometry(&det);
    let img = make_projection(n);

    let weighter = GpuWeighter::new(&gpu, &det);
    let mut filter = GpuFilter::new(&gpu, &det);
    let bp = GpuBackprojector::new(&gpu, &det, &vol);
    let slab = GpuSubVolume::new(
        &gpu,
        &vol,
        SubVolumeDesc {
            index: 0,
            device: 0,
            dim_z_local: vol.dim_z,
            z_offset: 0,
            row_top: 0,
            row_bottom: det.n_col - 1,
        },
    );
    let proj = GpuProjection::upload(&gpu, &img, 0);

    c.bench_function("gpu_weighting_256", |b| {
        b.iter(|| {
            weighter.run(&gpu, &proj);
            gpu.device.poll(wgpu::Maintain::Wait);
        });
    });

    c.bench_function("gpu_filtering_256", |b| {
        b.iter(|| {
            filter.run(&gpu, &proj);
            gpu.device.poll(wgpu::Maintain::Wait);
        });
    });

    c.bench_function("gpu_backprojection_256", |b| {
        b.iter(|| {
            bp.run(&gpu, &proj, &slab, 0.644_217_7, 0.764_842_2);
            gpu.device.poll(wgpu::Maintain::Wait);
        });
    });

    c.bench_function("gpu_upload_256", |b| {
        b.iter(|| {
            let p = GpuProjection::upload(&gpu, &img, 0);
            gpu.device.poll(wgpu::Maintain::Wait);
            p
        });
    });
}

criterion_group!(benches, bench_gpu_stages);
criterion_main!(benches);
