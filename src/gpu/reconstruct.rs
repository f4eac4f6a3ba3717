// gpu/reconstruct.rs — GPU reconstruction driver.
//
// Drop-in GPU counterpart of reconstruct::reconstruct. The stage graph
// is identical — source → weight → filter → back-projection → merge —
// but weight/filter/back-projection run one worker *per device*, each
// operating on device-resident buffers:
//
//   source (CPU thread)
//     │  one clone of each projection per device
//     ▼
//   weight(d):  upload to device d → weighting dispatch
//     ▼
//   filter(d):  pad/FFT/apply/IFFT/crop dispatches
//     ▼
//   backproject(d): one dispatch per owned slab, then slab readback
//     ▼
//   merge (driver thread) → sink
//
// Projections stay on their device from upload to accumulation; only
// the CPU-side image crosses the source queue. Per-device command
// queues execute submissions in order, which serializes the stages of
// one projection without any explicit synchronization; the slab
// readback after the sentinel is the only blocking wait.

use std::sync::{Arc, OnceLock};

use log::{info, warn};

use crate::angles::AngleTable;
use crate::geometry::{apply_roi, calculate_volume_geometry, DetectorGeometry};
use crate::gpu::backproject::{GpuBackprojector, GpuSubVolume};
use crate::gpu::device::{device_memories, enumerate_devices, GpuDevice};
use crate::gpu::filter::GpuFilter;
use crate::gpu::projection::GpuProjection;
use crate::gpu::weight::GpuWeighter;
use crate::pipeline::{
    queue, queue_capacity, PipelineError, QueueReceiver, QueueSender, StageWorker,
};
use crate::projection::Projection;
use crate::reconstruct::{
    build_angle_table, note_error, ReconstructionConfig, ReconstructionError,
};
use crate::scheduler::ReconstructionPlan;
use crate::source::{ProjectionSource, VolumeSink};
use crate::volume::{SubVolume, Volume};

/// Reconstruct on every usable GPU in the machine.
pub fn reconstruct_gpu<S>(
    det: &DetectorGeometry,
    source: S,
    sink: &mut dyn VolumeSink,
    config: &ReconstructionConfig,
) -> Result<(), ReconstructionError>
where
    S: ProjectionSource + 'static,
{
    let devices = enumerate_devices()?;
    reconstruct_on(devices, det, source, sink, config)
}

/// Reconstruct on an explicit device set (budgets may have been
/// overridden by the caller before planning).
pub fn reconstruct_on<S>(
    devices: Vec<GpuDevice>,
    det: &DetectorGeometry,
    source: S,
    sink: &mut dyn VolumeSink,
    config: &ReconstructionConfig,
) -> Result<(), ReconstructionError>
where
    S: ProjectionSource + 'static,
{
    let mut vol_geo = calculate_volume_geometry(det);
    if let Some(roi) = &config.roi {
        vol_geo = apply_roi(&vol_geo, roi);
    }
    let plan = Arc::new(ReconstructionPlan::with_volume(
        det,
        vol_geo,
        &device_memories(&devices),
    )?);

    let n_proj = source.num_projections();
    if n_proj != det.n_proj {
        warn!(
            "source provides {n_proj} projections, geometry says {}; using the source's count",
            det.n_proj
        );
    }
    info!(
        "GPU reconstruction: {} x {} x {} voxels, {n_proj} projections, {} device(s)",
        plan.volume.dim_x,
        plan.volume.dim_y,
        plan.volume.dim_z,
        devices.len()
    );

    let devices: Vec<Arc<GpuDevice>> = devices.into_iter().map(Arc::new).collect();
    let capacity = config
        .queue_capacity
        .unwrap_or_else(|| queue_capacity(devices.len()));

    let angles: Arc<OnceLock<AngleTable>> = Arc::new(OnceLock::new());
    let angle_file = config.angle_file.clone();
    let rot_angle = det.rot_angle;

    // ── Queues: one chain per device ─────────────────────────────────────
    let mut weight_txs: Vec<QueueSender<Projection>> = Vec::new();
    let mut weight_rxs: Vec<QueueReceiver<Projection>> = Vec::new();
    let mut filter_txs: Vec<QueueSender<GpuProjection>> = Vec::new();
    let mut filter_rxs: Vec<QueueReceiver<GpuProjection>> = Vec::new();
    let mut bp_txs: Vec<QueueSender<GpuProjection>> = Vec::new();
    let mut bp_rxs: Vec<QueueReceiver<GpuProjection>> = Vec::new();
    for _ in &devices {
        let (tx, rx) = queue::<Projection>(capacity);
        weight_txs.push(tx);
        weight_rxs.push(rx);
        let (tx, rx) = queue::<GpuProjection>(capacity);
        filter_txs.push(tx);
        filter_rxs.push(rx);
        let (tx, rx) = queue::<GpuProjection>(capacity);
        bp_txs.push(tx);
        bp_rxs.push(rx);
    }

    // ── Source worker: fan out one clone per device ──────────────────────
    let src_worker = {
        let angles = angles.clone();
        let angle_file = angle_file.clone();
        let mut source = source;
        StageWorker::spawn("source", move || {
            let table =
                angles.get_or_init(|| build_angle_table(angle_file.as_deref(), n_proj, rot_angle));
            loop {
                match source.next_projection() {
                    Ok(Some((index, image))) => {
                        if index >= n_proj {
                            return Err(PipelineError::stage(
                                "source",
                                format!("projection index {index} out of range (n_proj {n_proj})"),
                            ));
                        }
                        let proj = Projection::new(image, index, table.phi(index));
                        for tx in &weight_txs {
                            if tx.send(proj.clone()).is_err() {
                                return Err(PipelineError::disconnected("source"));
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(PipelineError::stage("source", e.to_string())),
                }
            }
            for tx in &weight_txs {
                tx.finish(1)
                    .map_err(|_| PipelineError::disconnected("source"))?;
            }
            Ok(())
        })
    };

    // ── Weighting workers: upload + weight on their device ───────────────
    let weight_workers: Vec<StageWorker<()>> = devices
        .iter()
        .zip(weight_rxs)
        .zip(filter_txs)
        .map(|((gpu, rx), tx)| {
            let gpu = gpu.clone();
            let det = *det;
            StageWorker::spawn("weight", move || {
                let weighter = GpuWeighter::new(&gpu, &det);
                while let Some(proj) = rx.recv() {
                    let gpu_proj = GpuProjection::upload(&gpu, &proj.image, proj.index);
                    weighter.run(&gpu, &gpu_proj);
                    if tx.send(gpu_proj).is_err() {
                        return Err(PipelineError::disconnected("weight"));
                    }
                }
                tx.finish(1)
                    .map_err(|_| PipelineError::disconnected("weight"))
            })
        })
        .collect();

    // ── Filtering workers ────────────────────────────────────────────────
    let filter_workers: Vec<StageWorker<()>> = devices
        .iter()
        .zip(filter_rxs)
        .zip(bp_txs)
        .map(|((gpu, rx), tx)| {
            let gpu = gpu.clone();
            let det = *det;
            StageWorker::spawn("filter", move || {
                let mut filter = GpuFilter::new(&gpu, &det);
                while let Some(gpu_proj) = rx.recv() {
                    filter.run(&gpu, &gpu_proj);
                    if tx.send(gpu_proj).is_err() {
                        return Err(PipelineError::disconnected("filter"));
                    }
                }
                tx.finish(1)
                    .map_err(|_| PipelineError::disconnected("filter"))
            })
        })
        .collect();

    // ── Back-projection workers ──────────────────────────────────────────
    let bp_workers: Vec<StageWorker<Vec<SubVolume>>> = devices
        .iter()
        .zip(bp_rxs)
        .map(|(gpu, rx)| {
            let gpu = gpu.clone();
            let plan = plan.clone();
            let angles = angles.clone();
            let angle_file = angle_file.clone();
            let det = *det;
            StageWorker::spawn("backproject", move || {
                let table = angles
                    .get_or_init(|| build_angle_table(angle_file.as_deref(), n_proj, rot_angle));
                let bp = GpuBackprojector::new(&gpu, &det, &plan.volume);
                let slabs: Vec<GpuSubVolume> = plan
                    .device_subvolumes(gpu.id)
                    .map(|desc| GpuSubVolume::new(&gpu, &plan.volume, *desc))
                    .collect();

                while let Some(gpu_proj) = rx.recv() {
                    let (sin_phi, cos_phi) = table.sin_cos(gpu_proj.index);
                    for slab in &slabs {
                        bp.run(&gpu, &gpu_proj, slab, sin_phi, cos_phi);
                    }
                }
                // Sentinel: pull the finished slabs to the host.
                Ok(slabs.iter().map(|s| s.readback(&gpu)).collect())
            })
        })
        .collect();

    // ── Join, merge, deliver ─────────────────────────────────────────────
    let mut first_error: Option<PipelineError> = None;
    if let Err(e) = src_worker.join() {
        note_error(&mut first_error, e);
    }
    for w in weight_workers {
        if let Err(e) = w.join() {
            note_error(&mut first_error, e);
        }
    }
    for w in filter_workers {
        if let Err(e) = w.join() {
            note_error(&mut first_error, e);
        }
    }
    let mut slabs: Vec<SubVolume> = Vec::new();
    for w in bp_workers {
        match w.join() {
            Ok(mut s) => slabs.append(&mut s),
            Err(e) => note_error(&mut first_error, e),
        }
    }
    if let Some(e) = first_error {
        return Err(e.into());
    }

    slabs.sort_by_key(|s| s.z_offset);
    let mut volume = Volume::new(&plan.volume);
    for slab in &slabs {
        volume.merge(slab);
    }
    sink.write_volume(&volume)
        .map_err(ReconstructionError::Sink)?;
    info!("GPU reconstruction finished");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
