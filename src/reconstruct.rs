// reconstruct.rs — CPU reference reconstruction driver.
//
// Ties every component into the staged pipeline:
//
//   plan ──┐
//   source ─→ [weight] ─→ [filter] ─→ [backproject ×D] ─→ merge ─→ sink
//
// One worker thread per box; the back-projection stage runs one worker
// per planned device, each owning its sub-volumes exclusively until the
// merge. The GPU driver in gpu/reconstruct.rs mirrors this loop with
// device-resident buffers; keeping the two drivers shape-identical is
// what makes CPU-vs-GPU comparison tests meaningful.
//
// Every filtered projection is delivered to every back-projection
// worker (each device accumulates the whole angular range into its own
// z-slab), so the filter stage fans out one clone per device queue.
//
// ANGLE TABLE LIFETIME
// ─────────────────────
// The sin/cos tables are shared behind a OnceLock: the source worker
// (which stamps φ onto each projection) and every back-projection
// worker race to `get_or_init`, construction happens exactly once, and
// afterwards the table is read-only — no further locking on the hot
// path.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use log::{info, warn};

use crate::angles::AngleTable;
use crate::backproject::backproject;
use crate::filter::RampFilter;
use crate::geometry::{
    apply_roi, calculate_volume_geometry, DetectorGeometry, RegionOfInterest,
};
use crate::pipeline::{
    queue, queue_capacity, PipelineError, QueueReceiver, QueueSender, StageWorker,
};
use crate::projection::Projection;
use crate::scheduler::{DeviceMemory, PlanError, ReconstructionPlan};
use crate::source::{ProjectionSource, VolumeSink};
use crate::volume::{SubVolume, Volume};
use crate::weight::apply_weights;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Knobs for one reconstruction run. The defaults reconstruct the full
/// volume with uniform angles and auto-sized queues.
#[derive(Debug, Clone, Default)]
pub struct ReconstructionConfig {
    /// Stage-queue capacity; `None` = 2× the back-projection worker
    /// count (minimum 4).
    pub queue_capacity: Option<usize>,
    /// Angle file (one angle per line, degrees). `None` = uniform
    /// `rot_angle` steps.
    pub angle_file: Option<PathBuf>,
    /// Optional crop of the output volume. Invalid ROIs are ignored
    /// with a warning.
    pub roi: Option<RegionOfInterest>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Anything that can abort a reconstruction run.
#[derive(Debug)]
pub enum ReconstructionError {
    /// The partition plan was rejected before the pipeline started.
    Plan(PlanError),
    /// GPU device acquisition failed (GPU backend only).
    Gpu(crate::gpu::device::GpuError),
    /// A pipeline stage failed mid-run.
    Pipeline(PipelineError),
    /// The volume sink refused the finished volume.
    Sink(std::io::Error),
}

impl From<PlanError> for ReconstructionError {
    fn from(e: PlanError) -> Self {
        ReconstructionError::Plan(e)
    }
}

impl From<PipelineError> for ReconstructionError {
    fn from(e: PipelineError) -> Self {
        ReconstructionError::Pipeline(e)
    }
}

impl From<crate::gpu::device::GpuError> for ReconstructionError {
    fn from(e: crate::gpu::device::GpuError) -> Self {
        ReconstructionError::Gpu(e)
    }
}

impl std::fmt::Display for ReconstructionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconstructionError::Plan(e) => write!(f, "plan rejected: {e}"),
            ReconstructionError::Gpu(e) => write!(f, "GPU unavailable: {e}"),
            ReconstructionError::Pipeline(e) => write!(f, "pipeline failed: {e}"),
            ReconstructionError::Sink(e) => write!(f, "volume sink failed: {e}"),
        }
    }
}

impl std::error::Error for ReconstructionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReconstructionError::Plan(e) => Some(e),
            ReconstructionError::Gpu(e) => Some(e),
            ReconstructionError::Pipeline(e) => Some(e),
            ReconstructionError::Sink(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Run a full reconstruction on the CPU reference backend and hand the
/// assembled volume to `sink`.
///
/// `devices` are the simulated device capacities the scheduler
/// partitions against — the CPU path honors the resulting plan exactly
/// (one back-projection worker per device, slab-wise merge), so
/// scheduler behavior can be exercised without GPUs.
pub fn reconstruct<S>(
    det: &DetectorGeometry,
    devices: &[DeviceMemory],
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
    let plan = Arc::new(ReconstructionPlan::with_volume(det, vol_geo, devices)?);

    let n_proj = source.num_projections();
    if n_proj != det.n_proj {
        warn!(
            "source provides {n_proj} projections, geometry says {}; using the source's count",
            det.n_proj
        );
    }
    info!(
        "Reconstructing {} x {} x {} voxels from {n_proj} projections on {} device(s)",
        plan.volume.dim_x,
        plan.volume.dim_y,
        plan.volume.dim_z,
        plan.n_devices()
    );

    let device_ids = plan.device_ids();
    let capacity = config
        .queue_capacity
        .unwrap_or_else(|| queue_capacity(device_ids.len()));

    let angles: Arc<OnceLock<AngleTable>> = Arc::new(OnceLock::new());
    let angle_file = config.angle_file.clone();
    let rot_angle = det.rot_angle;

    // ── Queues ───────────────────────────────────────────────────────────
    let (weight_tx, weight_rx) = queue::<Projection>(capacity);
    let (filter_tx, filter_rx) = queue::<Projection>(capacity);
    let mut bp_txs: Vec<QueueSender<Projection>> = Vec::new();
    let mut bp_rxs: Vec<QueueReceiver<Projection>> = Vec::new();
    for _ in &device_ids {
        let (tx, rx) = queue::<Projection>(capacity);
        bp_txs.push(tx);
        bp_rxs.push(rx);
    }

    // ── Source worker ────────────────────────────────────────────────────
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
                        if weight_tx.send(proj).is_err() {
                            return Err(PipelineError::disconnected("source"));
                        }
                    }
                    Ok(None) => break,
                    Err(e) => return Err(PipelineError::stage("source", e.to_string())),
                }
            }
            weight_tx
                .finish(1)
                .map_err(|_| PipelineError::disconnected("source"))
        })
    };

    // ── Weighting worker ─────────────────────────────────────────────────
    let weight_worker = {
        let det = *det;
        StageWorker::spawn("weight", move || {
            while let Some(mut proj) = weight_rx.recv() {
                apply_weights(&mut proj.image, &det);
                if filter_tx.send(proj).is_err() {
                    return Err(PipelineError::disconnected("weight"));
                }
            }
            filter_tx
                .finish(1)
                .map_err(|_| PipelineError::disconnected("weight"))
        })
    };

    // ── Filtering worker ─────────────────────────────────────────────────
    let filter_worker = {
        let det = *det;
        StageWorker::spawn("filter", move || {
            let mut filter = RampFilter::new(det.n_col, det.l_px_row);
            while let Some(mut proj) = filter_rx.recv() {
                filter.apply(&mut proj.image);
                for tx in &bp_txs {
                    if tx.send(proj.clone()).is_err() {
                        return Err(PipelineError::disconnected("filter"));
                    }
                }
            }
            for tx in &bp_txs {
                tx.finish(1)
                    .map_err(|_| PipelineError::disconnected("filter"))?;
            }
            Ok(())
        })
    };

    // ── Back-projection workers, one per device ──────────────────────────
    let bp_workers: Vec<StageWorker<Vec<SubVolume>>> = device_ids
        .iter()
        .zip(bp_rxs)
        .map(|(&dev_id, rx)| {
            let plan = plan.clone();
            let angles = angles.clone();
            let angle_file = angle_file.clone();
            let det = *det;
            StageWorker::spawn("backproject", move || {
                let table = angles
                    .get_or_init(|| build_angle_table(angle_file.as_deref(), n_proj, rot_angle));
                let mut subs: Vec<SubVolume> = plan
                    .device_subvolumes(dev_id)
                    .map(|d| {
                        SubVolume::new(
                            plan.volume.dim_x,
                            plan.volume.dim_y,
                            d.dim_z_local,
                            d.z_offset,
                            dev_id,
                        )
                    })
                    .collect();

                while let Some(proj) = rx.recv() {
                    let (sin_phi, cos_phi) = table.sin_cos(proj.index);
                    for sub in &mut subs {
                        backproject(sub, &proj.image, &det, &plan.volume, sin_phi, cos_phi);
                    }
                }
                Ok(subs)
            })
        })
        .collect();

    // ── Join in construction order, keeping the most telling error ───────
    let mut first_error: Option<PipelineError> = None;
    let mut keep = |res: Result<(), PipelineError>| {
        if let Err(e) = res {
            note_error(&mut first_error, e);
        }
    };
    keep(src_worker.join());
    keep(weight_worker.join());
    keep(filter_worker.join());

    let mut slabs: Vec<SubVolume> = Vec::new();
    for worker in bp_workers {
        match worker.join() {
            Ok(mut subs) => slabs.append(&mut subs),
            Err(e) => note_error(&mut first_error, e),
        }
    }
    if let Some(e) = first_error {
        return Err(e.into());
    }

    // ── Merge: slabs are disjoint, write in ascending z ──────────────────
    slabs.sort_by_key(|s| s.z_offset);
    let mut volume = Volume::new(&plan.volume);
    for slab in &slabs {
        volume.merge(slab);
    }

    sink.write_volume(&volume)
        .map_err(ReconstructionError::Sink)?;
    info!("Reconstruction finished");
    Ok(())
}

/// Prefer a root-cause error (stage failure, panic) over the
/// `Disconnected` noise the failure caused elsewhere.
pub(crate) fn note_error(slot: &mut Option<PipelineError>, e: PipelineError) {
    let is_root = !matches!(e, PipelineError::Disconnected { .. });
    match slot {
        None => *slot = Some(e),
        Some(existing) if is_root && matches!(existing, PipelineError::Disconnected { .. }) => {
            *slot = Some(e)
        }
        _ => {}
    }
}

pub(crate) fn build_angle_table(path: Option<&Path>, n_proj: u32, step_deg: f32) -> AngleTable {
    match path {
        Some(p) => AngleTable::from_file(p, n_proj, step_deg),
        None => AngleTable::uniform(n_proj, step_deg),
    }
}

// ---------------------------------------------------------------------------
// Tests (failure paths; the numeric scenarios live in tests/)
// ---------------------------------------------------------------------------
