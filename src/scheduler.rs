// scheduler.rs — Translate detector geometry and device memory into a
// deterministic execution plan.
//
// The plan answers three questions before any projection is consumed:
//   1. How big is the output volume and its voxels? (geometry)
//   2. How is the volume split into z-slabs, and which device owns
//      which slab? (memory-driven halving)
//   3. Which detector rows can geometrically contribute to each slab,
//      for *any* rotation angle? (sub-projection borders)
//
// The scheduler is a plain value — construct it once, share it behind
// an Arc, and every stage reads the same immutable plan. It performs no
// I/O and spawns no threads, which makes the partition arithmetic
// directly testable with simulated device capacities.
//
// SUB-PROJECTION BORDERS
// ───────────────────────
// A z-slab [top, bottom] (mm, volume-centered coordinates) projects
// onto the detector through the cone. The worst case over all rotation
// angles occurs when the slab edge closest to the source sits at the
// in-plane radius r_max: the edge then magnifies the most. Projecting
// both slab faces through that worst case, clamping to the physical
// detector, and converting to row indices (floor for the top edge,
// ceil for the bottom) gives the inclusive row band that filtering and
// back-projection need for this slab.

use log::debug;

use crate::geometry::{
    calculate_volume_geometry, DetectorGeometry, VolumeGeometry,
};

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Memory capacity of one reconstruction device. On the GPU path these
/// come from adapter limits; tests and the CPU reference path pass
/// simulated capacities.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMemory {
    pub id: usize,
    pub bytes: usize,
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

/// One z-slab of the plan: where it sits in the volume, who owns it,
/// and the inclusive detector row band that can reach it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubVolumeDesc {
    /// Position in plan order (0-based).
    pub index: u32,
    /// Owning device (index into the `DeviceMemory` slice).
    pub device: usize,
    /// Slab thickness in voxels.
    pub dim_z_local: u32,
    /// First global z-slice of the slab.
    pub z_offset: u32,
    /// First detector row that can contribute to this slab.
    pub row_top: u32,
    /// Last detector row (inclusive) that can contribute.
    pub row_bottom: u32,
}

/// The immutable execution plan. All downstream stages read it through
/// a shared reference; nothing mutates it after construction.
#[derive(Debug, Clone)]
pub struct ReconstructionPlan {
    pub detector: DetectorGeometry,
    pub volume: VolumeGeometry,
    /// Slabs in plan order; device assignment is contiguous runs.
    pub subvolumes: Vec<SubVolumeDesc>,
    /// Chunk count per device, always a power of two.
    pub chunks_per_device: Vec<u32>,
}

/// Plan construction failures. All are fatal and reported before the
/// pipeline starts.
#[derive(Debug)]
pub enum PlanError {
    /// The device list was empty.
    NoDevices,
    /// The detector geometry produced a non-positive volume dimension
    /// or failed basic validation.
    InvalidGeometry(String),
    /// Even at the finest halving a sub-volume does not fit the
    /// smallest device.
    ChunkTooLarge { needed: usize, available: usize },
}

impl std::fmt::Display for PlanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanError::NoDevices => write!(f, "no reconstruction devices available"),
            PlanError::InvalidGeometry(why) => write!(f, "invalid geometry: {why}"),
            PlanError::ChunkTooLarge { needed, available } => write!(
                f,
                "sub-volume of {needed} bytes exceeds device memory of {available} bytes \
                 even at the finest split"
            ),
        }
    }
}

impl std::error::Error for PlanError {}

impl ReconstructionPlan {
    /// Build a plan from the detector geometry alone (volume geometry
    /// derived per the standard formulas).
    pub fn new(det: &DetectorGeometry, devices: &[DeviceMemory]) -> Result<Self, PlanError> {
        if !det.is_valid() {
            return Err(PlanError::InvalidGeometry(
                "non-positive pixel count, pitch or distance".into(),
            ));
        }
        Self::with_volume(det, calculate_volume_geometry(det), devices)
    }

    /// Build a plan for an explicit (possibly ROI-cropped) volume.
    pub fn with_volume(
        det: &DetectorGeometry,
        volume: VolumeGeometry,
        devices: &[DeviceMemory],
    ) -> Result<Self, PlanError> {
        if devices.is_empty() {
            return Err(PlanError::NoDevices);
        }
        if volume.dim_x == 0 || volume.dim_y == 0 || volume.dim_z == 0 {
            return Err(PlanError::InvalidGeometry(format!(
                "volume dimensions {} x {} x {} contain a zero",
                volume.dim_x, volume.dim_y, volume.dim_z
            )));
        }

        let bytes_total = volume.bytes();
        debug!("Volume needs {bytes_total} bytes");

        let chunks_per_device = chunks_per_device(bytes_total, devices)?;
        let n: u32 = chunks_per_device.iter().sum();

        // Slab thickness: dim_z / N slices each, the last slab absorbs
        // the remainder so the slabs cover [0, dim_z) exactly.
        let z_step = volume.dim_z / n;
        if z_step == 0 {
            let plane_bytes =
                volume.dim_x as usize * volume.dim_y as usize * std::mem::size_of::<f32>();
            let smallest = devices.iter().map(|d| d.bytes).min().unwrap_or(0);
            return Err(PlanError::ChunkTooLarge {
                needed: plane_bytes,
                available: smallest,
            });
        }

        let borders = subprojection_borders(det, &volume, n);

        // Distribute slabs to devices in plan order: device d owns the
        // next chunks_per_device[d] slabs.
        let mut subvolumes = Vec::with_capacity(n as usize);
        let mut next = 0u32;
        for (d, &count) in chunks_per_device.iter().enumerate() {
            for _ in 0..count {
                let index = next;
                let z_offset = index * z_step;
                let dim_z_local = if index == n - 1 {
                    volume.dim_z - z_offset
                } else {
                    z_step
                };
                let (row_top, row_bottom) = borders[index as usize];
                subvolumes.push(SubVolumeDesc {
                    index,
                    device: devices[d].id,
                    dim_z_local,
                    z_offset,
                    row_top,
                    row_bottom,
                });
                next += 1;
            }
        }

        // Final fit check: the actual slabs (remainder included) must
        // fit their devices.
        for sub in &subvolumes {
            let bytes = volume.dim_x as usize
                * volume.dim_y as usize
                * sub.dim_z_local as usize
                * std::mem::size_of::<f32>();
            let dev = devices
                .iter()
                .find(|d| d.id == sub.device)
                .expect("slab assigned to unknown device");
            if bytes >= dev.bytes {
                return Err(PlanError::ChunkTooLarge {
                    needed: bytes,
                    available: dev.bytes,
                });
            }
        }

        for sub in &subvolumes {
            debug!(
                "Sub-volume #{}: device {}, z [{}, {}), rows [{}, {}]",
                sub.index,
                sub.device,
                sub.z_offset,
                sub.z_offset + sub.dim_z_local,
                sub.row_top,
                sub.row_bottom
            );
        }

        Ok(ReconstructionPlan {
            detector: *det,
            volume,
            subvolumes,
            chunks_per_device,
        })
    }

    /// Total sub-volume count across all devices.
    #[inline]
    pub fn n_subvolumes(&self) -> u32 {
        self.subvolumes.len() as u32
    }

    /// Number of planned devices.
    #[inline]
    pub fn n_devices(&self) -> usize {
        self.chunks_per_device.len()
    }

    /// The slabs owned by one device, in plan order.
    pub fn device_subvolumes(&self, device: usize) -> impl Iterator<Item = &SubVolumeDesc> {
        self.subvolumes.iter().filter(move |s| s.device == device)
    }

    /// Distinct device ids appearing in the plan, in plan order.
    pub fn device_ids(&self) -> Vec<usize> {
        let mut ids = Vec::new();
        for sub in &self.subvolumes {
            if !ids.contains(&sub.device) {
                ids.push(sub.device);
            }
        }
        ids
    }
}

// ---------------------------------------------------------------------------
// Halving
// ---------------------------------------------------------------------------

/// Split `bytes_total / n_devices` per device, halving (and doubling
/// the chunk count) until the chunk fits the device. The count is a
/// power of two by construction.
fn chunks_per_device(
    bytes_total: usize,
    devices: &[DeviceMemory],
) -> Result<Vec<u32>, PlanError> {
    let initial = bytes_total / devices.len();
    let mut counts = Vec::with_capacity(devices.len());

    for dev in devices {
        let mut chunk = initial;
        let mut count = 1u32;
        while chunk >= dev.bytes {
            if chunk == 0 {
                // Only reachable with a zero-byte device.
                return Err(PlanError::ChunkTooLarge {
                    needed: 1,
                    available: dev.bytes,
                });
            }
            chunk /= 2;
            count *= 2;
        }
        debug!(
            "Need {count} chunk{} of {chunk} bytes on device #{}",
            if count > 1 { "s" } else { "" },
            dev.id
        );
        counts.push(count);
    }
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Sub-projection borders
// ---------------------------------------------------------------------------

/// For each of the `n` slabs, the inclusive detector row band that can
/// contribute to it under any rotation angle.
fn subprojection_borders(
    det: &DetectorGeometry,
    vol: &VolumeGeometry,
    n: u32,
) -> Vec<(u32, u32)> {
    let delta_t = det.delta_t_mm();
    let d_v = det.l_px_col;
    let n_v = det.n_col as f32;
    let d_so = det.d_so.abs();
    let d_sd = det.d_sd();

    let height = vol.height_mm();
    let r_max = (vol.dim_x as f32 * vol.l_vx_x) / 2.0;

    // Physical detector band in mm, centered coordinates: the center of
    // the first row and of the last row.
    let top_real = -((n_v * d_v) / 2.0) - delta_t + d_v / 2.0;
    let bottom_real = top_real + n_v * d_v - d_v;

    let mut borders = Vec::with_capacity(n as usize);
    for i in 0..n {
        let top = -(height / 2.0) + (i as f32 / n as f32) * height;
        let bottom = -(height / 2.0) + ((i + 1) as f32 / n as f32) * height;

        // Worst-case magnification: the slab edge sits at ±r_max,
        // whichever side throws its shadow further out.
        let top_virt = top * d_sd / (d_so + if top < 0.0 { -r_max } else { r_max });
        let bottom_virt = bottom * d_sd / (d_so + if bottom < 0.0 { r_max } else { -r_max });

        let top_proj = top_virt.clamp(top_real, bottom_real);
        let bottom_proj = bottom_virt.clamp(top_real, bottom_real);

        let mut row_top = ((top_proj + (n_v * d_v) / 2.0 + delta_t) / d_v - 0.5).floor();
        let mut row_bottom = ((bottom_proj + (n_v * d_v) / 2.0 + delta_t) / d_v - 0.5).ceil();
        if row_top < 0.0 {
            row_top = 0.0;
        }
        if row_bottom >= n_v {
            row_bottom = n_v - 1.0;
        }

        debug!(
            "Slab #{i}: (top, bottom) = ({top}, {bottom}) mm, \
             virtual = ({top_virt}, {bottom_virt}), rows = ({row_top}, {row_bottom})"
        );
        borders.push((row_top as u32, row_bottom as u32));
    }
    borders
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
