// geometry.rs — Detector and volume geometry for circular cone-beam CT.
//
// The acquisition model: a point X-ray source and a flat-panel detector
// rotate around the object on a circle of radius |d_so|. The detector
// sits |d_od| behind the rotation center, so the source–detector
// distance is d_sd = |d_so| + |d_od|.
//
//            detector (n_row × n_col pixels)
//          ┌───────────────┐
//          │       ·(Δs,Δt)│   principal-point offset, in *pixels*
//          └───────┬───────┘
//                  │ d_od
//            ──────●──────    rotation center
//                  │ d_so
//                  ▲
//                source
//
// The reconstructable volume is the largest cylinder-inscribed cube that
// every projection sees completely: its in-plane radius r follows from
// the half-fan angle α, and the voxel size is chosen so one voxel maps
// to roughly one detector pixel at the rotation center. The formulas
// below are evaluated in f32 throughout — the derived dimensions must be
// bit-stable across runs because the scheduler partitions on them.

use log::{info, warn};

// ---------------------------------------------------------------------------
// Detector geometry
// ---------------------------------------------------------------------------

/// Immutable description of the scanner: detector layout, distances and
/// the angular sampling of one rotation.
///
/// Units: pixel counts are dimensionless, pitches and distances are mm,
/// principal-point offsets (`delta_s`, `delta_t`) are *pixels*, and
/// `rot_angle` is degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorGeometry {
    /// Horizontal pixel count (pixels per detector row).
    pub n_row: u32,
    /// Vertical pixel count (number of detector rows).
    pub n_col: u32,
    /// Horizontal pixel pitch in mm.
    pub l_px_row: f32,
    /// Vertical pixel pitch in mm.
    pub l_px_col: f32,
    /// Principal-point offset, horizontal, in pixels.
    pub delta_s: f32,
    /// Principal-point offset, vertical, in pixels.
    pub delta_t: f32,
    /// Source-to-object distance in mm.
    pub d_so: f32,
    /// Object-to-detector distance in mm.
    pub d_od: f32,
    /// Number of projections per rotation.
    pub n_proj: u32,
    /// Default angular step in degrees, used when no angle file is given.
    pub rot_angle: f32,
}

impl DetectorGeometry {
    /// Source-to-detector distance: `|d_so| + |d_od|`.
    #[inline]
    pub fn d_sd(&self) -> f32 {
        self.d_so.abs() + self.d_od.abs()
    }

    /// Horizontal principal-point offset converted to mm.
    #[inline]
    pub fn delta_s_mm(&self) -> f32 {
        self.delta_s * self.l_px_row
    }

    /// Vertical principal-point offset converted to mm.
    #[inline]
    pub fn delta_t_mm(&self) -> f32 {
        self.delta_t * self.l_px_col
    }

    /// `true` if every count and length that the reconstruction divides
    /// by is usable. The scheduler turns `false` into a plan error
    /// before any projection is consumed.
    pub fn is_valid(&self) -> bool {
        self.n_row > 0
            && self.n_col > 0
            && self.n_proj > 0
            && self.l_px_row > 0.0
            && self.l_px_col > 0.0
            && self.d_so != 0.0
            && self.d_od != 0.0
    }
}

// ---------------------------------------------------------------------------
// Volume geometry
// ---------------------------------------------------------------------------

/// Derived output-volume description: dimensions in voxels and the
/// isotropic voxel size in mm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeGeometry {
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    pub l_vx_x: f32,
    pub l_vx_y: f32,
    pub l_vx_z: f32,
}

impl VolumeGeometry {
    /// Total voxel count.
    #[inline]
    pub fn voxels(&self) -> usize {
        self.dim_x as usize * self.dim_y as usize * self.dim_z as usize
    }

    /// Bytes needed for the full volume in f32.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.voxels() * std::mem::size_of::<f32>()
    }

    /// Volume height in mm (`dim_z · l_vx_z`).
    #[inline]
    pub fn height_mm(&self) -> f32 {
        self.dim_z as f32 * self.l_vx_z
    }
}

/// Compute the output-volume geometry from the detector geometry.
///
/// Pure and deterministic: identical inputs give bit-identical f32
/// outputs, which the scheduler and every kernel rely on.
///
/// The in-plane radius is `r = |d_so| · sin(α)` with
/// `α = atan(((n_row·l_px_row)/2 + |Δs|) / d_sd)`; the voxel size scales
/// r back to detector pixels, and the z extent follows from the vertical
/// detector half-height demagnified to the rotation center.
pub fn calculate_volume_geometry(det: &DetectorGeometry) -> VolumeGeometry {
    let n_row = det.n_row as f32;
    let l_px_row = det.l_px_row;
    let delta_s = det.delta_s_mm().abs();

    let n_col = det.n_col as f32;
    let l_px_col = det.l_px_col;
    let delta_t = det.delta_t_mm().abs();

    let d_so = det.d_so.abs();
    let d_sd = det.d_sd();

    // Slice dimensions (x/y plane).
    let alpha = (((n_row * l_px_row) / 2.0 + delta_s) / d_sd).atan();
    let r = d_so * alpha.sin();

    let l_vx_x = r / (((n_row * l_px_row) / 2.0 + delta_s) / l_px_row);
    let dim_x = ((2.0 * r) / l_vx_x) as u32;

    // Number of slices (z).
    let l_vx_z = l_vx_x;
    let dim_z =
        (((n_col * l_px_col) / 2.0 + delta_t) * (d_so / d_sd) * (2.0 / l_vx_z)) as u32;

    let vol = VolumeGeometry {
        dim_x,
        dim_y: dim_x,
        dim_z,
        l_vx_x,
        l_vx_y: l_vx_x,
        l_vx_z,
    };

    info!(
        "Volume dimensions [vx]: {} x {} x {}",
        vol.dim_x, vol.dim_y, vol.dim_z
    );
    info!(
        "Volume dimensions [mm]: {} x {} x {}",
        vol.dim_x as f32 * vol.l_vx_x,
        vol.dim_y as f32 * vol.l_vx_y,
        vol.dim_z as f32 * vol.l_vx_z
    );
    info!(
        "Voxel size [mm]: {:.4} x {:.4} x {:.4}",
        vol.l_vx_x, vol.l_vx_y, vol.l_vx_z
    );

    vol
}

// ---------------------------------------------------------------------------
// Region of interest
// ---------------------------------------------------------------------------

/// An axis-aligned crop of the output volume, in voxel coordinates.
/// Each pair is `low < high`; the resulting dimensions must not exceed
/// the full volume's.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegionOfInterest {
    pub x1: u32,
    pub x2: u32,
    pub y1: u32,
    pub y2: u32,
    pub z1: u32,
    pub z2: u32,
}

/// Shrink a volume geometry to a region of interest.
///
/// An invalid ROI (any `low >= high`, or dimensions that would exceed
/// the input volume) is *ignored*: the input geometry is returned
/// unchanged and a warning is logged. A malformed ROI must never abort
/// a reconstruction that would otherwise succeed.
///
/// When a low coordinate is 0 the corresponding dimension is widened by
/// one: the zero plane counts inclusively.
pub fn apply_roi(vol: &VolumeGeometry, roi: &RegionOfInterest) -> VolumeGeometry {
    let coords_ok = roi.x1 < roi.x2 && roi.y1 < roi.y2 && roi.z1 < roi.z2;
    if !coords_ok {
        warn!("Invalid ROI coordinates. ROI NOT applied.");
        return *vol;
    }

    let mut dim_x = roi.x2 - roi.x1;
    let mut dim_y = roi.y2 - roi.y1;
    let mut dim_z = roi.z2 - roi.z1;
    if roi.x1 == 0 {
        dim_x += 1;
    }
    if roi.y1 == 0 {
        dim_y += 1;
    }
    if roi.z1 == 0 {
        dim_z += 1;
    }

    if dim_x > vol.dim_x || dim_y > vol.dim_y || dim_z > vol.dim_z {
        warn!("New volume dimensions exceed old volume dimensions. ROI NOT applied.");
        return *vol;
    }

    let roi_geo = VolumeGeometry {
        dim_x,
        dim_y,
        dim_z,
        ..*vol
    };
    info!(
        "Applied region of interest. Updated volume dimensions [vx]: {} x {} x {}",
        roi_geo.dim_x, roi_geo.dim_y, roi_geo.dim_z
    );
    roi_geo
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
