// backproject.rs — Per-voxel FDK back-projection (CPU reference kernel).
//
// For one projection at angle φ and one z-slab, every voxel:
//
//   1. Voxel center (x, y, z) in mm, volume-centered coordinates.
//   2. Rotate into the source frame:
//        S =  x·cos φ + y·sin φ        (along the source axis)
//        T = −x·sin φ + y·cos φ        (across it)
//   3. Perspective-project onto the detector:
//        factor = d_sd / (S − d_so)
//        h = T·factor,  v = z·factor   (mm, then → pixel coordinates)
//   4. Bilinear sample of the filtered projection; samples outside the
//      detector contribute zero.
//   5. Accumulate 0.5 · sample · u² with u = d_so / (S − d_so). The
//      0.5 constant is part of the established output scaling of this
//      engine and must not be "simplified" away.
//
// Accumulation across projections is a plain sum, so delivery order
// does not matter — each worker owns its slab exclusively and no other
// synchronization exists on the voxel data.
//
// The mm → pixel conversion inverts the weighting stage's pixel-center
// mapping: pixel s has its center at l_px_row/2 + s·l_px_row + h_min,
// hence s = (h − h_min)/l_px_row − 1/2 (and the same vertically).

use crate::geometry::{DetectorGeometry, VolumeGeometry};
use crate::projection::{sample_bilinear, Image};
use crate::volume::SubVolume;
use crate::weight::{h_min, v_min};

/// Accumulate one filtered projection into one z-slab.
///
/// `sin_phi`/`cos_phi` come from the angle table, looked up by the
/// projection's index — never recomputed per call.
pub fn backproject(
    sub: &mut SubVolume,
    proj: &Image,
    det: &DetectorGeometry,
    vol: &VolumeGeometry,
    sin_phi: f32,
    cos_phi: f32,
) {
    let d_so = det.d_so.abs();
    let d_sd = det.d_sd();
    let h0 = h_min(det);
    let v0 = v_min(det);

    let sx = vol.l_vx_x;
    let sy = vol.l_vx_y;
    let sz = vol.l_vx_z;

    // Voxel-center coordinate of index 0 along each axis.
    let x0 = -(vol.dim_x as f32 * sx) / 2.0 + sx / 2.0;
    let y0 = -(vol.dim_y as f32 * sy) / 2.0 + sy / 2.0;
    let z0 = -(vol.dim_z as f32 * sz) / 2.0 + sz / 2.0;

    for m in 0..sub.dim_z_local {
        let z = z0 + (m + sub.z_offset) as f32 * sz;
        for l in 0..sub.dim_y {
            let y = y0 + l as f32 * sy;
            for k in 0..sub.dim_x {
                let x = x0 + k as f32 * sx;

                let s = x * cos_phi + y * sin_phi;
                let t = -x * sin_phi + y * cos_phi;

                let factor = d_sd / (s - d_so);
                let h = t * factor;
                let v = z * factor;

                let h_px = (h - h0) / det.l_px_row - 0.5;
                let v_px = (v - v0) / det.l_px_col - 0.5;

                let det_val = sample_bilinear(proj, h_px, v_px);
                if det_val != 0.0 {
                    let u = d_so / (s - d_so);
                    sub.add(k, l, m, 0.5 * det_val * u * u);
                }
            }
        }
    }
}
