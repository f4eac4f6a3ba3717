// weight.rs — FDK cosine weighting (CPU reference kernel).
//
// Feldkamp's pre-weight: every detector pixel is scaled by the cosine
// of the angle between its ray and the central ray,
//
//     w(s, t) = d_sd / sqrt(d_sd² + h_s² + v_t²),
//
// where (h_s, v_t) is the pixel center in mm, measured from the
// principal ray. Rays that hit the detector obliquely traverse the
// object over a longer path; the weight compensates before the ramp
// filter sees the data.
//
// The GPU kernel in shaders/weight.wgsl computes the same expression;
// `weight_at` is the single source of truth the GPU tests compare
// against.

use crate::geometry::DetectorGeometry;
use crate::projection::Image;

/// Horizontal coordinate of the first pixel column's *edge* in mm:
/// pixel s has its center at `l_px_row/2 + s·l_px_row + h_min`.
#[inline]
pub fn h_min(det: &DetectorGeometry) -> f32 {
    det.delta_s * det.l_px_row - det.n_row as f32 * det.l_px_row / 2.0
}

/// Vertical counterpart of [`h_min`].
#[inline]
pub fn v_min(det: &DetectorGeometry) -> f32 {
    det.delta_t * det.l_px_col - det.n_col as f32 * det.l_px_col / 2.0
}

/// The cosine weight at detector pixel (s, t).
#[inline]
pub fn weight_at(det: &DetectorGeometry, s: u32, t: u32) -> f32 {
    let d_sd = det.d_sd();
    let h_s = det.l_px_row / 2.0 + s as f32 * det.l_px_row + h_min(det);
    let v_t = det.l_px_col / 2.0 + t as f32 * det.l_px_col + v_min(det);
    d_sd / (d_sd * d_sd + h_s * h_s + v_t * v_t).sqrt()
}

/// Weight a projection in place.
pub fn apply_weights(img: &mut Image, det: &DetectorGeometry) {
    let d_sd = det.d_sd();
    let h0 = h_min(det);
    let v0 = v_min(det);

    for t in 0..img.height() {
        let v_t = det.l_px_col / 2.0 + t as f32 * det.l_px_col + v0;
        let row = img.row_mut(t);
        for (s, px) in row.iter_mut().enumerate() {
            let h_s = det.l_px_row / 2.0 + s as f32 * det.l_px_row + h0;
            *px *= d_sd / (d_sd * d_sd + h_s * h_s + v_t * v_t).sqrt();
        }
    }
}
