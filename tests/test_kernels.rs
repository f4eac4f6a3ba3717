// tests/test_kernels.rs — Weighting and back-projection kernel
// properties, exercised through the public API.

use konrad::backproject::backproject;
use konrad::geometry::{calculate_volume_geometry, DetectorGeometry};
use konrad::projection::{sample_bilinear, Image};
use konrad::volume::SubVolume;
use konrad::weight::{apply_weights, weight_at};

fn scenario_detector() -> DetectorGeometry {
    DetectorGeometry {
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
    }
}

// ===== Weighting (property 4) =====

#[test]
fn weighting_of_ones_gives_weight_map() {
    // Applying the kernel to an all-ones projection must reproduce
    //   w(s, t) = d_sd / sqrt(d_sd² + h_s² + v_t²)
    // to within 1e-5 relative error at every pixel.
    let det = scenario_detector();
    let d_sd = det.d_sd();

    let mut img = Image::new(det.n_row as usize, det.n_col as usize);
    img.fill(1.0);
    apply_weights(&mut img, &det);

    for t in 0..det.n_col {
        for s in 0..det.n_row {
            let h_s = 0.5 + s as f32 - 16.0;
            let v_t = 0.5 + t as f32 - 16.0;
            let expected = d_sd / (d_sd * d_sd + h_s * h_s + v_t * v_t).sqrt();
            let got = img.get(s as usize, t as usize);
            assert!(
                (got - expected).abs() <= 1e-5 * expected,
                "({s},{t}): {got} vs {expected}"
            );
            // And the public helper agrees with the kernel.
            assert!((weight_at(&det, s, t) - expected).abs() <= 1e-5 * expected);
        }
    }
}

#[test]
fn weighting_with_principal_point_offset() {
    let mut det = scenario_detector();
    det.delta_s = 2.0;
    det.delta_t = -1.0;
    let d_sd = det.d_sd();

    let mut img = Image::new(32, 32);
    img.fill(1.0);
    apply_weights(&mut img, &det);

    for t in [0u32, 13, 31] {
        for s in [0u32, 7, 31] {
            let h_s = 0.5 + s as f32 + (2.0 - 16.0);
            let v_t = 0.5 + t as f32 + (-1.0 - 16.0);
            let expected = d_sd / (d_sd * d_sd + h_s * h_s + v_t * v_t).sqrt();
            let got = img.get(s as usize, t as usize);
            assert!((got - expected).abs() <= 1e-5 * expected);
        }
    }
}

// ===== Back-projection linearity (property 7) =====

#[test]
fn backprojection_is_linear() {
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    let w = det.n_row as usize;
    let h = det.n_col as usize;

    let mut p = Image::new(w, h);
    let mut q = Image::new(w, h);
    for t in 0..h {
        for s in 0..w {
            p.set(s, t, ((s + t) % 5) as f32 * 0.2);
            q.set(s, t, ((s * 3 + t) % 7) as f32 * 0.1);
        }
    }

    let alpha = 2.5f32;
    let mut combined = Image::new(w, h);
    for t in 0..h {
        for s in 0..w {
            combined.set(s, t, alpha * p.get(s, t) + q.get(s, t));
        }
    }

    let (sin_phi, cos_phi) = (1.1f32.sin(), 1.1f32.cos());
    let mut bp_p = SubVolume::new(vol.dim_x, vol.dim_y, vol.dim_z, 0, 0);
    let mut bp_q = SubVolume::new(vol.dim_x, vol.dim_y, vol.dim_z, 0, 0);
    let mut bp_c = SubVolume::new(vol.dim_x, vol.dim_y, vol.dim_z, 0, 0);
    backproject(&mut bp_p, &p, &det, &vol, sin_phi, cos_phi);
    backproject(&mut bp_q, &q, &det, &vol, sin_phi, cos_phi);
    backproject(&mut bp_c, &combined, &det, &vol, sin_phi, cos_phi);

    for i in 0..bp_c.voxels() {
        let expected = alpha * bp_p.as_slice()[i] + bp_q.as_slice()[i];
        let got = bp_c.as_slice()[i];
        assert!(
            (got - expected).abs() <= 1e-4 * expected.abs().max(1e-3),
            "voxel {i}: {got} vs {expected}"
        );
    }
}

// ===== Bilinear boundary (property 8) =====

#[test]
fn bilinear_outside_detector_is_zero() {
    let mut img = Image::new(8, 8);
    img.fill(3.0);

    // Entirely outside in every direction: exactly zero, never NaN,
    // never wrapped around to the far edge.
    for (h, v) in [
        (-2.0f32, 4.0f32),
        (10.0, 4.0),
        (4.0, -2.0),
        (4.0, 9.5),
        (-100.0, -100.0),
        (1e6, 1e6),
    ] {
        let s = sample_bilinear(&img, h, v);
        assert_eq!(s, 0.0, "({h},{v}) leaked {s}");
        assert!(!s.is_nan());
    }

    // Straddling the edge: partial weight from the in-bounds corner
    // only — strictly between 0 and the interior value.
    let edge = sample_bilinear(&img, -0.25, 4.0);
    assert!(edge > 0.0 && edge < 3.0, "edge sample {edge}");
    let interior = sample_bilinear(&img, 3.5, 3.5);
    assert!((interior - 3.0).abs() < 1e-6);
}

#[test]
fn backprojection_with_empty_detector_region_stays_zero() {
    // A projection that is zero everywhere except one far corner must
    // leave voxels projecting into the opposite corner untouched.
    let det = scenario_detector();
    let vol = calculate_volume_geometry(&det);
    let mut proj = Image::new(32, 32);
    proj.set(0, 0, 1.0);

    let mut sub = SubVolume::new(vol.dim_x, vol.dim_y, vol.dim_z, 0, 0);
    backproject(&mut sub, &proj, &det, &vol, 0.0, 1.0);

    // Something was deposited...
    let nonzero = sub.as_slice().iter().filter(|&&v| v != 0.0).count();
    assert!(nonzero > 0);
    // ...but only a sliver of the volume.
    assert!(
        nonzero < sub.voxels() / 10,
        "corner impulse touched {nonzero} of {} voxels",
        sub.voxels()
    );
    // Every deposited value is finite.
    assert!(sub.as_slice().iter().all(|v| v.is_finite()));
}
