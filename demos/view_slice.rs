// demos/view_slice.rs — Reconstruct a small ball phantom and show the
// central slice in a window.
//
//   cargo run --release --example view_slice
//
// ↑/↓ steps through slices, ESC quits. Grayscale is normalized to the
// volume's own min/max, so the FDK edge overshoot is visible as a
// bright rim around the ball.

use minifb::{Key, Window, WindowOptions};

use konrad::geometry::DetectorGeometry;
use konrad::projection::Image;
use konrad::reconstruct::{reconstruct, ReconstructionConfig};
use konrad::scheduler::DeviceMemory;
use konrad::source::{VecSink, VecSource};
use konrad::volume::Volume;
use konrad::weight::{h_min, v_min};

const SCALE: usize = 6;

fn detector() -> DetectorGeometry {
    DetectorGeometry {
        n_row: 96,
        n_col: 96,
        l_px_row: 1.0,
        l_px_col: 1.0,
        delta_s: 0.0,
        delta_t: 0.0,
        d_so: 300.0,
        d_od: 300.0,
        n_proj: 120,
        rot_angle: 3.0,
    }
}

fn chord_through_ball(p0: [f32; 3], p1: [f32; 3], radius: f32) -> f32 {
    let d = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];
    let len = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
    let u = [d[0] / len, d[1] / len, d[2] / len];
    let t0 = -(p0[0] * u[0] + p0[1] * u[1] + p0[2] * u[2]);
    let c = [p0[0] + t0 * u[0], p0[1] + t0 * u[1], p0[2] + t0 * u[2]];
    let dist2 = c[0] * c[0] + c[1] * c[1] + c[2] * c[2];
    if dist2 >= radius * radius {
        0.0
    } else {
        2.0 * (radius * radius - dist2).sqrt()
    }
}

fn project_ball(det: &DetectorGeometry, phi: f32, radius: f32) -> Image {
    let (sin_phi, cos_phi) = phi.sin_cos();
    let d_so = det.d_so.abs();
    let s_det = d_so - det.d_sd();
    let h0 = h_min(det);
    let v0 = v_min(det);
    let source = [d_so * cos_phi, d_so * sin_phi, 0.0];

    let mut img = Image::new(det.n_row as usize, det.n_col as usize);
    for t in 0..det.n_col as usize {
        let v_mm = det.l_px_col / 2.0 + t as f32 * det.l_px_col + v0;
        for s in 0..det.n_row as usize {
            let h_mm = det.l_px_row / 2.0 + s as f32 * det.l_px_row + h0;
            let t_det = -h_mm;
            let pixel = [
                s_det * cos_phi - t_det * sin_phi,
                s_det * sin_phi + t_det * cos_phi,
                -v_mm,
            ];
            img.set(s, t, 0.01 * chord_through_ball(source, pixel, radius));
        }
    }
    img
}

/// Map one z-slice to a scaled 0RGB framebuffer.
fn render_slice(vol: &Volume, m: u32, lo: f32, hi: f32, buf: &mut [u32]) {
    let n = vol.dim_x as usize;
    let span = (hi - lo).max(1e-12);
    let slice = vol.slice(m);
    for y in 0..n * SCALE {
        for x in 0..n * SCALE {
            let v = slice[(y / SCALE) * n + x / SCALE];
            let g = (((v - lo) / span).clamp(0.0, 1.0) * 255.0) as u32;
            buf[y * n * SCALE + x] = (g << 16) | (g << 8) | g;
        }
    }
}

fn main() {
    env_logger::init();
    let det = detector();

    println!("projecting and reconstructing, this takes a moment...");
    let images: Vec<Image> = (0..det.n_proj)
        .map(|i| project_ball(&det, (i as f32 * det.rot_angle).to_radians(), 25.0))
        .collect();

    let mut sink = VecSink::new();
    reconstruct(
        &det,
        &[DeviceMemory {
            id: 0,
            bytes: 1 << 32,
        }],
        VecSource::new(images),
        &mut sink,
        &ReconstructionConfig::default(),
    )
    .expect("reconstruction failed");
    let vol = sink.take().expect("sink holds no volume");

    let lo = vol.as_slice().iter().cloned().fold(f32::INFINITY, f32::min);
    let hi = vol
        .as_slice()
        .iter()
        .cloned()
        .fold(f32::NEG_INFINITY, f32::max);
    println!("voxel range: [{lo:.4}, {hi:.4}]");

    let n = vol.dim_x as usize;
    let mut window = Window::new(
        "konrad — volume slice (↑/↓ to browse, ESC to quit)",
        n * SCALE,
        n * SCALE,
        WindowOptions::default(),
    )
    .expect("failed to open window");
    window.set_target_fps(30);

    let mut buf = vec![0u32; n * SCALE * n * SCALE];
    let mut m = vol.dim_z / 2;
    while window.is_open() && !window.is_key_down(Key::Escape) {
        if window.is_key_pressed(Key::Up, minifb::KeyRepeat::Yes) && m + 1 < vol.dim_z {
            m += 1;
        }
        if window.is_key_pressed(Key::Down, minifb::KeyRepeat::Yes) && m > 0 {
            m -= 1;
        }
        render_slice(&vol, m, lo, hi, &mut buf);
        window
            .update_with_buffer(&buf, n * SCALE, n * SCALE)
            .expect("framebuffer update failed");
    }
}
