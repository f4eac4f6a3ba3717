// projection.rs — Detector images and the projection unit that flows
// through the reconstruction pipeline.
//
// MEMORY LAYOUT
// ──────────────
// A projection is a row-major f32 buffer with an explicit row pitch,
// measured in *elements* (not bytes). pitch >= width; the padding slots
// keep rows aligned when the buffer mirrors a pitched GPU allocation:
//
//   element index:  0  1  2  3 [4]  5  6  7  8 [9]
//   pixel:          ■  ■  ■  ■  ·   ■  ■  ■  ■  ·
//   row:            |--- row 0 ---| |--- row 1 ---|
//
// Detector convention: x (called s) runs along a detector row of
// `width = n_row` pixels; y (called t) runs across the `height = n_col`
// rows. `get(s, t)` therefore addresses column s of row t.
//
// Reconstruction is single-precision throughout — the accumulation in
// the back-projection kernel is f32 and every GPU buffer is f32 — so
// the container is monomorphic instead of generic over a pixel trait.

use std::fmt;

// ---------------------------------------------------------------------------
// Image
// ---------------------------------------------------------------------------

/// A 2-D f32 image with runtime dimensions and explicit row pitch.
pub struct Image {
    /// Pixel data in row-major order. Length = height * pitch.
    data: Vec<f32>,
    width: usize,
    height: usize,
    /// Row pitch in elements. pitch >= width; row t starts at t * pitch.
    pitch: usize,
}

impl Clone for Image {
    fn clone(&self) -> Self {
        Image {
            data: self.data.clone(),
            width: self.width,
            height: self.height,
            pitch: self.pitch,
        }
    }
}

impl Image {
    /// Create a zero-filled image with pitch == width.
    pub fn new(width: usize, height: usize) -> Self {
        Self::new_with_pitch(width, height, width)
    }

    /// Create a zero-filled image with an explicit row pitch.
    ///
    /// # Panics
    /// Panics if `pitch < width`.
    pub fn new_with_pitch(width: usize, height: usize, pitch: usize) -> Self {
        assert!(pitch >= width, "pitch {pitch} < width {width}");
        Image {
            data: vec![0.0; height * pitch],
            width,
            height,
            pitch,
        }
    }

    /// Wrap an existing contiguous buffer (pitch == width).
    ///
    /// # Panics
    /// Panics if `data.len() != width * height`.
    pub fn from_vec(width: usize, height: usize, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), width * height, "buffer length mismatch");
        Image {
            data,
            width,
            height,
            pitch: width,
        }
    }

    /// Wrap an existing pitched buffer.
    ///
    /// # Panics
    /// Panics if `pitch < width` or `data.len() != height * pitch`.
    pub fn from_vec_with_pitch(
        width: usize,
        height: usize,
        pitch: usize,
        data: Vec<f32>,
    ) -> Self {
        assert!(pitch >= width, "pitch {pitch} < width {width}");
        assert_eq!(data.len(), height * pitch, "buffer length mismatch");
        Image {
            data,
            width,
            height,
            pitch,
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Read pixel (s, t) — column s of row t.
    ///
    /// # Panics
    /// Panics in debug builds if out of bounds.
    #[inline]
    pub fn get(&self, s: usize, t: usize) -> f32 {
        debug_assert!(s < self.width && t < self.height);
        self.data[t * self.pitch + s]
    }

    #[inline]
    pub fn set(&mut self, s: usize, t: usize, v: f32) {
        debug_assert!(s < self.width && t < self.height);
        self.data[t * self.pitch + s] = v;
    }

    /// The active pixels of row t (padding excluded).
    #[inline]
    pub fn row(&self, t: usize) -> &[f32] {
        let start = t * self.pitch;
        &self.data[start..start + self.width]
    }

    #[inline]
    pub fn row_mut(&mut self, t: usize) -> &mut [f32] {
        let start = t * self.pitch;
        &mut self.data[start..start + self.width]
    }

    /// The raw backing buffer, padding included.
    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Iterate over the active pixels as `(s, t, value)`.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        (0..self.height).flat_map(move |t| {
            (0..self.width).map(move |s| (s, t, self.get(s, t)))
        })
    }

    /// Overwrite every active pixel with `v` (padding untouched).
    pub fn fill(&mut self, v: f32) {
        for t in 0..self.height {
            self.row_mut(t).fill(v);
        }
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pitch", &self.pitch)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Bilinear detector sampling
// ---------------------------------------------------------------------------

/// Sample the detector at fractional pixel coordinate `(h, v)`.
///
/// The four corners are `floor`/`ceil` in each axis; each corner is
/// weighted by the fractional distance to the *opposite* corner. A
/// corner outside `[0, width) × [0, height)` contributes exactly zero —
/// rays that leave the detector fade out instead of clamping or
/// wrapping, and no coordinate produces NaN.
///
/// Integral coordinates degenerate cleanly: floor == ceil and the
/// fractional weight of the duplicate corner is zero, so the pixel is
/// counted once.
pub fn sample_bilinear(img: &Image, h: f32, v: f32) -> f32 {
    let s0 = h.floor();
    let s1 = h.ceil();
    let t0 = v.floor();
    let t1 = v.ceil();

    let ws = h - s0;
    let wt = v - t0;

    let w = img.width() as f32;
    let hh = img.height() as f32;

    let corner = |s: f32, t: f32| -> f32 {
        if s >= 0.0 && s < w && t >= 0.0 && t < hh {
            img.get(s as usize, t as usize)
        } else {
            0.0
        }
    };

    (1.0 - ws) * (1.0 - wt) * corner(s0, t0)
        + ws * (1.0 - wt) * corner(s1, t0)
        + (1.0 - ws) * wt * corner(s0, t1)
        + ws * wt * corner(s1, t1)
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

/// One radiograph travelling through the pipeline: the pitched detector
/// image plus the identity that ties it to its precomputed angle.
///
/// Ownership is exclusive to whichever stage currently holds the value;
/// projections move through the queues and die when back-projection has
/// accumulated them.
#[derive(Debug, Clone)]
pub struct Projection {
    pub image: Image,
    /// Zero-based projection ordinal; also the angle-table index.
    pub index: u32,
    /// Rotation angle in radians.
    pub phi: f32,
}

impl Projection {
    pub fn new(image: Image, index: u32, phi: f32) -> Self {
        Projection { image, index, phi }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_zero_initialized() {
        let img = Image::new(7, 3);
        assert_eq!(img.width(), 7);
        assert_eq!(img.height(), 3);
        assert_eq!(img.pitch(), 7);
        assert_eq!(img.get(0, 0), 0.0);
        assert_eq!(img.get(6, 2), 0.0);
    }

    #[test]
    fn test_pitch_does_not_affect_access() {
        let mut img = Image::new_with_pitch(3, 2, 8);
        img.set(0, 0, 1.0);
        img.set(2, 0, 2.0);
        img.set(0, 1, 3.0);
        img.set(2, 1, 4.0);
        assert_eq!(img.get(0, 0), 1.0);
        assert_eq!(img.get(2, 0), 2.0);
        assert_eq!(img.get(0, 1), 3.0);
        assert_eq!(img.get(2, 1), 4.0);
        // Row slices are width long, not pitch long.
        assert_eq!(img.row(0), &[1.0, 0.0, 2.0]);
        assert_eq!(img.row(1), &[3.0, 0.0, 4.0]);
    }

    #[test]
    fn test_from_vec_layout() {
        let img = Image::from_vec(3, 2, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert_eq!(img.get(0, 0), 10.0);
        assert_eq!(img.get(2, 0), 30.0);
        assert_eq!(img.get(0, 1), 40.0);
        assert_eq!(img.get(2, 1), 60.0);
    }

    #[test]
    #[should_panic(expected = "pitch")]
    fn test_pitch_smaller_than_width_panics() {
        Image::new_with_pitch(8, 2, 4);
    }

    #[test]
    fn test_fill_leaves_padding() {
        let mut img = Image::new_with_pitch(2, 2, 4);
        img.fill(5.0);
        assert_eq!(img.as_slice(), &[5.0, 5.0, 0.0, 0.0, 5.0, 5.0, 0.0, 0.0]);
    }

    // ---- bilinear sampling -------------------------------------------------

    #[test]
    fn test_bilinear_exact_pixel() {
        let img = Image::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(sample_bilinear(&img, 0.0, 0.0), 1.0);
        assert_eq!(sample_bilinear(&img, 1.0, 0.0), 2.0);
        assert_eq!(sample_bilinear(&img, 0.0, 1.0), 3.0);
        assert_eq!(sample_bilinear(&img, 1.0, 1.0), 4.0);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let img = Image::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]);
        assert!((sample_bilinear(&img, 0.5, 0.5) - 2.5).abs() < 1e-6);
        assert!((sample_bilinear(&img, 0.5, 0.0) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_bilinear_outside_is_zero() {
        let img = Image::from_vec(2, 2, vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(sample_bilinear(&img, -1.5, 0.0), 0.0);
        assert_eq!(sample_bilinear(&img, 0.0, 5.0), 0.0);
        assert_eq!(sample_bilinear(&img, 100.0, 100.0), 0.0);
        // No NaN even far outside.
        assert!(sample_bilinear(&img, -1e6, 1e6).is_finite());
    }

    #[test]
    fn test_bilinear_edge_fades_out() {
        // Just past the last column: the in-bounds corner still
        // contributes its share, the out-of-bounds corner adds zero.
        let img = Image::from_vec(2, 1, vec![0.0, 8.0]);
        let v = sample_bilinear(&img, 1.5, 0.0);
        assert!((v - 4.0).abs() < 1e-6);
    }
}
