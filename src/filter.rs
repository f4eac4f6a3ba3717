// filter.rs — Ramp-filter construction and per-row frequency-domain
// filtering (CPU reference).
//
// The FDK ramp filter is built in the spatial domain first. With
// τ = l_px_row (the horizontal pixel pitch) the discrete kernel is
//
//     r(0)        = 1/8 · 1/τ²
//     r(j) j even = 0
//     r(j) j odd  = −1 / (2 · j² · π² · τ²)
//
// over j ∈ [−(L−2)/2, …, 0, …, L/2], where L = 2 · 2^⌈log₂(n)⌉ is the
// detector count rounded up to a power of two and doubled — the zero
// padding that turns cyclic convolution into the linear one we want.
// A single forward FFT of r, scaled to τ·|K|, yields the real-valued
// frequency response applied to every projection row.
//
// THE "COMPLEX FILTER" THAT ISN'T
// ────────────────────────────────
// Hardware implementations of this filter often store the scalar τ·|K|
// in both lanes of a complex value and "complex-multiply" it with the
// spectrum, which works out to (a·k, b·k) — a real scalar multiply.
// We store the scalar once and multiply it into both components
// directly; the result is identical, bin for bin.
//
// PLAN CACHING
// ─────────────
// A `RampFilter` owns its rustfft plans and scratch for its padded
// length. Build one per filtering context (the pipeline builds one per
// worker) and reuse it for every projection — planning is far more
// expensive than a 64-point transform.

use std::sync::Arc;

use num_complex::Complex32;
use rustfft::{Fft, FftPlanner};

use crate::projection::Image;

/// Padded transform length for a detector of `n` pixels:
/// `2 · 2^⌈log₂(n)⌉`. The detector *column* count is what the caller
/// passes here, matching the kernel derivation above.
#[inline]
pub fn padded_length(n: u32) -> usize {
    2 * (n as usize).next_power_of_two()
}

/// The spatial-domain kernel r, laid out in FFT order: index i holds
/// r(i) for i ≤ L/2 and r(i − L) for i > L/2. r depends on j² only, so
/// the layout is symmetric: r[i] == r[L − i].
pub fn spatial_kernel(len: usize, tau: f32) -> Vec<f32> {
    assert!(len.is_power_of_two(), "kernel length {len} not a power of two");
    let mut r = vec![0.0f32; len];
    r[0] = 0.125 / (tau * tau);
    for i in 1..len {
        let j = i.min(len - i); // |j| in the wrapped layout
        if j % 2 == 1 {
            let jf = j as f32;
            r[i] = -1.0 / (2.0 * jf * jf * std::f32::consts::PI * std::f32::consts::PI * tau * tau);
        }
    }
    r
}

/// The frequency-domain ramp: τ·|FFT(r)| per bin, full length L.
///
/// r is real and even, so its spectrum is real; the magnitude strips
/// the residual imaginary roundoff. The full-length layout (instead of
/// the L/2+1 bins a real-to-complex transform would give) matches the
/// complex row transform used below — the upper half mirrors the lower.
pub fn frequency_filter(len: usize, tau: f32) -> Vec<f32> {
    let r = spatial_kernel(len, tau);
    let mut buf: Vec<Complex32> = r.iter().map(|&v| Complex32::new(v, 0.0)).collect();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(len);
    fft.process(&mut buf);

    buf.iter().map(|c| tau * c.norm()).collect()
}

// ---------------------------------------------------------------------------
// RampFilter
// ---------------------------------------------------------------------------

/// A ready-to-apply ramp filter: cached FFT plans, scratch space and
/// the frequency response for one padded length.
pub struct RampFilter {
    len: usize,
    freq: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    row: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl RampFilter {
    /// Build the filter for a detector of `n_col` rows with horizontal
    /// pitch `tau` (mm).
    pub fn new(n_col: u32, tau: f32) -> Self {
        let len = padded_length(n_col);
        let freq = frequency_filter(len, tau);
        Self::with_response(len, freq)
    }

    /// A unit-gain "filter": the same pad → FFT → multiply → IFFT →
    /// crop plumbing with a response of all ones. Exists to validate
    /// the transform round trip in isolation.
    pub fn passthrough(n_col: u32) -> Self {
        let len = padded_length(n_col);
        Self::with_response(len, vec![1.0; len])
    }

    fn with_response(len: usize, freq: Vec<f32>) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(len);
        let ifft = planner.plan_fft_inverse(len);
        let scratch_len = fft
            .get_inplace_scratch_len()
            .max(ifft.get_inplace_scratch_len());
        RampFilter {
            len,
            freq,
            fft,
            ifft,
            row: vec![Complex32::new(0.0, 0.0); len],
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
        }
    }

    /// Padded transform length L.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The cached frequency response, length L.
    #[inline]
    pub fn frequency_response(&self) -> &[f32] {
        &self.freq
    }

    /// Filter every row of a projection in place:
    /// zero-pad to L, forward FFT, multiply by the response, inverse
    /// FFT, then crop back to `width` with the 1/L normalization.
    ///
    /// # Panics
    /// Panics if the projection is wider than L — that means the filter
    /// was built for a different detector.
    pub fn apply(&mut self, img: &mut Image) {
        let width = img.width();
        assert!(
            width <= self.len,
            "projection width {width} exceeds filter length {}",
            self.len
        );
        let norm = 1.0 / self.len as f32;

        for t in 0..img.height() {
            {
                let src = img.row(t);
                for (i, slot) in self.row.iter_mut().enumerate() {
                    *slot = if i < width {
                        Complex32::new(src[i], 0.0)
                    } else {
                        Complex32::new(0.0, 0.0)
                    };
                }
            }

            self.fft.process_with_scratch(&mut self.row, &mut self.scratch);
            for (c, &k) in self.row.iter_mut().zip(self.freq.iter()) {
                // (a + bi) · k — the real scalar multiply described in
                // the header.
                *c = Complex32::new(c.re * k, c.im * k);
            }
            self.ifft.process_with_scratch(&mut self.row, &mut self.scratch);

            let dst = img.row_mut(t);
            for (i, px) in dst.iter_mut().enumerate() {
                *px = self.row[i].re * norm;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
