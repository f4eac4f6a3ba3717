// angles.rs — Per-projection rotation angles and their sin/cos tables.
//
// The back-projection kernel consumes sin(φ) and cos(φ), never φ
// itself, so both are precomputed once for the whole run and looked up
// by projection index. The table is built either from an angle file
// (one angle per line, degrees) or from a uniform step.
//
// ANGLE FILE DIALECTS
// ────────────────────
// Lab software in the field writes either "1.5" or, with a German
// locale, "1,5". The dialect is auto-detected from the first line: if
// it contains a comma, the whole file is read with ',' as the decimal
// separator. Trailing whitespace is tolerated, blank lines are skipped.
//
// A missing or short file is never fatal: absent entries are synthesized
// from the uniform step and a warning names how many were padded.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use log::warn;

/// Write-once table of per-projection angles. Constructed before the
/// first back-projection kernel launch; read-only afterwards.
#[derive(Debug, Clone)]
pub struct AngleTable {
    phi: Vec<f32>,
    sin: Vec<f32>,
    cos: Vec<f32>,
}

impl AngleTable {
    /// Build from explicit angles in degrees.
    pub fn from_degrees(degrees: &[f32]) -> Self {
        let phi: Vec<f32> = degrees.iter().map(|d| d.to_radians()).collect();
        let sin = phi.iter().map(|p| p.sin()).collect();
        let cos = phi.iter().map(|p| p.cos()).collect();
        AngleTable { phi, sin, cos }
    }

    /// Uniform sampling: projection i sits at `i * step_deg` degrees.
    pub fn uniform(n_proj: u32, step_deg: f32) -> Self {
        let degrees: Vec<f32> = (0..n_proj).map(|i| i as f32 * step_deg).collect();
        Self::from_degrees(&degrees)
    }

    /// Build from an angle file, falling back to the uniform step for
    /// anything the file does not provide. Never fails:
    /// - unreadable file → warning, fully uniform table;
    /// - fewer lines than `n_proj` → missing tail padded with uniform-
    ///   step angles, warning;
    /// - more lines than `n_proj` → surplus ignored, warning.
    pub fn from_file(path: &Path, n_proj: u32, step_deg: f32) -> Self {
        let mut degrees = match parse_angle_file(path) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "Could not read angle file {}: {e}. Falling back to a uniform {step_deg}° step.",
                    path.display()
                );
                return Self::uniform(n_proj, step_deg);
            }
        };

        let n = n_proj as usize;
        if degrees.len() < n {
            warn!(
                "Angle file {} has {} entries but {} projections are expected; \
                 padding {} with uniform-step angles.",
                path.display(),
                degrees.len(),
                n,
                n - degrees.len()
            );
            for i in degrees.len()..n {
                degrees.push(i as f32 * step_deg);
            }
        } else if degrees.len() > n {
            warn!(
                "Angle file {} has {} entries but only {} projections are expected; \
                 ignoring the surplus.",
                path.display(),
                degrees.len(),
                n
            );
            degrees.truncate(n);
        }

        Self::from_degrees(&degrees)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.phi.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.phi.is_empty()
    }

    /// Rotation angle of projection `index`, radians.
    #[inline]
    pub fn phi(&self, index: u32) -> f32 {
        self.phi[index as usize]
    }

    /// `(sin φ, cos φ)` of projection `index`.
    #[inline]
    pub fn sin_cos(&self, index: u32) -> (f32, f32) {
        (self.sin[index as usize], self.cos[index as usize])
    }

    #[inline]
    pub fn sines(&self) -> &[f32] {
        &self.sin
    }

    #[inline]
    pub fn cosines(&self) -> &[f32] {
        &self.cos
    }
}

/// Read an angle file into degrees. Dialect detection: a comma anywhere
/// in the first non-blank line switches the whole file to ',' as the
/// decimal separator.
fn parse_angle_file(path: &Path) -> io::Result<Vec<f32>> {
    let reader = BufReader::new(File::open(path)?);
    let mut degrees = Vec::new();
    let mut comma_decimal: Option<bool> = None;

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let comma = *comma_decimal.get_or_insert_with(|| trimmed.contains(','));

        let normalized;
        let s = if comma {
            normalized = trimmed.replace(',', ".");
            normalized.as_str()
        } else {
            trimmed
        };

        let value: f32 = s.parse().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("line {}: not an angle: {trimmed:?}", lineno + 1),
            )
        })?;
        degrees.push(value);
    }

    Ok(degrees)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
