// source.rs — Collaborator interfaces at the edges of the pipeline.
//
// The engine does not read TIFF/HIS files and does not write volume
// files; it is handed an opened projection source and a volume sink.
// These traits are the seam: file-format crates implement them on one
// side, the pipeline drives them on the other. `VecSource`/`VecSink`
// are the in-memory implementations the tests, benches and demos use.

use crate::projection::Image;
use crate::volume::Volume;

/// An ordered stream of projection images.
///
/// `num_projections` must return the final count *before* the first
/// projection is emitted — the back-projection stage sizes its angle
/// table from it and must not launch before the count is known.
pub trait ProjectionSource: Send {
    /// Total number of projections this source will yield.
    fn num_projections(&self) -> u32;

    /// The next projection as `(index, image)`, or `None` at end of
    /// stream. Indices are 0-based and strictly increasing.
    fn next_projection(&mut self) -> std::io::Result<Option<(u32, Image)>>;
}

/// Receives the single assembled volume when reconstruction completes.
/// Partial volumes are never streamed.
pub trait VolumeSink: Send {
    fn write_volume(&mut self, volume: &Volume) -> std::io::Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

/// A source backed by a `Vec` of images, indexed in order.
pub struct VecSource {
    images: std::vec::IntoIter<Image>,
    next_index: u32,
    total: u32,
}

impl VecSource {
    pub fn new(images: Vec<Image>) -> Self {
        let total = images.len() as u32;
        VecSource {
            images: images.into_iter(),
            next_index: 0,
            total,
        }
    }
}

impl ProjectionSource for VecSource {
    fn num_projections(&self) -> u32 {
        self.total
    }

    fn next_projection(&mut self) -> std::io::Result<Option<(u32, Image)>> {
        Ok(self.images.next().map(|img| {
            let idx = self.next_index;
            self.next_index += 1;
            (idx, img)
        }))
    }
}

/// A sink that keeps the volume in memory.
#[derive(Default)]
pub struct VecSink {
    volume: Option<Volume>,
}

impl VecSink {
    pub fn new() -> Self {
        VecSink { volume: None }
    }

    /// The volume written by the pipeline, if reconstruction finished.
    pub fn take(self) -> Option<Volume> {
        self.volume
    }

    pub fn volume(&self) -> Option<&Volume> {
        self.volume.as_ref()
    }
}

impl VolumeSink for VecSink {
    fn write_volume(&mut self, volume: &Volume) -> std::io::Result<()> {
        self.volume = Some(volume.clone());
        Ok(())
    }
}
