// volume.rs — Reconstruction volumes and their z-slab decomposition.
//
// The scheduler splits the output volume into axis-aligned z-slabs
// ("sub-volumes"), each owned by exactly one back-projection worker
// until the merge phase. The host `Volume` is assembled slab by slab;
// the slabs are disjoint in z, so merges from different devices need no
// synchronization beyond the final join.
//
// Voxel addressing is (k, l, m) = (x, y, z), row-major with x fastest:
// index = (m * dim_y + l) * dim_x + k. z is *local* inside a sub-volume;
// `z_offset` places the slab in the global volume.

use crate::geometry::VolumeGeometry;

// ---------------------------------------------------------------------------
// SubVolume
// ---------------------------------------------------------------------------

/// One z-slab of the output volume, owned by a single back-projection
/// worker. Accumulation target of the back-projection kernel.
#[derive(Debug, Clone)]
pub struct SubVolume {
    pub dim_x: u32,
    pub dim_y: u32,
    /// Slab thickness in voxels.
    pub dim_z_local: u32,
    /// First global z-slice covered by this slab.
    pub z_offset: u32,
    /// Plan-assigned owning device.
    pub device: usize,
    data: Vec<f32>,
}

impl SubVolume {
    /// Allocate a zeroed slab.
    pub fn new(dim_x: u32, dim_y: u32, dim_z_local: u32, z_offset: u32, device: usize) -> Self {
        let len = dim_x as usize * dim_y as usize * dim_z_local as usize;
        SubVolume {
            dim_x,
            dim_y,
            dim_z_local,
            z_offset,
            device,
            data: vec![0.0; len],
        }
    }

    #[inline]
    fn idx(&self, k: u32, l: u32, m: u32) -> usize {
        debug_assert!(k < self.dim_x && l < self.dim_y && m < self.dim_z_local);
        (m as usize * self.dim_y as usize + l as usize) * self.dim_x as usize + k as usize
    }

    #[inline]
    pub fn get(&self, k: u32, l: u32, m: u32) -> f32 {
        self.data[self.idx(k, l, m)]
    }

    /// Accumulate into voxel (k, l, m-local).
    #[inline]
    pub fn add(&mut self, k: u32, l: u32, m: u32, v: f32) {
        let i = self.idx(k, l, m);
        self.data[i] += v;
    }

    /// One complete local z-slice, dim_x * dim_y long.
    #[inline]
    pub fn slice(&self, m: u32) -> &[f32] {
        let plane = self.dim_x as usize * self.dim_y as usize;
        let start = m as usize * plane;
        &self.data[start..start + plane]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    #[inline]
    pub fn voxels(&self) -> usize {
        self.data.len()
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// The assembled host-side output volume.
#[derive(Debug, Clone)]
pub struct Volume {
    pub dim_x: u32,
    pub dim_y: u32,
    pub dim_z: u32,
    /// Isotropic voxel size in mm, carried for downstream writers.
    pub voxel_size: f32,
    data: Vec<f32>,
}

impl Volume {
    /// Allocate a zeroed volume matching the scheduler's geometry.
    pub fn new(geo: &VolumeGeometry) -> Self {
        Volume {
            dim_x: geo.dim_x,
            dim_y: geo.dim_y,
            dim_z: geo.dim_z,
            voxel_size: geo.l_vx_x,
            data: vec![0.0; geo.voxels()],
        }
    }

    #[inline]
    pub fn get(&self, k: u32, l: u32, m: u32) -> f32 {
        debug_assert!(k < self.dim_x && l < self.dim_y && m < self.dim_z);
        let i =
            (m as usize * self.dim_y as usize + l as usize) * self.dim_x as usize + k as usize;
        self.data[i]
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Copy a finished sub-volume into its z-slab of this volume.
    ///
    /// # Panics
    /// Panics if the slab's footprint or z-range does not fit — that
    /// would mean the slab came from a different plan than this volume.
    pub fn merge(&mut self, sub: &SubVolume) {
        assert_eq!(sub.dim_x, self.dim_x, "sub-volume x extent mismatch");
        assert_eq!(sub.dim_y, self.dim_y, "sub-volume y extent mismatch");
        assert!(
            sub.z_offset + sub.dim_z_local <= self.dim_z,
            "sub-volume z range [{}, {}) exceeds dim_z {}",
            sub.z_offset,
            sub.z_offset + sub.dim_z_local,
            self.dim_z
        );
        let plane = self.dim_x as usize * self.dim_y as usize;
        let start = sub.z_offset as usize * plane;
        let len = sub.voxels();
        self.data[start..start + len].copy_from_slice(sub.as_slice());
    }

    /// One global z-slice, dim_x * dim_y long. Handy for slice viewers.
    pub fn slice(&self, m: u32) -> &[f32] {
        let plane = self.dim_x as usize * self.dim_y as usize;
        let start = m as usize * plane;
        &self.data[start..start + plane]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
