// gpu/projection.rs — Device-resident projections and CPU↔GPU copies.
//
// A projection lives on the GPU as a pitched f32 storage buffer (not a
// texture): the FFT stage rewrites rows in place and the back-projection
// kernel does its own bilinear arithmetic, so nothing here wants
// hardware samplers. The pitch keeps every row start 256-byte aligned,
// the same granularity pitched device allocations use elsewhere, and
// gives buffer→buffer copies friendly offsets.
//
// Upload goes through a staging Vec: rows are re-pitched from the CPU
// image's element pitch to the device pitch, then the whole buffer is
// created initialized (`create_buffer_init`) — one copy, no write_buffer
// round trip. Readback is the usual map_async + poll(Wait) dance and is
// for tests and the final merge only, never the hot path.

use wgpu::util::DeviceExt;

use crate::gpu::device::GpuDevice;
use crate::projection::Image;

/// Row pitch alignment in elements: 64 f32 = 256 bytes.
pub const PITCH_ALIGN: usize = 64;

/// Round a row length up to the device pitch.
#[inline]
pub fn aligned_pitch(width: usize) -> usize {
    (width + PITCH_ALIGN - 1) / PITCH_ALIGN * PITCH_ALIGN
}

/// One projection resident on a GPU, tied to its pipeline identity.
pub struct GpuProjection {
    pub buffer: wgpu::Buffer,
    pub width: u32,
    pub height: u32,
    /// Row pitch in elements.
    pub pitch: u32,
    /// Zero-based projection ordinal; also the angle-table index.
    pub index: u32,
}

impl GpuProjection {
    /// Upload a CPU projection image to the device.
    pub fn upload(gpu: &GpuDevice, img: &Image, index: u32) -> Self {
        let width = img.width();
        let height = img.height();
        let pitch = aligned_pitch(width);

        let mut staging = vec![0.0f32; pitch * height];
        for t in 0..height {
            staging[t * pitch..t * pitch + width].copy_from_slice(img.row(t));
        }

        let buffer = gpu
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("GpuProjection"),
                contents: bytemuck::cast_slice(&staging),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            });

        GpuProjection {
            buffer,
            width: width as u32,
            height: height as u32,
            pitch: pitch as u32,
            index,
        }
    }

    /// Read the projection back to a CPU image (pitch stripped).
    ///
    /// **Expensive and synchronous** — stalls the device. Tests only.
    pub fn readback(&self, gpu: &GpuDevice) -> Image {
        let elems = (self.pitch * self.height) as usize;
        let bytes = (elems * std::mem::size_of::<f32>()) as u64;

        let readback_buf = gpu.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("GpuProjection::readback"),
            size: bytes,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = gpu
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("GpuProjection::readback"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &readback_buf, 0, bytes);
        gpu.queue.submit(std::iter::once(encoder.finish()));

        let slice = readback_buf.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |r| {
            tx.send(r).expect("readback channel closed");
        });
        gpu.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .expect("readback callback never fired")
            .expect("readback map failed");

        let mapped = slice.get_mapped_range();
        let pitched: &[f32] = bytemuck::cast_slice(&mapped);

        let w = self.width as usize;
        let mut img = Image::new(w, self.height as usize);
        for t in 0..self.height as usize {
            let row = &pitched[t * self.pitch as usize..t * self.pitch as usize + w];
            img.row_mut(t).copy_from_slice(row);
        }
        drop(mapped);
        readback_buf.unmap();
        img
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // ---- pure (no GPU) -----------------------------------------------------

    #[test]
    fn test_aligned_pitch() {
        assert_eq!(aligned_pitch(1), 64);
        assert_eq!(aligned_pitch(64), 64);
        assert_eq!(aligned_pitch(65), 128);
        assert_eq!(aligned_pitch(1024), 1024);
    }

    #[test]
    fn test_staging_repitch() {
        // Reproduce the upload's re-pitching loop and verify layout.
        let mut img = Image::new_with_pitch(3, 2, 5);
        img.set(0, 0, 1.0);
        img.set(2, 0, 2.0);
        img.set(1, 1, 3.0);

        let pitch = aligned_pitch(3);
        let mut staging = vec![0.0f32; pitch * 2];
        for t in 0..2 {
            staging[t * pitch..t * pitch + 3].copy_from_slice(img.row(t));
        }
        assert_eq!(&staging[0..3], &[1.0, 0.0, 2.0]);
        assert_eq!(&staging[pitch..pitch + 3], &[0.0, 3.0, 0.0]);
        // Padding untouched.
        assert!(staging[3..pitch].iter().all(|&v| v == 0.0));
    }

    // ---- GPU round trip (ignored without Vulkan) ---------------------------

    #[test]
    #[ignore = "requires a Vulkan adapter"]
    fn inner_upload_round_trip() {
        let devices = crate::gpu::device::enumerate_devices().expect("need a GPU");
        let gpu = &devices[0];

        let mut img = Image::new(33, 7); // deliberately pitch-unfriendly width
        for (i, (s, t)) in (0..7).flat_map(|t| (0..33).map(move |s| (s, t))).enumerate() {
            img.set(s, t, i as f32 * 0.5 - 3.0);
        }

        let gpu_proj = GpuProjection::upload(gpu, &img, 4);
        assert_eq!(gpu_proj.index, 4);
        assert_eq!(gpu_proj.pitch % PITCH_ALIGN as u32, 0);

        let back = gpu_proj.readback(gpu);
        assert_eq!(back.width(), 33);
        assert_eq!(back.height(), 7);
        for (s, t, v) in back.pixels() {
            assert_eq!(v, img.get(s, t), "round-trip mismatch at ({s},{t})");
        }
        println!("GPU_TEST_OK");
    }
}
