// gpu/mod.rs — GPU reconstruction backend.
//
// wgpu-based compute kernels mirroring the CPU algorithms in the parent
// crate. The CPU implementations remain the authoritative reference —
// every GPU kernel is validated against them value-for-value.
//
// Division of labor:
//
//   GPU handles all per-projection compute:
//     upload → cosine weighting → ramp filtering (FFT) → back-projection
//
//   CPU handles orchestration:
//     scheduling, queueing, angle tables, the final slab merge into the
//     host volume, and delivery to the sink.
//
// Each physical GPU gets its own worker thread per stage; queues and
// sentinels are the same `pipeline` primitives the CPU driver uses.
// wgpu queues execute submissions in order, so one device queue plays
// the role the per-projection CUDA streams play in classic FDK
// engines; the only blocking synchronization is the sub-volume
// readback at merge time.

pub mod backproject;
pub mod device;
pub mod filter;
pub mod projection;
pub mod reconstruct;
pub mod weight;
