// KONRAD: KONe-beam Reconstruction on Accelerated Devices
// FDK cone-beam CT reconstruction on one or more GPUs, with a complete
// CPU reference backend.
//
// Reference: Feldkamp, Davis, Kress — "Practical cone-beam algorithm"
// (J. Opt. Soc. Am. A 1, 1984)

pub mod angles;
pub mod backproject;
pub mod filter;
pub mod geometry;
pub mod pipeline;
pub mod projection;
pub mod reconstruct;
pub mod scheduler;
pub mod source;
pub mod volume;
pub mod weight;

pub mod gpu;
