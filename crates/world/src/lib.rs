#![warn(missing_docs)]
//! Region terrain: generation and patch storage.

mod heightmap;
mod noise;
mod terrain;

pub use heightmap::{Heightfield, HeightfieldConfig, MAX_HEIGHT, MIN_HEIGHT};
pub use noise::{LayeredNoise, NoiseConfig, NoiseGenerator};
pub use terrain::{TerrainStore, MAX_PATCHES_PER_SIDE};
