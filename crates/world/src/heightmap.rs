//! Height-field generation for new regions.
//!
//! Samples are taken at global meter coordinates, so neighbouring patches and
//! neighbouring regions meet without seams.

use crate::noise::LayeredNoise;
use serde::{Deserialize, Serialize};
use simwire_core::RegionHandle;
use simwire_net::terrain::{PatchHeights, PATCH_SIZE};

/// Lowest height a generated sample may take.
pub const MIN_HEIGHT: f32 = 0.0;

/// Highest height a generated sample may take.
pub const MAX_HEIGHT: f32 = 255.0;

/// How a region's ground is seeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeightfieldConfig {
    /// Noise seed shared by every region of a grid.
    pub seed: u64,
    /// Mean ground height in meters.
    pub base_height: f32,
    /// Largest deviation from the mean.
    pub amplitude: f32,
}

impl Default for HeightfieldConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            base_height: 24.0,
            amplitude: 16.0,
        }
    }
}

/// Generates patches for any region of one grid.
pub struct Heightfield {
    noise: LayeredNoise,
    config: HeightfieldConfig,
}

impl Heightfield {
    /// Generator for `config`.
    pub fn new(config: HeightfieldConfig) -> Self {
        Self {
            noise: LayeredNoise::new(config.seed),
            config,
        }
    }

    /// Heights of patch `(px, py)` of `region`, clamped to
    /// `[MIN_HEIGHT, MAX_HEIGHT]`.
    pub fn patch(&self, region: RegionHandle, px: u32, py: u32) -> PatchHeights {
        let (origin_x, origin_y) = region.global();
        let mut heights = [[0.0; PATCH_SIZE]; PATCH_SIZE];
        for (local_y, row) in heights.iter_mut().enumerate() {
            for (local_x, cell) in row.iter_mut().enumerate() {
                let gx = f64::from(origin_x) + f64::from(px) * PATCH_SIZE as f64 + local_x as f64;
                let gy = f64::from(origin_y) + f64::from(py) * PATCH_SIZE as f64 + local_y as f64;
                let n = self.noise.sample_height(gx, gy) as f32;
                *cell = (self.config.base_height + n * self.config.amplitude)
                    .clamp(MIN_HEIGHT, MAX_HEIGHT);
            }
        }
        heights
    }
}
