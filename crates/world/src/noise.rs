//! Deterministic noise used to seed region height fields.

use noise::{NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

/// Multi-octave Perlin settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Number of octaves (layers of detail)
    pub octaves: u32,
    /// Frequency multiplier between octaves
    pub lacunarity: f64,
    /// Amplitude multiplier between octaves (persistence)
    pub persistence: f64,
    /// Base frequency, in cycles per meter
    pub frequency: f64,
    /// Seed for deterministic generation
    pub seed: u32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            octaves: 4,
            lacunarity: 2.0,
            persistence: 0.5,
            frequency: 1.0,
            seed: 0,
        }
    }
}

impl NoiseConfig {
    /// Broad hills spanning most of a region.
    pub fn hills(seed: u32) -> Self {
        Self {
            octaves: 3,
            lacunarity: 2.1,
            persistence: 0.55,
            frequency: 0.006,
            seed,
        }
    }

    /// Medium ridges and gullies.
    pub fn ridges(seed: u32) -> Self {
        Self {
            octaves: 4,
            lacunarity: 2.0,
            persistence: 0.5,
            frequency: 0.02,
            seed: seed.wrapping_add(1000),
        }
    }

    /// Meter-scale roughness.
    pub fn detail(seed: u32) -> Self {
        Self {
            octaves: 2,
            lacunarity: 2.3,
            persistence: 0.4,
            frequency: 0.12,
            seed: seed.wrapping_add(2000),
        }
    }
}

/// Perlin noise with octave summing.
pub struct NoiseGenerator {
    perlin: Perlin,
    config: NoiseConfig,
}

impl NoiseGenerator {
    /// Create a generator for `config`.
    pub fn new(config: NoiseConfig) -> Self {
        Self {
            perlin: Perlin::new(config.seed),
            config,
        }
    }

    /// Noise at 2D coordinates, in `[-1.0, 1.0]`.
    pub fn sample_2d(&self, x: f64, y: f64) -> f64 {
        let mut value = 0.0;
        let mut amplitude = 1.0;
        let mut frequency = self.config.frequency;
        let mut max_value = 0.0;

        for _ in 0..self.config.octaves {
            value += self.perlin.get([x * frequency, y * frequency]) * amplitude;
            max_value += amplitude;

            amplitude *= self.config.persistence;
            frequency *= self.config.lacunarity;
        }

        value / max_value
    }
}

/// Hills, ridges and detail combined into one height signal.
pub struct LayeredNoise {
    hills: NoiseGenerator,
    ridges: NoiseGenerator,
    detail: NoiseGenerator,
}

impl LayeredNoise {
    /// Generators for `seed`.
    pub fn new(seed: u64) -> Self {
        let seed = seed as u32;
        Self {
            hills: NoiseGenerator::new(NoiseConfig::hills(seed)),
            ridges: NoiseGenerator::new(NoiseConfig::ridges(seed)),
            detail: NoiseGenerator::new(NoiseConfig::detail(seed)),
        }
    }

    /// Weighted sum in `[-1.0, 1.0]` at global meters `(x, y)`.
    pub fn sample_height(&self, x: f64, y: f64) -> f64 {
        self.hills.sample_2d(x, y) * 0.6
            + self.ridges.sample_2d(x, y) * 0.3
            + self.detail.sample_2d(x, y) * 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_determinism() {
        let gen1 = NoiseGenerator::new(NoiseConfig::ridges(12345));
        let gen2 = NoiseGenerator::new(NoiseConfig::ridges(12345));
        for x in 0..10 {
            for y in 0..10 {
                let (a, b) = (gen1.sample_2d(x as f64, y as f64), gen2.sample_2d(x as f64, y as f64));
                assert_eq!(a, b, "noise not deterministic at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_noise_range() {
        let gen = NoiseGenerator::new(NoiseConfig::default());
        for x in 0..100 {
            for y in 0..100 {
                let val = gen.sample_2d(x as f64 * 0.1, y as f64 * 0.1);
                assert!((-1.0..=1.0).contains(&val), "{val} out of range at ({x}, {y})");
            }
        }
    }

    #[test]
    fn test_layered_noise_is_bounded() {
        let layered = LayeredNoise::new(7);
        for x in 0..32 {
            for y in 0..32 {
                let h = layered.sample_height(x as f64 * 8.0, y as f64 * 8.0);
                assert!((-1.0..=1.0).contains(&h));
            }
        }
    }
}
