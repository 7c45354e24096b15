//! Per-region terrain storage.

use crate::heightmap::Heightfield;
use simwire_core::RegionHandle;
use simwire_net::terrain::{
    self, CompressedPatch, DecodedLayer, LayerType, PatchHeights, TerrainError, PATCH_SIZE,
};
use simwire_net::NetError;
use std::collections::BTreeSet;
use tracing::debug;

/// Patch coordinates travel in five bits.
pub const MAX_PATCHES_PER_SIDE: u32 = 32;

/// Ground heights of one region, one [`PatchHeights`] per grid cell.
#[derive(Debug, Clone)]
pub struct TerrainStore {
    region: RegionHandle,
    patches_per_side: u32,
    patches: Vec<PatchHeights>,
    dirty: BTreeSet<(u32, u32)>,
}

impl TerrainStore {
    /// Region of `patches_per_side`² patches at uniform `height`.
    ///
    /// `patches_per_side` is clamped to `1..=MAX_PATCHES_PER_SIDE`.
    pub fn flat(region: RegionHandle, patches_per_side: u32, height: f32) -> Self {
        let patches_per_side = patches_per_side.clamp(1, MAX_PATCHES_PER_SIDE);
        let count = (patches_per_side * patches_per_side) as usize;
        Self {
            region,
            patches_per_side,
            patches: vec![[[height; PATCH_SIZE]; PATCH_SIZE]; count],
            dirty: BTreeSet::new(),
        }
    }

    /// Region seeded from `field`.
    pub fn generate(region: RegionHandle, patches_per_side: u32, field: &Heightfield) -> Self {
        let mut store = Self::flat(region, patches_per_side, 0.0);
        let side = store.patches_per_side;
        for py in 0..side {
            for px in 0..side {
                store.patches[(py * side + px) as usize] = field.patch(region, px, py);
            }
        }
        debug!(region = region.0, patches = side * side, "generated terrain");
        store
    }

    /// Region handle.
    pub fn region(&self) -> RegionHandle {
        self.region
    }

    /// Patches along one side.
    pub fn patches_per_side(&self) -> u32 {
        self.patches_per_side
    }

    /// Samples per row of the full height field.
    pub fn stride(&self) -> u16 {
        (self.patches_per_side as usize * PATCH_SIZE) as u16
    }

    fn index(&self, x: u32, y: u32) -> Result<usize, NetError> {
        if x >= self.patches_per_side || y >= self.patches_per_side {
            return Err(NetError::PatchOutOfRange { x, y });
        }
        Ok((y * self.patches_per_side + x) as usize)
    }

    /// Heights of patch `(x, y)`.
    pub fn get_patch(&self, x: u32, y: u32) -> Result<&PatchHeights, NetError> {
        let i = self.index(x, y)?;
        Ok(&self.patches[i])
    }

    /// Replace patch `(x, y)` and mark it for resend.
    pub fn put_patch(&mut self, x: u32, y: u32, heights: PatchHeights) -> Result<(), NetError> {
        let i = self.index(x, y)?;
        self.patches[i] = heights;
        self.dirty.insert((x, y));
        Ok(())
    }

    /// Height at region-local meters, nearest sample.
    pub fn height_at(&self, x: f32, y: f32) -> Option<f32> {
        if x < 0.0 || y < 0.0 {
            return None;
        }
        let (sx, sy) = (x as usize, y as usize);
        let patch = self
            .get_patch((sx / PATCH_SIZE) as u32, (sy / PATCH_SIZE) as u32)
            .ok()?;
        Some(patch[sy % PATCH_SIZE][sx % PATCH_SIZE])
    }

    /// Store every patch of an inbound layer. Returns how many were applied.
    pub fn apply_layer(&mut self, layer: &DecodedLayer) -> usize {
        let mut applied = 0;
        for patch in &layer.patches {
            if self.put_patch(patch.x, patch.y, patch.heights).is_ok() {
                applied += 1;
            }
        }
        applied
    }

    /// Patches changed since the last [`TerrainStore::take_dirty`].
    pub fn take_dirty(&mut self) -> Vec<(u32, u32)> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    /// Compress the given patches.
    pub fn compress(
        &self,
        coords: impl IntoIterator<Item = (u32, u32)>,
    ) -> Result<Vec<CompressedPatch>, TerrainError> {
        coords
            .into_iter()
            .map(|(x, y)| {
                let heights = self
                    .get_patch(x, y)
                    .map_err(|_| TerrainError::PatchOutOfRange { x, y })?;
                terrain::encode(x as u8, y as u8, heights)
            })
            .collect()
    }

    /// `LayerData` bodies carrying the given patches, each at most
    /// `max_body` bytes.
    pub fn layer_bodies(
        &self,
        coords: impl IntoIterator<Item = (u32, u32)>,
        max_body: usize,
    ) -> Result<Vec<Vec<u8>>, TerrainError> {
        let patches = self.compress(coords)?;
        terrain::split_into_layers(LayerType::Land, self.stride(), &patches, max_body)
    }

    /// Bodies for the whole region.
    pub fn full_layers(&self, max_body: usize) -> Result<Vec<Vec<u8>>, TerrainError> {
        let side = self.patches_per_side;
        self.layer_bodies(
            (0..side).flat_map(|y| (0..side).map(move |x| (x, y))),
            max_body,
        )
    }
}
