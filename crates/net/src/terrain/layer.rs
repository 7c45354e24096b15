//! `LayerData` bodies: a group header followed by a patch bit stream.

use super::bits::{BitReader, BitWriter};
use super::patch::{CompressedPatch, PatchHeights, QuantParams};
use super::{LayerType, TerrainError, PATCH_SIZE};
use tracing::debug;

/// Marker closing the patch stream.
pub const END_OF_PATCHES: u8 = 97;

/// Bytes of the group header.
pub const GROUP_HEADER_LEN: usize = 4;

/// Group header preceding the patch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerHeader {
    /// Samples per row of the source height field.
    pub stride: u16,
    /// Samples per patch side; always 16.
    pub patch_size: u8,
    /// Layer carried by the body.
    pub layer: LayerType,
}

/// A patch recovered from a layer body.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPatch {
    /// Patch column.
    pub x: u32,
    /// Patch row.
    pub y: u32,
    /// Parameters it was encoded with.
    pub params: QuantParams,
    /// Reconstructed heights.
    pub heights: PatchHeights,
}

/// Every patch of a layer body, plus those that were dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedLayer {
    /// Group header.
    pub header: LayerHeader,
    /// Patches inside the region grid.
    pub patches: Vec<DecodedPatch>,
    /// Per-patch failures; the other patches are unaffected.
    pub rejected: Vec<TerrainError>,
}

fn write_header(out: &mut Vec<u8>, layer: LayerType, stride: u16) {
    out.extend_from_slice(&stride.to_le_bytes());
    out.push(PATCH_SIZE as u8);
    out.push(layer.to_byte());
}

/// Build one body holding every patch in `patches`.
pub fn encode_layer(layer: LayerType, stride: u16, patches: &[CompressedPatch]) -> Vec<u8> {
    let mut bits = BitWriter::new();
    for patch in patches {
        patch.write_bits(&mut bits);
    }
    bits.write(u32::from(END_OF_PATCHES), 8);

    let mut out = Vec::with_capacity(GROUP_HEADER_LEN + bits.bit_len().div_ceil(8));
    write_header(&mut out, layer, stride);
    out.extend_from_slice(&bits.into_bytes());
    out
}

/// Pack `patches` into as few bodies as possible, none longer than
/// `max_bytes`.
pub fn split_into_layers(
    layer: LayerType,
    stride: u16,
    patches: &[CompressedPatch],
    max_bytes: usize,
) -> Result<Vec<Vec<u8>>, TerrainError> {
    let fixed_bits = GROUP_HEADER_LEN * 8 + 8;
    let mut bodies = Vec::new();
    let mut group: Vec<CompressedPatch> = Vec::new();
    let mut group_bits = fixed_bits;

    for patch in patches {
        let bits = patch.bit_len();
        let needed = (fixed_bits + bits).div_ceil(8);
        if needed > max_bytes {
            return Err(TerrainError::PatchTooLarge {
                needed,
                limit: max_bytes,
            });
        }
        if (group_bits + bits).div_ceil(8) > max_bytes {
            bodies.push(encode_layer(layer, stride, &group));
            group.clear();
            group_bits = fixed_bits;
        }
        group.push(patch.clone());
        group_bits += bits;
    }
    if !group.is_empty() {
        bodies.push(encode_layer(layer, stride, &group));
    }
    Ok(bodies)
}

/// Parse a body. `patches_per_side` bounds valid patch coordinates.
///
/// Header and stream errors fail the whole body; a patch outside the grid
/// is only recorded in [`DecodedLayer::rejected`].
pub fn decode_layer(bytes: &[u8], patches_per_side: u32) -> Result<DecodedLayer, TerrainError> {
    if bytes.len() < GROUP_HEADER_LEN {
        return Err(TerrainError::Truncated);
    }
    let stride = u16::from_le_bytes([bytes[0], bytes[1]]);
    let patch_size = bytes[2];
    if usize::from(patch_size) != PATCH_SIZE {
        return Err(TerrainError::BadPatchSize(patch_size));
    }
    let header = LayerHeader {
        stride,
        patch_size,
        layer: LayerType::from_byte(bytes[3])?,
    };

    let mut reader = BitReader::new(&bytes[GROUP_HEADER_LEN..]);
    let mut patches = Vec::new();
    let mut rejected = Vec::new();
    loop {
        let quant_bits = reader.read(8)? as u8;
        if quant_bits == END_OF_PATCHES {
            break;
        }
        let patch = CompressedPatch::read_bits(quant_bits, &mut reader)?;
        let (x, y) = (u32::from(patch.x), u32::from(patch.y));
        if x >= patches_per_side || y >= patches_per_side {
            debug!(x, y, patches_per_side, "dropping terrain patch outside region");
            rejected.push(TerrainError::PatchOutOfRange { x, y });
            continue;
        }
        match patch.decode() {
            Ok(heights) => patches.push(DecodedPatch {
                x,
                y,
                params: patch.params,
                heights,
            }),
            Err(err) => rejected.push(err),
        }
    }

    Ok(DecodedLayer {
        header,
        patches,
        rejected,
    })
}
