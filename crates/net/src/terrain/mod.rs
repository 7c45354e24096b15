//! Terrain patch codec.
//!
//! A 16×16 tile of heights is normalized against its minimum and range,
//! transformed with a separable DCT-II, quantized with steps that grow with
//! frequency, reordered along anti-diagonals and written as a short token
//! stream. Many patches share one `LayerData` body behind a small group
//! header.

mod bits;
mod dct;
mod layer;
mod patch;

pub use bits::{BitReader, BitWriter};
pub use layer::{
    decode_layer, encode_layer, split_into_layers, DecodedLayer, DecodedPatch, LayerHeader,
    END_OF_PATCHES, GROUP_HEADER_LEN,
};
pub use patch::{
    encode, encode_with, CompressedPatch, PatchHeights, QuantParams, Token, DEFAULT_QUANT_BITS,
};

use crate::scheduler::OutboundClass;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Samples along one side of a patch.
pub const PATCH_SIZE: usize = 16;

/// Terrain decoding or packing failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerrainError {
    /// The bit stream ended mid-field.
    #[error("terrain stream truncated")]
    Truncated,
    /// `quant_bits` outside `2..=16`.
    #[error("quantization width {0} is out of range")]
    InvalidQuantBits(u8),
    /// The group header names a patch size other than 16.
    #[error("unsupported patch size {0}")]
    BadPatchSize(u8),
    /// The group header names an unknown layer.
    #[error("unknown terrain layer {0:#04x}")]
    UnknownLayer(u8),
    /// Heights, offset or range are NaN or infinite, or the range is
    /// negative.
    #[error("non-finite or negative terrain values")]
    NonFinite,
    /// Patch coordinates outside the region's tile grid.
    #[error("patch ({x}, {y}) is outside the region grid")]
    PatchOutOfRange {
        /// Patch column.
        x: u32,
        /// Patch row.
        y: u32,
    },
    /// More tokens than coefficient positions.
    #[error("patch has more than 256 coefficients")]
    TooManyCoefficients,
    /// One patch alone exceeds the body limit.
    #[error("patch needs {needed} bytes but a layer body holds {limit}")]
    PatchTooLarge {
        /// Bytes the patch needs with the header and end marker.
        needed: usize,
        /// Body limit.
        limit: usize,
    },
}

/// Which height field a layer carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LayerType {
    /// Ground heights.
    Land,
    /// Wind vectors.
    Wind,
    /// Cloud density.
    Cloud,
    /// Water heights.
    Water,
}

impl LayerType {
    /// Wire byte.
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Land => b'L',
            Self::Wind => b'7',
            Self::Cloud => b'8',
            Self::Water => b'W',
        }
    }

    /// Parse a wire byte.
    pub fn from_byte(byte: u8) -> Result<Self, TerrainError> {
        match byte {
            b'L' => Ok(Self::Land),
            b'7' => Ok(Self::Wind),
            b'8' => Ok(Self::Cloud),
            b'W' => Ok(Self::Water),
            other => Err(TerrainError::UnknownLayer(other)),
        }
    }

    /// Outbound queue for this layer.
    pub const fn queue(self) -> OutboundClass {
        match self {
            Self::Land => OutboundClass::Land,
            Self::Wind => OutboundClass::Wind,
            Self::Cloud | Self::Water => OutboundClass::Cloud,
        }
    }
}
