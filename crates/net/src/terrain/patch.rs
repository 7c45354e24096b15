//! Single-patch compression.

use super::bits::{BitReader, BitWriter};
use super::dct::{self, Grid};
use super::{TerrainError, PATCH_SIZE};

const N: usize = PATCH_SIZE;
const COEFFS: usize = N * N;

/// Heights of one patch, `[y][x]`.
pub type PatchHeights = [[f32; N]; N];

/// Quantization width used by [`encode`].
pub const DEFAULT_QUANT_BITS: u8 = 10;

const MIN_QUANT_BITS: u8 = 2;
const MAX_QUANT_BITS: u8 = 16;

/// Decoded heights are rounded to f32, which moves each by at most
/// `|h| * 2^-24`. Keeping that under `1 / 64` of a normalized unit bounds
/// every coefficient's drift by `16 / 64`, short of a rounding boundary.
const F32_ROUNDING: f64 = 1.0 / (1u32 << 24) as f64;
const DRIFT_MARGIN: f64 = 64.0;

/// Smallest span still above subnormal territory.
const ABSOLUTE_MIN_RANGE: f64 = 1e-30;

/// Normalization and quantization parameters of one patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantParams {
    /// Normalized heights are scaled by `2^quant_bits`.
    pub quant_bits: u8,
    /// Height subtracted before normalization.
    pub dc_offset: f32,
    /// Height span divided out during normalization.
    pub range: f32,
}

impl QuantParams {
    /// Parameters spanning `heights`, widened to [`QuantParams::min_range`]
    /// when the heights sit in a very narrow band.
    pub fn for_heights(heights: &PatchHeights, quant_bits: u8) -> Self {
        let (min, max) = heights
            .iter()
            .flatten()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &h| {
                (lo.min(h), hi.max(h))
            });
        Self {
            quant_bits,
            dc_offset: min,
            range: max - min,
        }
        .stabilized()
    }

    /// Narrowest nonzero span whose decoded heights re-encode to the same
    /// coefficients at this offset.
    pub fn min_range(&self) -> f32 {
        let scale = f64::from(1u32 << self.quant_bits.min(MAX_QUANT_BITS));
        let k = scale * DRIFT_MARGIN * F32_ROUNDING;
        // decoded heights stay within |dc| + range * (1 + error)
        let reach = 1.0 + step_norm() / 2.0 / scale;
        let floor = k * f64::from(self.dc_offset.abs()) / (1.0 - k * reach);
        (floor.max(ABSOLUTE_MIN_RANGE) * (1.0 + 1e-6)) as f32
    }

    /// These parameters with a nonzero `range` raised to at least
    /// [`QuantParams::min_range`]. A zero range stays zero.
    pub fn stabilized(self) -> Self {
        if self.range > 0.0 && self.dc_offset.is_finite() {
            Self {
                range: self.range.max(self.min_range()),
                ..self
            }
        } else {
            self
        }
    }

    fn validate(&self) -> Result<(), TerrainError> {
        if !(MIN_QUANT_BITS..=MAX_QUANT_BITS).contains(&self.quant_bits) {
            return Err(TerrainError::InvalidQuantBits(self.quant_bits));
        }
        if !self.dc_offset.is_finite() || !self.range.is_finite() || self.range < 0.0 {
            return Err(TerrainError::NonFinite);
        }
        Ok(())
    }

    fn scale(&self) -> f64 {
        f64::from(1u32 << self.quant_bits)
    }

    /// Bits used for a value token's magnitude.
    pub fn magnitude_bits(&self) -> u32 {
        u32::from(self.quant_bits) + 5
    }

    /// Largest per-sample error a decode can show against heights that
    /// these parameters span.
    pub fn error_bound(&self) -> f32 {
        let normalized = step_norm() / 2.0 / self.scale();
        let slack = (f64::from(self.dc_offset.abs()) + f64::from(self.range)) * 1e-5 + 1e-5;
        (normalized * f64::from(self.range) + slack) as f32
    }
}

/// Euclidean norm of the quantizer steps.
fn step_norm() -> f64 {
    (0..N)
        .flat_map(|v| (0..N).map(move |u| dct::step(v, u).powi(2)))
        .sum::<f64>()
        .sqrt()
}

/// One element of the coefficient stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// A zero coefficient; bits `0`.
    Zero,
    /// Every remaining coefficient is zero; bits `10`.
    EndOfBlock,
    /// A nonzero coefficient; bits `11`, sign, magnitude.
    Value(i32),
}

/// A patch ready for the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedPatch {
    /// Patch column in the region grid.
    pub x: u8,
    /// Patch row in the region grid.
    pub y: u8,
    /// Normalization and quantization.
    pub params: QuantParams,
    /// Coefficients in zig-zag order.
    pub tokens: Vec<Token>,
}

/// Compress `heights` with parameters fitted to them.
pub fn encode(x: u8, y: u8, heights: &PatchHeights) -> Result<CompressedPatch, TerrainError> {
    encode_with(x, y, heights, QuantParams::for_heights(heights, DEFAULT_QUANT_BITS))
}

/// Compress `heights` under fixed parameters, after
/// [`QuantParams::stabilized`]. Re-encoding a decoded patch with its own
/// parameters yields the same tokens and the same heights.
pub fn encode_with(
    x: u8,
    y: u8,
    heights: &PatchHeights,
    params: QuantParams,
) -> Result<CompressedPatch, TerrainError> {
    params.validate()?;
    let params = params.stabilized();
    if heights.iter().flatten().any(|h| !h.is_finite()) {
        return Err(TerrainError::NonFinite);
    }

    let scale = params.scale();
    let dc = f64::from(params.dc_offset);
    let range = f64::from(params.range);
    let mut samples: Grid = [[0.0; N]; N];
    if range > 0.0 {
        for (row, src) in samples.iter_mut().zip(heights) {
            for (cell, &h) in row.iter_mut().zip(src) {
                *cell = (f64::from(h) - dc) / range * scale;
            }
        }
    }

    let coeffs = dct::forward(&samples);
    let max_mag = f64::from((1u32 << params.magnitude_bits()) - 1);
    let mut quantized = [0i32; COEFFS];
    for (i, &(v, u)) in dct::zigzag().iter().enumerate() {
        let q = (coeffs[v][u] / dct::step(v, u)).round();
        quantized[i] = q.clamp(-max_mag, max_mag) as i32;
    }

    let mut tokens = Vec::new();
    match quantized.iter().rposition(|&q| q != 0) {
        None => tokens.push(Token::EndOfBlock),
        Some(last) => {
            for &q in &quantized[..=last] {
                tokens.push(if q == 0 { Token::Zero } else { Token::Value(q) });
            }
            if last + 1 < COEFFS {
                tokens.push(Token::EndOfBlock);
            }
        }
    }

    Ok(CompressedPatch {
        x,
        y,
        params,
        tokens,
    })
}

impl CompressedPatch {
    /// Quantized coefficients in zig-zag order.
    pub fn coefficients(&self) -> Result<[i32; COEFFS], TerrainError> {
        let mut out = [0i32; COEFFS];
        let mut i = 0;
        for token in &self.tokens {
            match token {
                Token::EndOfBlock => break,
                Token::Zero | Token::Value(_) if i == COEFFS => {
                    return Err(TerrainError::TooManyCoefficients);
                }
                Token::Zero => i += 1,
                Token::Value(q) => {
                    out[i] = *q;
                    i += 1;
                }
            }
        }
        Ok(out)
    }

    /// Reconstruct heights.
    pub fn decode(&self) -> Result<PatchHeights, TerrainError> {
        self.params.validate()?;
        let quantized = self.coefficients()?;
        let mut coeffs: Grid = [[0.0; N]; N];
        for (i, &(v, u)) in dct::zigzag().iter().enumerate() {
            coeffs[v][u] = f64::from(quantized[i]) * dct::step(v, u);
        }
        let samples = dct::inverse(&coeffs);

        let scale = self.params.scale();
        let dc = f64::from(self.params.dc_offset);
        let range = f64::from(self.params.range);
        let mut heights = [[0.0f32; N]; N];
        for (row, src) in heights.iter_mut().zip(&samples) {
            for (cell, &s) in row.iter_mut().zip(src) {
                *cell = (s / scale * range + dc) as f32;
            }
        }
        Ok(heights)
    }

    /// Size of this patch in the layer bit stream.
    pub fn bit_len(&self) -> usize {
        let mag = self.params.magnitude_bits() as usize;
        let tokens: usize = self
            .tokens
            .iter()
            .map(|t| match t {
                Token::Zero => 1,
                Token::EndOfBlock => 2,
                Token::Value(_) => 3 + mag,
            })
            .sum();
        8 + 32 + 32 + 5 + 5 + tokens
    }

    pub(crate) fn write_bits(&self, w: &mut BitWriter) {
        let mag_bits = self.params.magnitude_bits();
        w.write(u32::from(self.params.quant_bits), 8);
        w.write(self.params.dc_offset.to_bits(), 32);
        w.write(self.params.range.to_bits(), 32);
        w.write(u32::from(self.x), 5);
        w.write(u32::from(self.y), 5);
        for token in &self.tokens {
            match *token {
                Token::Zero => w.write(0b0, 1),
                Token::EndOfBlock => w.write(0b10, 2),
                Token::Value(q) => {
                    w.write(0b11, 2);
                    w.write(u32::from(q < 0), 1);
                    w.write(q.unsigned_abs(), mag_bits);
                }
            }
        }
    }

    /// Read the rest of a patch whose `quant_bits` byte was already taken.
    pub(crate) fn read_bits(quant_bits: u8, r: &mut BitReader<'_>) -> Result<Self, TerrainError> {
        let params = QuantParams {
            quant_bits,
            dc_offset: f32::from_bits(r.read(32)?),
            range: f32::from_bits(r.read(32)?),
        };
        params.validate()?;
        let x = r.read(5)? as u8;
        let y = r.read(5)? as u8;
        let mag_bits = params.magnitude_bits();

        let mut tokens = Vec::new();
        let mut written = 0;
        while written < COEFFS {
            if r.read(1)? == 0 {
                tokens.push(Token::Zero);
                written += 1;
                continue;
            }
            if r.read(1)? == 0 {
                tokens.push(Token::EndOfBlock);
                break;
            }
            let negative = r.read(1)? == 1;
            let magnitude = r.read(mag_bits)? as i32;
            tokens.push(Token::Value(if negative { -magnitude } else { magnitude }));
            written += 1;
        }

        Ok(Self {
            x,
            y,
            params,
            tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slope() -> PatchHeights {
        let mut h = [[0.0; N]; N];
        for (y, row) in h.iter_mut().enumerate() {
            for (x, cell) in row.iter_mut().enumerate() {
                *cell = 20.0 + x as f32 * 0.5 + (y as f32 * 0.3).sin() * 4.0;
            }
        }
        h
    }

    #[test]
    fn flat_patch_is_a_single_end_of_block() {
        let zeros = [[0.0; N]; N];
        let patch = encode(0, 0, &zeros).unwrap();
        assert_eq!(patch.tokens, vec![Token::EndOfBlock]);
        assert_eq!(patch.decode().unwrap(), zeros);
    }

    #[test]
    fn constant_patch_decodes_exactly() {
        let flat = [[33.25; N]; N];
        let patch = encode(1, 2, &flat).unwrap();
        assert_eq!(patch.params.range, 0.0);
        assert_eq!(patch.tokens, vec![Token::EndOfBlock]);
        assert_eq!(patch.decode().unwrap(), flat);
    }

    #[test]
    fn error_stays_within_bound() {
        let heights = slope();
        let patch = encode(0, 0, &heights).unwrap();
        let bound = patch.params.error_bound();
        let back = patch.decode().unwrap();
        for (a, b) in heights.iter().flatten().zip(back.iter().flatten()) {
            assert!((a - b).abs() <= bound, "{a} vs {b} (bound {bound})");
        }
    }

    #[test]
    fn second_round_is_a_fixed_point() {
        let patch = encode(3, 4, &slope()).unwrap();
        let once = patch.decode().unwrap();
        let again = encode_with(3, 4, &once, patch.params).unwrap();
        assert_eq!(again.tokens, patch.tokens);
        assert_eq!(again.decode().unwrap(), once);
    }

    fn band(dc: f32, amp: f32) -> PatchHeights {
        let mut h = [[0.0; N]; N];
        for (y, row) in h.iter_mut().enumerate() {
            for (x, cell) in row.iter_mut().enumerate() {
                let pattern = ((x * 7 + y * 13) % 17) as f32 / 16.0;
                *cell = dc + amp * pattern;
            }
        }
        h
    }

    #[test]
    fn narrow_band_far_from_zero_is_a_fixed_point() {
        for (dc, amp) in [
            (-3000.0, 0.01),
            (20.0, 0.0001),
            (4000.0, 0.5),
            (1000.0, 37.0),
            (0.0, 1000.0),
            (-4096.0, 1e-4),
        ] {
            let patch = encode(0, 0, &band(dc, amp)).unwrap();
            let once = patch.decode().unwrap();
            let again = encode_with(0, 0, &once, patch.params).unwrap();
            assert_eq!(again.params, patch.params, "dc={dc} amp={amp}");
            assert_eq!(again.tokens, patch.tokens, "dc={dc} amp={amp}");
            assert_eq!(again.decode().unwrap(), once, "dc={dc} amp={amp}");
        }
    }

    #[test]
    fn narrow_band_is_widened_once() {
        let params = QuantParams::for_heights(&band(-3000.0, 0.01), DEFAULT_QUANT_BITS);
        assert!(params.range > 0.01);
        assert_eq!(params.range, params.min_range());
        assert_eq!(params.stabilized(), params);

        let wide = QuantParams::for_heights(&band(0.0, 1000.0), DEFAULT_QUANT_BITS);
        assert_eq!(wide.range, 1000.0);
    }

    #[test]
    fn rejects_bad_parameters() {
        let heights = slope();
        let params = QuantParams {
            quant_bits: 1,
            dc_offset: 0.0,
            range: 1.0,
        };
        assert_eq!(
            encode_with(0, 0, &heights, params),
            Err(TerrainError::InvalidQuantBits(1))
        );
        let mut nan = heights;
        nan[3][3] = f32::NAN;
        assert_eq!(encode(0, 0, &nan), Err(TerrainError::NonFinite));
    }

    #[test]
    fn bits_round_trip() {
        let patch = encode(7, 9, &slope()).unwrap();
        let mut w = BitWriter::new();
        patch.write_bits(&mut w);
        assert_eq!(w.bit_len(), patch.bit_len());
        let bytes = w.into_bytes();
        let mut r = BitReader::new(&bytes);
        let qb = r.read(8).unwrap() as u8;
        let back = CompressedPatch::read_bits(qb, &mut r).unwrap();
        assert_eq!(back, patch);
    }

    #[test]
    fn too_many_tokens_is_an_error() {
        let patch = CompressedPatch {
            x: 0,
            y: 0,
            params: QuantParams {
                quant_bits: 8,
                dc_offset: 0.0,
                range: 1.0,
            },
            tokens: vec![Token::Zero; COEFFS + 1],
        };
        assert_eq!(patch.decode(), Err(TerrainError::TooManyCoefficients));
    }
}
