//! Zero-run coding for message bodies.
//!
//! Every run of `0x00` bytes becomes `0x00, count` (runs longer than 255 are
//! split); all other bytes pass through.

use thiserror::Error;

/// Zero-run decoding failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ZeroCodeError {
    /// The input ends with a zero marker and no count byte.
    #[error("zero run at offset {offset} has no count byte")]
    MissingCount {
        /// Offset of the dangling marker.
        offset: usize,
    },
    /// A run count of zero.
    #[error("zero run at offset {offset} has a count of zero")]
    EmptyRun {
        /// Offset of the marker.
        offset: usize,
    },
    /// Expansion would exceed the output limit.
    #[error("zero-decoded output would exceed {limit} bytes")]
    TooLarge {
        /// Output cap.
        limit: usize,
    },
}

/// Collapse zero runs in `input`.
pub fn encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut run: u8 = 0;

    for &byte in input {
        if byte == 0 {
            if run == u8::MAX {
                out.extend_from_slice(&[0, run]);
                run = 0;
            }
            run += 1;
        } else {
            if run > 0 {
                out.extend_from_slice(&[0, run]);
                run = 0;
            }
            out.push(byte);
        }
    }
    if run > 0 {
        out.extend_from_slice(&[0, run]);
    }
    out
}

/// Expand zero runs in `input`, refusing to produce more than `limit` bytes.
pub fn decode(input: &[u8], limit: usize) -> Result<Vec<u8>, ZeroCodeError> {
    let mut out = Vec::with_capacity(input.len().min(limit));
    let mut i = 0;

    while i < input.len() {
        let byte = input[i];
        if byte != 0 {
            if out.len() == limit {
                return Err(ZeroCodeError::TooLarge { limit });
            }
            out.push(byte);
            i += 1;
            continue;
        }

        let count = *input
            .get(i + 1)
            .ok_or(ZeroCodeError::MissingCount { offset: i })?;
        if count == 0 {
            return Err(ZeroCodeError::EmptyRun { offset: i });
        }
        let count = usize::from(count);
        if out.len() + count > limit {
            return Err(ZeroCodeError::TooLarge { limit });
        }
        out.resize(out.len() + count, 0);
        i += 2;
    }

    Ok(out)
}
