//! 16-point orthonormal DCT-II and the diagonal zig-zag order.

use super::PATCH_SIZE;
use std::sync::OnceLock;

const N: usize = PATCH_SIZE;

/// Coefficient grid, `[v][u]` with `v` the vertical frequency.
pub(crate) type Grid = [[f64; N]; N];

/// `basis[k][n] = a(k) * cos(pi * (2n + 1) * k / 2N)`.
fn basis() -> &'static [[f64; N]; N] {
    static TABLE: OnceLock<[[f64; N]; N]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: Grid = [[0.0; N]; N];
        for (k, row) in table.iter_mut().enumerate() {
            let scale = if k == 0 {
                (1.0 / N as f64).sqrt()
            } else {
                (2.0 / N as f64).sqrt()
            };
            for (n, cell) in row.iter_mut().enumerate() {
                let angle = std::f64::consts::PI * (2 * n + 1) as f64 * k as f64 / (2 * N) as f64;
                *cell = scale * angle.cos();
            }
        }
        table
    })
}

/// Forward transform of `samples[y][x]`.
pub(crate) fn forward(samples: &Grid) -> Grid {
    let b = basis();
    // Rows first, then columns.
    let mut rows: Grid = [[0.0; N]; N];
    for y in 0..N {
        for u in 0..N {
            rows[y][u] = (0..N).map(|x| samples[y][x] * b[u][x]).sum();
        }
    }
    let mut out: Grid = [[0.0; N]; N];
    for u in 0..N {
        for v in 0..N {
            out[v][u] = (0..N).map(|y| rows[y][u] * b[v][y]).sum();
        }
    }
    out
}

/// Inverse of [`forward`].
pub(crate) fn inverse(coeffs: &Grid) -> Grid {
    let b = basis();
    let mut cols: Grid = [[0.0; N]; N];
    for u in 0..N {
        for y in 0..N {
            cols[y][u] = (0..N).map(|v| coeffs[v][u] * b[v][y]).sum();
        }
    }
    let mut out: Grid = [[0.0; N]; N];
    for y in 0..N {
        for x in 0..N {
            out[y][x] = (0..N).map(|u| cols[y][u] * b[u][x]).sum();
        }
    }
    out
}

/// Quantization step for coefficient `(v, u)`.
pub(crate) fn step(v: usize, u: usize) -> f64 {
    (1 + 2 * (v + u)) as f64
}

/// `zigzag()[i]` is the `(v, u)` position of the `i`-th coefficient on the
/// wire, walking anti-diagonals from the DC term outward.
pub(crate) fn zigzag() -> &'static [(usize, usize); N * N] {
    static ORDER: OnceLock<[(usize, usize); N * N]> = OnceLock::new();
    ORDER.get_or_init(|| {
        let mut order = [(0, 0); N * N];
        let mut i = 0;
        for diag in 0..(2 * N - 1) {
            let lo = diag.saturating_sub(N - 1);
            let hi = diag.min(N - 1);
            let rows: Vec<usize> = if diag % 2 == 0 {
                (lo..=hi).rev().collect()
            } else {
                (lo..=hi).collect()
            };
            for v in rows {
                order[i] = (v, diag - v);
                i += 1;
            }
        }
        order
    })
}
