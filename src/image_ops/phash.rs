/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::RgbMatrix;

const GRID_ROWS: usize = 8;
const GRID_COLS: usize = 8;

/// Difference-hash over an 8x8 luma grid box-sampled from the matrix.
///
/// `shift_amount` trades discriminative power for tolerance: its magnitude
/// (clamped to `0..=7`, per SPEC_FULL.md §4.2) is the number of low bits
/// discarded from each luma sample before two adjacent samples are
/// compared, so `shift_amount = 0` compares samples at full 8-bit
/// resolution (the finest the grid supports — "exact matching only", since
/// no two distinct samples collapse to the same bucket) and larger
/// magnitudes merge more samples into the same bucket, tolerating small
/// lighting or compression differences. The sign flips the tie-break
/// direction for samples that land in the same bucket, which keeps the
/// hash a deterministic function of `(matrix, shift_amount)` rather than
/// introducing a separate tunable.
pub fn phash(matrix: &RgbMatrix, shift_amount: i8) -> u64 {
    let grid = luma_grid(matrix);
    let shift = shift_amount.unsigned_abs().min(7) as u32;
    let bias_equal_to_set = shift_amount >= 0;

    let mut hash: u64 = 0;
    let mut bit = 0u32;
    for row in grid.iter() {
        for col in 0..GRID_COLS {
            let a = row[col] >> shift;
            let b = row[col + 1] >> shift;
            let set = if a == b {
                bias_equal_to_set
            } else {
                a > b
            };
            if set {
                hash |= 1 << bit;
            }
            bit += 1;
        }
    }
    hash
}

/// Box-samples `matrix` down to a `(GRID_COLS + 1) x GRID_ROWS` luma grid.
fn luma_grid(matrix: &RgbMatrix) -> [[u8; GRID_COLS + 1]; GRID_ROWS] {
    let mut grid = [[0u8; GRID_COLS + 1]; GRID_ROWS];
    let cols = GRID_COLS + 1;
    for row in 0..GRID_ROWS {
        for col in 0..cols {
            grid[row][col] = box_luma(matrix, col, cols, row, GRID_ROWS);
        }
    }
    grid
}

/// Average luma of the source region that maps to `(col, row)` in a
/// `cols x rows` downsampled grid.
fn box_luma(matrix: &RgbMatrix, col: usize, cols: usize, row: usize, rows: usize) -> u8 {
    let x0 = (col * matrix.width as usize) / cols;
    let x1 = (((col + 1) * matrix.width as usize) / cols).max(x0 + 1);
    let y0 = (row * matrix.height as usize) / rows;
    let y1 = (((row + 1) * matrix.height as usize) / rows).max(y0 + 1);

    let mut sum: u64 = 0;
    let mut count: u64 = 0;
    for y in y0..y1.min(matrix.height as usize) {
        for x in x0..x1.min(matrix.width as usize) {
            let [r, g, b] = matrix.pixel(x as u32, y as u32);
            // Rec. 601 luma weights.
            let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
            sum += luma as u64;
            count += 1;
        }
    }
    if count == 0 {
        0
    } else {
        (sum / count) as u8
    }
}
