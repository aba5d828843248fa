/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::RgbMatrix;

/// Mean squared error between two same-shaped RGB matrices.
///
/// Accumulates in `u64` to avoid overflow across large images, and returns
/// the arithmetic mean as `f32`. Shape mismatches are an internal
/// programming error, not a user-facing one: every caller obtains both
/// matrices from the same compression target size (`decode` or the image
/// cache), so this is a `debug_assert`, not a runtime `Result`.
pub fn mse(a: &RgbMatrix, b: &RgbMatrix) -> f32 {
    debug_assert_eq!(a.width, b.width);
    debug_assert_eq!(a.height, b.height);
    debug_assert_eq!(a.data.len(), b.data.len());

    let mut sum: u64 = 0;
    for (x, y) in a.data.iter().zip(b.data.iter()) {
        let d = *x as i64 - *y as i64;
        sum += (d * d) as u64;
    }
    sum as f32 / a.data.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbMatrix {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..(width * height) {
            data.extend_from_slice(&rgb);
        }
        RgbMatrix::new(width, height, data)
    }

    #[test]
    fn mse_of_identical_matrices_is_zero() {
        let a = solid(4, 4, [10, 20, 30]);
        assert_eq!(mse(&a, &a), 0.0);
    }

    #[test]
    fn mse_is_symmetric() {
        let a = solid(4, 4, [10, 20, 30]);
        let b = solid(4, 4, [12, 18, 33]);
        assert_eq!(mse(&a, &b), mse(&b, &a));
    }

    #[test]
    fn mse_matches_hand_computed_value() {
        // Single pixel, difference of (3, 4, 0) per channel.
        let a = RgbMatrix::new(1, 1, vec![0, 0, 0]);
        let b = RgbMatrix::new(1, 1, vec![3, 4, 0]);
        // (9 + 16 + 0) / 3 = 8.333...
        assert!((mse(&a, &b) - 8.3333333).abs() < 1e-3);
    }
}
