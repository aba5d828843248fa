/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use super::RgbMatrix;
use image::imageops::FilterType;
use image::GenericImageView;
use std::path::Path;

/// Everything that can go wrong decoding or resizing a single image.
///
/// Kept distinct from [`crate::error::PipelineError`]: workers convert this
/// into a per-row `error` string (SPEC_FULL.md §4.3/§7) instead of letting
/// it cross the worker boundary as an exception.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("{0}")]
    Image(#[from] image::ImageError),
}

/// The result of decoding one file: its original pixel dimensions (recorded
/// before any resize, per SPEC_FULL.md §4.3 step 2) and the matrix resized
/// to `(target_width, target_height)`.
pub struct Decoded {
    pub original_width: u32,
    pub original_height: u32,
    pub matrix: RgbMatrix,
}

/// Decodes `path` to RGB, promoting grayscale by channel replication and
/// dropping alpha from RGBA, then resizes to `(target_width,
/// target_height)` with a bicubic-family filter if it isn't already that
/// size.
pub fn decode(
    path: &Path,
    target_width: u32,
    target_height: u32,
) -> Result<Decoded, DecodeError> {
    let image = image::open(path)?;
    let (original_width, original_height) = image.dimensions();
    // Convert to RGB (grayscale replicated, alpha dropped) before any
    // resize, so the resize filter never has to reason about a fourth
    // channel.
    let rgb_image = image.into_rgb8();

    let rgb = if original_width == target_width && original_height == target_height {
        rgb_image
    } else {
        // CatmullRom is the bicubic-family filter `image` exposes; the
        // spec only requires "bicubic interpolation", not a specific
        // kernel.
        image::imageops::resize(
            &rgb_image,
            target_width,
            target_height,
            FilterType::CatmullRom,
        )
    };

    let data = rgb.into_raw();
    Ok(Decoded {
        original_width,
        original_height,
        matrix: RgbMatrix::new(target_width, target_height, data),
    })
}

/// Writes `matrix` out as a PNG, the thumbnail container format
/// (SPEC_FULL.md §4.3 step 3).
pub fn save_png(matrix: &RgbMatrix, path: &Path) -> Result<(), DecodeError> {
    let image: image::RgbImage =
        image::ImageBuffer::from_raw(matrix.width, matrix.height, matrix.data.clone())
            .expect("RgbMatrix invariant guarantees data.len() == width * height * 3");
    image.save(path).map_err(DecodeError::Image)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &Path, width: u32, height: u32, fill: [u8; 3]) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(width, height, |_, _| Rgb(fill));
        img.save(path).unwrap();
    }

    #[test]
    fn decode_preserves_already_correct_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        write_png(&path, 16, 16, [10, 20, 30]);

        let decoded = decode(&path, 16, 16).unwrap();
        assert_eq!(decoded.original_width, 16);
        assert_eq!(decoded.original_height, 16);
        assert_eq!(decoded.matrix.width, 16);
        assert_eq!(decoded.matrix.height, 16);
        assert_eq!(decoded.matrix.pixel(0, 0), [10, 20, 30]);
    }

    #[test]
    fn decode_resizes_and_reports_original_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.png");
        write_png(&path, 200, 100, [5, 5, 5]);

        let decoded = decode(&path, 32, 32).unwrap();
        assert_eq!(decoded.original_width, 200);
        assert_eq!(decoded.original_height, 100);
        assert_eq!(decoded.matrix.width, 32);
        assert_eq!(decoded.matrix.height, 32);
    }

    #[test]
    fn decode_missing_file_is_an_error() {
        let result = decode(Path::new("/nonexistent/path/x.png"), 16, 16);
        assert!(result.is_err());
    }
}
