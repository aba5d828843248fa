/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Small, pure helpers used throughout the crate: base64-wrapping for
//! error strings that must survive round-tripping through a TEXT column,
//! and humanized byte sizes for log lines.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Wraps an error message in base64 so it can be stored in a TEXT column
/// without worrying about embedded control characters or invalid UTF-8
/// sequences produced by some decoders' error messages.
pub fn to_b64(message: impl AsRef<str>) -> String {
    STANDARD.encode(message.as_ref().as_bytes())
}

/// Reverses [`to_b64`]. Returns the original text on success; falls back to
/// returning the input unchanged if it was never base64 to begin with, so
/// that a catalog inherited from a run that stored raw text still reads
/// back as something, rather than erroring.
pub fn from_b64(encoded: impl AsRef<str>) -> String {
    let encoded = encoded.as_ref();
    match STANDARD.decode(encoded) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => encoded.to_string(),
    }
}

/// Renders a byte count as a human-readable size, e.g. `"4.00 MiB"`.
pub fn humanize_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} {}", UNITS[unit])
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Lowercases a file extension for comparison against the allowed set,
/// returning `None` for paths without one.
pub fn lowercased_extension(path: &std::path::Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn b64_roundtrips_arbitrary_text() {
        let original = "decode failed: invalid PNG signature \u{1F600}";
        let wrapped = to_b64(original);
        assert_ne!(wrapped, original);
        assert_eq!(from_b64(wrapped), original);
    }

    #[test]
    fn from_b64_is_lenient_on_raw_text() {
        assert_eq!(from_b64("not base64 at all!!"), "not base64 at all!!");
    }

    #[test]
    fn humanize_bytes_picks_sensible_units() {
        assert_eq!(humanize_bytes(0), "0 B");
        assert_eq!(humanize_bytes(512), "512 B");
        assert_eq!(humanize_bytes(1024), "1.00 KiB");
        assert_eq!(humanize_bytes(4 * 1024 * 1024), "4.00 MiB");
    }

    #[test]
    fn lowercased_extension_normalizes_case() {
        assert_eq!(
            lowercased_extension(Path::new("/a/Photo.JPG")),
            Some("jpg".to_string())
        );
        assert_eq!(lowercased_extension(Path::new("/a/no_ext")), None);
    }
}
