/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Error types surfaced at the crate boundary.
//!
//! Every internal helper (SQL assembly, path walking, batch bookkeeping)
//! already returns this module's [`Result`] directly rather than a
//! type-erased one, since the catalog and decode errors it wraps are known
//! up front; there is no separate internal error type to funnel through.

use std::path::PathBuf;

/// Errors that can escape the pipeline's public API.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A configuration value is missing, contradictory, or refers to a path
    /// that does not exist or is not where it claims to be (e.g. root B
    /// nested inside root A).
    #[error("configuration error: {0}")]
    Config(String),

    /// The catalog (SQLite) rejected a statement or its schema was found to
    /// be inconsistent with what this crate expects.
    #[error("catalog error: {0}")]
    Catalog(#[from] rusqlite::Error),

    /// A filesystem operation failed outside of a worker's per-item error
    /// handling (e.g. the root path itself could not be read).
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An image could not be decoded. Per-file decode failures inside a
    /// worker are recorded in the catalog, not raised as this variant; this
    /// variant is for decode failures the driver itself needs to surface
    /// (e.g. while building a synthetic test fixture).
    #[error("could not decode image: {0}")]
    Decode(#[from] image::ImageError),

    /// Two matrices compared with [`crate::image_ops::mse`] did not share
    /// shape, or a computed score was not finite.
    #[error("metric error: {0}")]
    Metric(String),

    /// The run was interrupted by SIGINT. Returned to the caller so it can
    /// distinguish a clean, resumable stop from a real failure.
    #[error("cancelled by signal")]
    Cancelled,
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
