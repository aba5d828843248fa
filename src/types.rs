/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Message types carried on the driver/worker channels.
//!
//! These are deliberately storage- and worker-implementation-agnostic: the
//! catalog converts them to and from rows, and the worker loops convert
//! them to and from decoded images, but neither side needs to know about
//! the other's internals. This mirrors the teacher's `Triple`/`BatchIterator`
//! split in `utils/sort_pairs.rs`, where the on-disk batch format is a
//! third, neutral thing that both the writer and the merge iterator agree
//! on.

use std::collections::HashMap;
use std::path::PathBuf;

/// One unit of first-loop work: decode, resize, and optionally hash the
/// file at `path`, which is cataloged under `key`.
#[derive(Debug, Clone)]
pub struct PreprocessTask {
    pub key: i64,
    pub path: PathBuf,
}

/// What a preprocess worker reports back for one [`PreprocessTask`].
#[derive(Debug, Clone)]
pub enum PreprocessResult {
    Ok {
        key: i64,
        px: i32,
        py: i32,
        /// Present only when the run requested hashing.
        hashes: Option<[u64; 4]>,
    },
    Error {
        key: i64,
        error: String,
    },
}

impl PreprocessResult {
    pub fn key(&self) -> i64 {
        match self {
            PreprocessResult::Ok { key, .. } => *key,
            PreprocessResult::Error { key, .. } => *key,
        }
    }
}

/// One item-mode comparison request.
#[derive(Debug, Clone)]
pub struct ItemCompareArgs {
    pub pair_key: i64,
    pub key_a: i64,
    pub key_b: i64,
    pub path_a: PathBuf,
    pub path_b: PathBuf,
    /// When set, the worker resolves matrices from the shared image cache
    /// under this key instead of decoding from disk.
    pub cache_key: Option<i64>,
}

#[derive(Debug, Clone)]
pub enum ItemCompareResult {
    Ok { pair_key: i64, diff: f32 },
    Error { pair_key: i64, error: String },
}

impl ItemCompareResult {
    pub fn pair_key(&self) -> i64 {
        match self {
            ItemCompareResult::Ok { pair_key, .. } => *pair_key,
            ItemCompareResult::Error { pair_key, .. } => *pair_key,
        }
    }
}

/// One batch-mode comparison request: compare `key_a` against `key_b,
/// key_b - 1, ..` for up to `max_size_b` entries within the current block.
#[derive(Debug, Clone)]
pub struct BatchCompareArgs {
    pub key_a: i64,
    pub key_b: i64,
    pub max_size_b: usize,
    pub cache_key: Option<i64>,
    pub path_a: Option<PathBuf>,
    pub path_b: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct BatchCompareResult {
    pub key_a: i64,
    pub key_b: i64,
    /// Indexed by descending `key_b` relative to the request's `key_b`
    /// (SPEC_FULL.md §5): `diffs[0]` is the score for `key_b`, `diffs[1]`
    /// for `key_b - 1`, and so on.
    pub diffs: Vec<f32>,
    pub errors: HashMap<i64, String>,
    pub cache_key: Option<i64>,
}

/// Work-queue message wrapping either a real task or the shutdown marker a
/// worker must observe before it exits (SPEC_FULL.md §4.3/§4.6).
#[derive(Debug, Clone)]
pub enum Task<T> {
    Work(T),
    Shutdown,
}
