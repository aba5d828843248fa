/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The first-loop worker (SPEC_FULL.md §4.3).

use crate::image_ops::{self, RgbMatrix, ROTATIONS};
use crate::types::{PreprocessResult, PreprocessTask, Task};
use crossbeam_channel::{Receiver, Sender};
use rayon::prelude::*;
use std::path::PathBuf;

/// Everything a preprocess worker needs that doesn't change task to task.
/// Cloned once per spawned thread; cheap (no catalog handle, no cache
/// handle — the preprocessor touches neither).
#[derive(Clone)]
pub struct PreprocessWorkerConfig {
    pub shift_amount: i8,
    pub thumb_dir: PathBuf,
    pub target_width: u32,
    pub target_height: u32,
    pub compute_hash: bool,
    pub compress: bool,
}

/// Runs until `task_rx` yields [`Task::Shutdown`] or closes. The whole
/// lifetime of one preprocess worker thread.
pub fn run(
    task_rx: &Receiver<Task<PreprocessTask>>,
    result_tx: &Sender<PreprocessResult>,
    config: &PreprocessWorkerConfig,
) {
    loop {
        match task_rx.recv() {
            Ok(Task::Work(task)) => {
                let result = process_one(&task, config);
                if result_tx.send(result).is_err() {
                    break;
                }
            }
            Ok(Task::Shutdown) | Err(_) => break,
        }
    }
}

fn process_one(task: &PreprocessTask, config: &PreprocessWorkerConfig) -> PreprocessResult {
    let decoded = match image_ops::decode(&task.path, config.target_width, config.target_height) {
        Ok(d) => d,
        Err(e) => {
            return PreprocessResult::Error {
                key: task.key,
                error: e.to_string(),
            }
        }
    };

    if config.compress {
        let path = config_thumbnail_path(&config.thumb_dir, task.key);
        if let Err(e) = image_ops::save_png(&decoded.matrix, &path) {
            return PreprocessResult::Error {
                key: task.key,
                error: format!("writing thumbnail: {e}"),
            };
        }
    }

    let hashes = if config.compute_hash {
        Some(rotation_hashes(&decoded.matrix, config.shift_amount))
    } else {
        None
    };

    PreprocessResult::Ok {
        key: task.key,
        px: decoded.original_width as i32,
        py: decoded.original_height as i32,
        hashes,
    }
}

fn config_thumbnail_path(thumb_dir: &std::path::Path, key: i64) -> PathBuf {
    thumb_dir.join(format!("{key:016x}.png"))
}

/// Hashes all four 90-degree rotations of `matrix`, in `{0, 90, 180, 270}`
/// order, matching the catalog's `hash_0..hash_270` columns. The four
/// rotate-then-hash computations are independent, so they run across
/// rayon's global pool rather than sequentially on the preprocess worker's
/// own thread.
fn rotation_hashes(matrix: &RgbMatrix, shift_amount: i8) -> [u64; 4] {
    let results: Vec<u64> = ROTATIONS
        .par_iter()
        .map(|quarter_turns| {
            let rotated = matrix.rotated(*quarter_turns);
            image_ops::phash(&rotated, shift_amount)
        })
        .collect();
    let mut hashes = [0u64; 4];
    hashes.copy_from_slice(&results);
    hashes
}
