/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Persisted run configuration and the pipeline's progress state machine.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// The process-wide, persisted progress state machine.
///
/// Transitions are monotone: the driver only ever moves forward along
/// `Init -> IndexedDirs -> FirstLoopInProgress -> FirstLoopDone ->
/// SecondLoopPopulating -> SecondLoopInProgress -> SecondLoopDone`. Only the
/// pipeline driver mutates this value; everything else treats it as
/// read-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Progress {
    Init,
    IndexedDirs,
    FirstLoopInProgress,
    FirstLoopDone,
    SecondLoopPopulating,
    SecondLoopInProgress,
    SecondLoopDone,
}

impl Default for Progress {
    fn default() -> Self {
        Progress::Init
    }
}

/// Which side of a two-partition comparison a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Partition {
    A,
    B,
}

/// Options that govern the first (preprocessing) loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirstLoopOptions {
    /// Write a resized thumbnail to the thumbnail directory for every file.
    pub compress: bool,
    /// Compute the four rotation hashes for every file.
    pub compute_hash: bool,
    /// Perceptual-hash precision. `0` means exact matching only.
    pub shift_amount: i8,
    /// Preprocessing tasks submitted per batch. `None` disables batching
    /// (one task submitted at a time).
    pub batch_size: Option<usize>,
    /// Whether the loop should run in parallel at all. Forced to `false`
    /// when the catalog is too small to amortise worker spin-up.
    pub parallel: bool,
    /// Number of worker threads to spawn.
    pub cpu_proc: usize,
}

impl Default for FirstLoopOptions {
    fn default() -> Self {
        FirstLoopOptions {
            compress: true,
            compute_hash: true,
            shift_amount: 4,
            batch_size: None,
            parallel: true,
            cpu_proc: num_cpus::get().max(1),
        }
    }
}

/// Options that govern the second (comparison) loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondLoopOptions {
    /// Number of CPU comparator worker threads.
    pub cpu_proc: usize,
    /// Number of GPU comparator workers. Retained so the config document
    /// and catalog round-trip it; this crate schedules no GPU worker kind
    /// (see SPEC_FULL.md §4.7 and §1 non-goals).
    pub gpu_proc: usize,
    /// Side length of a comparison block.
    pub batch_size: usize,
    /// Short-circuit a pair as `dif=0` when any rotation hash matches on
    /// both sides. Only honoured in item mode (`batch_args=false`).
    pub skip_matching_hash: bool,
    /// Short-circuit a pair as `dif=INFINITY` when the aspect ratios differ
    /// by more than this fraction. `None` disables the filter. Only
    /// honoured in item mode.
    pub match_aspect_by: Option<f32>,
    /// Dispatch whole blocks (`true`) or individual pairs (`false`).
    pub batch_args: bool,
    /// Keep decoded thumbnails resident in the shared cache instead of
    /// re-decoding per comparison.
    pub use_ram_cache: bool,
    /// Pairs scoring below this value are considered duplicates by
    /// [`crate::catalog::Catalog::query_duplicate_pairs`]'s default caller,
    /// though callers may pass any delta they like.
    pub diff_threshold: f32,
    /// Retained for catalog/config round-tripping; plotting matched pairs
    /// is out of scope for this crate (see SPEC_FULL.md §1 non-goals).
    pub plot_threshold: f32,
    /// Whether the loop should run in parallel at all.
    pub parallel: bool,
}

impl Default for SecondLoopOptions {
    fn default() -> Self {
        SecondLoopOptions {
            cpu_proc: num_cpus::get().max(1),
            gpu_proc: 0,
            batch_size: 64,
            skip_matching_hash: true,
            match_aspect_by: Some(0.1),
            batch_args: true,
            use_ram_cache: true,
            diff_threshold: 200.0,
            plot_threshold: 200.0,
            parallel: true,
        }
    }
}

/// The full, persisted configuration of a run.
///
/// Stored in the catalog's `kv_meta` table and mirrored to
/// `<root_a>/.task.json` on commit when [`Config::retain_progress`] is set
/// (SPEC_FULL.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub root_a: PathBuf,
    pub root_b: Option<PathBuf>,
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
    pub allowed_extensions: HashSet<String>,
    pub ignore_names: HashSet<String>,
    pub ignore_paths: HashSet<PathBuf>,
    pub first_loop: FirstLoopOptions,
    pub second_loop: SecondLoopOptions,
    /// When set, a comparison considers all four 90-degree rotations of
    /// the second image and keeps the lowest score (SPEC_FULL.md §4.6).
    /// When clear, only the unrotated pair is scored.
    pub rotate: bool,
    /// Dense cursor into block-key space; resume skips `block_key <
    /// cache_index`.
    pub cache_index: u64,
    /// Directory entries buffered per parent before a flush commit, and
    /// subdirectories buffered before recursing, during indexing.
    pub batch_size_dir: usize,
    /// Seconds a worker waits on an empty queue before self-terminating.
    pub child_proc_timeout: u64,
    /// Rewrite `.task.json` next to the catalog on every commit.
    pub retain_progress: bool,
    pub progress: Progress,
}

impl Config {
    pub fn default_extensions() -> HashSet<String> {
        ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif", "webp"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    pub fn new(root_a: impl Into<PathBuf>, root_b: Option<PathBuf>) -> Self {
        Config {
            root_a: root_a.into(),
            root_b,
            thumbnail_width: 64,
            thumbnail_height: 64,
            allowed_extensions: Self::default_extensions(),
            ignore_names: HashSet::new(),
            ignore_paths: HashSet::new(),
            first_loop: FirstLoopOptions::default(),
            second_loop: SecondLoopOptions::default(),
            rotate: true,
            cache_index: 0,
            batch_size_dir: 2500,
            child_proc_timeout: 60,
            retain_progress: true,
            progress: Progress::Init,
        }
    }

    pub fn has_b(&self) -> bool {
        self.root_b.is_some()
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root_a.join(".fast_diff.db")
    }

    pub fn task_file_path(&self) -> PathBuf {
        self.root_a.join(".task.json")
    }

    pub fn thumbnail_dir(&self) -> PathBuf {
        self.root_a.join(".temp_thumb")
    }

    /// Deterministic thumbnail path for one catalog key (SPEC_FULL.md
    /// §4.3 step 3, §6).
    pub fn thumbnail_path(&self, key: i64) -> PathBuf {
        self.thumbnail_dir().join(format!("{key:016x}.png"))
    }

    /// Checks the configuration is internally consistent before a driver
    /// commits to it: both roots exist, and neither is a subdirectory of the
    /// other. Grounded on
    /// `original_source/src/fast_diff_py/fast_dif_new.py`'s constructor and
    /// `__safe_index` checks (`root_dir_a`/`root_dir_b` existence, the
    /// `commonpath`-style containment guard), surfaced here as a
    /// [`crate::error::PipelineError::Config`] instead of a raised
    /// `ValueError` (SPEC_FULL.md §7).
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::PipelineError;

        if !self.root_a.is_dir() {
            return Err(PipelineError::Config(format!(
                "root A does not exist or is not a directory: {}",
                self.root_a.display()
            )));
        }
        let Some(root_b) = &self.root_b else {
            return Ok(());
        };
        if !root_b.is_dir() {
            return Err(PipelineError::Config(format!(
                "root B does not exist or is not a directory: {}",
                root_b.display()
            )));
        }

        let abs_a = self.root_a.canonicalize().unwrap_or_else(|_| self.root_a.clone());
        let abs_b = root_b.canonicalize().unwrap_or_else(|_| root_b.clone());
        if abs_a == abs_b || abs_a.starts_with(&abs_b) || abs_b.starts_with(&abs_a) {
            return Err(PipelineError::Config(format!(
                "root A ({}) and root B ({}) must not be subdirectories of each other",
                abs_a.display(),
                abs_b.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_orders_monotonically() {
        assert!(Progress::Init < Progress::IndexedDirs);
        assert!(Progress::IndexedDirs < Progress::FirstLoopInProgress);
        assert!(Progress::FirstLoopInProgress < Progress::FirstLoopDone);
        assert!(Progress::FirstLoopDone < Progress::SecondLoopPopulating);
        assert!(Progress::SecondLoopPopulating < Progress::SecondLoopInProgress);
        assert!(Progress::SecondLoopInProgress < Progress::SecondLoopDone);
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = Config::new("/tmp/a", Some(PathBuf::from("/tmp/b")));
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.root_a, back.root_a);
        assert_eq!(cfg.root_b, back.root_b);
        assert_eq!(cfg.second_loop.batch_size, back.second_loop.batch_size);
    }

    #[test]
    fn validate_rejects_a_missing_root() {
        let cfg = Config::new("/does/not/exist/anywhere", None);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_nested_roots() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let cfg = Config::new(dir.path().to_path_buf(), Some(sub));
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_sibling_roots() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let cfg = Config::new(dir_a.path().to_path_buf(), Some(dir_b.path().to_path_buf()));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn default_extensions_cover_the_allowed_set() {
        let ext = Config::default_extensions();
        for e in ["jpg", "jpeg", "png", "bmp", "tiff", "tif", "gif", "webp"] {
            assert!(ext.contains(e));
        }
    }
}
