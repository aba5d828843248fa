/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The pipeline driver: owns the catalog and the persisted [`Progress`]
//! state machine, and dispatches to each stage in turn (SPEC_FULL.md §4.7).
//!
//! Grounded on `original_source/src/fast_diff_py/fast_dif_new.py`'s
//! `FastDifPy.main` method, which runs the same five stages in the same
//! order behind the same kind of persisted, monotone status flag. SIGINT
//! handling is new: the original polls a `multiprocessing.Event` its worker
//! pool children share, where this crate uses `ctrlc` to flip a single
//! `Arc<AtomicBool>` checked at every stage boundary and inside every
//! `Submit`/`Drain` loop (SPEC_FULL.md §4.7, §5).

pub mod first_loop;
pub mod indexer;
pub mod second_loop;

use crate::catalog::{Catalog, Cluster, DuplicatePair};
use crate::config::{Config, Progress};
use crate::error::{PipelineError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Owns one run's catalog and configuration, and drives it through
/// [`Progress`]'s stages.
pub struct Driver {
    config: Config,
    catalog: Catalog,
    run: Arc<AtomicBool>,
}

impl Driver {
    /// Opens (or resumes) a run at `config.catalog_path()`. If the catalog
    /// already holds a persisted [`Config`], it wins over `config` for
    /// everything [`Progress`] governs resuming into, since a resumed run
    /// must not re-interpret a change in the caller's config mid-flight
    /// (SPEC_FULL.md §8).
    pub fn open(config: Config) -> Result<Self> {
        let catalog = Catalog::open(&config.catalog_path())?;
        Self::with_catalog(config, catalog)
    }

    /// As [`Self::open`], but over an already-open catalog (an in-memory one
    /// in tests, or one the caller has already run migrations against).
    pub fn with_catalog(config: Config, catalog: Catalog) -> Result<Self> {
        config.validate()?;
        let config = match catalog.load_config()? {
            Some(mut resumed) => {
                resumed.progress = catalog.load_progress()?;
                resumed
            }
            None => config,
        };
        Ok(Driver {
            config,
            catalog,
            run: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Installs a `SIGINT` handler that asks the run to stop at the next
    /// stage or `Submit`/`Drain` boundary instead of tearing down workers
    /// mid-flight (SPEC_FULL.md §5). Call once per process; a second call
    /// (e.g. from a second `Driver` in the same process) returns an error.
    pub fn install_signal_handler(&self) -> Result<()> {
        let run = self.run.clone();
        ctrlc::set_handler(move || {
            log::warn!("interrupted; stopping at the next safe checkpoint");
            run.store(false, Ordering::SeqCst);
        })
        .map_err(|e| PipelineError::Config(format!("could not install signal handler: {e}")))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.run.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::Cancelled)
        }
    }

    fn checkpoint(&mut self, progress: Progress) -> Result<()> {
        self.config.progress = progress;
        self.catalog.store_progress(progress)?;
        self.catalog.store_config(&self.config)?;
        Ok(())
    }

    /// Runs every stage the current [`Progress`] hasn't passed yet, in
    /// order, stopping (and returning [`PipelineError::Cancelled`]) as soon
    /// as the run flag drops at a stage boundary. Safe to call again on the
    /// same catalog to resume exactly where it left off.
    pub fn run_to_completion(&mut self) -> Result<()> {
        self.catalog.reset_processing_rows()?;

        if self.config.progress < Progress::IndexedDirs {
            self.ensure_running()?;
            indexer::index(&mut self.catalog, &self.config, &self.run)?;
            self.checkpoint(Progress::IndexedDirs)?;
        }

        if self.config.progress < Progress::FirstLoopDone {
            self.ensure_running()?;
            if self.config.progress < Progress::FirstLoopInProgress {
                // Sizing (SPEC_FULL.md §4.7): balance partitions and
                // dense-renumber keys exactly once, between indexing and
                // the first loop, before the preprocess worker ever derives
                // a thumbnail path or a hash FK from a key. Guarded on
                // `< FirstLoopInProgress` so a resumed run never re-swaps
                // or re-renumbers keys a thumbnail file was already written
                // against.
                if self.catalog.swap_partitions_if_needed()? {
                    log::info!("swapped partitions so A is the smaller side");
                }
                self.catalog.dense_renumber_keys()?;
            }
            self.checkpoint(Progress::FirstLoopInProgress)?;
            let todo = self.catalog.remaining_unprocessed()?;
            first_loop::size_for_workload(&mut self.config.first_loop, todo);
            first_loop::run(&mut self.catalog, &self.config, &self.run)?;
            self.ensure_running()?;
            self.checkpoint(Progress::FirstLoopDone)?;
        }

        if self.config.progress < Progress::SecondLoopPopulating {
            self.ensure_running()?;
            self.checkpoint(Progress::SecondLoopPopulating)?;
            crate::planner::plan(&mut self.catalog, &self.config.second_loop)?;
        }

        if self.config.progress < Progress::SecondLoopDone {
            self.ensure_running()?;
            self.checkpoint(Progress::SecondLoopInProgress)?;
            second_loop::run(&mut self.catalog, &mut self.config, &self.run)?;
            self.ensure_running()?;
            self.checkpoint(Progress::SecondLoopDone)?;
        }

        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn progress(&self) -> Progress {
        self.config.progress
    }

    /// Pairs scoring below `delta` (SPEC_FULL.md §6).
    pub fn get_diff_pairs(&self, delta: f32) -> Result<Vec<DuplicatePair>> {
        self.catalog.query_duplicate_pairs(delta)
    }

    /// Matching pairs grouped by one side.
    pub fn get_diff_clusters(&self, delta: f32, group_by_a: bool) -> Result<Vec<Cluster>> {
        self.catalog.query_clusters(delta, group_by_a)
    }

    /// Drops every recorded pair scoring above `threshold`.
    pub fn reduce_diff(&mut self, threshold: f32) -> Result<usize> {
        self.catalog.reduce_diff(threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &std::path::Path, fill: [u8; 3]) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(16, 16, |_, _| Rgb(fill));
        img.save(path).unwrap();
    }

    #[test]
    fn runs_end_to_end_and_finds_a_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), [4, 4, 4]);
        write_png(&dir.path().join("b.png"), [4, 4, 4]);
        write_png(&dir.path().join("c.png"), [200, 10, 10]);

        let mut config = Config::new(dir.path().to_path_buf(), None);
        config.first_loop.cpu_proc = 1;
        config.second_loop.cpu_proc = 1;

        let catalog = Catalog::open_in_memory().unwrap();
        let mut driver = Driver::with_catalog(config, catalog).unwrap();
        driver.run_to_completion().unwrap();

        assert_eq!(driver.progress(), Progress::SecondLoopDone);
        let dups = driver.get_diff_pairs(50.0).unwrap();
        assert_eq!(dups.len(), 1);
    }

    #[test]
    fn resumes_from_a_persisted_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("a.png"), [4, 4, 4]);
        write_png(&dir.path().join("b.png"), [4, 4, 4]);

        let mut config = Config::new(dir.path().to_path_buf(), None);
        config.first_loop.cpu_proc = 1;
        config.second_loop.cpu_proc = 1;
        config.progress = Progress::FirstLoopDone;

        let catalog = Catalog::open_in_memory().unwrap();
        catalog.store_progress(Progress::FirstLoopDone).unwrap();
        catalog.store_config(&config).unwrap();
        // Without having actually run the first loop, "FirstLoopDone" means
        // the driver must trust the checkpoint and skip straight to
        // planning rather than re-deriving it from an empty catalog.
        let mut driver = Driver::with_catalog(config, catalog).unwrap();
        assert_eq!(driver.progress(), Progress::FirstLoopDone);
        driver.run_to_completion().unwrap();
        assert_eq!(driver.progress(), Progress::SecondLoopDone);
    }

    #[test]
    fn cancelling_before_the_first_stage_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), None);
        let catalog = Catalog::open_in_memory().unwrap();
        let mut driver = Driver::with_catalog(config, catalog).unwrap();
        driver.run.store(false, Ordering::SeqCst);
        let result = driver.run_to_completion();
        assert!(matches!(result, Err(PipelineError::Cancelled)));
    }
}
