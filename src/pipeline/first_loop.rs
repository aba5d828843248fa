/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The first (preprocessing) loop's sizing and worker-pool lifecycle
//! (SPEC_FULL.md §4.7, "Sizing" and "First loop").
//!
//! Grounded on `original_source/src/fast_diff_py/fast_dif_new.py`'s
//! `build_first_loop_runtime_config` for the sequential/batching heuristics
//! and `submit_batch_first_loop`/`dequeue_results_first_loop` for the
//! submit/drain split, reworked into the explicit `Stage` state machine
//! SPEC_FULL.md §9 calls for (no coroutine-style interleaving) and onto
//! `std::thread::scope` + `crossbeam_channel`, matching the teacher's
//! `graph/bvgraph/bvgraph_writer_par.rs::parallel_compress_sequential_iter`
//! worker-pool shape.

use crate::catalog::Catalog;
use crate::config::{Config, FirstLoopOptions};
use crate::error::{PipelineError, Result};
use crate::types::{PreprocessResult, PreprocessTask, Task};
use crate::workers::preprocess::{self, PreprocessWorkerConfig};
use crossbeam_channel::RecvTimeoutError;
use dsi_progress_logger::ProgressLogger;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A hard ceiling on the auto-sized batch, mirroring the original's
/// `batch_size_max_fl` configuration cap.
const MAX_AUTO_BATCH_SIZE: usize = 5000;

/// Derives the runtime batching/parallelism decision from the catalog's
/// current workload, per SPEC_FULL.md §4.7's "Sizing" step. Mutates
/// `options` in place; the caller persists the result if it wants the
/// decision to survive a resume.
pub fn size_for_workload(options: &mut FirstLoopOptions, todo: i64) {
    let cpu_count = num_cpus::get().max(1) as i64;

    if todo < cpu_count {
        log::debug!("fewer files than CPUs; running the first loop sequentially");
        options.parallel = false;
    }

    if todo / cpu_count < 40 {
        log::debug!("too few files per CPU to batch; submitting one task at a time");
        options.batch_size = None;
    } else {
        let size = (todo / (4 * cpu_count)) as usize;
        options.batch_size = Some(size.min(MAX_AUTO_BATCH_SIZE).max(1));
    }
}

enum Stage {
    Submit,
    Drain,
    Finalise,
}

/// Runs the first loop to completion (or until `run` drops), claiming
/// `UNPROCESSED` files in batches, dispatching them to `cpu_proc` worker
/// threads, and writing results back as they arrive.
pub fn run(catalog: &mut Catalog, config: &Config, run: &AtomicBool) -> Result<()> {
    let options = &config.first_loop;
    if !options.compress && !options.compute_hash {
        log::info!("no computation requested, skipping the first loop");
        return Ok(());
    }

    let worker_config = PreprocessWorkerConfig {
        shift_amount: options.shift_amount,
        thumb_dir: config.thumbnail_dir(),
        target_width: config.thumbnail_width,
        target_height: config.thumbnail_height,
        compute_hash: options.compute_hash,
        compress: options.compress,
    };
    if options.compress {
        std::fs::create_dir_all(&worker_config.thumb_dir)
            .map_err(|e| PipelineError::io(worker_config.thumb_dir.clone(), e))?;
    }

    let cpu_proc = if options.parallel { options.cpu_proc.max(1) } else { 1 };
    let channel_capacity = cpu_proc * 2;
    let (task_tx, task_rx) =
        crossbeam_channel::bounded::<Task<PreprocessTask>>(channel_capacity);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<PreprocessResult>(channel_capacity);

    let mut pl = ProgressLogger::default();
    pl.item_name = "file";
    pl.expected_updates = Some(catalog.remaining_unprocessed()? as usize);
    pl.start("preprocessing files");

    let batch_size = options.batch_size.unwrap_or(1).max(1);

    std::thread::scope(|scope| -> Result<()> {
        for _ in 0..cpu_proc {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let worker_config = worker_config.clone();
            scope.spawn(move || preprocess::run(&task_rx, &result_tx, &worker_config));
        }
        drop(task_rx);

        let mut pending = 0usize;
        let mut stage = Stage::Submit;
        loop {
            if !run.load(Ordering::SeqCst) {
                stage = Stage::Finalise;
            }
            match stage {
                Stage::Submit => {
                    let batch = catalog.take_preprocess_batch(batch_size)?;
                    if batch.is_empty() {
                        stage = Stage::Finalise;
                        continue;
                    }
                    for task in batch {
                        if task_tx.send(Task::Work(task)).is_err() {
                            break;
                        }
                        pending += 1;
                    }
                    stage = Stage::Drain;
                }
                Stage::Drain => {
                    let mut results = Vec::new();
                    match result_rx.recv_timeout(Duration::from_millis(50)) {
                        Ok(result) => {
                            pending -= 1;
                            results.push(result);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => stage = Stage::Finalise,
                    }
                    while let Ok(result) = result_rx.try_recv() {
                        pending -= 1;
                        results.push(result);
                    }
                    if !results.is_empty() {
                        apply(catalog, &results, &mut pl)?;
                    }
                    if !matches!(stage, Stage::Finalise) {
                        stage = Stage::Submit;
                    }
                }
                Stage::Finalise => break,
            }
        }

        while pending > 0 {
            match result_rx.recv() {
                Ok(result) => {
                    pending -= 1;
                    apply(catalog, std::slice::from_ref(&result), &mut pl)?;
                }
                Err(_) => break,
            }
        }

        for _ in 0..cpu_proc {
            let _ = task_tx.send(Task::Shutdown);
        }
        Ok(())
    })?;

    pl.done();
    Ok(())
}

fn apply(catalog: &mut Catalog, results: &[PreprocessResult], pl: &mut ProgressLogger) -> Result<()> {
    catalog.apply_preprocess_results(results)?;
    for _ in 0..results.len() {
        pl.update();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Partition;
    use image::{ImageBuffer, Rgb};

    fn write_png(path: &std::path::Path) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(16, 16, |_, _| Rgb([7, 7, 7]));
        img.save(path).unwrap();
    }

    #[test]
    fn sizing_disables_parallel_below_cpu_count() {
        let mut options = FirstLoopOptions::default();
        size_for_workload(&mut options, 1);
        assert!(!options.parallel);
    }

    #[test]
    fn sizing_caps_batch_size_and_disables_it_for_small_workloads() {
        let mut options = FirstLoopOptions::default();
        size_for_workload(&mut options, 10_000_000);
        assert!(options.batch_size.unwrap() <= MAX_AUTO_BATCH_SIZE);

        let mut options = FirstLoopOptions::default();
        size_for_workload(&mut options, num_cpus::get() as i64 * 10);
        assert_eq!(options.batch_size, None);
    }

    #[test]
    fn runs_end_to_end_over_a_small_catalog() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.png", "b.png"] {
            write_png(&dir.path().join(name));
        }

        let mut config = Config::new(dir.path().to_path_buf(), None);
        config.first_loop.cpu_proc = 2;
        let mut catalog = Catalog::open_in_memory().unwrap();
        catalog
            .insert_file(&dir.path().join("a.png"), Partition::A)
            .unwrap();
        catalog
            .insert_file(&dir.path().join("b.png"), Partition::A)
            .unwrap();

        let run = AtomicBool::new(true);
        run_and_check(&mut catalog, &config, &run);
    }

    fn run_and_check(catalog: &mut Catalog, config: &Config, run: &AtomicBool) {
        super::run(catalog, config, run).unwrap();
        assert_eq!(catalog.remaining_unprocessed().unwrap(), 0);
        assert_eq!(catalog.count_ok_files().unwrap(), 2);
    }
}
