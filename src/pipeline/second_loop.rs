/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The second (comparison) loop's block-by-block driver (SPEC_FULL.md §4.5,
//! §4.6, §4.7 "Second loop").
//!
//! Grounded on `original_source/src/fast_diff_py/fast_dif_new.py`'s
//! `set_load_batch`/`set_dequeue_second_loop` dispatch pair and the
//! `__build_thumb_cache`/`__build_org_cache`/`prune_cache_batch` cache
//! lifecycle, reworked onto the explicit `Stage` state machine
//! `pipeline::first_loop` already establishes and the worker-pool shape
//! `workers::compare` exposes. The original's eight-way
//! `(batch_args, use_ram_cache, compress)` dispatch table collapses to two
//! worker-facing paths here: every `!batch_args` combination reduces to
//! `__item_block(submit=True)` regardless of caching or compression, and
//! every `batch_args` combination reduces to a thumbnail- or original-backed
//! cache build, picked by `compress` alone. `use_ram_cache=false` in item
//! mode still reduces to the same dispatch, just without a cache to publish.

use crate::cache::{BlockCache, ImageCache, ImageCacheMap};
use crate::catalog::{BlockExtent, Catalog};
use crate::config::{Config, SecondLoopOptions};
use crate::error::Result;
use crate::types::{BatchCompareArgs, BatchCompareResult, ItemCompareArgs, ItemCompareResult, Task};
use crate::workers::compare::{self, CompareWorkerConfig};
use crossbeam_channel::RecvTimeoutError;
use dsi_progress_logger::ProgressLogger;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Channel/dequeue-threshold sizing for batch mode: a whole block's worth of
/// in-flight tasks, doubled so the driver can keep dispatching the next
/// block's cache build while the current one drains.
pub const BATCH_DEQUEUE_FACTOR: usize = 2;

/// Channel/dequeue-threshold sizing for item mode: one batch per worker.
pub const ITEM_DEQUEUE_FACTOR: usize = 1;

enum Stage {
    Submit,
    Drain,
    Finalise,
}

/// Runs the second loop to completion (or until `run` drops).
pub fn run(catalog: &mut Catalog, config: &mut Config, run: &AtomicBool) -> Result<()> {
    let options = config.second_loop.clone();
    let cpu_proc = if options.parallel { options.cpu_proc.max(1) } else { 1 };
    let worker_config = CompareWorkerConfig {
        rotate: config.rotate,
        target_width: config.thumbnail_width,
        target_height: config.thumbnail_height,
    };

    if options.batch_args {
        run_batch_mode(catalog, config, &options, cpu_proc, worker_config, run)
    } else {
        run_item_mode(catalog, config, &options, cpu_proc, worker_config, run)
    }
}

fn load_image_run(
    config: &Config,
    catalog: &Catalog,
    offset: i64,
    size: usize,
    compress: bool,
) -> Result<ImageCache> {
    let mut matrices = Vec::with_capacity(size);
    for i in 0..size as i64 {
        let key = offset + i;
        let path = if compress {
            config.thumbnail_path(key)
        } else {
            catalog.file_row(key)?.path
        };
        let decoded = crate::image_ops::decode(&path, config.thumbnail_width, config.thumbnail_height)
            .map_err(|crate::image_ops::DecodeError::Image(e)| crate::error::PipelineError::Decode(e))?;
        matrices.push(decoded.matrix);
    }
    Ok(ImageCache::new(offset, matrices))
}

/// Builds the cache for one block, filling from thumbnails or from the
/// original files depending on `config.first_loop.compress` (whether
/// thumbnails were ever written).
fn build_block_cache(config: &Config, catalog: &Catalog, extent: &BlockExtent) -> Result<BlockCache> {
    let compress = config.first_loop.compress;
    let x = load_image_run(config, catalog, extent.lower_key_a, extent.size_a, compress)?;
    let y = load_image_run(config, catalog, extent.lower_key_b, extent.size_b, compress)?;
    Ok(BlockCache { x, y })
}

fn run_batch_mode(
    catalog: &mut Catalog,
    config: &mut Config,
    options: &SecondLoopOptions,
    cpu_proc: usize,
    worker_config: CompareWorkerConfig,
    run: &AtomicBool,
) -> Result<()> {
    let channel_capacity = (options.batch_size * options.batch_size * BATCH_DEQUEUE_FACTOR).max(cpu_proc * 2);
    let (args_tx, args_rx) = crossbeam_channel::bounded::<Task<BatchCompareArgs>>(channel_capacity);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<BatchCompareResult>(channel_capacity);

    let mut cache_map = ImageCacheMap::new();
    let handle = cache_map.handle();

    let mut pl = ProgressLogger::default();
    pl.item_name = "pair";
    pl.expected_updates = Some(catalog.remaining_pairs()? as usize);
    pl.start("comparing blocks");

    std::thread::scope(|scope| -> Result<()> {
        for _ in 0..cpu_proc {
            let args_rx = args_rx.clone();
            let result_tx = result_tx.clone();
            let handle = handle.clone();
            scope.spawn(move || compare::run_batch(&args_rx, &result_tx, &handle, &worker_config));
        }
        drop(args_rx);

        let mut block_key = config.cache_index as i64;
        loop {
            if !run.load(Ordering::SeqCst) {
                break;
            }
            let Some(extent) = catalog.get_block_extent(block_key)? else {
                break;
            };
            let tasks = catalog.get_block_tasks(block_key)?;
            if tasks.is_empty() {
                block_key += 1;
                continue;
            }

            let block_cache = build_block_cache(config, catalog, &extent)?;
            let key_as: Vec<i64> = tasks.iter().map(|t| t.key_a).collect();
            cache_map.publish(block_key, block_cache, Some(key_as));

            let mut pending = 0usize;
            let mut stage = Stage::Submit;
            let mut task_iter = tasks.into_iter();
            loop {
                if !run.load(Ordering::SeqCst) {
                    stage = Stage::Finalise;
                }
                match stage {
                    Stage::Submit => {
                        let mut sent_any = false;
                        for task in task_iter.by_ref() {
                            let args = BatchCompareArgs {
                                key_a: task.key_a,
                                key_b: task.max_key_b,
                                max_size_b: extent.size_b,
                                cache_key: Some(block_key),
                                path_a: None,
                                path_b: None,
                            };
                            if args_tx.send(Task::Work(args)).is_err() {
                                break;
                            }
                            pending += 1;
                            sent_any = true;
                            if pending >= channel_capacity {
                                break;
                            }
                        }
                        let _ = sent_any;
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
                        for result in &results {
                            apply_batch_result(catalog, result)?;
                            cache_map.mark_row_done(block_key, result.key_a);
                            pl.update();
                        }
                        if !matches!(stage, Stage::Finalise) {
                            stage = if pending == 0 && task_iter.len() == 0 {
                                Stage::Finalise
                            } else {
                                Stage::Submit
                            };
                        }
                    }
                    Stage::Finalise => break,
                }
            }

            while pending > 0 {
                match result_rx.recv() {
                    Ok(result) => {
                        pending -= 1;
                        apply_batch_result(catalog, &result)?;
                        cache_map.mark_row_done(block_key, result.key_a);
                        pl.update();
                    }
                    Err(_) => break,
                }
            }

            while cache_map.prune_batch().is_some() {}

            config.cache_index = (block_key + 1) as u64;
            catalog.store_config(config)?;

            if !run.load(Ordering::SeqCst) {
                break;
            }
            block_key += 1;
        }

        for _ in 0..cpu_proc {
            let _ = args_tx.send(Task::Shutdown);
        }
        Ok(())
    })?;

    pl.done();
    Ok(())
}

fn apply_batch_result(catalog: &mut Catalog, result: &BatchCompareResult) -> Result<()> {
    if result.diffs.is_empty() {
        if let Some(msg) = result.errors.get(&result.key_a) {
            log::warn!("block row key_a={} failed entirely: {msg}", result.key_a);
        }
        return Ok(());
    }
    if result.errors.is_empty() {
        catalog.record_block_result(result.key_a, result.key_b, &result.diffs)?;
        return Ok(());
    }
    // A partially failed row: fall back to the granular per-pair writers
    // (SPEC_FULL.md §5) instead of the fast positional path, since a gap in
    // the middle of the run would otherwise misalign `diffs[i]` against the
    // wrong `key_b`.
    for (i, dif) in result.diffs.iter().enumerate() {
        let key_b = result.key_b - i as i64;
        if let Some(msg) = result.errors.get(&key_b) {
            catalog.record_block_row_error(result.key_a, key_b, msg)?;
        } else {
            catalog.record_pair_result(result.key_a, key_b, *dif)?;
        }
    }
    Ok(())
}

fn run_item_mode(
    catalog: &mut Catalog,
    config: &mut Config,
    options: &SecondLoopOptions,
    cpu_proc: usize,
    worker_config: CompareWorkerConfig,
    run: &AtomicBool,
) -> Result<()> {
    let channel_capacity = (options.batch_size * cpu_proc * ITEM_DEQUEUE_FACTOR).max(cpu_proc * 2);
    let (args_tx, args_rx) = crossbeam_channel::bounded::<Task<ItemCompareArgs>>(channel_capacity);
    let (result_tx, result_rx) = crossbeam_channel::bounded::<ItemCompareResult>(channel_capacity);

    let mut cache_map = ImageCacheMap::new();
    let handle = cache_map.handle();

    let mut pl = ProgressLogger::default();
    pl.item_name = "pair";
    pl.expected_updates = Some(catalog.remaining_pairs()? as usize);
    pl.start("comparing pairs");

    std::thread::scope(|scope| -> Result<()> {
        for _ in 0..cpu_proc {
            let args_rx = args_rx.clone();
            let result_tx = result_tx.clone();
            let handle = handle.clone();
            scope.spawn(move || compare::run_item(&args_rx, &result_tx, &handle, &worker_config));
        }
        drop(args_rx);

        let mut block_key = config.cache_index as i64;
        loop {
            if !run.load(Ordering::SeqCst) {
                break;
            }
            let Some(extent) = catalog.get_block_extent(block_key)? else {
                break;
            };
            let rows = catalog.get_item_block(block_key, false)?;
            if rows.is_empty() {
                // Either already fully resolved by a planner short-circuit,
                // or (transiently) mid-flight; either way there is nothing
                // to dispatch for this block key.
                block_key += 1;
                continue;
            }

            if options.use_ram_cache {
                let block_cache = build_block_cache(config, catalog, &extent)?;
                cache_map.publish(block_key, block_cache, None);
            }
            let cache_key = if options.use_ram_cache { Some(block_key) } else { None };

            let mut pending = 0usize;
            let mut keys = Vec::new();
            let mut diffs = Vec::new();
            let mut errors = HashMap::new();

            let mut rows_iter = rows.into_iter();
            let mut stage = Stage::Submit;
            loop {
                if !run.load(Ordering::SeqCst) {
                    stage = Stage::Finalise;
                }
                match stage {
                    Stage::Submit => {
                        for row in rows_iter.by_ref() {
                            let args = ItemCompareArgs {
                                pair_key: row.pair_key,
                                key_a: row.key_a,
                                key_b: row.key_b,
                                path_a: row.path_a,
                                path_b: row.path_b,
                                cache_key,
                            };
                            if args_tx.send(Task::Work(args)).is_err() {
                                break;
                            }
                            pending += 1;
                            if pending >= channel_capacity {
                                break;
                            }
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
                        for result in results {
                            match result {
                                ItemCompareResult::Ok { pair_key, diff } => {
                                    keys.push(pair_key);
                                    diffs.push(diff);
                                }
                                ItemCompareResult::Error { pair_key, error } => {
                                    errors.insert(pair_key, error);
                                }
                            }
                            pl.update();
                        }
                        if !matches!(stage, Stage::Finalise) {
                            stage = if pending == 0 && rows_iter.len() == 0 {
                                Stage::Finalise
                            } else {
                                Stage::Submit
                            };
                        }
                    }
                    Stage::Finalise => break,
                }
            }

            while pending > 0 {
                match result_rx.recv() {
                    Ok(ItemCompareResult::Ok { pair_key, diff }) => {
                        pending -= 1;
                        keys.push(pair_key);
                        diffs.push(diff);
                        pl.update();
                    }
                    Ok(ItemCompareResult::Error { pair_key, error }) => {
                        pending -= 1;
                        errors.insert(pair_key, error);
                        pl.update();
                    }
                    Err(_) => break,
                }
            }

            catalog.record_item_result(&keys, &diffs)?;
            catalog.record_errors(&errors)?;

            if options.use_ram_cache {
                cache_map.remove(block_key);
            }

            config.cache_index = (block_key + 1) as u64;
            catalog.store_config(config)?;

            if !run.load(Ordering::SeqCst) {
                break;
            }
            block_key += 1;
        }

        for _ in 0..cpu_proc {
            let _ = args_tx.send(Task::Shutdown);
        }
        Ok(())
    })?;

    pl.done();
    Ok(())
}
