/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The directory indexer (SPEC_FULL.md §4.7, "Index").
//!
//! Grounded on `original_source/src/fast_diff_py/fast_dif_new.py`'s
//! `__recursive_index`: buffer files and subdirectories per parent up to
//! `batch_size_dir`, flush files to the catalog at that threshold (and once
//! more at the end of the directory), then recurse. Rust gives this an
//! explicit worklist instead of the original's mutual self-recursion on an
//! overflowing directory stack, but the buffering thresholds are unchanged.

use crate::catalog::Catalog;
use crate::config::{Config, Partition};
use crate::error::{PipelineError, Result};
use dsi_progress_logger::ProgressLogger;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Walks `config.root_a` (and `config.root_b`, if set) into `catalog`,
/// stopping early if `run` goes false.
pub fn index(catalog: &mut Catalog, config: &Config, run: &AtomicBool) -> Result<()> {
    let mut pl = ProgressLogger::default();
    pl.item_name = "file";
    pl.start("indexing files");

    let mut enqueued = 0usize;
    walk(catalog, config, &config.root_a, Partition::A, run, &mut enqueued, &mut pl)?;
    if run.load(Ordering::SeqCst) {
        if let Some(root_b) = config.root_b.clone() {
            walk(catalog, config, &root_b, Partition::B, run, &mut enqueued, &mut pl)?;
        }
    }

    pl.done();
    log::info!("indexed {enqueued} files total");
    Ok(())
}

fn walk(
    catalog: &mut Catalog,
    config: &Config,
    path: &Path,
    partition: Partition,
    run: &AtomicBool,
    enqueued: &mut usize,
    pl: &mut ProgressLogger,
) -> Result<()> {
    if !run.load(Ordering::SeqCst) {
        return Ok(());
    }

    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("skipping unreadable directory {}: {e}", path.display());
            return Ok(());
        }
    };

    let mut files: Vec<PathBuf> = Vec::new();
    let mut dirs: Vec<PathBuf> = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| PipelineError::io(path, e))?;
        let full_path = entry.path();

        if config.ignore_paths.contains(&full_path) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if config.ignore_names.contains(&name) || name.starts_with(".temp_thumb") {
            continue;
        }

        let file_type = entry
            .file_type()
            .map_err(|e| PipelineError::io(full_path.clone(), e))?;
        if file_type.is_dir() {
            dirs.push(full_path);
        } else if file_type.is_file() {
            if let Some(ext) = crate::util::lowercased_extension(&full_path) {
                if config.allowed_extensions.contains(&ext) {
                    files.push(full_path);
                }
            }
        }

        if files.len() >= config.batch_size_dir {
            flush(catalog, &mut files, partition, enqueued, pl)?;
        }
        if dirs.len() >= config.batch_size_dir {
            flush(catalog, &mut files, partition, enqueued, pl)?;
            drain_dirs(catalog, config, &mut dirs, partition, run, enqueued, pl)?;
            if !run.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    flush(catalog, &mut files, partition, enqueued, pl)?;
    drain_dirs(catalog, config, &mut dirs, partition, run, enqueued, pl)?;
    Ok(())
}

fn drain_dirs(
    catalog: &mut Catalog,
    config: &Config,
    dirs: &mut Vec<PathBuf>,
    partition: Partition,
    run: &AtomicBool,
    enqueued: &mut usize,
    pl: &mut ProgressLogger,
) -> Result<()> {
    while let Some(dir) = dirs.pop() {
        walk(catalog, config, &dir, partition, run, enqueued, pl)?;
        if !run.load(Ordering::SeqCst) {
            return Ok(());
        }
    }
    Ok(())
}

fn flush(
    catalog: &mut Catalog,
    files: &mut Vec<PathBuf>,
    partition: Partition,
    enqueued: &mut usize,
    pl: &mut ProgressLogger,
) -> Result<()> {
    if files.is_empty() {
        return Ok(());
    }
    let rows: Vec<(PathBuf, Partition)> = files.drain(..).map(|p| (p, partition)).collect();
    catalog.bulk_insert_files(&rows)?;
    *enqueued += rows.len();
    for _ in 0..rows.len() {
        pl.update();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tree(root: &Path) {
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::write(root.join("a.jpg"), b"not a real image").unwrap();
        std::fs::write(root.join("sub/b.png"), b"not a real image").unwrap();
        std::fs::write(root.join("ignore.txt"), b"not an image").unwrap();
        std::fs::create_dir_all(root.join(".temp_thumb")).unwrap();
        std::fs::write(root.join(".temp_thumb/c.png"), b"thumbnail").unwrap();
    }

    #[test]
    fn walks_subdirectories_and_filters_extensions() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let config = Config::new(dir.path().to_path_buf(), None);
        let mut catalog = Catalog::open_in_memory().unwrap();
        let run = AtomicBool::new(true);

        index(&mut catalog, &config, &run).unwrap();

        assert_eq!(catalog.count_files().unwrap(), 2);
    }

    #[test]
    fn respects_ignore_names() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let mut config = Config::new(dir.path().to_path_buf(), None);
        config.ignore_names.insert("sub".to_string());
        let mut catalog = Catalog::open_in_memory().unwrap();
        let run = AtomicBool::new(true);

        index(&mut catalog, &config, &run).unwrap();

        assert_eq!(catalog.count_files().unwrap(), 1);
    }

    #[test]
    fn stops_early_when_run_flag_drops() {
        let dir = tempfile::tempdir().unwrap();
        make_tree(dir.path());

        let config = Config::new(dir.path().to_path_buf(), None);
        let mut catalog = Catalog::open_in_memory().unwrap();
        let run = AtomicBool::new(false);

        index(&mut catalog, &config, &run).unwrap();

        assert_eq!(catalog.count_files().unwrap(), 0);
    }
}
