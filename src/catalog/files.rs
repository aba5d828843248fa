/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The `files` table: one row per indexed path, carrying its preprocessing
//! status and, once hashed, foreign keys into `hash_table`.

use super::{Catalog, ERROR, OK, PROCESSING, UNPROCESSED};
use crate::config::Partition;
use crate::error::Result;
use crate::types::{PreprocessResult, PreprocessTask};
use rusqlite::params;
use std::path::{Path, PathBuf};

/// The `files.success` domain, mirrored from the catalog's raw `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSuccess {
    Processing,
    Unprocessed,
    Error,
    Ok,
}

impl FileSuccess {
    fn from_raw(v: i32) -> Self {
        match v {
            PROCESSING => FileSuccess::Processing,
            ERROR => FileSuccess::Error,
            OK => FileSuccess::Ok,
            _ => FileSuccess::Unprocessed,
        }
    }
}

/// A fully materialized `files` row, returned by lookups the planner and
/// second loop need (path + dimensions) rather than a raw preprocessing
/// task.
#[derive(Debug, Clone)]
pub struct FileRow {
    pub key: i64,
    pub path: PathBuf,
    pub partition: Partition,
    pub success: FileSuccess,
    pub px: i32,
    pub py: i32,
}

fn partition_to_raw(p: Partition) -> i64 {
    match p {
        Partition::A => 0,
        Partition::B => 1,
    }
}

fn partition_from_raw(v: i64) -> Partition {
    if v == 0 {
        Partition::A
    } else {
        Partition::B
    }
}

impl Catalog {
    /// Inserts one indexed path. Silently ignores a duplicate
    /// `(path, partition)` pair, since the indexer may revisit a directory
    /// across a resumed run.
    pub fn insert_file(&self, path: &Path, partition: Partition) -> Result<i64> {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.conn.execute(
            "INSERT OR IGNORE INTO files (path, filename, partition) VALUES (?1, ?2, ?3)",
            params![path.to_string_lossy(), filename, partition_to_raw(partition)],
        )?;
        let key: i64 = self.conn.query_row(
            "SELECT key FROM files WHERE path = ?1 AND partition = ?2",
            params![path.to_string_lossy(), partition_to_raw(partition)],
            |row| row.get(0),
        )?;
        Ok(key)
    }

    /// Inserts a whole batch of indexed paths in one transaction, per
    /// SPEC_FULL.md §3 ("commits happen per directory batch, not per
    /// file").
    pub fn bulk_insert_files(&mut self, rows: &[(PathBuf, Partition)]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO files (path, filename, partition) VALUES (?1, ?2, ?3)",
            )?;
            for (path, partition) in rows {
                let filename = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_default();
                stmt.execute(params![
                    path.to_string_lossy(),
                    filename,
                    partition_to_raw(*partition)
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count_files(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM files", [], |row| row.get(0))?)
    }

    pub fn count_partition(&self, partition: Partition) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE partition = ?1",
            params![partition_to_raw(partition)],
            |row| row.get(0),
        )?)
    }

    /// Swaps the A/B partition labels when a second partition exists and A
    /// outnumbers B, so the planner's outer loop (SPEC_FULL.md §5) always
    /// iterates the smaller side. Mirrors
    /// `original_source/src/fast_diff_py/fast_dif_new.py`'s
    /// `cond_switch_a_b`, which returns immediately when `root_dir_b is
    /// None` and otherwise skips the swap when A already has no more
    /// entries than B. A single-partition catalog has every row in A and
    /// none in B, so without this guard `a > b` always holds and the swap
    /// would relabel every file to B, making `prepopulate_pairs` take the
    /// two-partition branch against an empty A side. Returns whether a swap
    /// happened.
    pub fn swap_partitions_if_needed(&self) -> Result<bool> {
        let a = self.count_partition(Partition::A)?;
        let b = self.count_partition(Partition::B)?;
        if b > 0 && a > b {
            self.conn
                .execute("UPDATE files SET partition = 1 - partition", [])?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Shifts every `files.key` so the minimum becomes `0`, so block
    /// arithmetic in the planner can assume a dense `0..count` key space
    /// even when earlier runs deleted rows or SQLite's rowid allocator
    /// left gaps.
    pub fn dense_renumber_keys(&self) -> Result<()> {
        let min_key: Option<i64> =
            self.conn
                .query_row("SELECT MIN(key) FROM files", [], |row| row.get(0))?;
        match min_key {
            Some(min) if min != 0 => {
                self.conn
                    .execute("UPDATE files SET key = key - ?1", params![min])?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Atomically claims up to `limit` unprocessed files for preprocessing,
    /// marking them `PROCESSING` in the same transaction that reads them so
    /// two concurrent callers (or a resumed run racing a partial batch)
    /// never claim the same row twice (SPEC_FULL.md §9, `take_preprocess_batch`
    /// isolation).
    pub fn take_preprocess_batch(&mut self, limit: usize) -> Result<Vec<PreprocessTask>> {
        let tx = self.conn.transaction()?;
        let claimed: Vec<(i64, String)> = {
            let mut stmt = tx.prepare(
                "SELECT key, path FROM files WHERE success = ?1 ORDER BY key LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![UNPROCESSED, limit as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        {
            let mut mark = tx.prepare("UPDATE files SET success = ?1 WHERE key = ?2")?;
            for (key, _) in &claimed {
                mark.execute(params![PROCESSING, key])?;
            }
        }
        tx.commit()?;
        Ok(claimed
            .into_iter()
            .map(|(key, path)| PreprocessTask {
                key,
                path: PathBuf::from(path),
            })
            .collect())
    }

    /// Writes back a batch of preprocess results: dimensions and success
    /// status always, plus rotation hash foreign keys when hashing was
    /// requested. Runs in one transaction so a resumed run never observes a
    /// half-applied batch.
    pub fn apply_preprocess_results(&mut self, results: &[PreprocessResult]) -> Result<()> {
        let tx = self.conn.transaction()?;
        for result in results {
            match result {
                PreprocessResult::Ok { key, px, py, hashes } => {
                    tx.execute(
                        "UPDATE files SET success = ?1, px = ?2, py = ?3, error = NULL WHERE key = ?4",
                        params![OK, px, py, key],
                    )?;
                    if let Some(hashes) = hashes {
                        let columns = ["hash_0", "hash_90", "hash_180", "hash_270"];
                        for (column, hash) in columns.iter().zip(hashes.iter()) {
                            let hash_key = super::hashes::upsert_hash(&tx, *hash)?;
                            tx.execute(
                                &format!("UPDATE files SET {column} = ?1 WHERE key = ?2"),
                                params![hash_key, key],
                            )?;
                        }
                    }
                }
                PreprocessResult::Error { key, error } => {
                    tx.execute(
                        "UPDATE files SET success = ?1, error = ?2 WHERE key = ?3",
                        params![ERROR, crate::util::to_b64(error), key],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn file_row(&self, key: i64) -> Result<FileRow> {
        Ok(self.conn.query_row(
            "SELECT key, path, partition, success, px, py FROM files WHERE key = ?1",
            params![key],
            |row| {
                Ok(FileRow {
                    key: row.get(0)?,
                    path: PathBuf::from(row.get::<_, String>(1)?),
                    partition: partition_from_raw(row.get(2)?),
                    success: FileSuccess::from_raw(row.get(3)?),
                    px: row.get(4)?,
                    py: row.get(5)?,
                })
            },
        )?)
    }

    /// Resets every row left `PROCESSING` back to `UNPROCESSED`. Called on
    /// startup before resuming the first loop, so a crash that happened
    /// mid-batch (worker claimed a row, driver never received or applied
    /// the result) does not strand that row forever (SPEC_FULL.md §8,
    /// "resume safety").
    pub fn reset_processing_rows(&self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE files SET success = ?1 WHERE success = ?2",
            params![UNPROCESSED, PROCESSING],
        )?)
    }

    pub fn remaining_unprocessed(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE success = ?1",
            params![UNPROCESSED],
            |row| row.get(0),
        )?)
    }

    pub fn count_ok_files(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM files WHERE success = ?1",
            params![OK],
            |row| row.get(0),
        )?)
    }

    /// All four rotation hashes for one file, resolved through
    /// `hash_table`, or `None` if the file hasn't been hashed. Used by the
    /// planner's `skip_matching_hash` short-circuit.
    pub fn file_hashes(&self, key: i64) -> Result<Option<[u64; 4]>> {
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<String>)> =
            self.conn
                .query_row(
                    "SELECT h0.hash, h90.hash, h180.hash, h270.hash
                     FROM files AS f
                     LEFT JOIN hash_table AS h0 ON f.hash_0 = h0.key
                     LEFT JOIN hash_table AS h90 ON f.hash_90 = h90.key
                     LEFT JOIN hash_table AS h180 ON f.hash_180 = h180.key
                     LEFT JOIN hash_table AS h270 ON f.hash_270 = h270.key
                     WHERE f.key = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .ok();
        let Some((h0, h90, h180, h270)) = row else {
            return Ok(None);
        };
        let parse = |h: Option<String>| h.and_then(|s| u64::from_str_radix(&s, 16).ok());
        match (parse(h0), parse(h90), parse(h180), parse(h270)) {
            (Some(a), Some(b), Some(c), Some(d)) => Ok(Some([a, b, c, d])),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn swap_triggers_only_when_a_outnumbers_b() {
        let cat = Catalog::open_in_memory().unwrap();
        for i in 0..3 {
            cat.insert_file(Path::new(&format!("/a/{i}.jpg")), Partition::A)
                .unwrap();
        }
        cat.insert_file(Path::new("/b/0.jpg"), Partition::B)
            .unwrap();

        assert!(cat.swap_partitions_if_needed().unwrap());
        assert_eq!(cat.count_partition(Partition::A).unwrap(), 1);
        assert_eq!(cat.count_partition(Partition::B).unwrap(), 3);
    }

    #[test]
    fn swap_is_a_no_op_when_a_is_already_the_smaller_or_equal_side() {
        let cat = Catalog::open_in_memory().unwrap();
        cat.insert_file(Path::new("/a/0.jpg"), Partition::A)
            .unwrap();
        for i in 0..3 {
            cat.insert_file(Path::new(&format!("/b/{i}.jpg")), Partition::B)
                .unwrap();
        }

        assert!(!cat.swap_partitions_if_needed().unwrap());
        assert_eq!(cat.count_partition(Partition::A).unwrap(), 1);
        assert_eq!(cat.count_partition(Partition::B).unwrap(), 3);
    }

    #[test]
    fn swap_is_a_no_op_in_single_partition_mode() {
        // A single-partition catalog (no root B) has every row in A and none
        // in B, so `a > b` always holds; without the `b > 0` guard this
        // would relabel every file to B and leave A empty.
        let cat = Catalog::open_in_memory().unwrap();
        for i in 0..5 {
            cat.insert_file(Path::new(&format!("/a/{i}.jpg")), Partition::A)
                .unwrap();
        }

        assert!(!cat.swap_partitions_if_needed().unwrap());
        assert_eq!(cat.count_partition(Partition::A).unwrap(), 5);
        assert_eq!(cat.count_partition(Partition::B).unwrap(), 0);
    }
}
