/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Pair-space enumeration, block assignment, and the second loop's
//! read/write surface over the `pairs` and `pair_errors` tables. Grounded
//! directly on `original_source/src/fast_diff_py/sqlite_db.py`'s
//! `prepopulate_diff_table`, `get_cache_block_thumb`, `get_task_block_key`,
//! `get_item_block`, `insert_batch_diff_*`, `get_duplicate_pairs`, and
//! `get_cluster`.

use super::Catalog;
use crate::error::Result;
use rusqlite::params;
use std::collections::HashMap;
use std::path::PathBuf;

/// The extent of a block in catalog-key space: how many distinct `key_a`
/// (`size_a`) and `key_b` (`size_b`) values it spans, and the lowest key on
/// each side. `None` if the block key does not exist (the planner's
/// "no more blocks" stopping criterion).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExtent {
    pub lower_key_a: i64,
    pub lower_key_b: i64,
    pub size_a: usize,
    pub size_b: usize,
}

/// One row of `get_block_tasks`: a whole descending `key_b` run to compare
/// against `key_a`, identified by the pair row that anchors it (the one
/// with the largest `key_b` in the run).
#[derive(Debug, Clone, Copy)]
pub struct BlockTask {
    pub pair_key: i64,
    pub key_a: i64,
    pub max_key_b: i64,
}

/// One row of `get_item_block`.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub pair_key: i64,
    pub key_a: i64,
    pub key_b: i64,
    pub path_a: PathBuf,
    pub path_b: PathBuf,
    pub block_key: Option<i64>,
}

/// One row of [`Catalog::query_duplicate_pairs`].
#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub path_a: PathBuf,
    pub path_b: PathBuf,
    pub dif: f32,
}

/// One group from [`Catalog::query_clusters`]: `anchor` is the grouping
/// key's path, `members` maps every other path in the cluster to its score
/// against the anchor.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub anchor: PathBuf,
    pub members: HashMap<PathBuf, f32>,
}

impl Catalog {
    /// Materializes the whole pair space in one pass: one row per
    /// candidate pair, each tagged with a dense `block_key` assigned in
    /// the order that maximises cache reuse (SPEC_FULL.md §4.4). Idempotent
    /// only in the sense that calling it twice would duplicate rows (the
    /// driver calls it exactly once, guarded by `Progress`).
    pub fn prepopulate_pairs(&mut self, block_size: i64) -> Result<()> {
        let has_b = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM files WHERE partition = 1)",
            [],
            |row| row.get::<_, bool>(0),
        )?;

        let tx = self.conn.transaction()?;

        if has_b {
            tx.execute(
                "INSERT INTO pairs (key_a, key_b, block_a, block_b, block_key)
                 SELECT a.key, b.key, a.key / ?1,
                        (b.key - (SELECT MIN(key) FROM files WHERE partition = 1)) / ?1, 0
                 FROM files AS a CROSS JOIN files AS b
                 WHERE a.partition = 0 AND b.partition = 1 AND a.success = 1 AND b.success = 1
                 ORDER BY a.key, b.key",
                params![block_size],
            )?;
        } else {
            tx.execute(
                "INSERT INTO pairs (key_a, key_b, block_a, block_b, block_key)
                 SELECT a.key, b.key, a.key / ?1, b.key / ?1, 0
                 FROM files AS a CROSS JOIN files AS b
                 WHERE a.key < b.key AND a.success = 1 AND b.success = 1
                 ORDER BY a.key, b.key",
                params![block_size],
            )?;
        }

        tx.execute_batch(
            "DROP TABLE IF EXISTS block_key_temp;
             CREATE TABLE block_key_temp (
                 key INTEGER PRIMARY KEY AUTOINCREMENT,
                 block_a INTEGER,
                 block_b INTEGER,
                 UNIQUE (block_a, block_b)
             );",
        )?;

        if has_b {
            // Row-major: two partitions means no symmetric triangle to
            // exploit, so the natural reading order is cache-friendliest.
            tx.execute_batch(
                "INSERT INTO block_key_temp (block_a, block_b)
                 SELECT DISTINCT block_a, block_b FROM pairs ORDER BY block_a, block_b;",
            )?;
        } else {
            // Diagonal-major: walks the symmetric upper triangle so
            // adjacent dispatched blocks share rows/columns, maximising
            // cache residency (SPEC_FULL.md §4.4).
            tx.execute_batch(
                "INSERT INTO block_key_temp (block_a, block_b)
                 SELECT DISTINCT block_a, block_b FROM pairs
                 ORDER BY (block_b - block_a), (block_b + block_a);",
            )?;
        }

        tx.execute_batch(
            "UPDATE pairs SET block_key = (
                 SELECT key - 1 FROM block_key_temp
                 WHERE block_a = pairs.block_a AND block_b = pairs.block_b
             );
             DROP TABLE block_key_temp;",
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Short-circuit: marks every still-open pair whose two files share
    /// any rotation hash as `dif = 0, success = 1`, without dispatching it
    /// to a comparator. Item mode only (SPEC_FULL.md §4.4); the driver
    /// does not call this when `batch_args` is set, since a block is
    /// dispatched atomically.
    pub fn skip_matching_hash_pairs(&mut self) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE pairs SET dif = 0, success = 1
             WHERE success = -1 AND EXISTS (
                 SELECT 1 FROM files AS fa, files AS fb
                 WHERE fa.key = pairs.key_a AND fb.key = pairs.key_b AND (
                     (fa.hash_0 IS NOT NULL AND fa.hash_0 IN (fb.hash_0, fb.hash_90, fb.hash_180, fb.hash_270)) OR
                     (fa.hash_90 IS NOT NULL AND fa.hash_90 IN (fb.hash_0, fb.hash_90, fb.hash_180, fb.hash_270)) OR
                     (fa.hash_180 IS NOT NULL AND fa.hash_180 IN (fb.hash_0, fb.hash_90, fb.hash_180, fb.hash_270)) OR
                     (fa.hash_270 IS NOT NULL AND fa.hash_270 IN (fb.hash_0, fb.hash_90, fb.hash_180, fb.hash_270))
                 )
             )",
            [],
        )?)
    }

    /// Short-circuit: marks every still-open pair whose aspect ratios
    /// differ by more than `threshold` as `dif = INFINITY, success = 1`.
    /// Item mode only.
    pub fn skip_mismatched_aspect_pairs(&mut self, threshold: f32) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE pairs SET dif = ?1, success = 1
             WHERE success = -1 AND EXISTS (
                 SELECT 1 FROM files AS fa, files AS fb
                 WHERE fa.key = pairs.key_a AND fb.key = pairs.key_b
                 AND fa.py > 0 AND fb.py > 0
                 AND ABS((CAST(fa.px AS REAL) / fa.py) - (CAST(fb.px AS REAL) / fb.py)) > ?2
             )",
            params![f64::INFINITY, threshold as f64],
        )?)
    }

    pub fn pair_count(&self) -> Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM pairs", [], |row| row.get(0))?)
    }

    pub fn remaining_pairs(&self) -> Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM pairs WHERE success = -1",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn max_block_key(&self) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row("SELECT MAX(block_key) FROM pairs", [], |row| row.get(0))?)
    }

    /// Returns the extent of `block_key`, or `None` if it has no rows (the
    /// second loop's stopping criterion).
    pub fn get_block_extent(&self, block_key: i64) -> Result<Option<BlockExtent>> {
        let row: (i64, Option<i64>, i64, Option<i64>) = self.conn.query_row(
            "SELECT COUNT(DISTINCT key_a), MIN(key_a), COUNT(DISTINCT key_b), MIN(key_b)
             FROM pairs WHERE block_key = ?1",
            params![block_key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        match row {
            (size_a, Some(lower_a), size_b, Some(lower_b)) if size_a > 0 && size_b > 0 => {
                Ok(Some(BlockExtent {
                    lower_key_a: lower_a,
                    lower_key_b: lower_b,
                    size_a: size_a as usize,
                    size_b: size_b as usize,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Drives the batched comparator: one task per distinct `key_a` in the
    /// block, covering its whole descending `key_b` run up to `MAX(key_b)`.
    pub fn get_block_tasks(&self, block_key: i64) -> Result<Vec<BlockTask>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, key_a, MAX(key_b) FROM pairs WHERE block_key = ?1 GROUP BY key_a",
        )?;
        let rows = stmt
            .query_map(params![block_key], |row| {
                Ok(BlockTask {
                    pair_key: row.get(0)?,
                    key_a: row.get(1)?,
                    max_key_b: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Drives the item comparator: every still-unresolved pair in the
    /// block, joined to its two file paths.
    pub fn get_item_block(&self, block_key: i64, include_block_key: bool) -> Result<Vec<ItemRow>> {
        let sql = "SELECT d.key, d.key_a, d.key_b, a.path, b.path, d.block_key
                    FROM pairs AS d
                    JOIN files AS a ON d.key_a = a.key
                    JOIN files AS b ON d.key_b = b.key
                    WHERE d.block_key = ?1 AND d.success = -1";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![block_key], |row| {
                Ok(ItemRow {
                    pair_key: row.get(0)?,
                    key_a: row.get(1)?,
                    key_b: row.get(2)?,
                    path_a: PathBuf::from(row.get::<_, String>(3)?),
                    path_b: PathBuf::from(row.get::<_, String>(4)?),
                    block_key: if include_block_key {
                        Some(row.get(5)?)
                    } else {
                        None
                    },
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// `true` once every pair in `block_key` has a `success != -1`
    /// (resolved, whether by success or recorded error). Drives item-mode
    /// cache pruning (SPEC_FULL.md §4.5).
    pub fn verify_item_block(&self, block_key: i64) -> Result<bool> {
        let remaining: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pairs WHERE block_key = ?1 AND success = -1",
            params![block_key],
            |row| row.get(0),
        )?;
        Ok(remaining == 0)
    }

    /// Writes a descending run of results for one `key_a`: `diffs[0]`
    /// scores `(key_a, max_key_b)`, `diffs[1]` scores `(key_a, max_key_b -
    /// 1)`, and so on (SPEC_FULL.md §5).
    pub fn record_block_result(&mut self, key_a: i64, max_key_b: i64, diffs: &[f32]) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("UPDATE pairs SET dif = ?1, success = 1 WHERE key_a = ?2 AND key_b = ?3")?;
            for (i, dif) in diffs.iter().enumerate() {
                stmt.execute(params![*dif as f64, key_a, max_key_b - i as i64])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Writes a single `(key_a, key_b)` score. Used by the batch-mode
    /// driver to patch individual rows of a run that partially failed,
    /// where the fast positional [`Self::record_block_result`] path no
    /// longer applies.
    pub fn record_pair_result(&mut self, key_a: i64, key_b: i64, dif: f32) -> Result<()> {
        self.conn.execute(
            "UPDATE pairs SET dif = ?1, success = 1 WHERE key_a = ?2 AND key_b = ?3",
            params![dif as f64, key_a, key_b],
        )?;
        Ok(())
    }

    /// Records a single `(key_a, key_b)` row's failure by resolving it to
    /// its `pairs.key` and delegating to the same bookkeeping
    /// [`Self::record_errors`] performs.
    pub fn record_block_row_error(&mut self, key_a: i64, key_b: i64, message: &str) -> Result<()> {
        let key: Option<i64> = self
            .conn
            .query_row(
                "SELECT key FROM pairs WHERE key_a = ?1 AND key_b = ?2",
                params![key_a, key_b],
                |row| row.get(0),
            )
            .ok();
        if let Some(key) = key {
            let mut errors = HashMap::new();
            errors.insert(key, message.to_string());
            self.record_errors(&errors)?;
        }
        Ok(())
    }

    /// Writes a scattered set of item-mode results, one per `(key, dif)`
    /// pair.
    pub fn record_item_result(&mut self, keys: &[i64], diffs: &[f32]) -> Result<()> {
        debug_assert_eq!(keys.len(), diffs.len());
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("UPDATE pairs SET dif = ?1, success = 1 WHERE key = ?2")?;
            for (key, dif) in keys.iter().zip(diffs.iter()) {
                stmt.execute(params![*dif as f64, key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Flips every key in `errors` to `success = 0` and records its
    /// base64-wrapped message in `pair_errors`.
    pub fn record_errors(&mut self, errors: &HashMap<i64, String>) -> Result<()> {
        if errors.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        {
            let mut mark = tx.prepare("UPDATE pairs SET success = 0 WHERE key = ?1")?;
            let mut insert =
                tx.prepare("INSERT OR REPLACE INTO pair_errors (key, error) VALUES (?1, ?2)")?;
            for (key, message) in errors {
                mark.execute(params![key])?;
                insert.execute(params![key, crate::util::to_b64(message)])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Pairs scoring below `delta`, ordered by `(key_a, key_b)`
    /// (SPEC_FULL.md §6).
    pub fn query_duplicate_pairs(&self, delta: f32) -> Result<Vec<DuplicatePair>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.path, b.path, d.dif
             FROM pairs AS d
             JOIN files AS a ON a.key = d.key_a
             JOIN files AS b ON b.key = d.key_b
             WHERE d.dif < ?1 AND d.dif >= 0 AND d.success = 1
             ORDER BY d.key_a, d.key_b",
        )?;
        let rows = stmt
            .query_map(params![delta as f64], |row| {
                Ok(DuplicatePair {
                    path_a: PathBuf::from(row.get::<_, String>(0)?),
                    path_b: PathBuf::from(row.get::<_, String>(1)?),
                    dif: row.get::<_, f64>(2)? as f32,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Groups matching pairs by one side (`group_by_a`), ordered by the
    /// grouping key, each cluster mapping the other side's path to its
    /// score against the anchor.
    pub fn query_clusters(&self, delta: f32, group_by_a: bool) -> Result<Vec<Cluster>> {
        let sql = if group_by_a {
            "SELECT a.path, b.path, d.dif
             FROM pairs AS d
             JOIN files AS a ON a.key = d.key_a
             JOIN files AS b ON b.key = d.key_b
             WHERE d.dif < ?1 AND d.dif >= 0 AND d.success = 1
             ORDER BY d.key_a, d.key_b"
        } else {
            "SELECT a.path, b.path, d.dif
             FROM pairs AS d
             JOIN files AS a ON a.key = d.key_a
             JOIN files AS b ON b.key = d.key_b
             WHERE d.dif < ?1 AND d.dif >= 0 AND d.success = 1
             ORDER BY d.key_b, d.key_a"
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![delta as f64], |row| {
                Ok((
                    PathBuf::from(row.get::<_, String>(0)?),
                    PathBuf::from(row.get::<_, String>(1)?),
                    row.get::<_, f64>(2)? as f32,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut clusters: Vec<Cluster> = Vec::new();
        let mut current_anchor: Option<PathBuf> = None;
        for (path_a, path_b, dif) in rows {
            let (anchor, other) = if group_by_a {
                (path_a, path_b)
            } else {
                (path_b, path_a)
            };
            match current_anchor.as_ref() {
                Some(head) if *head == anchor => {
                    clusters.last_mut().unwrap().members.insert(other, dif);
                }
                _ => {
                    let mut members = HashMap::new();
                    members.insert(other, dif);
                    clusters.push(Cluster {
                        anchor: anchor.clone(),
                        members,
                    });
                    current_anchor = Some(anchor);
                }
            }
        }
        Ok(clusters)
    }

    /// Deletes every pair row scoring above `threshold`. Returns the
    /// number of rows removed.
    pub fn reduce_diff(&mut self, threshold: f32) -> Result<usize> {
        Ok(self
            .conn
            .execute("DELETE FROM pairs WHERE dif > ?1", params![threshold as f64])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Partition;

    fn seed_ok_file(cat: &mut Catalog, path: &str, partition: Partition) -> i64 {
        let key = cat.insert_file(std::path::Path::new(path), partition).unwrap();
        cat.conn
            .execute(
                "UPDATE files SET success = 1, px = 10, py = 10 WHERE key = ?1",
                params![key],
            )
            .unwrap();
        key
    }

    #[test]
    fn single_partition_pair_count_matches_n_choose_2() {
        let mut cat = Catalog::open_in_memory().unwrap();
        for i in 0..5 {
            seed_ok_file(&mut cat, &format!("/a/{i}.jpg"), Partition::A);
        }
        cat.prepopulate_pairs(2).unwrap();
        assert_eq!(cat.pair_count().unwrap(), 5 * 4 / 2);
    }

    #[test]
    fn two_partition_pair_count_matches_product() {
        let mut cat = Catalog::open_in_memory().unwrap();
        for i in 0..3 {
            seed_ok_file(&mut cat, &format!("/a/{i}.jpg"), Partition::A);
        }
        for i in 0..4 {
            seed_ok_file(&mut cat, &format!("/b/{i}.jpg"), Partition::B);
        }
        cat.prepopulate_pairs(2).unwrap();
        assert_eq!(cat.pair_count().unwrap(), 3 * 4);
    }

    #[test]
    fn block_assignment_matches_formula() {
        let mut cat = Catalog::open_in_memory().unwrap();
        for i in 0..6 {
            seed_ok_file(&mut cat, &format!("/a/{i}.jpg"), Partition::A);
        }
        cat.prepopulate_pairs(2).unwrap();
        let mut stmt = cat
            .conn
            .prepare("SELECT key_a, key_b, block_a, block_b FROM pairs")
            .unwrap();
        let rows: Vec<(i64, i64, i64, i64)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();
        for (key_a, key_b, block_a, block_b) in rows {
            assert_eq!(block_a, key_a / 2);
            assert_eq!(block_b, key_b / 2);
        }
    }

    #[test]
    fn record_and_query_duplicate() {
        let mut cat = Catalog::open_in_memory().unwrap();
        seed_ok_file(&mut cat, "/a/x.jpg", Partition::A);
        seed_ok_file(&mut cat, "/a/y.jpg", Partition::A);
        cat.prepopulate_pairs(64).unwrap();
        cat.record_item_result(&[1], &[0.0]).unwrap();
        let dups = cat.query_duplicate_pairs(1.0).unwrap();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].dif, 0.0);
    }

    #[test]
    fn reduce_diff_drops_high_scores() {
        let mut cat = Catalog::open_in_memory().unwrap();
        seed_ok_file(&mut cat, "/a/x.jpg", Partition::A);
        seed_ok_file(&mut cat, "/a/y.jpg", Partition::A);
        cat.prepopulate_pairs(64).unwrap();
        cat.record_item_result(&[1], &[500.0]).unwrap();
        let removed = cat.reduce_diff(200.0).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cat.pair_count().unwrap(), 0);
    }
}
