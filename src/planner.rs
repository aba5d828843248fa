/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The pair-space planner (SPEC_FULL.md §4.4).
//!
//! Turns a fully preprocessed catalog into the block-keyed pair space the
//! second loop iterates: materializes every candidate pair through
//! [`crate::catalog::Catalog::prepopulate_pairs`] and applies the
//! item-mode short-circuits before the first block is ever dispatched.
//! Partition balancing and key renumbering happen earlier, as part of the
//! driver's sizing step between indexing and the first loop (SPEC_FULL.md
//! §4.7), since the preprocess worker already derives thumbnail paths and
//! hash FKs from the post-renumber key — this planner only ever sees keys
//! that are already dense and partitions that are already balanced.

use crate::catalog::Catalog;
use crate::config::SecondLoopOptions;
use crate::error::Result;
use log::info;

/// Runs once, right after `FirstLoopDone`, before the progress state moves
/// past `SecondLoopPopulating`. Idempotent only in the sense the driver
/// already guarantees by gating this call on `Progress` (SPEC_FULL.md
/// §4.4); calling it twice would duplicate pair rows.
pub fn plan(catalog: &mut Catalog, options: &SecondLoopOptions) -> Result<()> {
    catalog.prepopulate_pairs(options.batch_size as i64)?;
    info!("prepopulated {} pairs", catalog.pair_count()?);

    if !options.batch_args {
        if options.skip_matching_hash {
            let skipped = catalog.skip_matching_hash_pairs()?;
            info!("short-circuited {skipped} pairs on a matching rotation hash");
        }
        if let Some(threshold) = options.match_aspect_by {
            let skipped = catalog.skip_mismatched_aspect_pairs(threshold)?;
            info!("short-circuited {skipped} pairs on aspect-ratio mismatch");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Partition;

    fn seed_ok_file(cat: &Catalog, path: &str, partition: Partition, px: i32, py: i32) -> i64 {
        let key = cat.insert_file(std::path::Path::new(path), partition).unwrap();
        cat.conn
            .execute(
                "UPDATE files SET success = 1, px = ?1, py = ?2 WHERE key = ?3",
                rusqlite::params![px, py, key],
            )
            .unwrap();
        key
    }

    #[test]
    fn plan_materializes_every_candidate_pair() {
        let mut cat = Catalog::open_in_memory().unwrap();
        for i in 0..2 {
            seed_ok_file(&mut cat, &format!("/a/{i}.jpg"), Partition::A, 10, 10);
        }
        for i in 0..5 {
            seed_ok_file(&mut cat, &format!("/b/{i}.jpg"), Partition::B, 10, 10);
        }
        let options = SecondLoopOptions::default();
        plan(&mut cat, &options).unwrap();
        assert_eq!(cat.pair_count().unwrap(), 2 * 5);
    }

    #[test]
    fn plan_does_not_touch_partition_labels_or_keys() {
        // Partition balancing and key renumbering are the driver's sizing
        // step now (SPEC_FULL.md §4.7), not the planner's; seed a catalog
        // where A outnumbers B and confirm `plan` leaves partitions as they
        // are instead of swapping them itself.
        let mut cat = Catalog::open_in_memory().unwrap();
        for i in 0..5 {
            seed_ok_file(&mut cat, &format!("/a/{i}.jpg"), Partition::A, 10, 10);
        }
        for i in 0..2 {
            seed_ok_file(&mut cat, &format!("/b/{i}.jpg"), Partition::B, 10, 10);
        }
        let options = SecondLoopOptions::default();
        plan(&mut cat, &options).unwrap();
        assert_eq!(cat.count_partition(Partition::A).unwrap(), 5);
        assert_eq!(cat.count_partition(Partition::B).unwrap(), 2);
        assert_eq!(cat.pair_count().unwrap(), 5 * 2);
    }

    #[test]
    fn item_mode_short_circuits_mismatched_aspect_ratio() {
        let mut cat = Catalog::open_in_memory().unwrap();
        seed_ok_file(&mut cat, "/a/square.jpg", Partition::A, 10, 10);
        seed_ok_file(&mut cat, "/a/wide.jpg", Partition::A, 100, 10);
        let mut options = SecondLoopOptions::default();
        options.batch_args = false;
        options.skip_matching_hash = false;
        options.match_aspect_by = Some(0.1);
        plan(&mut cat, &options).unwrap();
        assert_eq!(cat.remaining_pairs().unwrap(), 0);
    }

    #[test]
    fn batch_mode_never_applies_short_circuits() {
        let mut cat = Catalog::open_in_memory().unwrap();
        seed_ok_file(&mut cat, "/a/square.jpg", Partition::A, 10, 10);
        seed_ok_file(&mut cat, "/a/wide.jpg", Partition::A, 100, 10);
        let mut options = SecondLoopOptions::default();
        options.batch_args = true;
        options.match_aspect_by = Some(0.1);
        plan(&mut cat, &options).unwrap();
        assert_eq!(cat.remaining_pairs().unwrap(), 1);
    }
}
