/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The SQLite-backed catalog: the single source of truth for what has been
//! indexed, preprocessed, planned, and compared.
//!
//! Grounded on `original_source/src/fast_diff_py/sqlite_db.py`, which plays
//! the same role in the original pipeline (a thin, transaction-scoped
//! wrapper around a handful of tables that every stage reads and writes
//! through rather than passing state between stages directly). Operations
//! are split across files the way the teacher splits `bvgraph`'s codec
//! concerns across `bvgraph/`'s submodules: [`files`] for the file catalog
//! and first-loop bookkeeping, [`hashes`] for the shared hash table,
//! [`pairs`] for block planning and second-loop results, [`progress_store`]
//! for the `kv_meta`/`.task.json` persistence of [`crate::config::Config`].

mod files;
mod hashes;
mod pairs;
mod progress_store;
mod schema;

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;

pub use files::{FileRow, FileSuccess};
pub use pairs::{BlockExtent, BlockTask, Cluster, DuplicatePair, ItemRow};
pub use progress_store::read_task_file;

/// The lowest-level status an individual `files`/`pairs` row can carry.
///
/// Mirrors the three-or-four-way status convention the original keeps in
/// `success` columns (`-2` processing, `-1` unprocessed, `0` error, `1` ok),
/// collapsed to the two-way `pairs.success` domain where there is no
/// "currently being worked on" state to persist.
pub(crate) const UNPROCESSED: i32 = -1;
pub(crate) const PROCESSING: i32 = -2;
pub(crate) const ERROR: i32 = 0;
pub(crate) const OK: i32 = 1;

/// A connection to one run's catalog database.
///
/// Not `Sync`; the driver owns the single writer connection and hands
/// workers data through channels rather than a shared connection, per
/// SPEC_FULL.md §4 ("only the driver touches the catalog directly").
pub struct Catalog {
    pub(crate) conn: Connection,
}

impl Catalog {
    /// Opens (creating if necessary) the catalog at `path` and ensures its
    /// schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::create_all(&conn)?;
        Ok(Catalog { conn })
    }

    /// Opens a private, in-memory catalog. Used by tests and by callers who
    /// want a scratch run with no filesystem footprint.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::create_all(&conn)?;
        Ok(Catalog { conn })
    }
}
