/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The shared `hash_table`: one row per distinct perceptual hash, reference
//! counted but never dereferenced during a run (SPEC_FULL.md §3).

use rusqlite::{params, Connection};

/// Inserts `hash` if it isn't already known, or bumps its reference count
/// if it is, returning its key either way.
///
/// Takes a raw connection reference so it can be called from inside a
/// transaction already open on the `files` update (see
/// `files::apply_preprocess_results`) without nesting transactions, which
/// `rusqlite` does not allow on a single connection.
pub(super) fn upsert_hash(conn: &Connection, hash: u64) -> rusqlite::Result<i64> {
    let text = format!("{hash:016x}");
    conn.execute(
        "INSERT INTO hash_table (hash, count) VALUES (?1, 1)
         ON CONFLICT(hash) DO UPDATE SET count = count + 1",
        params![text],
    )?;
    conn.query_row(
        "SELECT key FROM hash_table WHERE hash = ?1",
        params![text],
        |row| row.get(0),
    )
}

impl super::Catalog {
    /// Total reference count across every hash, used by the
    /// hash-reference-integrity test in SPEC_FULL.md §8
    /// (`sum(count) = 4 * |files_with_success=1|` when every OK file was
    /// hashed).
    pub fn total_hash_refs(&self) -> crate::error::Result<i64> {
        Ok(self.conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM hash_table",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn count_hashes(&self) -> crate::error::Result<i64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM hash_table", [], |row| row.get(0))?)
    }
}
