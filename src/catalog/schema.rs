/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Table and index DDL, grounded directly on the table layout in
//! `original_source/src/fast_diff_py/sqlite_db.py` (the `files`, `hash_table`,
//! `dif_table`, and `dif_error_table` definitions), adapted to integer
//! partition tags and a dedicated `kv_meta` table for progress/config
//! persistence (SPEC_FULL.md §6 and §9).

use rusqlite::Connection;

pub const CREATE_FILES: &str = "
CREATE TABLE IF NOT EXISTS files (
    key             INTEGER PRIMARY KEY,
    path            TEXT NOT NULL,
    filename        TEXT NOT NULL,
    partition       INTEGER NOT NULL CHECK(partition IN (0, 1)),
    success         INTEGER NOT NULL DEFAULT -1 CHECK(success IN (-2, -1, 0, 1)),
    px              INTEGER NOT NULL DEFAULT -1,
    py              INTEGER NOT NULL DEFAULT -1,
    error           TEXT,
    hash_0          INTEGER REFERENCES hash_table(key),
    hash_90         INTEGER REFERENCES hash_table(key),
    hash_180        INTEGER REFERENCES hash_table(key),
    hash_270        INTEGER REFERENCES hash_table(key),
    UNIQUE(path, partition)
);";

pub const CREATE_HASH_TABLE: &str = "
CREATE TABLE IF NOT EXISTS hash_table (
    key     INTEGER PRIMARY KEY,
    hash    TEXT NOT NULL UNIQUE,
    count   INTEGER NOT NULL DEFAULT 0
);";

pub const CREATE_PAIRS: &str = "
CREATE TABLE IF NOT EXISTS pairs (
    key         INTEGER PRIMARY KEY,
    key_a       INTEGER NOT NULL REFERENCES files(key),
    key_b       INTEGER NOT NULL REFERENCES files(key),
    dif         REAL NOT NULL DEFAULT -1,
    success     INTEGER NOT NULL DEFAULT -1 CHECK(success IN (-1, 0, 1)),
    block_a     INTEGER NOT NULL,
    block_b     INTEGER NOT NULL,
    block_key   INTEGER NOT NULL,
    UNIQUE(key_a, key_b)
);";

pub const CREATE_PAIR_ERRORS: &str = "
CREATE TABLE IF NOT EXISTS pair_errors (
    key     INTEGER PRIMARY KEY REFERENCES pairs(key),
    error   TEXT NOT NULL
);";

pub const CREATE_KV_META: &str = "
CREATE TABLE IF NOT EXISTS kv_meta (
    k   TEXT PRIMARY KEY,
    v   TEXT NOT NULL
);";

const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_files_partition ON files(partition);",
    "CREATE INDEX IF NOT EXISTS idx_files_success ON files(success);",
    "CREATE INDEX IF NOT EXISTS idx_files_hash_0 ON files(hash_0);",
    "CREATE INDEX IF NOT EXISTS idx_files_hash_90 ON files(hash_90);",
    "CREATE INDEX IF NOT EXISTS idx_files_hash_180 ON files(hash_180);",
    "CREATE INDEX IF NOT EXISTS idx_files_hash_270 ON files(hash_270);",
    "CREATE INDEX IF NOT EXISTS idx_pairs_block_key ON pairs(block_key);",
    "CREATE INDEX IF NOT EXISTS idx_pairs_success ON pairs(success);",
];

/// Creates every table and index this crate needs, idempotently.
pub fn create_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_FILES)?;
    conn.execute_batch(CREATE_HASH_TABLE)?;
    conn.execute_batch(CREATE_PAIRS)?;
    conn.execute_batch(CREATE_PAIR_ERRORS)?;
    conn.execute_batch(CREATE_KV_META)?;
    for stmt in CREATE_INDEXES {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}
