/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Persistence for [`crate::config::Progress`] and [`crate::config::Config`]
//! in the catalog's `kv_meta` table, plus the `.task.json` mirror
//! (SPEC_FULL.md §4.1, §6).

use crate::config::{Config, Progress};
use crate::error::Result;
use rusqlite::params;
use std::fs;
use std::path::Path;

const PROGRESS_KEY: &str = "progress";
const CONFIG_KEY: &str = "config";

impl super::Catalog {
    pub fn store_progress(&self, progress: Progress) -> Result<()> {
        let json = serde_json::to_string(&progress).map_err(|e| {
            crate::error::PipelineError::Catalog(rusqlite::Error::ToSqlConversionFailure(
                Box::new(e),
            ))
        })?;
        self.conn.execute(
            "INSERT INTO kv_meta (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![PROGRESS_KEY, json],
        )?;
        Ok(())
    }

    pub fn load_progress(&self) -> Result<Progress> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT v FROM kv_meta WHERE k = ?1",
                params![PROGRESS_KEY],
                |row| row.get(0),
            )
            .ok();
        Ok(match row {
            Some(json) => serde_json::from_str(&json).unwrap_or_default(),
            None => Progress::default(),
        })
    }

    pub fn store_config(&self, config: &Config) -> Result<()> {
        let json = serde_json::to_string(config).map_err(|e| {
            crate::error::PipelineError::Catalog(rusqlite::Error::ToSqlConversionFailure(
                Box::new(e),
            ))
        })?;
        self.conn.execute(
            "INSERT INTO kv_meta (k, v) VALUES (?1, ?2)
             ON CONFLICT(k) DO UPDATE SET v = excluded.v",
            params![CONFIG_KEY, json],
        )?;
        if config.retain_progress {
            write_task_file(&config.task_file_path(), config)?;
        }
        Ok(())
    }

    pub fn load_config(&self) -> Result<Option<Config>> {
        let row: Option<String> = self
            .conn
            .query_row(
                "SELECT v FROM kv_meta WHERE k = ?1",
                params![CONFIG_KEY],
                |row| row.get(0),
            )
            .ok();
        Ok(row.and_then(|json| serde_json::from_str(&json).ok()))
    }
}

/// Mirrors `config` out to `<root_a>/.task.json`, matching SPEC_FULL.md §6's
/// external-interface contract. Best-effort: a write failure here does not
/// fail the commit, since `kv_meta` inside the catalog is the authoritative
/// copy.
fn write_task_file(path: &Path, config: &Config) -> Result<()> {
    match serde_json::to_vec_pretty(config) {
        Ok(bytes) => {
            if let Err(e) = fs::write(path, bytes) {
                log::warn!("could not mirror task file to {}: {e}", path.display());
            }
        }
        Err(e) => log::warn!("could not serialize config for task file mirror: {e}"),
    }
    Ok(())
}

/// Reads `<root_a>/.task.json` directly, independent of the catalog. Used
/// by callers that want to inspect a run's configuration without opening
/// the SQLite file.
pub fn read_task_file(path: &Path) -> Option<Config> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn progress_roundtrips() {
        let cat = Catalog::open_in_memory().unwrap();
        assert_eq!(cat.load_progress().unwrap(), Progress::Init);
        cat.store_progress(Progress::FirstLoopInProgress).unwrap();
        assert_eq!(cat.load_progress().unwrap(), Progress::FirstLoopInProgress);
    }

    #[test]
    fn config_roundtrips_without_task_file() {
        let cat = Catalog::open_in_memory().unwrap();
        let mut config = Config::new("/tmp/does-not-matter", None);
        config.retain_progress = false;
        cat.store_config(&config).unwrap();
        let back = cat.load_config().unwrap().unwrap();
        assert_eq!(back.root_a, config.root_a);
    }
}
