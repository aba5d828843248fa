/*
 * SPDX-FileCopyrightText: 2023 Inria
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Worker-loop bodies for the first and second loops.
//!
//! Each function here is the whole lifetime of one worker: block on the
//! command channel, process, send a result, repeat, exit on
//! [`crate::types::Task::Shutdown`] or a closed channel. The pipeline
//! driver spawns `cpu_proc` OS threads per stage inside a `std::thread`
//! scope and runs one of these loops on each, mirroring the teacher's
//! `traits/par_map_fold.rs::par_map_fold2_with` (bounded
//! `crossbeam_channel`s in and out of a `thread_pool.in_place_scope`
//! closure, no reference back to the spawner).

pub mod compare;
pub mod preprocess;
