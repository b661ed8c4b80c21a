// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Per-partition progress aggregation for the extraction workers. Counters
//! are plain atomics so that workers never contend on a lock in the hot
//! path; the registry lock is only taken when a bar is created or when the
//! totals are aggregated.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use tracing::debug;

#[derive(Debug)]
struct BarState {
    name: String,
    total: u64,
    done: AtomicU64,
    finished: AtomicBool,
}

/// Registry of all per-partition progress bars.
#[derive(Clone, Debug, Default)]
pub struct Progress {
    bars: Arc<Mutex<Vec<Arc<BarState>>>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new bar spanning `total` units of work.
    pub fn add_bar(&self, name: &str, total: u64) -> ProgressBar {
        let state = Arc::new(BarState {
            name: name.to_owned(),
            total,
            done: AtomicU64::new(0),
            finished: AtomicBool::new(false),
        });

        self.bars.lock().unwrap().push(state.clone());

        ProgressBar { state }
    }

    /// Sum of every bar's total units.
    pub fn total_units(&self) -> u64 {
        self.bars.lock().unwrap().iter().map(|b| b.total).sum()
    }

    /// Sum of every bar's completed units.
    pub fn completed_units(&self) -> u64 {
        self.bars
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.done.load(Ordering::Relaxed))
            .sum()
    }

    /// Whether every registered bar has been finalized.
    pub fn all_finished(&self) -> bool {
        self.bars
            .lock()
            .unwrap()
            .iter()
            .all(|b| b.finished.load(Ordering::Relaxed))
    }
}

/// Handle for one partition's bar. Owned by a single worker.
#[derive(Debug)]
pub struct ProgressBar {
    state: Arc<BarState>,
}

impl ProgressBar {
    pub fn increment(&self) {
        self.state.done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn finish(&self) {
        self.state.finished.store(true, Ordering::Relaxed);

        debug!(
            "{}: {}/{} operations",
            self.state.name,
            self.state.done.load(Ordering::Relaxed),
            self.state.total,
        );
    }
}
