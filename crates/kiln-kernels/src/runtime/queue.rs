//! Ordered kernel queue backed by the rayon pool.
//!
//! Work-groups of one submission run in parallel; the submission completes
//! before `submit_parallel_for` returns, so submissions on one queue execute
//! in order.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_core::Device;
use rayon::prelude::*;

/// Capabilities reported by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub max_compute_units: usize,
    pub max_work_group_size: usize,
}

/// Global and local (work-group) extents of a 2D dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    global: [usize; 2],
    local: [usize; 2],
}

impl NdRange {
    /// 1D range covering `n` items, rounded up to whole work-groups.
    pub fn linear(n: usize, work_group: usize) -> Self {
        Self::grid(1, n, 1, work_group)
    }

    /// 2D range covering `rows × cols`, rounded up to whole work-groups.
    pub fn grid(rows: usize, cols: usize, group_rows: usize, group_cols: usize) -> Self {
        let group_rows = group_rows.max(1);
        let group_cols = group_cols.max(1);
        let grid_rows = rows.div_ceil(group_rows).max(1);
        let grid_cols = cols.div_ceil(group_cols).max(1);
        Self {
            global: [grid_rows * group_rows, grid_cols * group_cols],
            local: [group_rows, group_cols],
        }
    }

    pub fn global_range(&self) -> [usize; 2] {
        self.global
    }

    pub fn local_range(&self) -> [usize; 2] {
        self.local
    }

    /// Work-groups along each axis.
    pub fn num_groups(&self) -> [usize; 2] {
        [
            self.global[0] / self.local[0],
            self.global[1] / self.local[1],
        ]
    }

    pub fn total_items(&self) -> usize {
        self.global[0] * self.global[1]
    }
}

/// Identity of one work-item inside a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    global_id: [usize; 2],
    global_range: [usize; 2],
    local_id: [usize; 2],
    group: [usize; 2],
}

impl WorkItem {
    #[inline]
    pub fn global_id(&self, dim: usize) -> usize {
        self.global_id[dim]
    }

    #[inline]
    pub fn global_range(&self, dim: usize) -> usize {
        self.global_range[dim]
    }

    #[inline]
    pub fn local_id(&self, dim: usize) -> usize {
        self.local_id[dim]
    }

    #[inline]
    pub fn group(&self, dim: usize) -> usize {
        self.group[dim]
    }
}

/// Handle to a finished submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    id: u64,
}

impl Event {
    /// Sequence number of the submission on its queue.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until the submission completes. Submissions finish before
    /// `submit_parallel_for` returns, so this never waits.
    pub fn wait(&self) {}
}

/// An in-order queue bound to one device.
#[derive(Debug)]
pub struct Queue {
    device: Device,
    info: DeviceInfo,
    submitted: AtomicU64,
}

impl Queue {
    pub fn new(device: Device, info: DeviceInfo) -> Self {
        Self {
            device,
            info,
            submitted: AtomicU64::new(0),
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn info(&self) -> DeviceInfo {
        self.info
    }

    pub fn max_compute_units(&self) -> usize {
        self.info.max_compute_units
    }

    pub fn max_work_group_size(&self) -> usize {
        self.info.max_work_group_size
    }

    /// Number of submissions made so far.
    pub fn submission_count(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Run `kernel` once per work-item of `range`.
    ///
    /// Items past the logical problem size are still launched; kernels must
    /// bounds-check their global ids.
    pub fn submit_parallel_for<F>(&self, name: &'static str, range: NdRange, kernel: F) -> Event
    where
        F: Fn(WorkItem) + Send + Sync,
    {
        let id = self.submitted.fetch_add(1, Ordering::Relaxed);
        let groups = range.num_groups();
        let local = range.local;
        let global = range.global;
        tracing::trace!(
            kernel = name,
            device = %self.device,
            submission = id,
            global = ?global,
            local = ?local,
            "submit_parallel_for"
        );

        (0..groups[0] * groups[1]).into_par_iter().for_each(|g| {
            let group = [g / groups[1], g % groups[1]];
            for ly in 0..local[0] {
                for lx in 0..local[1] {
                    kernel(WorkItem {
                        global_id: [group[0] * local[0] + ly, group[1] * local[1] + lx],
                        global_range: global,
                        local_id: [ly, lx],
                        group,
                    });
                }
            }
        });

        Event { id }
    }
}
