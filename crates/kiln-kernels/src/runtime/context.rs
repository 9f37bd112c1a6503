//! Per-device queue registry.
//!
//! Queues are created lazily on first use and cached for reuse.

use std::collections::HashMap;
use std::sync::Arc;

use kiln_core::Device;
use parking_lot::Mutex;

use super::queue::{DeviceInfo, Queue};
use crate::config::RuntimeConfig;

/// One queue per device, shared by every operator run on a context.
#[derive(Debug)]
pub struct QueueRegistry {
    info: DeviceInfo,
    queues: Mutex<HashMap<Device, Arc<Queue>>>,
}

impl QueueRegistry {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            info: DeviceInfo {
                max_compute_units: config.max_compute_units,
                max_work_group_size: config.max_work_group_size,
            },
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Get or create the current queue for `device`.
    pub fn get(&self, device: Device) -> Arc<Queue> {
        let mut map = self.queues.lock();
        if let Some(queue) = map.get(&device) {
            return Arc::clone(queue);
        }
        tracing::debug!(%device, info = ?self.info, "creating queue");
        let queue = Arc::new(Queue::new(device, self.info));
        map.insert(device, Arc::clone(&queue));
        queue
    }

    /// Number of queues created so far.
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.lock().is_empty()
    }
}
