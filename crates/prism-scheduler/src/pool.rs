use crate::types::{PoolStatus, ResourceRequirement};
use prism_core::SchedulerConfig;

const CPU_EPSILON: f64 = 1e-9;

/// Slot and weight accounting for admitted tasks.
///
/// Budgets are advisory: nothing is enforced at the OS level. An absent
/// budget means the axis is unlimited.
#[derive(Debug, Clone)]
pub struct ResourcePool {
    slots_total: usize,
    slots_used: usize,
    memory_total: Option<u64>,
    memory_used: u64,
    cpu_total: Option<f64>,
    cpu_used: f64,
    network_total: Option<usize>,
    network_used: usize,
}

impl ResourcePool {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            slots_total: config.max_concurrency,
            slots_used: 0,
            memory_total: config.memory_budget,
            memory_used: 0,
            cpu_total: config.cpu_budget,
            cpu_used: 0.0,
            network_total: config.network_budget,
            network_used: 0,
        }
    }

    /// Whether `req` could ever be admitted, even on an empty pool.
    pub fn fits_capacity(&self, req: &ResourceRequirement) -> bool {
        self.slots_total > 0
            && self.memory_total.map_or(true, |total| req.memory <= total)
            && self
                .cpu_total
                .map_or(true, |total| req.cpu <= total + CPU_EPSILON)
            && (!req.network || self.network_total.map_or(true, |total| total > 0))
    }

    /// Whether `req` fits in what is currently free.
    pub fn can_admit(&self, req: &ResourceRequirement) -> bool {
        self.slots_used < self.slots_total
            && self
                .memory_total
                .map_or(true, |total| self.memory_used + req.memory <= total)
            && self
                .cpu_total
                .map_or(true, |total| self.cpu_used + req.cpu <= total + CPU_EPSILON)
            && (!req.network
                || self
                    .network_total
                    .map_or(true, |total| self.network_used < total))
    }

    /// Reserve `req` if it fits. Returns `false` and changes nothing otherwise.
    pub fn try_acquire(&mut self, req: &ResourceRequirement) -> bool {
        if !self.can_admit(req) {
            return false;
        }
        self.slots_used += 1;
        self.memory_used += req.memory;
        self.cpu_used += req.cpu;
        if req.network {
            self.network_used += 1;
        }
        true
    }

    /// Return a reservation previously granted by [`try_acquire`](Self::try_acquire).
    pub fn release(&mut self, req: &ResourceRequirement) {
        self.slots_used = self.slots_used.saturating_sub(1);
        self.memory_used = self.memory_used.saturating_sub(req.memory);
        self.cpu_used = (self.cpu_used - req.cpu).max(0.0);
        if req.network {
            self.network_used = self.network_used.saturating_sub(1);
        }
    }

    /// Drop every reservation.
    pub fn reset(&mut self) {
        self.slots_used = 0;
        self.memory_used = 0;
        self.cpu_used = 0.0;
        self.network_used = 0;
    }

    pub fn slots_used(&self) -> usize {
        self.slots_used
    }

    pub fn status(&self, queued: usize) -> PoolStatus {
        PoolStatus {
            slots_total: self.slots_total,
            slots_used: self.slots_used,
            memory_total: self.memory_total,
            memory_used: self.memory_used,
            cpu_total: self.cpu_total,
            cpu_used: self.cpu_used,
            network_total: self.network_total,
            network_used: self.network_used,
            queued,
        }
    }
}
