//! Per-plugin resource budgets
//!
//! Counters are atomic and independent per plugin, so charging never takes a
//! lock shared with other plugins. A breach is sticky: once a counter passes
//! its ceiling every later charge for that plugin is denied until the
//! counters are reset at the next load. A plugin only has counters between
//! `reset` and `remove`; outside that window it has no budget at all.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use palisade_core::config::BudgetConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    CpuMillis,
    MemoryBytes,
    DiskBytes,
    NetworkBytes,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] = [
        Self::CpuMillis,
        Self::MemoryBytes,
        Self::DiskBytes,
        Self::NetworkBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CpuMillis => "cpu_millis",
            Self::MemoryBytes => "memory_bytes",
            Self::DiskBytes => "disk_bytes",
            Self::NetworkBytes => "network_bytes",
        }
    }

    fn index(self) -> usize {
        match self {
            Self::CpuMillis => 0,
            Self::MemoryBytes => 1,
            Self::DiskBytes => 2,
            Self::NetworkBytes => 3,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ceilings for one plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bytes: u64,
}

impl ResourceBudget {
    pub fn ceiling(&self, kind: ResourceKind) -> u64 {
        match kind {
            ResourceKind::CpuMillis => self.cpu_millis,
            ResourceKind::MemoryBytes => self.memory_bytes,
            ResourceKind::DiskBytes => self.disk_bytes,
            ResourceKind::NetworkBytes => self.network_bytes,
        }
    }
}

impl From<&BudgetConfig> for ResourceBudget {
    fn from(config: &BudgetConfig) -> Self {
        Self {
            cpu_millis: config.cpu_millis,
            memory_bytes: config.memory_bytes,
            disk_bytes: config.disk_bytes,
            network_bytes: config.network_bytes,
        }
    }
}

impl Default for ResourceBudget {
    fn default() -> Self {
        Self::from(&BudgetConfig::default())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("plugin '{plugin_id}' exceeded its {resource} budget ({used} > {limit})")]
pub struct BudgetExceeded {
    pub plugin_id: String,
    pub resource: ResourceKind,
    pub used: u64,
    pub limit: u64,
}

/// Point-in-time usage for one plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub network_bytes: u64,
    pub breached: bool,
}

#[derive(Debug)]
struct Counters {
    budget: ResourceBudget,
    used: [AtomicU64; 4],
    breach: parking_lot::Mutex<Option<BudgetExceeded>>,
    breached: AtomicBool,
}

impl Counters {
    fn new(budget: ResourceBudget) -> Self {
        Self {
            budget,
            used: Default::default(),
            breach: parking_lot::Mutex::new(None),
            breached: AtomicBool::new(false),
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceLimiter {
    counters: DashMap<String, Arc<Counters>>,
}

impl ResourceLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a fresh instance lifetime: zero counters under `budget`
    pub fn reset(&self, plugin_id: &str, budget: ResourceBudget) {
        self.counters
            .insert(plugin_id.to_string(), Arc::new(Counters::new(budget)));
    }

    /// Forget the plugin entirely (unload)
    pub fn remove(&self, plugin_id: &str) {
        self.counters.remove(plugin_id);
    }

    pub fn budget(&self, plugin_id: &str) -> Option<ResourceBudget> {
        self.counters.get(plugin_id).map(|c| c.budget)
    }

    /// Add `amount` to the counter and compare against the ceiling
    ///
    /// A plugin without counters is denied with a zero limit and nothing is
    /// recorded, so a charge that lands after unload cannot recreate them.
    pub fn charge(
        &self,
        plugin_id: &str,
        kind: ResourceKind,
        amount: u64,
    ) -> Result<u64, BudgetExceeded> {
        let Some(counters) = self.counters.get(plugin_id).map(|c| Arc::clone(&c)) else {
            debug!(plugin_id = %plugin_id, resource = %kind, "Charge for an untracked plugin denied");
            return Err(BudgetExceeded {
                plugin_id: plugin_id.to_string(),
                resource: kind,
                used: amount,
                limit: 0,
            });
        };

        if counters.breached.load(Ordering::Acquire) {
            let previous = counters.breach.lock().clone();
            return Err(previous.unwrap_or_else(|| BudgetExceeded {
                plugin_id: plugin_id.to_string(),
                resource: kind,
                used: counters.used[kind.index()].load(Ordering::Acquire),
                limit: counters.budget.ceiling(kind),
            }));
        }

        let counter = &counters.used[kind.index()];
        let previous = counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_add(amount))
            })
            .unwrap_or_else(|v| v);
        let used = previous.saturating_add(amount);
        let limit = counters.budget.ceiling(kind);

        if used > limit {
            let exceeded = BudgetExceeded {
                plugin_id: plugin_id.to_string(),
                resource: kind,
                used,
                limit,
            };
            {
                let mut breach = counters.breach.lock();
                if breach.is_none() {
                    *breach = Some(exceeded.clone());
                }
            }
            counters.breached.store(true, Ordering::Release);
            warn!(
                plugin_id = %plugin_id,
                resource = %kind,
                used,
                limit,
                "Resource budget exceeded"
            );
            return Err(exceeded);
        }

        Ok(used)
    }

    pub fn is_breached(&self, plugin_id: &str) -> bool {
        self.counters
            .get(plugin_id)
            .is_some_and(|c| c.breached.load(Ordering::Acquire))
    }

    pub fn usage(&self, plugin_id: &str) -> Option<ResourceUsage> {
        self.counters.get(plugin_id).map(|c| ResourceUsage {
            cpu_millis: c.used[0].load(Ordering::Acquire),
            memory_bytes: c.used[1].load(Ordering::Acquire),
            disk_bytes: c.used[2].load(Ordering::Acquire),
            network_bytes: c.used[3].load(Ordering::Acquire),
            breached: c.breached.load(Ordering::Acquire),
        })
    }

    /// How much more of `kind` the plugin may use before it breaches
    pub fn remaining(&self, plugin_id: &str, kind: ResourceKind) -> Option<u64> {
        self.counters.get(plugin_id).map(|c| {
            if c.breached.load(Ordering::Acquire) {
                return 0;
            }
            let used = c.used[kind.index()].load(Ordering::Acquire);
            c.budget.ceiling(kind).saturating_sub(used)
        })
    }
}
