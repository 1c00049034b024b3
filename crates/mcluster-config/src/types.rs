//! Configuration value types.

use std::collections::HashSet;
use std::time::Duration;

use mcluster_core::Variant;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{ConfigError, Result};

/// A named partition of cluster capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePool {
    /// Pool name, unique within a cluster.
    pub name: String,
    /// Number of slots the pool's agent advertises.
    pub capacity: u32,
}

impl ResourcePool {
    /// Create a resource pool.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

/// Scheduler the master runs its resource pools with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Fair-share scheduling.
    #[default]
    Default,
    /// Priority scheduling.
    Priority,
}

impl SchedulerKind {
    /// Scheduler type name written into the master config.
    #[must_use]
    pub const fn master_type(&self) -> &'static str {
        match self {
            Self::Default => "fair_share",
            Self::Priority => "priority",
        }
    }
}

/// Where the cluster's nodes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Master and agents are local child processes.
    #[default]
    LocalProcess,
    /// Master and agents are pods in a Kubernetes namespace.
    Kubernetes,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalProcess => f.write_str("local-process"),
            Self::Kubernetes => f.write_str("kubernetes"),
        }
    }
}

/// Whether restart injection is allowed, and how long agents back off before reconnecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RestartPolicy {
    /// Restart injection is permitted.
    pub enabled: bool,
    /// Pause between stopping a node and relaunching it, in milliseconds.
    /// Agents use the same value as their reconnect backoff.
    pub interval_ms: u64,
}

impl RestartPolicy {
    /// Restart injection disabled.
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            interval_ms: 0,
        }
    }

    /// Restart injection enabled with the given interval.
    #[must_use]
    pub fn enabled(interval: Duration) -> Self {
        Self {
            enabled: true,
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// The restart interval as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Immutable description of a cluster to launch.
///
/// Construct through [`ClusterConfigBuilder`](crate::ClusterConfigBuilder) or
/// [`ClusterConfig::new`]; both validate, so every value of this type satisfies:
/// at least one pool, unique non-empty pool names, non-zero capacities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterConfig {
    variant: Variant,
    resource_pools: Vec<ResourcePool>,
    scheduler: SchedulerKind,
    restart_policy: RestartPolicy,
    backend: BackendKind,
    master_port: u16,
}

impl ClusterConfig {
    /// Create and validate a configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the pools are empty, duplicated, unnamed or have no capacity,
    /// or if restarts are enabled with a zero interval.
    pub fn new(
        variant: Variant,
        resource_pools: Vec<ResourcePool>,
        scheduler: SchedulerKind,
        restart_policy: RestartPolicy,
        backend: BackendKind,
        master_port: u16,
    ) -> Result<Self> {
        let config = Self {
            variant,
            resource_pools,
            scheduler,
            restart_policy,
            backend,
            master_port,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.resource_pools.is_empty() {
            return Err(ConfigError::NoResourcePools);
        }

        let mut seen = HashSet::with_capacity(self.resource_pools.len());
        for pool in &self.resource_pools {
            if pool.name.trim().is_empty() {
                return Err(ConfigError::EmptyPoolName);
            }
            if pool.capacity == 0 {
                return Err(ConfigError::ZeroCapacity(pool.name.clone()));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::DuplicatePool(pool.name.clone()));
            }
        }

        if self.restart_policy.enabled && self.restart_policy.interval_ms == 0 {
            return Err(ConfigError::ZeroRestartInterval);
        }

        Ok(())
    }

    /// The variant this configuration was built for.
    #[must_use]
    pub const fn variant(&self) -> Variant {
        self.variant
    }

    /// Resource pools, in agent order.
    #[must_use]
    pub fn resource_pools(&self) -> &[ResourcePool] {
        &self.resource_pools
    }

    /// Look up a pool by name.
    #[must_use]
    pub fn pool(&self, name: &str) -> Option<&ResourcePool> {
        self.resource_pools.iter().find(|p| p.name == name)
    }

    /// Scheduler kind.
    #[must_use]
    pub const fn scheduler(&self) -> SchedulerKind {
        self.scheduler
    }

    /// Restart policy.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy
    }

    /// Backend the cluster runs on.
    #[must_use]
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Port the master listens on.
    #[must_use]
    pub const fn master_port(&self) -> u16 {
        self.master_port
    }

    /// Number of agent nodes: one per resource pool.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.resource_pools.len()
    }

    /// Total slots across all pools.
    #[must_use]
    pub fn total_capacity(&self) -> u64 {
        self.resource_pools.iter().map(|p| u64::from(p.capacity)).sum()
    }

    /// Return a copy of this configuration with one more resource pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the new pool is invalid or its name is already taken.
    pub fn with_resource_pool(&self, pool: ResourcePool) -> Result<Self> {
        let mut next = self.clone();
        next.resource_pools.push(pool);
        next.validate()?;
        Ok(next)
    }

    /// Return a copy of this configuration listening on another master port.
    #[must_use]
    pub fn with_master_port(&self, master_port: u16) -> Self {
        Self {
            master_port,
            ..self.clone()
        }
    }

    /// Render the configuration artifact handed to the master process.
    ///
    /// The result is opaque to mcluster: backends write it to disk or pass it through
    /// the environment, and nothing reads it back.
    #[must_use]
    pub fn master_config_json(&self) -> serde_json::Value {
        let pools: Vec<_> = self
            .resource_pools
            .iter()
            .map(|pool| {
                json!({
                    "pool_name": pool.name,
                    "max_slots": pool.capacity,
                    "scheduler": { "type": self.scheduler.master_type() },
                })
            })
            .collect();

        let default_pool = &self.resource_pools[0].name;

        json!({
            "port": self.master_port,
            "resource_manager": {
                "type": "agent",
                "default_aux_resource_pool": default_pool,
                "default_compute_resource_pool": default_pool,
            },
            "resource_pools": pools,
            "agent": {
                "reconnect_attempts": if self.restart_policy.enabled { 10 } else { 0 },
                "reconnect_backoff_ms": self.restart_policy.interval_ms,
            },
        })
    }
}
