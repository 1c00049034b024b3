//! Variant → configuration mapping.

use std::time::Duration;

use mcluster_core::Variant;
use tracing::debug;

use crate::error::Result;
use crate::types::{BackendKind, ClusterConfig, ResourcePool, RestartPolicy, SchedulerKind};

/// Name of the pool every variant starts with.
pub const DEFAULT_POOL: &str = "default";

/// Name of the second pool in the multi-resource-pools variant.
pub const ADDITIONAL_POOL: &str = "additional";

/// Base settings the builder fills every variant in with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDefaults {
    /// Port the master listens on.
    ///
    /// Kubernetes pods always use it. The local backend picks a free port per cluster
    /// unless it is pinned to this one.
    pub master_port: u16,
    /// Slots per resource pool.
    pub pool_capacity: u32,
    /// Restart interval for the restartable variant, in milliseconds.
    pub restart_interval_ms: u64,
}

impl Default for ClusterDefaults {
    fn default() -> Self {
        Self {
            master_port: 8080,
            pool_capacity: 8,
            restart_interval_ms: 1000,
        }
    }
}

impl ClusterDefaults {
    /// Load defaults from environment variables.
    ///
    /// Supported environment variables:
    /// - `MCLUSTER_MASTER_PORT`: port the master listens on
    /// - `MCLUSTER_POOL_CAPACITY`: slots per resource pool
    /// - `MCLUSTER_RESTART_INTERVAL_MS`: restart interval for the restartable variant
    ///
    /// Unparseable values are ignored.
    #[must_use]
    pub fn from_env() -> Self {
        let mut defaults = Self::default();

        if let Ok(val) = std::env::var("MCLUSTER_MASTER_PORT") {
            if let Ok(n) = val.parse() {
                defaults.master_port = n;
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_POOL_CAPACITY") {
            if let Ok(n) = val.parse() {
                defaults.pool_capacity = n;
            }
        }
        if let Ok(val) = std::env::var("MCLUSTER_RESTART_INTERVAL_MS") {
            if let Ok(n) = val.parse() {
                defaults.restart_interval_ms = n;
            }
        }

        defaults
    }

    /// The restart interval as a `Duration`.
    #[must_use]
    pub const fn restart_interval(&self) -> Duration {
        Duration::from_millis(self.restart_interval_ms)
    }
}

/// Builds a validated [`ClusterConfig`] for each [`Variant`].
///
/// The mapping is a pure function of the variant and the builder's defaults.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfigBuilder {
    defaults: ClusterDefaults,
}

impl ClusterConfigBuilder {
    /// Create a builder with explicit defaults.
    #[must_use]
    pub const fn new(defaults: ClusterDefaults) -> Self {
        Self { defaults }
    }

    /// Create a builder with defaults loaded from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(ClusterDefaults::from_env())
    }

    /// The defaults in use.
    #[must_use]
    pub const fn defaults(&self) -> &ClusterDefaults {
        &self.defaults
    }

    /// Build the configuration for a variant.
    ///
    /// # Errors
    ///
    /// Returns an error if the defaults produce an invalid configuration
    /// (for example a zero pool capacity).
    pub fn build(&self, variant: Variant) -> Result<ClusterConfig> {
        let capacity = self.defaults.pool_capacity;
        let mut pools = vec![ResourcePool::new(DEFAULT_POOL, capacity)];
        let mut scheduler = SchedulerKind::Default;
        let mut restart_policy = RestartPolicy::disabled();
        let mut backend = BackendKind::LocalProcess;

        match variant {
            Variant::Default => {}
            Variant::MultiResourcePools => {
                pools.push(ResourcePool::new(ADDITIONAL_POOL, capacity));
            }
            Variant::PriorityScheduler => scheduler = SchedulerKind::Priority,
            Variant::Restartable => {
                restart_policy = RestartPolicy::enabled(self.defaults.restart_interval());
            }
            Variant::RestartableMultiResourcePools => {
                pools.push(ResourcePool::new(ADDITIONAL_POOL, capacity));
                restart_policy = RestartPolicy::enabled(self.defaults.restart_interval());
            }
            Variant::K8s => backend = BackendKind::Kubernetes,
        }

        let config = ClusterConfig::new(
            variant,
            pools,
            scheduler,
            restart_policy,
            backend,
            self.defaults.master_port,
        )?;

        debug!(
            variant = %variant,
            pools = config.resource_pools().len(),
            scheduler = ?config.scheduler(),
            backend = %config.backend(),
            "Built cluster configuration"
        );

        Ok(config)
    }

    /// Build the configuration for a variant given by name.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownVariant` if the name is not recognized.
    pub fn build_named(&self, variant: &str) -> Result<ClusterConfig> {
        self.build(variant.parse::<Variant>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigError;

    #[test]
    fn default_variant() {
        let config = ClusterConfigBuilder::default()
            .build(Variant::Default)
            .unwrap();
        assert_eq!(config.variant(), Variant::Default);
        assert_eq!(config.agent_count(), 1);
        assert_eq!(config.resource_pools()[0].name, DEFAULT_POOL);
        assert_eq!(config.scheduler(), SchedulerKind::Default);
        assert!(!config.restart_policy().enabled);
        assert_eq!(config.backend(), BackendKind::LocalProcess);
        assert_eq!(config.master_port(), 8080);
    }

    #[test]
    fn multi_resource_pools_variant() {
        let config = ClusterConfigBuilder::default()
            .build(Variant::MultiResourcePools)
            .unwrap();
        let names: Vec<_> = config
            .resource_pools()
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, [DEFAULT_POOL, ADDITIONAL_POOL]);
    }

    #[test]
    fn priority_variant() {
        let config = ClusterConfigBuilder::default()
            .build(Variant::PriorityScheduler)
            .unwrap();
        assert_eq!(config.scheduler(), SchedulerKind::Priority);
    }

    #[test]
    fn restartable_variant() {
        let config = ClusterConfigBuilder::default()
            .build(Variant::Restartable)
            .unwrap();
        assert!(config.restart_policy().enabled);
        assert_eq!(config.restart_policy().interval(), Duration::from_secs(1));
    }

    #[test]
    fn restartable_multi_resource_pools_variant() {
        let config = ClusterConfigBuilder::default()
            .build_named("restartable-multi-resource-pools")
            .unwrap();
        assert_eq!(config.agent_count(), 2);
        assert!(config.pool(ADDITIONAL_POOL).is_some());
        assert!(config.restart_policy().enabled);
        assert_eq!(config.backend(), BackendKind::LocalProcess);
    }

    #[test]
    fn k8s_variant() {
        let config = ClusterConfigBuilder::default().build(Variant::K8s).unwrap();
        assert_eq!(config.backend(), BackendKind::Kubernetes);
        assert_eq!(config.agent_count(), 1);
    }

    #[test]
    fn build_is_pure() {
        let builder = ClusterConfigBuilder::default();
        for variant in Variant::ALL {
            assert_eq!(builder.build(variant), builder.build(variant));
        }
    }

    #[test]
    fn build_named_unknown_variant() {
        let result = ClusterConfigBuilder::default().build_named("gpu-heavy");
        assert_eq!(
            result,
            Err(ConfigError::UnknownVariant("gpu-heavy".to_string()))
        );
    }

    #[test]
    fn invalid_defaults_fail() {
        let builder = ClusterConfigBuilder::new(ClusterDefaults {
            pool_capacity: 0,
            ..Default::default()
        });
        assert!(matches!(
            builder.build(Variant::Default),
            Err(ConfigError::ZeroCapacity(_))
        ));

        let builder = ClusterConfigBuilder::new(ClusterDefaults {
            restart_interval_ms: 0,
            ..Default::default()
        });
        assert_eq!(
            builder.build(Variant::Restartable),
            Err(ConfigError::ZeroRestartInterval)
        );
    }

    #[test]
    fn custom_defaults() {
        let builder = ClusterConfigBuilder::new(ClusterDefaults {
            master_port: 18080,
            pool_capacity: 2,
            restart_interval_ms: 250,
        });
        let config = builder.build(Variant::Restartable).unwrap();
        assert_eq!(config.master_port(), 18080);
        assert_eq!(config.total_capacity(), 2);
        assert_eq!(
            config.restart_policy().interval(),
            Duration::from_millis(250)
        );
    }
}
