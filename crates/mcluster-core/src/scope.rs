//! Scope keys: which cluster a caller is asking for, and for how long.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// A named cluster configuration flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Variant {
    /// One resource pool, default scheduler, local processes.
    Default,
    /// Two resource pools, one agent each.
    MultiResourcePools,
    /// Priority scheduler instead of the default one.
    PriorityScheduler,
    /// Restart injection enabled.
    Restartable,
    /// Two resource pools with restart injection enabled.
    RestartableMultiResourcePools,
    /// Kubernetes-backed deployment.
    K8s,
}

impl Variant {
    /// Every variant, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::Default,
        Self::MultiResourcePools,
        Self::PriorityScheduler,
        Self::Restartable,
        Self::RestartableMultiResourcePools,
        Self::K8s,
    ];

    /// The canonical name of the variant.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::MultiResourcePools => "multi-resource-pools",
            Self::PriorityScheduler => "priority-scheduler",
            Self::Restartable => "restartable",
            Self::RestartableMultiResourcePools => "restartable-multi-resource-pools",
            Self::K8s => "k8s",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "multi-resource-pools" | "multi_resource_pools" | "multi-pool" => {
                Ok(Self::MultiResourcePools)
            }
            "priority-scheduler" | "priority_scheduler" | "priority" => Ok(Self::PriorityScheduler),
            "restartable" | "restarts" => Ok(Self::Restartable),
            "restartable-multi-resource-pools" | "restartable_multi_resource_pools" => {
                Ok(Self::RestartableMultiResourcePools)
            }
            "k8s" | "kubernetes" => Ok(Self::K8s),
            other => Err(CoreError::UnknownVariant(other.to_string())),
        }
    }
}

/// Lifetime granularity of a cluster instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Owned by a single test, named by the test so concurrent tests never share.
    Test(String),
    /// Shared by every test in the session.
    Session,
}

impl Scope {
    /// Whether this is the session scope.
    #[must_use]
    pub const fn is_session(&self) -> bool {
        matches!(self, Self::Session)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Test(owner) => write!(f, "test[{owner}]"),
            Self::Session => f.write_str("session"),
        }
    }
}

/// Lookup key for a live cluster: a scope plus a variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    /// Lifetime of the cluster.
    pub scope: Scope,
    /// Configuration flavor.
    pub variant: Variant,
}

impl ScopeKey {
    /// Create a key from its parts.
    #[must_use]
    pub const fn new(scope: Scope, variant: Variant) -> Self {
        Self { scope, variant }
    }

    /// A session-scoped key.
    #[must_use]
    pub const fn session(variant: Variant) -> Self {
        Self::new(Scope::Session, variant)
    }

    /// A test-scoped key owned by `test_name`.
    #[must_use]
    pub fn test(test_name: impl Into<String>, variant: Variant) -> Self {
        Self::new(Scope::Test(test_name.into()), variant)
    }

    /// Whether the key lives for the whole session.
    #[must_use]
    pub const fn is_session(&self) -> bool {
        self.scope.is_session()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.variant)
    }
}
