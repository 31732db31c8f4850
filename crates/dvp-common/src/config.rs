//! Cloud provider configuration
//!
//! Loaded from a YAML document (the `--cloud-config` file) and then overlaid
//! with environment variables, so that deployments can inject the kubeconfig
//! path and namespace without templating the file.
//!
//! ```yaml
//! kubeconfigPath: /etc/dvp/kubeconfig
//! namespace: tenant-infra
//! zoneAndRegionEnabled: true
//! infraLabels:
//!   network.deckhouse.io/lb-pool: public
//! loadBalancer:
//!   creationPollInterval: 5
//!   creationPollTimeout: 300
//!   selectorLess: false
//! ```

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Overrides `kubeconfigPath`
pub const ENV_KUBECONFIG_PATH: &str = "DVP_CCM_KUBECONFIG_PATH";
/// Overrides `namespace`
pub const ENV_NAMESPACE: &str = "DVP_CCM_NAMESPACE";

/// Default seconds between polls while waiting for a load balancer ingress
pub const DEFAULT_CREATION_POLL_INTERVAL_SECS: u64 = 5;
/// Default seconds to wait for a load balancer ingress
pub const DEFAULT_CREATION_POLL_TIMEOUT_SECS: u64 = 300;

/// Source of environment variables
///
/// Lets tests exercise the overlay without touching process state.
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Look up a variable, `None` when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads from the process environment
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Top-level provider configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CloudConfig {
    /// Kubeconfig for the infrastructure (virtualization) cluster
    pub kubeconfig_path: String,

    /// Load balancer reconciliation settings
    pub load_balancer: LoadBalancerConfig,

    /// Namespace in the infrastructure cluster holding the VMs and backing
    /// services. Empty means "take it from the kubeconfig context".
    pub namespace: String,

    /// Resolve region/zone from the topology labels of the hosting node
    pub zone_and_region_enabled: bool,

    /// Labels stamped onto every backing load balancer service
    pub infra_labels: BTreeMap<String, String>,
}

/// Load balancer settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancerConfig {
    /// Seconds between polls while waiting for an ingress point
    pub creation_poll_interval: u64,

    /// Seconds to wait for an ingress point before giving up
    pub creation_poll_timeout: u64,

    /// Leave the backing service without a selector; endpoints are managed
    /// by a third party
    pub selector_less: bool,
}

impl Default for LoadBalancerConfig {
    fn default() -> Self {
        Self {
            creation_poll_interval: DEFAULT_CREATION_POLL_INTERVAL_SECS,
            creation_poll_timeout: DEFAULT_CREATION_POLL_TIMEOUT_SECS,
            selector_less: false,
        }
    }
}

impl LoadBalancerConfig {
    /// Interval between ingress polls
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.creation_poll_interval)
    }

    /// Overall ingress wait deadline
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.creation_poll_timeout)
    }
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            kubeconfig_path: String::new(),
            load_balancer: LoadBalancerConfig::default(),
            namespace: String::new(),
            zone_and_region_enabled: true,
            infra_labels: BTreeMap::new(),
        }
    }
}

impl CloudConfig {
    /// Parse a YAML document; an empty document yields the defaults
    pub fn from_yaml(yaml: &str) -> Result<Self, Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("failed to parse cloud provider config: {}", e)))
    }

    /// Read the config document (if any) and apply the environment overlay
    pub fn load<R: Read>(reader: Option<R>, env: &dyn EnvSource) -> Result<Self, Error> {
        let mut config = match reader {
            Some(mut r) => {
                let mut buf = String::new();
                r.read_to_string(&mut buf).map_err(|e| {
                    Error::config(format!("failed to read cloud provider config: {}", e))
                })?;
                Self::from_yaml(&buf)?
            }
            None => Self::default(),
        };
        config.apply_env(env);
        Ok(config)
    }

    /// Environment variables win over file values
    pub fn apply_env(&mut self, env: &dyn EnvSource) {
        if let Some(path) = env.var(ENV_KUBECONFIG_PATH) {
            self.kubeconfig_path = path;
        }
        if let Some(ns) = env.var(ENV_NAMESPACE) {
            self.namespace = ns;
        }
    }

    /// Reject configurations the provider cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.kubeconfig_path.is_empty() {
            return Err(Error::config_for_field(
                "kubeconfigPath",
                "kubeconfig not found",
            ));
        }
        if self.load_balancer.creation_poll_interval == 0 {
            return Err(Error::config_for_field(
                "loadBalancer.creationPollInterval",
                "must be a positive number of seconds",
            ));
        }
        if self.load_balancer.creation_poll_timeout == 0 {
            return Err(Error::config_for_field(
                "loadBalancer.creationPollTimeout",
                "must be a positive number of seconds",
            ));
        }
        Ok(())
    }
}
