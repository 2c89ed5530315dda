//! Per-network settings delivered to the cloud and the agent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Settings for one network interface of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSetting {
    pub ip: String,
    pub netmask: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub cloud_properties: serde_json::Value,
    /// Which defaults (`dns`, `gateway`) this network provides.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub default: Vec<String>,
}

/// Network settings keyed by network name.
pub type NetworkSettings = BTreeMap<String, NetworkSetting>;
