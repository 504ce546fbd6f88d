//! Topology records read from the cluster metadata service.
//!
//! These types mirror the JSON documents served by the metadata API.
//! They are produced fresh on every read and never mutated in place;
//! hosts are compared by UUID and by label values only.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

use crate::config::LabelKeys;
use crate::error::{Error, Result};

/// A cluster host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Host {
    pub uuid: String,
    pub name: String,
    pub agent_ip: String,
    #[serde(deserialize_with = "null_as_default")]
    pub labels: HashMap<String, String>,
}

impl Host {
    /// The override agent IP label if present, otherwise the raw agent IP.
    pub fn effective_agent_ip<'a>(&'a self, keys: &LabelKeys) -> &'a str {
        self.labels
            .get(&keys.override_agent_ip)
            .map(String::as_str)
            .unwrap_or(&self.agent_ip)
    }

    /// Effective agent IP parsed as an IPv4 address.
    pub fn effective_agent_addr(&self, keys: &LabelKeys) -> Result<Ipv4Addr> {
        let raw = self.effective_agent_ip(keys);
        raw.parse().map_err(|_| Error::InvalidAddress {
            host: self.uuid.clone(),
            value: raw.to_string(),
        })
    }

    /// Raw per-host subnet label.
    pub fn subnet_label<'a>(&'a self, keys: &LabelKeys) -> Option<&'a str> {
        self.labels.get(&keys.subnet).map(String::as_str)
    }

    /// Per-host subnet parsed as a CIDR and normalised to its network address.
    /// A missing or malformed label is an error.
    pub fn subnet(&self, keys: &LabelKeys) -> Result<Ipv4Network> {
        let raw = self.subnet_label(keys).ok_or_else(|| Error::MissingLabel {
            host: self.uuid.clone(),
            label: keys.subnet.clone(),
        })?;
        let net: Ipv4Network = raw.parse().map_err(|_| Error::InvalidSubnet {
            host: self.uuid.clone(),
            value: raw.to_string(),
        })?;
        Ipv4Network::new(net.network(), net.prefix()).map_err(|_| Error::InvalidSubnet {
            host: self.uuid.clone(),
            value: raw.to_string(),
        })
    }

    /// Router IP label parsed as an IPv4 address.
    #[cfg(any(windows, test))]
    pub fn router_ip(&self, keys: &LabelKeys) -> Result<Ipv4Addr> {
        let raw = self
            .labels
            .get(&keys.router_ip)
            .ok_or_else(|| Error::MissingLabel {
                host: self.uuid.clone(),
                label: keys.router_ip.clone(),
            })?;
        raw.parse().map_err(|_| Error::InvalidAddress {
            host: self.uuid.clone(),
            value: raw.clone(),
        })
    }
}

/// A cluster network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Network {
    pub name: String,
    pub uuid: String,
}

/// Container lifecycle state as reported by the metadata service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Starting,
    Stopping,
    #[default]
    #[serde(other)]
    Other,
}

impl ContainerState {
    /// States whose port mappings should be present on the host.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ContainerState::Running | ContainerState::Starting | ContainerState::Stopping
        )
    }
}

/// A container scheduled somewhere in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub external_id: String,
    pub host_uuid: String,
    pub network_uuid: String,
    pub state: ContainerState,
    pub primary_ip: String,
    /// Port specs in `sourceIP:sourcePort:targetPort[/protocol]` form.
    #[serde(deserialize_with = "null_as_default")]
    pub ports: Vec<String>,
}

// The metadata service renders empty collections as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn host(uuid: &str, agent_ip: &str, labels: &[(&str, &str)]) -> Host {
        Host {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            agent_ip: agent_ip.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}
