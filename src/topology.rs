//! Point-in-time views of the cluster topology.
//!
//! Each reconciliation pass fetches a fresh snapshot; nothing is cached
//! between calls.

use crate::error::{Error, Result};
use crate::metadata::MetadataClient;
use crate::types::{Container, Host, Network};

/// The local host plus every host in the cluster.
#[derive(Debug, Clone)]
pub struct HostTopology {
    pub self_host: Host,
    pub hosts: Vec<Host>,
}

impl HostTopology {
    pub async fn fetch(client: &dyn MetadataClient) -> Result<Self> {
        let self_host = client.get_self_host().await?;
        let hosts = client.get_hosts().await?;
        Ok(Self { self_host, hosts })
    }

    /// Every host other than the local one.
    pub fn peers(&self) -> impl Iterator<Item = &Host> {
        self.hosts
            .iter()
            .filter(move |h| h.uuid != self.self_host.uuid)
    }
}

/// The local host with the networks and containers of the cluster.
#[derive(Debug, Clone)]
pub struct ContainerTopology {
    pub self_host: Host,
    pub networks: Vec<Network>,
    pub containers: Vec<Container>,
}

impl ContainerTopology {
    pub async fn fetch(client: &dyn MetadataClient) -> Result<Self> {
        let self_host = client.get_self_host().await?;
        let networks = client.get_networks().await?;
        let containers = client.get_containers().await?;
        Ok(Self {
            self_host,
            networks,
            containers,
        })
    }

    /// UUID of the network called `name`.
    pub fn network_uuid(&self, name: &str) -> Result<&str> {
        self.networks
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.uuid.as_str())
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    /// Containers scheduled on the local host and attached to `network_uuid`.
    pub fn local_containers<'a>(
        &'a self,
        network_uuid: &'a str,
    ) -> impl Iterator<Item = &'a Container> + 'a {
        self.containers.iter().filter(move |c| {
            c.host_uuid == self.self_host.uuid && c.network_uuid == network_uuid
        })
    }
}
