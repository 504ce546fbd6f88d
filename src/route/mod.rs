//! Host gateway routing.
//!
//! Every peer host gets one route: its subnet via its agent IP. Routes
//! already in the table are matched by gateway (qualified by destination,
//! so a peer whose subnet moved is replaced) and only the difference is
//! applied.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::{debug, info};

use crate::config::LabelKeys;
use crate::diff::diff;
use crate::error::{AggregateError, Operation, Result};
use crate::metadata::MetadataClient;
use crate::reconcile::{Reconciler, Trigger};
use crate::topology::HostTopology;
use crate::types::Host;

#[cfg(any(not(windows), test))]
pub mod ip;
#[cfg(any(windows, test))]
pub mod netroute;

#[cfg(any(not(windows), test))]
pub use ip::IpRouteTable;
#[cfg(any(windows, test))]
pub use netroute::NetRouteTable;

/// Route table implementation for the platform the daemon is built for.
#[cfg(windows)]
pub type PlatformRouteTable = NetRouteTable;
#[cfg(not(windows))]
pub type PlatformRouteTable = IpRouteTable;

/// An IPv4 route to a peer host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Network,
    pub gateway: Ipv4Addr,
    pub source: Option<Ipv4Addr>,
    #[cfg_attr(not(windows), allow(dead_code))]
    pub interface_index: Option<u32>,
}

/// Diff key of a route: its gateway, qualified by destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub gateway: Ipv4Addr,
    pub network: Ipv4Addr,
    pub prefix: u8,
}

impl RouteEntry {
    pub fn key(&self) -> RouteKey {
        RouteKey {
            gateway: self.gateway,
            network: self.destination.network(),
            prefix: self.destination.prefix(),
        }
    }
}

/// What part of the route table belongs to this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteScope {
    /// Effective agent IP of the local host.
    pub source: Ipv4Addr,
    /// Router IP, when routes are bound to the interface carrying it.
    pub router_ip: Option<Ipv4Addr>,
    pub interface_index: Option<u32>,
}

/// Platform route table.
#[async_trait]
pub trait RouteTable: Send + Sync {
    /// Works out the scope for `self_host`. Fails when the scope cannot be
    /// determined unambiguously.
    async fn scope(&self, self_host: &Host, labels: &LabelKeys) -> Result<RouteScope> {
        Ok(RouteScope {
            source: self_host.effective_agent_addr(labels)?,
            router_ip: None,
            interface_index: None,
        })
    }

    /// Routes within `scope`.
    async fn list(&self, scope: &RouteScope) -> Result<Vec<RouteEntry>>;
    async fn add(&self, route: &RouteEntry) -> Result<()>;
    /// Deletes the route to `route.destination`.
    async fn delete(&self, route: &RouteEntry) -> Result<()>;
}

/// Reconciles peer routes.
pub struct HostGw<T> {
    client: Arc<dyn MetadataClient>,
    table: T,
    labels: LabelKeys,
}

impl<T: RouteTable> HostGw<T> {
    pub fn new(client: Arc<dyn MetadataClient>, table: T, labels: LabelKeys) -> Self {
        Self {
            client,
            table,
            labels,
        }
    }

    async fn configure(&self, topology: &HostTopology) -> Result<()> {
        // Interface indices are not stable, resolve the scope every pass.
        let scope = self.table.scope(&topology.self_host, &self.labels).await?;
        let current = current_routes(self.table.list(&scope).await?, &scope);
        let desired = desired_routes(topology, &self.labels, &scope)?;
        let diff = diff(&current, &desired);
        debug!(
            "hostgw: {} current, {} desired, {} to add, {} to remove",
            current.len(),
            desired.len(),
            diff.to_add.len(),
            diff.to_remove.len()
        );
        if diff.is_empty() {
            return Ok(());
        }

        let mut failures = AggregateError::default();
        for route in diff.to_remove {
            info!("hostgw: deleting route {} via {}", route.destination, route.gateway);
            if let Err(e) = self.table.delete(&route).await {
                failures.push(route.destination.to_string(), Operation::Remove, e);
            }
        }
        for route in diff.to_add {
            info!("hostgw: adding route {} via {}", route.destination, route.gateway);
            if let Err(e) = self.table.add(&route).await {
                failures.push(route.destination.to_string(), Operation::Add, e);
            }
        }
        failures.into_result()
    }
}

#[async_trait]
impl<T: RouteTable> Reconciler for HostGw<T> {
    fn name(&self) -> &'static str {
        "hostgw"
    }

    async fn reconcile(&mut self, _trigger: &Trigger) -> Result<()> {
        debug!("HostGW: reload");
        let topology = HostTopology::fetch(self.client.as_ref()).await?;
        self.configure(&topology).await
    }
}

/// Keys the routes of `listed` that this daemon manages.
///
/// Routes covering the local source address or router IP are link routes
/// of the host itself, and routes without a next hop are default-route
/// artifacts; neither is touched.
pub fn current_routes(listed: Vec<RouteEntry>, scope: &RouteScope) -> HashMap<RouteKey, RouteEntry> {
    listed
        .into_iter()
        .filter(|r| !r.destination.contains(scope.source))
        .filter(|r| match scope.router_ip {
            Some(router) => !r.destination.contains(router),
            None => true,
        })
        .filter(|r| !r.gateway.is_unspecified())
        .map(|r| (r.key(), r))
        .collect()
}

/// One route per peer host. A peer with a missing or malformed subnet
/// label fails the whole computation.
pub fn desired_routes(
    topology: &HostTopology,
    labels: &LabelKeys,
    scope: &RouteScope,
) -> Result<HashMap<RouteKey, RouteEntry>> {
    let mut routes = HashMap::new();
    for peer in topology.peers() {
        let route = RouteEntry {
            destination: peer.subnet(labels)?,
            gateway: peer.effective_agent_addr(labels)?,
            source: Some(scope.source),
            interface_index: scope.interface_index,
        };
        routes.insert(route.key(), route);
    }
    Ok(routes)
}
