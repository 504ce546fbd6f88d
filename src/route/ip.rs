//! Kernel route table driven through iproute2.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::debug;
use serde::Deserialize;

use super::{RouteEntry, RouteScope, RouteTable};
use crate::error::{Error, Result};
use crate::exec::CommandRunner;

/// One object of `ip -j route` output.
#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    #[serde(default)]
    gateway: Option<String>,
    #[serde(default)]
    prefsrc: Option<String>,
}

impl IpRoute {
    /// Converts to a [`RouteEntry`]; routes without a usable IPv4 gateway
    /// are not host gateway routes and yield `None`.
    fn into_entry(self) -> Result<Option<RouteEntry>> {
        let destination: Ipv4Network = match self.dst.as_str() {
            "default" => Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
                .map_err(|e| Error::decode("ip route", e))?,
            dst => dst
                .parse()
                .map_err(|e| Error::decode("ip route", format!("destination {dst:?}: {e}")))?,
        };
        let Some(gateway) = self.gateway.and_then(|g| g.parse().ok()) else {
            return Ok(None);
        };
        Ok(Some(RouteEntry {
            destination,
            gateway,
            source: self.prefsrc.and_then(|s| s.parse().ok()),
            interface_index: None,
        }))
    }
}

pub struct IpRouteTable {
    runner: Arc<dyn CommandRunner>,
}

impl IpRouteTable {
    const PROGRAM: &'static str = "ip";

    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl RouteTable for IpRouteTable {
    async fn list(&self, scope: &RouteScope) -> Result<Vec<RouteEntry>> {
        let out = self
            .runner
            .run(
                Self::PROGRAM,
                &[
                    "-4".into(),
                    "-j".into(),
                    "route".into(),
                    "show".into(),
                    "src".into(),
                    scope.source.to_string(),
                ],
            )
            .await?;
        let routes = parse_routes(&out)?;
        debug!("hostgw: {} kernel routes with source {}", routes.len(), scope.source);
        Ok(routes
            .into_iter()
            .filter(|r| r.source.map_or(true, |s| s == scope.source))
            .collect())
    }

    async fn add(&self, route: &RouteEntry) -> Result<()> {
        let mut args = vec![
            "-4".to_string(),
            "route".into(),
            "add".into(),
            route.destination.to_string(),
            "via".into(),
            route.gateway.to_string(),
        ];
        if let Some(src) = route.source {
            args.extend(["src".to_string(), src.to_string()]);
        }
        self.runner.run(Self::PROGRAM, &args).await.map(|_| ())
    }

    async fn delete(&self, route: &RouteEntry) -> Result<()> {
        self.runner
            .run(
                Self::PROGRAM,
                &[
                    "-4".into(),
                    "route".into(),
                    "del".into(),
                    route.destination.to_string(),
                ],
            )
            .await
            .map(|_| ())
    }
}

fn parse_routes(out: &str) -> Result<Vec<RouteEntry>> {
    if out.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<IpRoute> = serde_json::from_str(out).map_err(|e| Error::decode("ip route", e))?;
    let mut routes = Vec::with_capacity(raw.len());
    for r in raw {
        if let Some(entry) = r.into_entry()? {
            routes.push(entry);
        }
    }
    Ok(routes)
}
