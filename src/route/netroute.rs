//! Windows route table driven through the NetTCPIP cmdlets.
//!
//! Routes are bound to the single interface carrying the host's router IP,
//! so the scope resolution step looks that interface up on every pass.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::debug;

use super::{RouteEntry, RouteScope, RouteTable};
use crate::config::LabelKeys;
use crate::decode::Record;
use crate::error::{Error, Result};
use crate::exec::CommandRunner;
use crate::powershell::{self, quote, Param};
use crate::types::Host;

const NEW_ROUTE_PARAMS: &[Param<RouteEntry>] = &[
    Param {
        name: "DestinationPrefix",
        value: |r| Some(r.destination.to_string()),
        required: true,
    },
    Param {
        name: "NextHop",
        value: |r| Some(r.gateway.to_string()),
        required: true,
    },
    Param {
        name: "InterfaceIndex",
        value: |r| r.interface_index.map(|i| i.to_string()),
        required: true,
    },
];

pub struct NetRouteTable {
    runner: Arc<dyn CommandRunner>,
}

impl NetRouteTable {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Indices of the interfaces that carry `address`.
    async fn interfaces_with_address(&self, address: Ipv4Addr) -> Result<BTreeSet<u32>> {
        let records = powershell::query(
            self.runner.as_ref(),
            "Get-NetIPAddress -AddressFamily IPv4 -ErrorAction Ignore | Format-List *",
        )
        .await?;
        let mut found = BTreeSet::new();
        for record in records {
            let matches = record
                .get("IPAddress")
                .and_then(|a| a.parse::<Ipv4Addr>().ok())
                .is_some_and(|a| a == address);
            if matches {
                found.insert(record.parse::<u32>("InterfaceIndex")?);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl RouteTable for NetRouteTable {
    async fn scope(&self, self_host: &Host, labels: &LabelKeys) -> Result<RouteScope> {
        let router_ip = self_host.router_ip(labels)?;
        let interfaces = self.interfaces_with_address(router_ip).await?;
        if interfaces.len() != 1 {
            return Err(Error::AmbiguousInterface {
                address: router_ip.to_string(),
                found: interfaces.len(),
            });
        }
        let interface_index = interfaces.into_iter().next();
        debug!("hostgw: router ip {} is on interface {:?}", router_ip, interface_index);
        Ok(RouteScope {
            source: self_host.effective_agent_addr(labels)?,
            router_ip: Some(router_ip),
            interface_index,
        })
    }

    async fn list(&self, scope: &RouteScope) -> Result<Vec<RouteEntry>> {
        let script = match scope.interface_index {
            Some(index) => format!(
                "Get-NetRoute -AddressFamily IPv4 -InterfaceIndex {index} -ErrorAction Ignore | Format-List *"
            ),
            None => "Get-NetRoute -AddressFamily IPv4 -ErrorAction Ignore | Format-List *".to_string(),
        };
        let records = powershell::query(self.runner.as_ref(), &script).await?;
        let mut routes = Vec::new();
        for record in &records {
            if let Some(route) = route_from_record(record)? {
                if scope.interface_index.map_or(true, |i| route.interface_index == Some(i)) {
                    routes.push(route);
                }
            }
        }
        Ok(routes)
    }

    async fn add(&self, route: &RouteEntry) -> Result<()> {
        let params = powershell::render(NEW_ROUTE_PARAMS, route)?;
        let script = format!("New-NetRoute{params} -Confirm:$false | Format-List *");
        powershell::query(self.runner.as_ref(), &script)
            .await
            .map(|_| ())
    }

    async fn delete(&self, route: &RouteEntry) -> Result<()> {
        let script = format!(
            "Get-NetRoute -DestinationPrefix {} -ErrorAction Stop | Remove-NetRoute -Confirm:$false",
            quote(&route.destination.to_string())
        );
        powershell::exec_silent(self.runner.as_ref(), &script).await
    }
}

/// Decodes one `Get-NetRoute` record. Non-IPv4 rows yield `None`.
fn route_from_record(record: &Record) -> Result<Option<RouteEntry>> {
    if record.get("AddressFamily").is_some_and(|f| f != "IPv4") {
        return Ok(None);
    }
    let destination: Ipv4Network = match record.require("DestinationPrefix")?.parse() {
        Ok(net) => net,
        Err(_) => return Ok(None),
    };
    let gateway = match record.get("NextHop").map(str::parse::<Ipv4Addr>) {
        Some(Ok(gw)) => gw,
        _ => return Ok(None),
    };
    Ok(Some(RouteEntry {
        destination,
        gateway,
        source: None,
        interface_index: Some(record.parse("InterfaceIndex")?),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;
    use crate::types::fixtures::host;

    const ADDRESSES: &str = "
IPAddress         : 172.16.0.10
InterfaceIndex    : 7
InterfaceAlias    : Ethernet
AddressFamily     : IPv4

IPAddress         : 127.0.0.1
InterfaceIndex    : 1
InterfaceAlias    : Loopback Pseudo-Interface 1
AddressFamily     : IPv4
";

    const ROUTES: &str = "
DestinationPrefix : 10.42.2.0/24
NextHop           : 172.16.0.12
InterfaceIndex    : 7
AddressFamily     : IPv4

DestinationPrefix : 10.42.9.0/24
NextHop           : 172.16.0.19
InterfaceIndex    : 9
AddressFamily     : IPv4

DestinationPrefix : fe80::/64
NextHop           : ::
InterfaceIndex    : 7
AddressFamily     : IPv6
";

    fn self_host(keys: &LabelKeys) -> Host {
        host("h1", "172.16.0.10", &[(keys.router_ip.as_str(), "172.16.0.10")])
    }

    #[tokio::test]
    async fn resolves_interface_carrying_router_ip() {
        let keys = LabelKeys::default();
        let runner = Arc::new(FakeRunner::default());
        runner.respond("powershell", Ok(ADDRESSES.into()));
        let table = NetRouteTable::new(runner);

        let scope = table.scope(&self_host(&keys), &keys).await.unwrap();
        assert_eq!(scope.interface_index, Some(7));
        assert_eq!(scope.router_ip, Some("172.16.0.10".parse().unwrap()));
    }

    #[tokio::test]
    async fn ambiguous_or_missing_interface_fails() {
        let keys = LabelKeys::default();
        let runner = Arc::new(FakeRunner::default());
        let doubled = format!("{ADDRESSES}\nIPAddress : 172.16.0.10\nInterfaceIndex : 12\n");
        runner.respond("powershell", Ok(doubled));
        runner.respond("powershell", Ok(String::new()));
        let table = NetRouteTable::new(runner);

        let err = table.scope(&self_host(&keys), &keys).await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousInterface { found: 2, .. }));
        let err = table.scope(&self_host(&keys), &keys).await.unwrap_err();
        assert!(matches!(err, Error::AmbiguousInterface { found: 0, .. }));
    }

    #[tokio::test]
    async fn missing_router_label_fails() {
        let keys = LabelKeys::default();
        let table = NetRouteTable::new(Arc::new(FakeRunner::default()));
        let err = table
            .scope(&host("h1", "172.16.0.10", &[]), &keys)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingLabel { .. }));
    }

    #[tokio::test]
    async fn lists_ipv4_routes_on_the_scoped_interface() {
        let runner = Arc::new(FakeRunner::default());
        runner.respond("powershell", Ok(ROUTES.into()));
        let table = NetRouteTable::new(runner);
        let scope = RouteScope {
            source: "172.16.0.10".parse().unwrap(),
            router_ip: Some("172.16.0.10".parse().unwrap()),
            interface_index: Some(7),
        };

        let routes = table.list(&scope).await.unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway, "172.16.0.12".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn add_renders_new_netroute_parameters() {
        let runner = Arc::new(FakeRunner::default());
        let table = NetRouteTable::new(runner.clone());
        let route = RouteEntry {
            destination: "10.42.3.0/24".parse().unwrap(),
            gateway: "172.16.0.13".parse().unwrap(),
            source: None,
            interface_index: Some(7),
        };
        table.add(&route).await.unwrap();
        table.delete(&route).await.unwrap();

        let calls = runner.calls();
        assert!(calls[0].ends_with(
            "New-NetRoute -DestinationPrefix '10.42.3.0/24' -NextHop '172.16.0.13' \
             -InterfaceIndex '7' -Confirm:$false | Format-List *"
        ));
        assert!(calls[1].contains("Get-NetRoute -DestinationPrefix '10.42.3.0/24'"));

        let unbound = RouteEntry {
            interface_index: None,
            ..route
        };
        assert!(table.add(&unbound).await.is_err());
    }
}
