//! per-host-subnet daemon entry point.

use std::sync::Arc;

use log::{error, info};
use tokio::signal;
use tokio::task::JoinHandle;

mod config;
mod decode;
mod diff;
mod error;
mod exec;
mod ipset;
mod metadata;
mod ports;
#[cfg(any(windows, test))]
mod powershell;
mod reconcile;
mod route;
mod topology;
mod types;

use config::{Config, RouteProvider};
use exec::{CommandRunner, SystemRunner};
use ipset::{HostNatIpSet, IpSetTool};
use metadata::{HttpMetadataClient, MetadataClient};
use ports::HostPorts;
use reconcile::watch;
use route::{HostGw, PlatformRouteTable};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let cfg = Config::load()?;

    // Initialize logging
    let default_level = if cfg.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
    info!("Starting per-host-subnet with config: {:?}", cfg);

    let client: Arc<dyn MetadataClient> = Arc::new(HttpMetadataClient::new(cfg.metadata_url())?);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(cfg.command_timeout()));
    let check_interval = cfg.change_check_interval();
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    // Route updates
    if cfg.enable_route_update {
        match cfg.route_update_provider {
            RouteProvider::HostGw => {
                let table = PlatformRouteTable::new(runner.clone());
                let hostgw = HostGw::new(client.clone(), table, cfg.labels.clone());
                handles.push(tokio::spawn(watch(
                    client.clone(),
                    check_interval,
                    None,
                    hostgw,
                )));
            }
        }
    }

    // NAT exemption ipset
    if cfg.enable_host_nat_ipset {
        let set = IpSetTool::new(runner.clone(), cfg.ipset_name.clone());
        let ipset = HostNatIpSet::new(client.clone(), set, cfg.labels.clone());
        handles.push(tokio::spawn(watch(
            client.clone(),
            check_interval,
            None,
            ipset,
        )));
    }

    // Host port mappings
    if cfg.enable_host_ports {
        let table = port_mapping_table(&cfg, client.as_ref(), runner.clone()).await?;
        let ports = HostPorts::new(
            client.clone(),
            table,
            cfg.port_mapping_network.clone(),
            cfg.reapply_interval(),
        );
        handles.push(tokio::spawn(watch(
            client.clone(),
            check_interval,
            Some(cfg.reapply_interval()),
            ports,
        )));
    }

    if handles.is_empty() {
        info!("No resources enabled, nothing to do");
        return Ok(());
    }

    // Graceful Shutdown
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down...");
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    for handle in handles {
        handle.abort();
    }

    info!("Shutdown complete.");
    Ok(())
}

#[cfg(not(windows))]
async fn port_mapping_table(
    cfg: &Config,
    _client: &dyn MetadataClient,
    runner: Arc<dyn CommandRunner>,
) -> anyhow::Result<ports::IptablesPortMappings> {
    Ok(ports::IptablesPortMappings::new(runner, cfg.nat_chain.clone()))
}

#[cfg(windows)]
async fn port_mapping_table(
    cfg: &Config,
    client: &dyn MetadataClient,
    runner: Arc<dyn CommandRunner>,
) -> anyhow::Result<ports::NetNatPortMappings> {
    let nat_name = match &cfg.nat_name {
        Some(name) => name.clone(),
        None => client
            .get_self_host()
            .await?
            .labels
            .get(&cfg.labels.nat_adapter)
            .cloned()
            .unwrap_or_else(|| cfg.port_mapping_network.clone()),
    };
    info!("Using NAT {} for host port mappings", nat_name);
    Ok(ports::NetNatPortMappings::new(runner, nat_name))
}
