use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host label keys the daemon reads its per-host configuration from.
///
/// Built once at startup and handed to every resource component.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LabelKeys {
    pub subnet: String,
    pub override_agent_ip: String,
    pub router_ip: String,
    pub nat_adapter: String,
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self {
            subnet: "io.rancher.network.per_host_subnet.subnet".into(),
            override_agent_ip: "io.rancher.network.per_host_subnet.override_agent_ip".into(),
            router_ip: "io.rancher.network.per_host_subnet.router_ip".into(),
            nat_adapter: "io.rancher.network.per_host_subnet.nat_adapter".into(),
        }
    }
}

/// Route update providers known to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteProvider {
    /// Host gateway routing: one route per peer host via its agent IP.
    HostGw,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub debug: bool,
    pub metadata_address: String,
    pub metadata_version: String,
    pub enable_route_update: bool,
    pub route_update_provider: RouteProvider,
    pub enable_host_nat_ipset: bool,
    pub enable_host_ports: bool,
    pub ipset_name: String,
    pub change_check_interval_secs: u64,
    pub reapply_interval_secs: u64,
    pub command_timeout_secs: u64,
    pub port_mapping_network: String,
    pub nat_chain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nat_name: Option<String>,
    pub labels: LabelKeys,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            metadata_address: "169.254.169.250".into(),
            metadata_version: "2016-07-29".into(),
            enable_route_update: false,
            route_update_provider: RouteProvider::HostGw,
            enable_host_nat_ipset: !cfg!(windows),
            enable_host_ports: cfg!(windows),
            ipset_name: "RANCHER_DISABLE_HOST_NAT_IPSET".into(),
            change_check_interval_secs: 5,
            reapply_interval_secs: 300,
            command_timeout_secs: 30,
            port_mapping_network: "transparent".into(),
            nat_chain: "PER-HOST-SUBNET-PORTS".into(),
            nat_name: None,
            labels: LabelKeys::default(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("per-host-subnet.toml"))
            .merge(Json::file("per-host-subnet.json"))
            .merge(Env::prefixed("RANCHER_").split("__"))
    }

    pub fn metadata_url(&self) -> String {
        format!(
            "http://{}/{}",
            self.metadata_address.trim_end_matches('/'),
            self.metadata_version
        )
    }

    pub fn change_check_interval(&self) -> Duration {
        Duration::from_secs(self.change_check_interval_secs.max(1))
    }

    pub fn reapply_interval(&self) -> Duration {
        Duration::from_secs(self.reapply_interval_secs.max(1))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }
}
