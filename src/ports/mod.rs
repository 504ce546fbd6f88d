//! Host port mappings for containers on the per-host subnet network.
//!
//! Port mappings are not diffed: the OS cannot tell which container a
//! mapping belongs to, so a pass that decides to apply flushes the whole
//! table and recreates every rule. A pass applies when the computed rule
//! set differs from the last applied one, or when the last apply is older
//! than the reapply interval.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::error::{AggregateError, Operation, Result};
use crate::metadata::MetadataClient;
use crate::reconcile::{Reconciler, Trigger};
use crate::topology::ContainerTopology;

#[cfg(any(not(windows), test))]
pub mod iptables;
#[cfg(any(windows, test))]
pub mod netnat;

#[cfg(any(not(windows), test))]
pub use iptables::IptablesPortMappings;
#[cfg(any(windows, test))]
pub use netnat::NetNatPortMappings;

const DEFAULT_PROTOCOL: &str = "tcp";

/// A single NAT port forwarding rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: String,
    pub external_ip: Ipv4Addr,
    pub external_port: u16,
    pub internal_ip: Ipv4Addr,
    pub internal_port: u16,
    /// Handle assigned by the NAT table, for mappings read back from it.
    #[cfg_attr(not(windows), allow(dead_code))]
    pub static_mapping_id: Option<u32>,
}

impl PortMapping {
    /// Identity of a mapping read back from the OS.
    pub fn external_key(&self) -> String {
        format!("{}:{}", self.external_ip, self.external_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}/{}",
            self.external_ip, self.external_port, self.internal_ip, self.internal_port, self.protocol
        )
    }
}

/// Platform NAT table.
#[async_trait]
pub trait PortMappingTable: Send + Sync {
    /// Prepares the table before it is listed. Defaults to nothing.
    async fn ensure(&self) -> Result<()> {
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PortMapping>>;
    async fn delete(&self, mapping: &PortMapping) -> Result<()>;
    async fn create(&self, mapping: &PortMapping) -> Result<()>;
}

/// Parses a `sourceIP:sourcePort:targetPort[/protocol]` spec for a container
/// reachable at `internal_ip`.
///
/// Specs without exactly three segments are not rules and yield `None`.
/// Unparsable ports and addresses degrade to zero.
pub fn parse_port_rule(internal_ip: &str, spec: &str) -> Option<PortMapping> {
    let parts: Vec<&str> = spec.split(':').collect();
    let [source_ip, source_port, target] = parts.as_slice() else {
        warn!("hostports: ignoring malformed port spec {:?}", spec);
        return None;
    };

    let (target_port, protocol) = match target.split_once('/') {
        Some((port, proto)) => (port, proto.to_ascii_lowercase()),
        None => (*target, DEFAULT_PROTOCOL.to_string()),
    };

    Some(PortMapping {
        protocol,
        external_ip: parse_or(source_ip, Ipv4Addr::UNSPECIFIED, spec),
        external_port: parse_or(source_port, 0, spec),
        internal_ip: parse_or(internal_ip, Ipv4Addr::UNSPECIFIED, spec),
        internal_port: parse_or(target_port, 0, spec),
        static_mapping_id: None,
    })
}

fn parse_or<T>(raw: &str, zero: T, spec: &str) -> T
where
    T: std::str::FromStr + fmt::Display,
{
    raw.parse().unwrap_or_else(|_| {
        warn!("hostports: invalid value {:?} in port spec {:?}, using {}", raw, spec, zero);
        zero
    })
}

/// Rules for every active container of the local host on `network_name`,
/// keyed by `externalId/spec`.
pub fn desired_rules(
    topology: &ContainerTopology,
    network_name: &str,
) -> Result<HashMap<String, PortMapping>> {
    let network_uuid = topology.network_uuid(network_name)?;
    let mut rules = HashMap::new();
    for container in topology.local_containers(network_uuid) {
        if !container.state.is_active() {
            continue;
        }
        for spec in &container.ports {
            if let Some(rule) = parse_port_rule(&container.primary_ip, spec) {
                rules.insert(format!("{}/{}", container.external_id, spec), rule);
            }
        }
    }
    Ok(rules)
}

/// Reconciles host port mappings.
pub struct HostPorts<T> {
    client: Arc<dyn MetadataClient>,
    table: T,
    network_name: String,
    reapply_every: Duration,
    applied: HashMap<String, PortMapping>,
    last_applied: Option<Instant>,
}

impl<T: PortMappingTable> HostPorts<T> {
    pub fn new(
        client: Arc<dyn MetadataClient>,
        table: T,
        network_name: impl Into<String>,
        reapply_every: Duration,
    ) -> Self {
        Self {
            client,
            table,
            network_name: network_name.into(),
            reapply_every,
            applied: HashMap::new(),
            last_applied: None,
        }
    }

    /// Whether `rules` should be applied at `now`.
    pub fn needs_apply(&self, rules: &HashMap<String, PortMapping>, now: Instant) -> bool {
        match self.last_applied {
            None => true,
            Some(_) if self.applied != *rules => true,
            Some(at) => now.saturating_duration_since(at) >= self.reapply_every,
        }
    }

    /// Flushes the NAT table and recreates `rules`.
    ///
    /// `rules` is recorded as applied once the mutation phase has run, even
    /// if some deletes or creates failed.
    async fn apply(&mut self, rules: HashMap<String, PortMapping>, started: Instant) -> Result<()> {
        self.table.ensure().await?;
        let existing = self.table.list().await?;
        debug!(
            "hostports: flushing {} existing mappings: {:?}",
            existing.len(),
            existing.iter().map(PortMapping::external_key).collect::<Vec<_>>()
        );

        let mut failures = AggregateError::default();
        for mapping in &existing {
            if let Err(e) = self.table.delete(mapping).await {
                failures.push(mapping.external_key(), Operation::Remove, e);
            }
        }

        let mut ordered: Vec<(&String, &PortMapping)> = rules.iter().collect();
        ordered.sort_by(|a, b| a.0.cmp(b.0));
        for (key, mapping) in ordered {
            info!("hostports: creating {} for {}", mapping, key);
            if let Err(e) = self.table.create(mapping).await {
                failures.push(key.clone(), Operation::Add, e);
            }
        }

        self.applied = rules;
        self.last_applied = Some(started);
        failures.into_result()
    }
}

#[async_trait]
impl<T: PortMappingTable> Reconciler for HostPorts<T> {
    fn name(&self) -> &'static str {
        "hostports"
    }

    async fn reconcile(&mut self, _trigger: &Trigger) -> Result<()> {
        let started = Instant::now();
        debug!("hostports: creating rule set");
        let topology = ContainerTopology::fetch(self.client.as_ref()).await?;
        let rules = desired_rules(&topology, &self.network_name)?;
        debug!("hostports: generated {} rules", rules.len());

        if !self.needs_apply(&rules, started) {
            return Ok(());
        }
        if self.applied != rules {
            info!("hostports: applying new rules");
        } else {
            info!("hostports: reapplying rules");
        }
        self.apply(rules, started).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::Error;
    use crate::metadata::fake::FakeMetadata;
    use crate::types::fixtures::host;
    use crate::types::{Container, ContainerState, Network};

    fn mapping(ext: &str, ext_port: u16, int: &str, int_port: u16, proto: &str) -> PortMapping {
        PortMapping {
            protocol: proto.to_string(),
            external_ip: ext.parse().unwrap(),
            external_port: ext_port,
            internal_ip: int.parse().unwrap(),
            internal_port: int_port,
            static_mapping_id: None,
        }
    }

    #[test]
    fn parses_port_specs() {
        assert_eq!(
            parse_port_rule("172.17.0.2", "10.0.0.1:8080:80"),
            Some(mapping("10.0.0.1", 8080, "172.17.0.2", 80, "tcp"))
        );
        assert_eq!(
            parse_port_rule("172.17.0.2", "10.0.0.1:8080:80/udp"),
            Some(mapping("10.0.0.1", 8080, "172.17.0.2", 80, "udp"))
        );
        assert_eq!(parse_port_rule("172.17.0.2", "bad:spec"), None);
        assert_eq!(parse_port_rule("172.17.0.2", "a:b:c:d"), None);
    }

    #[test]
    fn unparsable_ports_degrade_to_zero() {
        let rule = parse_port_rule("172.17.0.2", "10.0.0.1:http:99999").unwrap();
        assert_eq!(rule.external_port, 0);
        assert_eq!(rule.internal_port, 0);
    }

    #[test]
    fn rule_sets_compare_by_content() {
        let a: HashMap<String, PortMapping> = [
            ("c1/x".to_string(), mapping("0.0.0.0", 80, "10.0.0.2", 8080, "tcp")),
            ("c2/y".to_string(), mapping("0.0.0.0", 81, "10.0.0.3", 8081, "tcp")),
        ]
        .into_iter()
        .collect();
        let mut entries: Vec<(String, PortMapping)> =
            a.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.reverse();
        let b: HashMap<String, PortMapping> = entries.into_iter().collect();
        assert_eq!(a, b);

        let mut c = b.clone();
        c.get_mut("c1/x").unwrap().internal_port = 9090;
        assert_ne!(a, c);
    }

    #[derive(Default)]
    struct MemoryNat {
        mappings: Mutex<Vec<PortMapping>>,
        ops: Mutex<Vec<String>>,
        fail_create: bool,
    }

    #[async_trait]
    impl PortMappingTable for MemoryNat {
        async fn list(&self) -> Result<Vec<PortMapping>> {
            Ok(self.mappings.lock().unwrap().clone())
        }

        async fn delete(&self, mapping: &PortMapping) -> Result<()> {
            self.ops.lock().unwrap().push(format!("delete {mapping}"));
            self.mappings.lock().unwrap().retain(|m| m != mapping);
            Ok(())
        }

        async fn create(&self, mapping: &PortMapping) -> Result<()> {
            self.ops.lock().unwrap().push(format!("create {mapping}"));
            if self.fail_create {
                return Err(Error::Command {
                    command: "create".into(),
                    message: "denied".into(),
                });
            }
            self.mappings.lock().unwrap().push(mapping.clone());
            Ok(())
        }
    }

    fn cluster() -> FakeMetadata {
        let me = host("h1", "1.1.1.1", &[]);
        let container = |id: &str, host: &str, net: &str, state: ContainerState, ports: &[&str]| {
            Container {
                external_id: id.into(),
                host_uuid: host.into(),
                network_uuid: net.into(),
                state,
                primary_ip: "10.0.1.5".into(),
                ports: ports.iter().map(|p| p.to_string()).collect(),
            }
        };
        FakeMetadata {
            self_host: me,
            networks: vec![
                Network {
                    name: "transparent".into(),
                    uuid: "n-phs".into(),
                },
                Network {
                    name: "managed".into(),
                    uuid: "n-managed".into(),
                },
            ],
            containers: vec![
                container("web", "h1", "n-phs", ContainerState::Running, &["0.0.0.0:80:8080", "bad"]),
                container("db", "h1", "n-phs", ContainerState::Other, &["0.0.0.0:5432:5432"]),
                container("other-host", "h2", "n-phs", ContainerState::Running, &["0.0.0.0:81:80"]),
                container("other-net", "h1", "n-managed", ContainerState::Running, &["0.0.0.0:82:80"]),
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn desired_rules_keep_active_local_containers_only() {
        let topo = ContainerTopology::fetch(&cluster()).await.unwrap();
        let rules = desired_rules(&topo, "transparent").unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules["web/0.0.0.0:80:8080"],
            mapping("0.0.0.0", 80, "10.0.1.5", 8080, "tcp")
        );

        assert!(matches!(
            desired_rules(&topo, "missing"),
            Err(Error::NetworkNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn applies_on_change_and_reapplies_after_interval() {
        let stale = mapping("0.0.0.0", 9999, "10.0.9.9", 9999, "tcp");
        let nat = MemoryNat::default();
        nat.mappings.lock().unwrap().push(stale.clone());
        let mut ports = HostPorts::new(Arc::new(cluster()), nat, "transparent", Duration::from_secs(300));

        ports.reconcile(&Trigger::Changed("1".into())).await.unwrap();
        assert_eq!(
            *ports.table.ops.lock().unwrap(),
            vec![format!("delete {stale}"), "create 0.0.0.0:80 -> 10.0.1.5:8080/tcp".to_string()]
        );

        // Unchanged rules inside the interval: nothing to do.
        tokio::time::advance(Duration::from_secs(60)).await;
        ports.reconcile(&Trigger::Resync).await.unwrap();
        assert_eq!(ports.table.ops.lock().unwrap().len(), 2);

        // Unchanged rules past the interval: full reapply.
        tokio::time::advance(Duration::from_secs(300)).await;
        ports.reconcile(&Trigger::Resync).await.unwrap();
        assert_eq!(ports.table.ops.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creates_still_record_applied_rules() {
        let nat = MemoryNat {
            fail_create: true,
            ..Default::default()
        };
        let mut ports = HostPorts::new(Arc::new(cluster()), nat, "transparent", Duration::from_secs(300));

        let err = ports.reconcile(&Trigger::Resync).await.unwrap_err();
        assert!(matches!(err, Error::Partial(_)));
        assert_eq!(ports.applied.len(), 1);
        assert!(!ports.needs_apply(&ports.applied.clone(), Instant::now()));
    }
}
