//! Host NAT exemption ipset.
//!
//! Keeps a `hash:net` set filled with the subnets of every peer host so
//! traffic between per-host subnets can bypass masquerading.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use log::{debug, info, warn};

use crate::config::LabelKeys;
use crate::decode::parse_members;
use crate::diff::diff_sets;
use crate::error::{AggregateError, Operation, Result};
use crate::exec::{args, CommandRunner};
use crate::metadata::MetadataClient;
use crate::reconcile::{Reconciler, Trigger};
use crate::topology::HostTopology;

/// A named kernel IP set.
#[async_trait]
pub trait IpSet: Send + Sync {
    /// Creates the set if it does not exist yet.
    async fn ensure(&self) -> Result<()>;
    async fn members(&self) -> Result<BTreeSet<String>>;
    /// Adds `entry`; already present entries are not an error.
    async fn add(&self, entry: &str) -> Result<()>;
    /// Removes `entry`; absent entries are not an error.
    async fn remove(&self, entry: &str) -> Result<()>;
}

/// [`IpSet`] backed by the `ipset` command line tool.
pub struct IpSetTool {
    runner: Arc<dyn CommandRunner>,
    name: String,
}

impl IpSetTool {
    const PROGRAM: &'static str = "ipset";

    pub fn new(runner: Arc<dyn CommandRunner>, name: impl Into<String>) -> Self {
        Self {
            runner,
            name: name.into(),
        }
    }
}

#[async_trait]
impl IpSet for IpSetTool {
    async fn ensure(&self) -> Result<()> {
        self.runner
            .run(
                Self::PROGRAM,
                &args(["create", self.name.as_str(), "hash:net", "--exist"]),
            )
            .await
            .map(|_| ())
    }

    async fn members(&self) -> Result<BTreeSet<String>> {
        let out = self
            .runner
            .run(Self::PROGRAM, &args(["list", "-o", "xml", self.name.as_str()]))
            .await?;
        parse_members(&out)
    }

    async fn add(&self, entry: &str) -> Result<()> {
        self.runner
            .run(Self::PROGRAM, &args(["add", self.name.as_str(), entry, "-exist"]))
            .await
            .map(|_| ())
    }

    async fn remove(&self, entry: &str) -> Result<()> {
        self.runner
            .run(Self::PROGRAM, &args(["del", self.name.as_str(), entry, "-exist"]))
            .await
            .map(|_| ())
    }
}

/// Reconciles the ipset against the subnets of peer hosts.
pub struct HostNatIpSet<S> {
    client: Arc<dyn MetadataClient>,
    set: S,
    labels: LabelKeys,
}

impl<S: IpSet> HostNatIpSet<S> {
    pub fn new(client: Arc<dyn MetadataClient>, set: S, labels: LabelKeys) -> Self {
        Self {
            client,
            set,
            labels,
        }
    }

    async fn refresh(&self, topology: &HostTopology) -> Result<()> {
        self.set.ensure().await?;
        let current: BTreeSet<String> = self
            .set
            .members()
            .await?
            .into_iter()
            .map(|m| canonical_entry(&m).unwrap_or(m))
            .collect();
        let desired = desired_entries(topology, &self.labels);
        let diff = diff_sets(&current, &desired);
        debug!(
            "ipset: {} current, {} desired, {} to add, {} to remove",
            current.len(),
            desired.len(),
            diff.to_add.len(),
            diff.to_remove.len()
        );
        if diff.is_empty() {
            return Ok(());
        }

        let mut failures = AggregateError::default();
        for entry in diff.to_remove {
            info!("ipset: removing {}", entry);
            if let Err(e) = self.set.remove(&entry).await {
                failures.push(entry, Operation::Remove, e);
            }
        }
        for entry in diff.to_add {
            info!("ipset: adding {}", entry);
            if let Err(e) = self.set.add(&entry).await {
                failures.push(entry, Operation::Add, e);
            }
        }
        failures.into_result()
    }
}

#[async_trait]
impl<S: IpSet> Reconciler for HostNatIpSet<S> {
    fn name(&self) -> &'static str {
        "ipset"
    }

    async fn reconcile(&mut self, _trigger: &Trigger) -> Result<()> {
        debug!("Evaluating NAT ipset");
        let topology = HostTopology::fetch(self.client.as_ref()).await?;
        self.refresh(&topology).await
    }
}

/// Subnet labels of every peer host, in the form the kernel lists them.
pub fn desired_entries(topology: &HostTopology, labels: &LabelKeys) -> BTreeSet<String> {
    topology
        .peers()
        .filter_map(|h| match h.subnet_label(labels) {
            Some(subnet) if !subnet.is_empty() => match canonical_entry(subnet) {
                Some(entry) => Some(entry),
                None => {
                    warn!("ipset: host {} has invalid subnet {:?}, skipping", h.uuid, subnet);
                    None
                }
            },
            _ => {
                warn!("ipset: host {} has no {} label, skipping", h.uuid, labels.subnet);
                None
            }
        })
        .collect()
}

/// Normalises a `hash:net` entry: host bits cleared, `/32` written as a
/// bare address.
fn canonical_entry(raw: &str) -> Option<String> {
    let net: Ipv4Network = raw.trim().parse().ok()?;
    if net.prefix() == 32 {
        Some(net.ip().to_string())
    } else {
        Some(format!("{}/{}", net.network(), net.prefix()))
    }
}
