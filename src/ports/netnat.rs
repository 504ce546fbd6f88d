//! Port mappings as WinNAT static mappings.

use std::sync::Arc;

use async_trait::async_trait;

use super::{PortMapping, PortMappingTable};
use crate::decode::Record;
use crate::error::Result;
use crate::exec::CommandRunner;
use crate::powershell::{self, quote, Param};

const ADD_MAPPING_PARAMS: &[Param<PortMapping>] = &[
    Param {
        name: "Protocol",
        value: |m| Some(m.protocol.to_ascii_uppercase()),
        required: true,
    },
    Param {
        name: "ExternalIPAddress",
        value: |m| Some(m.external_ip.to_string()),
        required: true,
    },
    Param {
        name: "ExternalPort",
        value: |m| Some(m.external_port.to_string()),
        required: true,
    },
    Param {
        name: "InternalIPAddress",
        value: |m| Some(m.internal_ip.to_string()),
        required: true,
    },
    Param {
        name: "InternalPort",
        value: |m| Some(m.internal_port.to_string()),
        required: true,
    },
];

const REMOVE_MAPPING_PARAMS: &[Param<PortMapping>] = &[Param {
    name: "StaticMappingID",
    value: |m| m.static_mapping_id.map(|id| id.to_string()),
    required: true,
}];

pub struct NetNatPortMappings {
    runner: Arc<dyn CommandRunner>,
    nat_name: String,
}

impl NetNatPortMappings {
    pub fn new(runner: Arc<dyn CommandRunner>, nat_name: impl Into<String>) -> Self {
        Self {
            runner,
            nat_name: nat_name.into(),
        }
    }
}

#[async_trait]
impl PortMappingTable for NetNatPortMappings {
    async fn list(&self) -> Result<Vec<PortMapping>> {
        let script = format!(
            "Get-NetNatStaticMapping -NatName {} -ErrorAction Ignore | Format-List *",
            quote(&self.nat_name)
        );
        let records = powershell::query(self.runner.as_ref(), &script).await?;
        records.iter().map(mapping_from_record).collect()
    }

    async fn delete(&self, mapping: &PortMapping) -> Result<()> {
        let params = powershell::render(REMOVE_MAPPING_PARAMS, mapping)?;
        let script = format!(
            "Remove-NetNatStaticMapping -NatName {}{params} -Confirm:$false",
            quote(&self.nat_name)
        );
        powershell::exec_silent(self.runner.as_ref(), &script).await
    }

    async fn create(&self, mapping: &PortMapping) -> Result<()> {
        let params = powershell::render(ADD_MAPPING_PARAMS, mapping)?;
        let script = format!(
            "Add-NetNatStaticMapping -NatName {}{params} | Format-List *",
            quote(&self.nat_name)
        );
        powershell::query(self.runner.as_ref(), &script)
            .await
            .map(|_| ())
    }
}

fn mapping_from_record(record: &Record) -> Result<PortMapping> {
    Ok(PortMapping {
        protocol: record.require("Protocol")?.to_ascii_lowercase(),
        external_ip: record.parse("ExternalIPAddress")?,
        external_port: record.parse("ExternalPort")?,
        internal_ip: record.parse("InternalIPAddress")?,
        internal_port: record.parse("InternalPort")?,
        static_mapping_id: Some(record.parse("StaticMappingID")?),
    })
}
