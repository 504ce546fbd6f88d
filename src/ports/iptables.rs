//! Port mappings as DNAT rules in a dedicated iptables chain.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};

use super::{PortMapping, PortMappingTable};
use crate::error::{Error, Result};
use crate::exec::{args, CommandRunner};

pub struct IptablesPortMappings {
    runner: Arc<dyn CommandRunner>,
    chain: String,
}

impl IptablesPortMappings {
    const PROGRAM: &'static str = "iptables";

    pub fn new(runner: Arc<dyn CommandRunner>, chain: impl Into<String>) -> Self {
        Self {
            runner,
            chain: chain.into(),
        }
    }

    async fn nat(&self, rest: Vec<String>) -> Result<String> {
        let mut full = args(["-w", "-t", "nat"]);
        full.extend(rest);
        self.runner.run(Self::PROGRAM, &full).await
    }

    /// Match and target arguments of the rule for `mapping`.
    fn rule_args(mapping: &PortMapping) -> Vec<String> {
        let mut rule = Vec::new();
        if !mapping.external_ip.is_unspecified() {
            rule.extend(["-d".to_string(), format!("{}/32", mapping.external_ip)]);
        }
        rule.extend([
            "-p".to_string(),
            mapping.protocol.clone(),
            "-m".to_string(),
            mapping.protocol.clone(),
            "--dport".to_string(),
            mapping.external_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", mapping.internal_ip, mapping.internal_port),
        ]);
        rule
    }
}

#[async_trait]
impl PortMappingTable for IptablesPortMappings {
    async fn ensure(&self) -> Result<()> {
        if self.nat(args(["-S", self.chain.as_str()])).await.is_err() {
            info!("hostports: creating nat chain {}", self.chain);
            self.nat(args(["-N", self.chain.as_str()])).await?;
        }
        let jump = args(["PREROUTING", "-m", "addrtype", "--dst-type", "LOCAL", "-j", self.chain.as_str()]);
        let mut check = args(["-C"]);
        check.extend(jump.iter().cloned());
        if self.nat(check).await.is_err() {
            let mut insert = args(["-I"]);
            insert.extend(jump);
            self.nat(insert).await?;
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PortMapping>> {
        let out = self.nat(args(["-S", self.chain.as_str()])).await?;
        let mappings = parse_rules(&out, &self.chain)?;
        debug!("hostports: {} rules in chain {}", mappings.len(), self.chain);
        Ok(mappings)
    }

    async fn delete(&self, mapping: &PortMapping) -> Result<()> {
        let mut rest = args(["-D", self.chain.as_str()]);
        rest.extend(Self::rule_args(mapping));
        self.nat(rest).await.map(|_| ())
    }

    async fn create(&self, mapping: &PortMapping) -> Result<()> {
        let mut rest = args(["-A", self.chain.as_str()]);
        rest.extend(Self::rule_args(mapping));
        self.nat(rest).await.map(|_| ())
    }
}

/// Decodes the DNAT rules of `chain` from `iptables -S` output.
fn parse_rules(out: &str, chain: &str) -> Result<Vec<PortMapping>> {
    let mut mappings = Vec::new();
    for line in out.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() < 2 || tokens[0] != "-A" || tokens[1] != chain {
            continue;
        }
        if let Some(mapping) = parse_rule(&tokens[2..])
            .map_err(|message| Error::decode("iptables rule", format!("{line:?}: {message}")))?
        {
            mappings.push(mapping);
        }
    }
    Ok(mappings)
}

fn parse_rule(tokens: &[&str]) -> std::result::Result<Option<PortMapping>, String> {
    let mut external_ip = Ipv4Addr::UNSPECIFIED;
    let mut protocol = None;
    let mut external_port = None;
    let mut destination = None;
    let mut is_dnat = false;

    let mut it = tokens.iter();
    while let Some(tok) = it.next() {
        match *tok {
            "-d" => {
                let value = *it.next().ok_or("-d without value")?;
                let addr = value.split('/').next().unwrap_or(value);
                external_ip = addr.parse().map_err(|_| format!("bad address {value}"))?;
            }
            "-p" => protocol = it.next().map(|p| p.to_string()),
            "--dport" => {
                let value = *it.next().ok_or("--dport without value")?;
                external_port = Some(value.parse::<u16>().map_err(|_| format!("bad port {value}"))?);
            }
            "-j" => is_dnat = it.next() == Some(&"DNAT"),
            "--to-destination" => destination = it.next().copied(),
            _ => {}
        }
    }

    if !is_dnat {
        return Ok(None);
    }
    let (protocol, external_port, destination) = match (protocol, external_port, destination) {
        (Some(p), Some(port), Some(d)) => (p, port, d),
        _ => return Err("incomplete DNAT rule".to_string()),
    };
    let (internal_ip, internal_port) = destination
        .split_once(':')
        .ok_or_else(|| format!("bad destination {destination}"))?;

    Ok(Some(PortMapping {
        protocol,
        external_ip,
        external_port,
        internal_ip: internal_ip
            .parse()
            .map_err(|_| format!("bad destination {destination}"))?,
        internal_port: internal_port
            .parse()
            .map_err(|_| format!("bad destination {destination}"))?,
        static_mapping_id: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::fake::FakeRunner;

    const CHAIN: &str = "PER-HOST-SUBNET-PORTS";

    const LISTING: &str = "-N PER-HOST-SUBNET-PORTS
-A PER-HOST-SUBNET-PORTS -d 10.0.0.1/32 -p tcp -m tcp --dport 8080 -j DNAT --to-destination 172.17.0.2:80
-A PER-HOST-SUBNET-PORTS -p udp -m udp --dport 53 -j DNAT --to-destination 172.17.0.3:5353
-A PER-HOST-SUBNET-PORTS -j RETURN
";

    #[test]
    fn parses_dnat_rules() {
        let rules = parse_rules(LISTING, CHAIN).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].external_key(), "10.0.0.1:8080");
        assert_eq!(rules[0].internal_port, 80);
        assert_eq!(rules[1].protocol, "udp");
        assert!(rules[1].external_ip.is_unspecified());
    }

    #[test]
    fn incomplete_dnat_rule_is_a_decode_error() {
        let out = "-A PER-HOST-SUBNET-PORTS -p tcp -j DNAT --to-destination 172.17.0.2:80\n";
        assert!(matches!(parse_rules(out, CHAIN), Err(Error::Decode { .. })));
    }

    #[tokio::test]
    async fn create_and_delete_use_the_same_rule_spec() {
        let runner = Arc::new(FakeRunner::default());
        let table = IptablesPortMappings::new(runner.clone(), CHAIN);
        let mapping = PortMapping {
            protocol: "tcp".into(),
            external_ip: "10.0.0.1".parse().unwrap(),
            external_port: 8080,
            internal_ip: "172.17.0.2".parse().unwrap(),
            internal_port: 80,
            static_mapping_id: None,
        };

        table.create(&mapping).await.unwrap();
        table.delete(&mapping).await.unwrap();

        let rule = "-d 10.0.0.1/32 -p tcp -m tcp --dport 8080 -j DNAT --to-destination 172.17.0.2:80";
        assert_eq!(
            runner.calls(),
            vec![
                format!("iptables -w -t nat -A {CHAIN} {rule}"),
                format!("iptables -w -t nat -D {CHAIN} {rule}"),
            ]
        );
    }

    #[tokio::test]
    async fn ensure_creates_missing_chain_and_jump() {
        let runner = Arc::new(FakeRunner::default());
        runner.respond(
            "iptables -w -t nat -S",
            Err(Error::Command {
                command: "iptables".into(),
                message: "No chain/target/match by that name.".into(),
            }),
        );
        runner.respond(
            "iptables -w -t nat -C",
            Err(Error::Command {
                command: "iptables".into(),
                message: "Bad rule".into(),
            }),
        );
        let table = IptablesPortMappings::new(runner.clone(), CHAIN);
        table.ensure().await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[1], format!("iptables -w -t nat -N {CHAIN}"));
        assert!(calls[3].starts_with("iptables -w -t nat -I PREROUTING"));
    }
}
