//! Decoder for `ipset list -o xml`.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Default, Deserialize)]
struct IpSets {
    #[serde(rename = "ipset", default)]
    sets: Vec<IpSet>,
}

#[derive(Debug, Default, Deserialize)]
struct IpSet {
    #[serde(default)]
    members: Members,
}

// ipset 6.x wraps each element in <member>; older releases list <elem> directly.
#[derive(Debug, Default, Deserialize)]
struct Members {
    #[serde(default)]
    elem: Vec<String>,
    #[serde(default)]
    member: Vec<Member>,
}

#[derive(Debug, Default, Deserialize)]
struct Member {
    #[serde(default)]
    elem: String,
}

/// Collects the member elements of every set in an ipset XML listing.
pub fn parse_members(xml: &str) -> Result<BTreeSet<String>> {
    let doc: IpSets = quick_xml::de::from_str(xml).map_err(|e| Error::decode("ipset xml", e))?;
    Ok(doc
        .sets
        .into_iter()
        .flat_map(|set| {
            let Members { elem, member } = set.members;
            elem.into_iter().chain(member.into_iter().map(|m| m.elem))
        })
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect())
}
