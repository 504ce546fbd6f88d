//! Cluster metadata access.
//!
//! The daemon only ever reads from the metadata service. Change detection
//! works by polling the snapshot version and firing whenever it moves.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Container, Host, Network};

pub mod http;
pub use http::HttpMetadataClient;

#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Opaque version of the current metadata snapshot.
    async fn get_version(&self) -> Result<String>;
    async fn get_self_host(&self) -> Result<Host>;
    async fn get_hosts(&self) -> Result<Vec<Host>>;
    async fn get_networks(&self) -> Result<Vec<Network>>;
    async fn get_containers(&self) -> Result<Vec<Container>>;
}

/// Remembers the last seen snapshot version.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    last: Option<String>,
}

impl ChangeDetector {
    /// Records `version` and reports whether it differs from the previous one.
    /// The first observed version always counts as a change.
    pub fn observe(&mut self, version: &str) -> bool {
        if self.last.as_deref() == Some(version) {
            return false;
        }
        self.last = Some(version.to_string());
        true
    }
}
