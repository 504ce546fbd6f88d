use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::MetadataClient;
use crate::error::Result;
use crate::types::{Container, Host, Network};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Metadata client over the Rancher metadata HTTP API.
pub struct HttpMetadataClient {
    client: Client,
    base_url: String,
}

impl HttpMetadataClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("GET {}", url);
        let value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }
}

#[async_trait]
impl MetadataClient for HttpMetadataClient {
    async fn get_version(&self) -> Result<String> {
        let url = format!("{}/version", self.base_url);
        let body = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().trim_matches('"').to_string())
    }

    async fn get_self_host(&self) -> Result<Host> {
        self.get_json("self/host").await
    }

    async fn get_hosts(&self) -> Result<Vec<Host>> {
        self.get_json("hosts").await
    }

    async fn get_networks(&self) -> Result<Vec<Network>> {
        self.get_json("networks").await
    }

    async fn get_containers(&self) -> Result<Vec<Container>> {
        self.get_json("containers").await
    }
}
