//! Product metadata API of the registration server, queried for the
//! extension tree of the registered base product.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error};

use crate::error::{Error, Result};
use crate::types::{ExtensionNode, Product, ProductTree};
use crate::zypp::Credentials;

const PRODUCTS_PATH: &str = "/connect/systems/products";

#[async_trait]
pub trait ProductMetadata: Send + Sync {
    /// Extensions available for `base` on the server at `base_url`.
    async fn extension_tree(
        &self,
        base_url: &str,
        base: &Product,
        credentials: &Credentials,
    ) -> Result<Vec<ExtensionNode>>;
}

pub struct ProductMetadataClient {
    client: reqwest::Client,
}

impl ProductMetadataClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::MetadataFetch(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ProductMetadata for ProductMetadataClient {
    async fn extension_tree(
        &self,
        base_url: &str,
        base: &Product,
        credentials: &Credentials,
    ) -> Result<Vec<ExtensionNode>> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), PRODUCTS_PATH);
        debug!("Requesting extensions of {} from {}", base, url);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("identifier", base.identifier.as_str()),
                ("version", base.version.as_str()),
                ("arch", base.arch.as_str()),
            ])
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await
            .map_err(|e| Error::MetadataFetch(format!("{url}: {e}")))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            error!("Unable to obtain product information from {}: {}", url, status);
            return Err(Error::MetadataFetch(format!("{url} returned {status}: {body}")));
        }

        let tree: ProductTree = response
            .json()
            .await
            .map_err(|e| Error::MetadataFetch(format!("malformed product metadata: {e}")))?;
        Ok(tree.extensions)
    }
}
