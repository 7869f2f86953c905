//! Region directory client.
//!
//! The directory answers with an XML document listing the registration
//! servers valid for the caller's region, one element per server carrying
//! the addresses, hostname and certificate fingerprint as attributes.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::types::EndpointRecord;

pub mod hint;
pub use hint::{Framework, RegionHint};

pub struct RegionClient {
    client: reqwest::Client,
    servers: Vec<String>,
    api: String,
}

impl RegionClient {
    pub fn new(
        servers: Vec<String>,
        api: impl Into<String>,
        timeout: Duration,
        pinned_cert: Option<&Path>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(path) = pinned_cert {
            let pem = std::fs::read(path).map_err(|e| {
                Error::RegionDirectory(format!("cannot read {}: {e}", path.display()))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::RegionDirectory(format!("invalid certificate {}: {e}", path.display()))
            })?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::RegionDirectory(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            servers,
            api: api.into(),
        })
    }

    /// Ask each region server in turn; the first one to answer wins.
    pub async fn fetch_endpoints(&self, hint: Option<&str>) -> Result<Vec<EndpointRecord>> {
        let mut failures = Vec::new();
        for server in &self.servers {
            let url = format!("{}/{}", server.trim_end_matches('/'), self.api);
            let mut request = self.client.get(&url);
            if let Some(hint) = hint {
                request = request.query(&[("regionHint", hint)]);
            }
            debug!("Requesting registration servers from {}", url);

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Region server {} unreachable: {}", server, e);
                    failures.push(format!("{server}: {e}"));
                    continue;
                }
            };
            if !response.status().is_success() {
                warn!("Region server {} answered {}", server, response.status());
                failures.push(format!("{server}: HTTP {}", response.status()));
                continue;
            }
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    failures.push(format!("{server}: {e}"));
                    continue;
                }
            };
            let endpoints = parse_server_list(&body)?;
            info!(
                "Region server {} reported {} registration server(s)",
                server,
                endpoints.len()
            );
            return Ok(endpoints);
        }
        Err(Error::RegionDirectory(if failures.is_empty() {
            "no region servers configured".to_string()
        } else {
            failures.join("; ")
        }))
    }
}

/// Extract endpoint records from the directory's XML answer, in document order.
pub fn parse_server_list(xml: &str) -> Result<Vec<EndpointRecord>> {
    let dom = tl::parse(xml, tl::ParserOptions::default())
        .map_err(|e| Error::RegionDirectory(format!("unparsable server list: {e:?}")))?;

    let mut endpoints = Vec::new();
    for tag in dom.nodes().iter().filter_map(|node| node.as_tag()) {
        let mut ipv4 = None;
        let mut ipv6 = None;
        let mut fqdn = None;
        let mut fingerprint = None;
        for (key, value) in tag.attributes().iter() {
            let Some(value) = value else { continue };
            match key.to_ascii_lowercase().as_str() {
                "smtserverip" => ipv4 = Some(value.to_string()),
                "smtserveripv6" => ipv6 = Some(value.to_string()),
                "smtservername" => fqdn = Some(value.to_string()),
                "fingerprint" => fingerprint = Some(value.to_string()),
                _ => {}
            }
        }
        let (Some(fqdn), Some(fingerprint)) = (fqdn, fingerprint) else {
            continue;
        };
        let ipv4 = ipv4.and_then(|a| a.parse::<Ipv4Addr>().ok());
        let ipv6 = ipv6.and_then(|a| a.parse::<Ipv6Addr>().ok());
        if ipv4.is_none() && ipv6.is_none() {
            warn!("Ignoring registration server {} without a usable address", fqdn);
            continue;
        }
        endpoints.push(EndpointRecord::new(fingerprint, ipv4, ipv6, fqdn));
    }
    Ok(endpoints)
}
