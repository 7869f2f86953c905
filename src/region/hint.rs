//! Region hint sent to the region directory, derived from the cloud
//! framework's instance metadata.  Every lookup is best effort: without a
//! hint the directory answers for its own default region.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    #[default]
    None,
    Amazon,
    Azure,
}

pub struct RegionHint {
    client: reqwest::Client,
    metadata_url: String,
}

impl RegionHint {
    pub fn new(metadata_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::RegionDirectory(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            metadata_url: metadata_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// A configured region wins over anything the framework reports.
    pub async fn resolve(&self, framework: Framework, region: Option<&str>) -> Option<String> {
        if let Some(region) = region {
            return Some(region.to_string());
        }
        let hint = match framework {
            Framework::None => None,
            Framework::Amazon => self.amazon().await,
            Framework::Azure => match self.azure().await {
                Some(location) => Some(location),
                None => {
                    info!("Falling back to XML data from wire server");
                    self.azure_wire_servers().await
                }
            },
        };
        if hint.is_none() && framework != Framework::None {
            warn!("Could not determine the instance region, querying without hint");
        }
        hint
    }

    /// Availability zone minus its trailing zone letter.
    async fn amazon(&self) -> Option<String> {
        let url = format!(
            "{}/latest/meta-data/placement/availability-zone",
            self.metadata_url
        );
        let zone = self.get_text(&url, &[]).await?;
        let zone = zone.trim();
        let mut chars = zone.chars();
        chars.next_back()?;
        let region = chars.as_str();
        (!region.is_empty()).then(|| region.to_string())
    }

    async fn azure(&self) -> Option<String> {
        let url = format!("{}/metadata/instance/location", self.metadata_url);
        let location = self.get_text(&url, &[("Metadata", "true")]).await?;
        let location = location.trim();
        (!location.is_empty()).then(|| location.to_string())
    }

    async fn azure_wire_servers(&self) -> Option<String> {
        let nameservers = system_nameservers();
        for ns in &nameservers {
            let base = match ns {
                IpAddr::V4(v4) => format!("http://{v4}"),
                IpAddr::V6(v6) => format!("http://[{v6}]"),
            };
            if let Some(location) = self.wire_server_location(&base).await {
                return Some(location);
            }
        }
        warn!(
            "Could not determine location from any of the endpoints: {:?}",
            nameservers
        );
        None
    }

    /// Follow the goal state document to the extensions configuration and
    /// read the `<Location>` it declares.
    pub async fn wire_server_location(&self, base: &str) -> Option<String> {
        const WIRE_HEADERS: [(&str, &str); 2] = [
            ("x-ms-agent-name", "WALinuxAgent"),
            ("x-ms-version", "2012-11-30"),
        ];
        let goal_state = self
            .get_text(&format!("{base}/machine/?comp=goalstate"), &WIRE_HEADERS)
            .await?;
        let Some(extensions_uri) = extract_element(&goal_state, "ExtensionsConfig") else {
            warn!("No \"<ExtensionsConfig>\" in goal state XML from {}", base);
            return None;
        };
        let extensions_uri = unescape(&extensions_uri);
        let extensions = self.get_text(&extensions_uri, &WIRE_HEADERS).await?;
        let location = extract_element(&extensions, "Location");
        if location.is_none() {
            warn!("No \"<Location>\" in extensions XML");
        }
        location
    }

    async fn get_text(&self, url: &str, headers: &[(&str, &str)]) -> Option<String> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Unable to query instance metadata at {}: {}", url, e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!("Instance metadata request {} returned {}", url, response.status());
            return None;
        }
        response.text().await.ok()
    }
}

fn system_nameservers() -> Vec<IpAddr> {
    match hickory_resolver::system_conf::read_system_conf() {
        Ok((config, _)) => config
            .name_servers()
            .iter()
            .map(|ns| ns.socket_addr.ip())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect(),
        Err(e) => {
            warn!("Unable to read system resolver configuration: {}", e);
            Vec::new()
        }
    }
}

fn extract_element(document: &str, element: &str) -> Option<String> {
    let pattern = format!(r"(?s)<{element}>(.*?)</{element}>");
    let re = Regex::new(&pattern).ok()?;
    re.captures(document)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Undo the XML entity and percent encoding the goal state applies to URIs.
fn unescape(raw: &str) -> String {
    let entities = raw
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&");
    urlencoding::decode(&entities)
        .map(|decoded| decoded.into_owned())
        .unwrap_or(entities)
}
