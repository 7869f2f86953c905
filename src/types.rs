//! Data structures used throughout the registration client.
//!
//! These types are serialised using [`serde`](https://serde.rs/).  An
//! [`EndpointRecord`] is what the endpoint cache persists on disk; the
//! product types mirror what the package manager reports locally and what
//! the registration server declares as the extension tree.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// One candidate registration server.
///
/// Records are plain values.  Two records are *identical* when every field
/// matches (`==`), and *equivalent* when they carry the same certificate
/// fingerprint, i.e. the same logical service possibly reached over a
/// different network path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<Ipv6Addr>,
    pub fqdn: String,
}

impl EndpointRecord {
    pub fn new(
        fingerprint: impl Into<String>,
        ipv4: Option<Ipv4Addr>,
        ipv6: Option<Ipv6Addr>,
        fqdn: impl Into<String>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            ipv4,
            ipv6,
            fqdn: fqdn.into(),
        }
    }

    /// Same logical service, compared on the normalised fingerprint.
    pub fn is_equivalent(&self, other: &EndpointRecord) -> bool {
        normalize_fingerprint(&self.fingerprint) == normalize_fingerprint(&other.fingerprint)
    }

    /// Equivalent but reached over a different path.
    pub fn is_alternate_path_to(&self, other: &EndpointRecord) -> bool {
        self.is_equivalent(other) && self != other
    }

    /// First label of the FQDN, used as the short host alias.
    pub fn name(&self) -> &str {
        self.fqdn.split('.').next().unwrap_or(&self.fqdn)
    }

    /// All known addresses, IPv6 first.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::with_capacity(2);
        if let Some(v6) = self.ipv6 {
            addrs.push(IpAddr::V6(v6));
        }
        if let Some(v4) = self.ipv4 {
            addrs.push(IpAddr::V4(v4));
        }
        addrs
    }

    /// Address used when no probe result is available to choose from.
    pub fn default_address(&self) -> Option<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .or_else(|| self.ipv6.map(IpAddr::V6))
    }

    /// Base URL of the registration service, addressed by hostname so that
    /// resolution goes through the host override table.
    pub fn registration_url(&self) -> String {
        format!("https://{}", self.fqdn)
    }
}

impl fmt::Display for EndpointRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let addrs: Vec<String> = self.addresses().iter().map(IpAddr::to_string).collect();
        write!(f, "{} [{}]", self.fqdn, addrs.join(", "))
    }
}

/// Strip separators and case so `AB:cd:01` and `ABCD01` compare equal.
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':')
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// An `{identifier, version, arch}` product triplet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Product {
    pub identifier: String,
    pub version: String,
    pub arch: String,
}

impl Product {
    pub fn new(
        identifier: impl Into<String>,
        version: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            version: version.into(),
            arch: arch.into(),
        }
    }

    /// The `identifier/version/arch` form the registration agent expects.
    pub fn triplet(&self) -> String {
        format!("{}/{}/{}", self.identifier, self.version, self.arch)
    }
}

impl fmt::Display for Product {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.triplet())
    }
}

/// Installed products other than the base product.
pub type ProductInventory = BTreeSet<Product>;

/// A node of the server-declared extension tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionNode {
    pub identifier: String,
    pub version: String,
    pub arch: String,
    #[serde(default, rename = "extensions")]
    pub children: Vec<ExtensionNode>,
}

impl ExtensionNode {
    pub fn product(&self) -> Product {
        Product::new(&self.identifier, &self.version, &self.arch)
    }
}

/// Product metadata document returned for the base product; only the
/// extension tree is of interest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductTree {
    #[serde(default)]
    pub extensions: Vec<ExtensionNode>,
}
