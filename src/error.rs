//! Error taxonomy for a registration run.
//!
//! Every variant is fatal for the run.  Recoverable agent failures never
//! surface here: they are [`crate::agent::AgentOutcome::AgentError`] values
//! consumed by the failover loop, which only produces
//! [`Error::RegistrationExhausted`] once every candidate has failed.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("endpoint cache I/O failed for {path}: {source}")]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host override table I/O failed for {path}: {source}")]
    HostsIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("registration data I/O failed for {path}: {source}")]
    StateIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no region server returned endpoint data: {0}")]
    RegionDirectory(String),

    #[error("none of the registration servers responded, probed: {}", probed.join(", "))]
    NoResponsiveEndpoint { probed: Vec<String> },

    #[error(
        "configured registration server {fqdn} is unreachable and no equivalent \
         server is available; check the network configuration (IPv4/IPv6 routing, \
         security groups)"
    )]
    NoEquivalentReplacement { fqdn: String },

    #[error("registration agent {agent} not found")]
    AgentMissing { agent: String },

    #[error("base product registration failed against every server, tried: {}", tried.join(", "))]
    RegistrationExhausted { tried: Vec<String> },

    #[error("product metadata request failed: {0}")]
    MetadataFetch(String),

    #[error("certificate import failed: {0}")]
    CertificateImport(String),

    #[error("package manager query failed: {0}")]
    PackageManager(String),

    #[error("package manager is running ({0}), refusing to reset registration state")]
    PackageManagerBusy(String),

    #[error("credentials unavailable: {0}")]
    Credentials(String),
}

impl Error {
    /// Process exit status for this failure.
    pub fn exit_code(&self) -> i32 {
        1
    }

    pub(crate) fn cache_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::CacheIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn state_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::StateIo {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn hosts_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::HostsIo {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
