//! Import a registration server's CA certificate into the system trust
//! store after checking it against the fingerprint the region directory
//! published.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{error, info, warn};
use sha1::{Digest, Sha1};
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::types::{normalize_fingerprint, EndpointRecord};

const CERT_FILE: &str = "registration_server.pem";
const FETCH_ATTEMPTS: u32 = 3;

#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Fetch, verify and install the certificate of `endpoint`, reached at `addr`.
    async fn import(&self, endpoint: &EndpointRecord, addr: IpAddr) -> Result<()>;
}

pub struct CertificateImporter {
    client: reqwest::Client,
    cert_dir: PathBuf,
    update_command: Vec<String>,
}

impl CertificateImporter {
    pub fn new(cert_dir: impl Into<PathBuf>, update_command: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::CertificateImport(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            cert_dir: cert_dir.into(),
            update_command,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<String> {
        let mut last_error = String::new();
        for attempt in 1..=FETCH_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().await.map_err(|e| {
                        Error::CertificateImport(format!("failed to read {url}: {e}"))
                    });
                }
                Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "Attempt {} of {}: certificate fetch from {} failed: {}",
                attempt, FETCH_ATTEMPTS, url, last_error
            );
        }
        Err(Error::CertificateImport(format!(
            "server {url} is unreachable: {last_error}"
        )))
    }

    pub async fn install(&self, endpoint: &EndpointRecord, pem: &str) -> Result<()> {
        let actual = pem_fingerprint(pem)?;
        if actual != normalize_fingerprint(&endpoint.fingerprint) {
            error!("Certificate fingerprint mismatch for {}", endpoint.fqdn);
            return Err(Error::CertificateImport(format!(
                "fingerprint of {} could not be verified",
                endpoint.fqdn
            )));
        }

        let path = self.cert_dir.join(CERT_FILE);
        info!("Writing registration server CA to {}", path.display());
        let write_error = |e: std::io::Error| {
            Error::CertificateImport(format!("{}: {e}", path.display()))
        };
        tokio::fs::create_dir_all(&self.cert_dir)
            .await
            .map_err(write_error)?;
        tokio::fs::write(&path, pem).await.map_err(write_error)?;

        let Some((program, args)) = self.update_command.split_first() else {
            return Ok(());
        };
        info!("Updating CA certificates: {}", program);
        let status = Command::new(program)
            .args(args)
            .status()
            .await
            .map_err(|e| Error::CertificateImport(format!("failed to run {program}: {e}")))?;
        if !status.success() {
            return Err(Error::CertificateImport(format!(
                "{program} exited with {status}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TrustStore for CertificateImporter {
    async fn import(&self, endpoint: &EndpointRecord, addr: IpAddr) -> Result<()> {
        let host = match addr {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        let pem = self.fetch(&format!("http://{host}/smt.crt")).await?;
        self.install(endpoint, &pem).await
    }
}

/// Upper-case hex SHA-1 of the first certificate's DER encoding.
pub fn pem_fingerprint(pem: &str) -> Result<String> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .skip_while(|line| !line.starts_with("-----BEGIN"))
        .skip(1)
        .take_while(|line| !line.starts_with("-----END"))
        .collect();
    if body.is_empty() {
        return Err(Error::CertificateImport("no PEM certificate found".into()));
    }
    let der = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| Error::CertificateImport(format!("invalid PEM body: {e}")))?;
    Ok(hex::encode_upper(Sha1::digest(&der)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Accepts every import and remembers which servers it saw.
    #[derive(Default)]
    pub struct RecordingTrust {
        imported: Mutex<Vec<String>>,
    }

    impl RecordingTrust {
        pub fn imported(&self) -> Vec<String> {
            self.imported.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrustStore for RecordingTrust {
        async fn import(&self, endpoint: &EndpointRecord, _addr: IpAddr) -> Result<()> {
            self.imported.lock().unwrap().push(endpoint.fqdn.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use tempfile::tempdir;

    const PEM: &str = "-----BEGIN CERTIFICATE-----
MIICHDCCAYWgAwIBAgIURlhgaZbJp2P01oWig4O0p8FokRowDQYJKoZIhvcNAQEL
BQAwIDEeMBwGA1UEAwwVc210LWVjMi5zdXNlY2xvdWQubmV0MB4XDTI2MTAxNjA3
MjcwOVoXDTM2MTAxMzA3MjcwOVowIDEeMBwGA1UEAwwVc210LWVjMi5zdXNlY2xv
dWQubmV0MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQCrMa/Qnlo49SBsGpjo
JE1Msvew8jEsTHPDsbKD3oeKnzdsze372fxmcZrk5WMPGAKgV1Fe4JXstpjl7ZS0
UnvdFLriHn+B7XoiAmlKr6SU2vDP6PB/0QIi8OqWAhJVlRWp5gao7WxvTpd7/7D7
OejL/deVo3Qfxt0/HIAJlaa/XwIDAQABo1MwUTAdBgNVHQ4EFgQUd8DVztuk5LUY
b+15PDGeb9LJvpwwHwYDVR0jBBgwFoAUd8DVztuk5LUYb+15PDGeb9LJvpwwDwYD
VR0TAQH/BAUwAwEB/zANBgkqhkiG9w0BAQsFAAOBgQA2pJK8p/ye0n/TqSyJI03q
jDOdavSKLOHtPlYMxfhQ+xz3wVz+h+IvB+gDsBeb+ektrFENO1q16PIZjukEW9ab
Xl+5sVVKxMT7f1391aioKKgzZ+u6SV6r7+m7l6+WjyXtF2FEfDvt4NsNGQ6qzQnM
YEklX7Rq9vg5f6Y9iQT+kA==
-----END CERTIFICATE-----
";
    const FINGERPRINT: &str = "74:DB:6E:A4:ED:80:60:CF:98:B9:56:9F:0E:A8:C1:0F:A5:65:26:D8";

    fn endpoint(fp: &str) -> EndpointRecord {
        EndpointRecord::new(fp, Some("10.0.0.1".parse().unwrap()), None, "smt-ec2.susecloud.net")
    }

    fn importer(dir: &std::path::Path, command: &[&str]) -> CertificateImporter {
        CertificateImporter::new(
            dir,
            command.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_pem_fingerprint() {
        assert_eq!(pem_fingerprint(PEM).unwrap(), normalize_fingerprint(FINGERPRINT));
        assert!(pem_fingerprint("garbage").is_err());
    }

    #[tokio::test]
    async fn test_install_writes_verified_certificate() {
        let dir = tempdir().unwrap();
        let store = importer(dir.path(), &["true"]);

        store.install(&endpoint(FINGERPRINT), PEM).await.unwrap();

        let written = std::fs::read_to_string(dir.path().join(CERT_FILE)).unwrap();
        assert_eq!(written, PEM);
    }

    #[tokio::test]
    async fn test_install_rejects_fingerprint_mismatch() {
        let dir = tempdir().unwrap();
        let store = importer(dir.path(), &["true"]);

        let err = store.install(&endpoint("00:11"), PEM).await.unwrap_err();

        assert!(matches!(err, Error::CertificateImport(_)));
        assert!(!dir.path().join(CERT_FILE).exists());
    }

    #[tokio::test]
    async fn test_install_reports_failed_update_command() {
        let dir = tempdir().unwrap();
        let store = importer(dir.path(), &["false"]);

        let err = store.install(&endpoint(FINGERPRINT), PEM).await.unwrap_err();
        assert!(err.to_string().contains("false exited"));
    }

    #[tokio::test]
    async fn test_fetch_certificate() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/smt.crt");
            then.status(200).body(PEM);
        });
        let dir = tempdir().unwrap();
        let store = importer(dir.path(), &[]);

        let pem = store.fetch(&server.url("/smt.crt")).await.unwrap();

        assert_eq!(pem, PEM);
        mock.assert();
    }

    #[tokio::test]
    async fn test_fetch_retries_then_fails() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/smt.crt");
            then.status(503);
        });
        let dir = tempdir().unwrap();
        let store = importer(dir.path(), &[]);

        let err = store.fetch(&server.url("/smt.crt")).await.unwrap_err();

        assert!(matches!(err, Error::CertificateImport(_)));
        mock.assert_calls(FETCH_ATTEMPTS as usize);
    }
}
