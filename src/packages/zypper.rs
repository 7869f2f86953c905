use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::process::Command;

use super::{InstalledProducts, PackageManager};
use crate::error::{Error, Result};
use crate::types::Product;

pub struct Zypper {
    zypper: PathBuf,
    ps: PathBuf,
}

impl Zypper {
    pub fn new() -> Self {
        Self::with_programs("zypper", "ps")
    }

    pub fn with_programs(zypper: impl Into<PathBuf>, ps: impl Into<PathBuf>) -> Self {
        Self {
            zypper: zypper.into(),
            ps: ps.into(),
        }
    }
}

impl Default for Zypper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PackageManager for Zypper {
    async fn installed_products(&self) -> Result<InstalledProducts> {
        let output = Command::new(&self.zypper)
            .args(["--no-remote", "-x", "products"])
            .output()
            .await
            .map_err(|e| Error::PackageManager(format!("failed to run zypper: {e}")))?;
        if !output.status.success() {
            return Err(Error::PackageManager(format!(
                "zypper products exited with {}",
                output.status
            )));
        }
        parse_products(&String::from_utf8_lossy(&output.stdout))
    }

    async fn running_transaction(&self) -> Result<Option<String>> {
        // ps exits non-zero when nothing matches, so only a spawn failure counts.
        let output = Command::new(&self.ps)
            .args(["-C", "zypper", "-o", "pid="])
            .output()
            .await
            .map_err(|e| {
                Error::PackageManager(format!("failed to run {}: {e}", self.ps.display()))
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let Some(pid) = stdout.split_whitespace().next() else {
            return Ok(None);
        };
        let cmdline = tokio::fs::read(format!("/proc/{pid}/cmdline"))
            .await
            .map(|raw| String::from_utf8_lossy(&raw).replace('\0', " ").trim().to_string())
            .unwrap_or_else(|_| format!("zypper (pid {pid})"));
        debug!("Package manager running: {}", cmdline);
        Ok(Some(cmdline))
    }
}

/// Parse `zypper -x products` output into the base product and the
/// inventory of every other installed product.
pub fn parse_products(xml: &str) -> Result<InstalledProducts> {
    let dom = tl::parse(xml, tl::ParserOptions::default())
        .map_err(|e| Error::PackageManager(format!("unparsable product list: {e:?}")))?;

    let mut base = None;
    let mut inventory = BTreeSet::new();
    for tag in dom.nodes().iter().filter_map(|node| node.as_tag()) {
        if !tag.name().as_utf8_str().eq_ignore_ascii_case("product") {
            continue;
        }
        let mut name = None;
        let mut version = None;
        let mut arch = None;
        let mut is_base = false;
        let mut installed = false;
        for (key, value) in tag.attributes().iter() {
            let value = value.map(|v| v.to_string()).unwrap_or_default();
            match key.to_ascii_lowercase().as_str() {
                "name" => name = Some(value),
                "version" => version = Some(value),
                "arch" => arch = Some(value),
                "isbase" => is_base = value == "true",
                "installed" => installed = value == "true",
                _ => {}
            }
        }
        let (Some(name), Some(version), Some(arch)) = (name, version, arch) else {
            warn!("Skipping product entry without name, version or arch");
            continue;
        };
        if !installed {
            continue;
        }
        let product = Product::new(name, version, arch);
        if is_base {
            base = Some(product);
        } else {
            inventory.insert(product);
        }
    }

    let base = base.ok_or_else(|| Error::PackageManager("no base product installed".into()))?;
    Ok(InstalledProducts { base, inventory })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    use tempfile::tempdir;

    use super::*;

    fn fake_ps(dir: &Path, stdout: &str) -> PathBuf {
        let path = dir.join("ps");
        fs::write(&path, format!("#!/bin/sh\nprintf '{stdout}'\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    const PRODUCTS: &str = r#"<?xml version='1.0'?>
<stream>
<product-list>
<product name="SLES" version="15.1" release="0" epoch="0" arch="x86_64" vendor="SUSE" summary="SUSE Linux Enterprise Server 15 SP1" repo="@System" productline="sles" registerrelease="" shortname="SLES15-SP1" flavor="" isbase="true" installed="true"><endoflife time_t="0" text="1970-01-01T01:00:00+01"/><registerflavor/><description>SUSE Linux Enterprise</description></product>
<product name="sle-module-basesystem" version="15.1" release="0" epoch="0" arch="x86_64" vendor="SUSE" summary="Basesystem Module" repo="@System" productline="" registerrelease="" shortname="Basesystem" flavor="" isbase="false" installed="true"><registerflavor>module</registerflavor><description>Basesystem</description></product>
<product name="sle-module-server-applications" version="15.1" release="0" epoch="0" arch="x86_64" vendor="SUSE" summary="Server Applications Module" repo="@System" productline="" registerrelease="" shortname="Server-Applications" flavor="" isbase="false" installed="true"><registerflavor>module</registerflavor><description>Server Apps</description></product>
<product name="sle-module-hpc" version="15.1" release="0" epoch="0" arch="x86_64" vendor="SUSE" summary="HPC Module" repo="repo-hpc" productline="" registerrelease="" shortname="HPC" flavor="" isbase="false" installed="false"><description>HPC</description></product>
</product-list>
</stream>"#;

    #[test]
    fn test_parse_products_splits_base_from_inventory() {
        let parsed = parse_products(PRODUCTS).unwrap();
        assert_eq!(parsed.base, Product::new("SLES", "15.1", "x86_64"));
        let names: Vec<&str> = parsed
            .inventory
            .iter()
            .map(|p| p.identifier.as_str())
            .collect();
        assert_eq!(
            names,
            vec!["sle-module-basesystem", "sle-module-server-applications"]
        );
    }

    #[test]
    fn test_parse_products_without_base_fails() {
        let xml = r#"<stream><product-list><product name="x" version="1" arch="noarch" isbase="false" installed="true"/></product-list></stream>"#;
        assert!(matches!(
            parse_products(xml),
            Err(Error::PackageManager(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_ps_is_an_error() {
        let dir = tempdir().unwrap();
        let zypper = Zypper::with_programs("zypper", dir.path().join("no-such-ps"));

        let err = zypper.running_transaction().await.unwrap_err();

        assert!(matches!(err, Error::PackageManager(ref msg) if msg.contains("no-such-ps")));
    }

    #[tokio::test]
    async fn test_no_zypper_process_is_idle() {
        let dir = tempdir().unwrap();
        let zypper = Zypper::with_programs("zypper", fake_ps(dir.path(), ""));

        assert_eq!(zypper.running_transaction().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_running_zypper_is_reported() {
        let dir = tempdir().unwrap();
        let zypper = Zypper::with_programs("zypper", fake_ps(dir.path(), " 4194999\\n"));

        let running = zypper.running_transaction().await.unwrap();

        assert!(running.is_some_and(|cmdline| !cmdline.is_empty()));
    }
}
