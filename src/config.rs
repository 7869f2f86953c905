use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::region::Framework;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/regionserverclnt.toml";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Region directory base URLs, tried in order.
    pub region_servers: Vec<String>,
    pub region_api: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub framework: Framework,
    pub metadata_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_server_cert: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub hosts_file: PathBuf,
    pub zypp_dir: PathBuf,
    pub agent_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_data_file: Option<PathBuf>,
    pub probe_port: u16,
    pub probe_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub cert_dir: PathBuf,
    pub cert_update_command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_servers: Vec::new(),
            region_api: "regionInfo".into(),
            region: None,
            framework: Framework::None,
            metadata_url: "http://169.254.169.254".into(),
            region_server_cert: None,
            data_dir: "/var/lib/cloudregister".into(),
            hosts_file: "/etc/hosts".into(),
            zypp_dir: "/etc/zypp".into(),
            agent_path: "/usr/sbin/SUSEConnect".into(),
            instance_data_file: None,
            probe_port: 443,
            probe_timeout_secs: 5,
            http_timeout_secs: 15,
            cert_dir: "/usr/share/pki/trust/anchors".into(),
            cert_update_command: vec!["update-ca-certificates".into()],
            log_file: Some("/var/log/cloudregister".into()),
        }
    }
}

impl Config {
    /// Defaults, then `path` (TOML) and its JSON sibling, then
    /// `CLOUDREGISTER_*` environment variables.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let toml = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let json = toml.with_extension("json");
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml))
            .merge(Json::file(json))
            .merge(Env::prefixed("CLOUDREGISTER_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.region_servers.is_empty() {
            anyhow::bail!("No region servers configured");
        }
        Ok(config)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_file_and_env_layers() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "client.toml",
                r#"
                region_servers = ["https://52.1.1.1", "https://52.2.2.2"]
                framework = "amazon"
                probe_timeout_secs = 2
                "#,
            )?;
            jail.set_env("CLOUDREGISTER_REGION", "eu-west-1");

            let config = Config::load(Some(Path::new("client.toml"))).unwrap();
            assert_eq!(config.region_servers.len(), 2);
            assert_eq!(config.framework, Framework::Amazon);
            assert_eq!(config.region.as_deref(), Some("eu-west-1"));
            assert_eq!(config.probe_timeout(), Duration::from_secs(2));
            assert_eq!(config.agent_path, PathBuf::from("/usr/sbin/SUSEConnect"));
            Ok(())
        });
    }

    #[test]
    fn test_region_servers_required() {
        Jail::expect_with(|jail| {
            jail.create_file("client.toml", "framework = \"azure\"\n")?;
            assert!(Config::load(Some(Path::new("client.toml"))).is_err());
            Ok(())
        });
    }
}
