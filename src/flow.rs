//! One registration run, from region discovery to module registration.
//!
//! The flow only talks to the outside world through the collaborator
//! traits and the HTTP clients built from the configuration.

use std::net::IpAddr;
use std::time::Duration;

use log::{info, warn};

use crate::agent::RegistrationAgent;
use crate::config::Config;
use crate::context::RunContext;
use crate::error::{Error, Result};
use crate::failover::{self, Election};
use crate::metadata::ProductMetadata;
use crate::packages::PackageManager;
use crate::probe::Prober;
use crate::reconcile;
use crate::region::{RegionClient, RegionHint};
use crate::register::{self, ModuleReport};
use crate::trust::TrustStore;
use crate::types::EndpointRecord;

pub struct Collaborators<'a> {
    pub agent: &'a dyn RegistrationAgent,
    pub packages: &'a dyn PackageManager,
    pub prober: &'a dyn Prober,
    pub trust: &'a dyn TrustStore,
    pub metadata: &'a dyn ProductMetadata,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Drop every piece of registration state before starting.
    pub force_new: bool,
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    AlreadyRegistered(EndpointRecord),
    Registered {
        server: EndpointRecord,
        modules: ModuleReport,
    },
}

pub async fn register_instance(
    ctx: &mut RunContext,
    cfg: &Config,
    options: &RunOptions,
    with: &Collaborators<'_>,
) -> Result<RunOutcome> {
    if !with.agent.is_available() {
        return Err(Error::AgentMissing {
            agent: with.agent.describe(),
        });
    }

    if let Some(delay) = options.delay {
        info!("Waiting {} seconds before registration", delay.as_secs());
        tokio::time::sleep(delay).await;
    }

    let mut cached = ctx.cache.load()?;
    ctx.current_target = cached.current.clone();
    if options.force_new {
        if let Some(transaction) = with.packages.running_transaction().await? {
            return Err(Error::PackageManagerBusy(transaction));
        }
        info!("Forcing new registration");
        ctx.reset()?;
        cached = Default::default();
    }

    let hint = RegionHint::new(&cfg.metadata_url, cfg.http_timeout())?
        .resolve(cfg.framework, cfg.region.as_deref())
        .await;
    let directory = RegionClient::new(
        cfg.region_servers.clone(),
        &cfg.region_api,
        cfg.http_timeout(),
        cfg.region_server_cert.as_deref(),
    )?;
    let remote = directory.fetch_endpoints(hint.as_deref()).await?;
    reconcile::reconcile(ctx, &remote, &cached.available)?;

    let election = failover::elect(ctx, with.prober).await?;
    let target = election.target().clone();
    info!("Using registration server {} ({:?})", target, election.state());

    if ctx.zypp.check_registration(&target.fqdn)? {
        info!("Instance is registered with {}, nothing to do", target.fqdn);
        return Ok(RunOutcome::AlreadyRegistered(target));
    }

    let Some(addr) = election_address(&election, with.prober).await else {
        return Err(Error::NoResponsiveEndpoint {
            probed: target.addresses().iter().map(IpAddr::to_string).collect(),
        });
    };
    with.trust.import(&target, addr).await?;

    let instance_data = cfg.instance_data_file.as_deref();
    let server = register::register_base_product(
        ctx,
        with.agent,
        with.prober,
        with.trust,
        instance_data,
    )
    .await?;

    let installed = with.packages.installed_products().await?;
    let credentials = ctx.zypp.load_credentials()?;
    let url = server.registration_url();
    let tree = with
        .metadata
        .extension_tree(&url, &installed.base, &credentials)
        .await?;
    let modules = register::register_modules(
        ctx,
        with.agent,
        &url,
        &tree,
        &installed.inventory,
        instance_data,
    )
    .await?;

    for (product, message) in &modules.failed {
        warn!("Module {} not registered: {}", product, message);
    }
    Ok(RunOutcome::Registered { server, modules })
}

/// Address the elected server was reached on.
async fn election_address(election: &Election, prober: &dyn Prober) -> Option<IpAddr> {
    match election {
        Election::FreshElection { addr, .. } | Election::TargetDeadReplaced { addr, .. } => {
            Some(*addr)
        }
        Election::TargetAlive(target) => match prober.reachable_address(target).await {
            Some(addr) => Some(addr),
            None => target.default_address(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::PathBuf;

    use async_trait::async_trait;
    use httpmock::prelude::*;

    use super::*;
    use crate::agent::testing::RecordingAgent;
    use crate::agent::{AgentOutcome, AgentRequest};
    use crate::context::testing::{endpoint, Sandbox};
    use crate::metadata::ProductMetadataClient;
    use crate::packages::InstalledProducts;
    use crate::probe::testing::ScriptedProber;
    use crate::trust::testing::RecordingTrust;
    use crate::types::{ExtensionNode, Product};
    use crate::zypp::Credentials;

    const DIRECTORY: &str = r#"<regionSMTdata>
  <smtInfo fingerprint="AA" SMTserverIP="10.0.0.1" SMTserverName="smt-a.example.net"/>
</regionSMTdata>"#;

    const PRODUCTS_PATH: &str = "/connect/systems/products";

    /// Writes the credentials file on a successful base registration, as
    /// the real agent does.
    struct IssuingAgent {
        inner: RecordingAgent,
        credentials: PathBuf,
        available: bool,
    }

    impl IssuingAgent {
        fn new(sb: &Sandbox) -> Self {
            Self {
                inner: RecordingAgent::new(),
                credentials: sb.dir.path().join("zypp/credentials.d/SCCcredentials"),
                available: true,
            }
        }
    }

    #[async_trait]
    impl RegistrationAgent for IssuingAgent {
        fn describe(&self) -> String {
            "issuing-agent".to_string()
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn register(&self, request: AgentRequest<'_>) -> AgentOutcome {
            let outcome = self.inner.register(request).await;
            if outcome == AgentOutcome::Success && request.product.is_none() {
                fs::create_dir_all(self.credentials.parent().unwrap()).unwrap();
                fs::write(&self.credentials, "username=SCC_user\npassword=pass\n").unwrap();
            }
            outcome
        }
    }

    struct FakePackages {
        busy: Option<String>,
    }

    #[async_trait]
    impl PackageManager for FakePackages {
        async fn installed_products(&self) -> Result<InstalledProducts> {
            Ok(InstalledProducts {
                base: Product::new("SLES", "15.1", "x86_64"),
                inventory: BTreeSet::from([Product::new("sle-module-basesystem", "15.1", "x86_64")]),
            })
        }

        async fn running_transaction(&self) -> Result<Option<String>> {
            Ok(self.busy.clone())
        }
    }

    /// Sends product metadata requests to the mock server instead of the
    /// registration server's HTTPS address.
    struct LocalMetadata {
        client: ProductMetadataClient,
        base_url: String,
    }

    #[async_trait]
    impl ProductMetadata for LocalMetadata {
        async fn extension_tree(
            &self,
            _base_url: &str,
            base: &Product,
            credentials: &Credentials,
        ) -> Result<Vec<ExtensionNode>> {
            self.client
                .extension_tree(&self.base_url, base, credentials)
                .await
        }
    }

    fn server_a() -> EndpointRecord {
        endpoint("AA", "10.0.0.1", None, "smt-a.example.net")
    }

    fn config(server: &MockServer) -> Config {
        Config {
            region_servers: vec![server.base_url()],
            http_timeout_secs: 5,
            ..Config::default()
        }
    }

    fn local_metadata(server: &MockServer) -> LocalMetadata {
        LocalMetadata {
            client: ProductMetadataClient::new(Duration::from_secs(5)).unwrap(),
            base_url: server.base_url(),
        }
    }

    fn mock_directory(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(GET).path("/regionInfo");
            then.status(200).body(DIRECTORY);
        })
    }

    #[tokio::test]
    async fn test_already_registered_skips_the_agent() {
        let server = MockServer::start();
        let directory = mock_directory(&server);
        let mut sb = Sandbox::new();
        sb.ctx
            .install_target(&server_a(), "10.0.0.1".parse().unwrap())
            .unwrap();
        let zypp = sb.dir.path().join("zypp");
        fs::create_dir_all(zypp.join("credentials.d")).unwrap();
        fs::create_dir_all(zypp.join("repos.d")).unwrap();
        fs::write(zypp.join("credentials.d/SCCcredentials"), "username=u\npassword=p\n").unwrap();
        fs::write(zypp.join("repos.d/smt-a_example_net:SLES15.repo"), "").unwrap();
        let agent = IssuingAgent::new(&sb);
        let trust = RecordingTrust::default();
        let metadata = local_metadata(&server);
        let with = Collaborators {
            agent: &agent,
            packages: &FakePackages { busy: None },
            prober: &ScriptedProber::new(&["10.0.0.1"]),
            trust: &trust,
            metadata: &metadata,
        };

        let outcome = register_instance(&mut sb.ctx, &config(&server), &RunOptions::default(), &with)
            .await
            .unwrap();

        assert_eq!(outcome, RunOutcome::AlreadyRegistered(server_a()));
        assert!(agent.inner.calls().is_empty());
        assert!(trust.imported().is_empty());
        directory.assert();
    }

    #[tokio::test]
    async fn test_fresh_registration_registers_base_then_modules() {
        let server = MockServer::start();
        mock_directory(&server);
        let products = server.mock(|when, then| {
            when.method(GET)
                .path(PRODUCTS_PATH)
                .query_param("identifier", "SLES");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{"extensions":[{"identifier":"sle-module-basesystem","version":"15.1","arch":"x86_64","extensions":[]}]}"#,
                );
        });
        let mut sb = Sandbox::new();
        let agent = IssuingAgent::new(&sb);
        let trust = RecordingTrust::default();
        let metadata = local_metadata(&server);
        let with = Collaborators {
            agent: &agent,
            packages: &FakePackages { busy: None },
            prober: &ScriptedProber::new(&["10.0.0.1"]),
            trust: &trust,
            metadata: &metadata,
        };

        let outcome = register_instance(&mut sb.ctx, &config(&server), &RunOptions::default(), &with)
            .await
            .unwrap();

        match outcome {
            RunOutcome::Registered { server, modules } => {
                assert_eq!(server, server_a());
                assert_eq!(
                    modules.registered,
                    vec![Product::new("sle-module-basesystem", "15.1", "x86_64")]
                );
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(
            agent.inner.calls(),
            vec![
                ("https://smt-a.example.net".to_string(), None),
                (
                    "https://smt-a.example.net".to_string(),
                    Some("sle-module-basesystem/15.1/x86_64".to_string())
                ),
            ]
        );
        assert_eq!(trust.imported(), vec!["smt-a.example.net"]);
        products.assert();
    }

    #[tokio::test]
    async fn test_metadata_failure_keeps_base_registration() {
        let server = MockServer::start();
        mock_directory(&server);
        server.mock(|when, then| {
            when.method(GET).path(PRODUCTS_PATH);
            then.status(500);
        });
        let mut sb = Sandbox::new();
        let agent = IssuingAgent::new(&sb);
        let metadata = local_metadata(&server);
        let with = Collaborators {
            agent: &agent,
            packages: &FakePackages { busy: None },
            prober: &ScriptedProber::new(&["10.0.0.1"]),
            trust: &RecordingTrust::default(),
            metadata: &metadata,
        };

        let err = register_instance(&mut sb.ctx, &config(&server), &RunOptions::default(), &with)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::MetadataFetch(_)));
        assert_eq!(agent.inner.calls().len(), 1);
        assert_eq!(sb.ctx.cache.load().unwrap().current, Some(server_a()));
        assert_eq!(
            sb.ctx.hosts.lookup("smt-a.example.net").unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );
        assert!(sb.ctx.zypp.has_credentials());
    }

    #[tokio::test]
    async fn test_force_new_refuses_while_package_manager_runs() {
        let server = MockServer::start();
        let directory = mock_directory(&server);
        let mut sb = Sandbox::new();
        sb.ctx
            .install_target(&server_a(), "10.0.0.1".parse().unwrap())
            .unwrap();
        let agent = IssuingAgent::new(&sb);
        let metadata = local_metadata(&server);
        let with = Collaborators {
            agent: &agent,
            packages: &FakePackages {
                busy: Some("zypper in vim".to_string()),
            },
            prober: &ScriptedProber::new(&["10.0.0.1"]),
            trust: &RecordingTrust::default(),
            metadata: &metadata,
        };
        let options = RunOptions {
            force_new: true,
            ..RunOptions::default()
        };

        let err = register_instance(&mut sb.ctx, &config(&server), &options, &with)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::PackageManagerBusy(ref cmd) if cmd == "zypper in vim"));
        assert_eq!(sb.ctx.cache.load().unwrap().current, Some(server_a()));
        assert_eq!(
            sb.ctx.hosts.lookup("smt-a.example.net").unwrap(),
            Some("10.0.0.1".parse().unwrap())
        );
        directory.assert_calls(0);
    }

    #[tokio::test]
    async fn test_missing_agent_aborts_before_any_request() {
        let server = MockServer::start();
        let directory = mock_directory(&server);
        let mut sb = Sandbox::new();
        let mut agent = IssuingAgent::new(&sb);
        agent.available = false;
        let metadata = local_metadata(&server);
        let with = Collaborators {
            agent: &agent,
            packages: &FakePackages { busy: None },
            prober: &ScriptedProber::new(&["10.0.0.1"]),
            trust: &RecordingTrust::default(),
            metadata: &metadata,
        };

        let err = register_instance(&mut sb.ctx, &config(&server), &RunOptions::default(), &with)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::AgentMissing { ref agent } if agent == "issuing-agent"));
        directory.assert_calls(0);
    }
}
