//! Cloud guest registration client entry point.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use log::{error, info};

mod agent;
mod cache;
mod config;
mod context;
mod error;
mod failover;
mod flow;
mod hosts;
mod metadata;
mod packages;
mod probe;
mod reconcile;
mod region;
mod register;
mod trust;
mod types;
mod zypp;

use agent::SuseConnect;
use cache::EndpointCache;
use config::Config;
use context::RunContext;
use flow::{Collaborators, RunOptions, RunOutcome};
use hosts::HostsTable;
use metadata::ProductMetadataClient;
use packages::Zypper;
use probe::TcpProber;
use trust::CertificateImporter;
use zypp::ZyppState;

#[derive(Parser, Debug)]
#[command(name = "registercloudguest")]
#[command(about = "Register a cloud instance with its region's update infrastructure", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Drop all registration state and register from scratch
    #[arg(long)]
    force_new: bool,

    /// Seconds to wait before starting
    #[arg(long, value_name = "SECS")]
    delay: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::load(cli.config.as_deref())?;
    init_logging(cfg.log_file.as_deref())?;
    info!("Starting registration with config: {:?}", cfg);

    if let Err(err) = run(&cli, &cfg).await {
        error!("{}", err);
        std::process::exit(err.exit_code());
    }
    Ok(())
}

async fn run(cli: &Cli, cfg: &Config) -> error::Result<()> {
    let mut ctx = RunContext::new(
        EndpointCache::new(&cfg.data_dir),
        HostsTable::new(&cfg.hosts_file),
        ZyppState::new(&cfg.zypp_dir),
    );
    let agent = SuseConnect::new(&cfg.agent_path);
    let trust = CertificateImporter::new(
        &cfg.cert_dir,
        cfg.cert_update_command.clone(),
        cfg.http_timeout(),
    )?;
    let metadata = ProductMetadataClient::new(cfg.http_timeout())?;
    let with = Collaborators {
        agent: &agent,
        packages: &Zypper::new(),
        prober: &TcpProber::new(cfg.probe_port, cfg.probe_timeout()),
        trust: &trust,
        metadata: &metadata,
    };
    let options = RunOptions {
        force_new: cli.force_new,
        delay: cli.delay.map(Duration::from_secs),
    };

    match flow::register_instance(&mut ctx, cfg, &options, &with).await? {
        RunOutcome::AlreadyRegistered(server) => {
            info!("Already registered with {}", server.fqdn)
        }
        RunOutcome::Registered { server, modules } => info!(
            "Registration with {} complete, {} module(s) registered, {} failed",
            server.fqdn,
            modules.registered.len(),
            modules.failed.len()
        ),
    }
    Ok(())
}

fn init_logging(log_file: Option<&Path>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| anyhow::anyhow!("Could not open log file {}: {}", path.display(), e))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}
