use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use hostcrab::model::{Account, Domain, DomainKind};
use hostcrab::tls::x509;
use hostcrab::{
    Config, FsArtifacts, Orchestrator, RenewalScheduler, SharedConfig, SystemClock, SystemRunner,
    TracingNotifier,
};
use is_terminal::IsTerminal;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Hosting control plane: DNS zones, virtual hosts and TLS certificates
#[derive(Parser, Debug)]
#[command(name = "hostcrab", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "HOSTCRAB_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Renew expiring certificates every `renewal_interval` until interrupted
    Serve,

    /// Create the zone and virtual host of a domain, optionally with a certificate
    Provision {
        domain: String,

        /// Owning system user
        #[arg(long)]
        user: String,

        #[arg(long)]
        uid: u32,

        #[arg(long)]
        gid: u32,

        /// Home directory of the owning user
        #[arg(long)]
        home: PathBuf,

        /// Document root (defaults to <home>/public_html)
        #[arg(long)]
        docroot: Option<PathBuf>,

        /// primary, addon, alias or parked
        #[arg(long, default_value = "primary")]
        kind: DomainKind,

        /// Issue and install a certificate
        #[arg(long)]
        ssl: bool,
    },

    /// Remove the virtual host, zone and certificate of a domain
    Deprovision { domain: String },

    /// Run one renewal sweep
    Renew {
        /// Renew certificates expiring within this many days
        #[arg(long)]
        days: Option<u32>,

        /// Only list the certificates that would be renewed
        #[arg(long)]
        dry_run: bool,
    },

    /// Check that a private key belongs to a certificate
    VerifyPair {
        #[arg(long)]
        cert: PathBuf,

        #[arg(long)]
        key: PathBuf,
    },

    /// Print the version of the configured web server
    Versions,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init();

    let cli = Cli::parse();
    let config = config_init(&cli.config)?;

    if let Commands::VerifyPair { cert, key } = &cli.command {
        let cert = tokio::fs::read_to_string(cert).await?;
        let key = tokio::fs::read_to_string(key).await?;
        if !x509::verify_pair(&cert, &key) {
            return Err(hostcrab::Error::CertificateMismatch.into());
        }
        println!("certificate and key match");
        return Ok(());
    }

    let orchestrator = Arc::new(
        Orchestrator::from_config(
            &config,
            Arc::new(FsArtifacts),
            Arc::new(SystemRunner::new(config.command_timeout)),
            Arc::new(SystemClock),
            Arc::new(TracingNotifier),
        )
        .await?,
    );

    match cli.command {
        Commands::Serve => {
            let scheduler = RenewalScheduler::new(orchestrator, config.tls.renewal_interval);
            scheduler
                .run(async {
                    if let Err(err) = signal::ctrl_c().await {
                        tracing::error!("failed to listen for ctrl-c: {err}");
                    }
                    tracing::info!("quitting from signal");
                })
                .await;
            tracing::info!("goodbye");
        }
        Commands::Provision {
            domain,
            user,
            uid,
            gid,
            home,
            docroot,
            kind,
            ssl,
        } => {
            let document_root = docroot.unwrap_or_else(|| home.join("public_html"));
            let account = Account {
                username: user,
                uid,
                gid,
                home,
            };
            let domain = Domain::new(domain, account, document_root, kind);
            let report = orchestrator.provision(domain, ssl).await?;
            print_json(&report)?;
            if !report.is_complete() {
                return Err(anyhow!("provisioning of {} is incomplete", report.domain));
            }
        }
        Commands::Deprovision { domain } => {
            let report = orchestrator.deprovision(&domain).await?;
            print_json(&report)?;
            if !report.is_complete() {
                return Err(anyhow!("deprovisioning of {} is incomplete", report.domain));
            }
        }
        Commands::Renew { days, dry_run } => {
            let report = orchestrator.renew_sweep(days, dry_run).await;
            print_json(&report)?;
            if !report.failed.is_empty() {
                return Err(anyhow!("{} renewals failed", report.failed.len()));
            }
        }
        Commands::Versions => {
            let web = orchestrator.web();
            println!("{:?} {}", web.kind(), web.version().await?);
        }
        Commands::VerifyPair { .. } => {}
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = if std::io::stdout().is_terminal() {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{out}");
    Ok(())
}

fn tracing_init() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostcrab=info".into()),
        )
        .init();
}

fn config_init(config_file: &Path) -> Result<SharedConfig> {
    let config = Config::try_from_file(config_file)
        .map_err(|err| anyhow!("failed to load {}: {err}", config_file.display()))?;
    tracing::debug!("loaded config from {}", config_file.display());
    Ok(Arc::new(config))
}
