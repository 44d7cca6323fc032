//! Beame credentials CLI - provision edge clients under local developer/app credentials

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beame_creds::api::http::{HttpProvisionApi, HttpProxyDirectory};
use beame_creds::config::{OsEnvConfig, ProvisionConfig};
use beame_creds::edge::EdgeClientService;
use beame_creds::pki::RcgenCsrGenerator;
use beame_creds::store::FsStore;

/// Beame credentials - hierarchical X.509 provisioning
#[derive(Parser, Debug)]
#[command(name = "beame-creds", version, about, long_about = None)]
struct Cli {
    /// Root of the credential directory tree
    #[arg(long, global = true)]
    root_dir: Option<PathBuf>,

    /// Load-balancer directory listing registration proxies
    #[arg(long, global = true)]
    load_balancer: Option<String>,

    /// Provisioning API endpoint
    #[arg(long, global = true)]
    provision_api: Option<String>,

    /// Issuer domain of beame-issued certificates
    #[arg(long, global = true)]
    ca_domain: Option<String>,

    /// Timeout for each remote call in seconds
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Extra root CA (PEM) trusted for the provisioning API
    #[arg(long, global = true, env = "BEAME_PROVISION_CA_CERT")]
    ca_cert: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register a new edge client and issue its certificate
    CreateEdgeClient {
        /// Developer hostname
        developer: String,
        /// App hostname
        app: String,
    },

    /// Register a new edge client without issuing a certificate
    RegisterEdgeClient {
        /// Developer hostname
        developer: String,
        /// App hostname
        app: String,
    },

    /// Issue a certificate for a registered edge client
    GetCert {
        /// Developer hostname
        developer: String,
        /// App hostname
        app: String,
        /// Edge client hostname
        edge: String,
    },

    /// Print a stored credential
    Show {
        /// Developer hostname
        developer: String,
        /// App hostname
        app: String,
        /// Edge client hostname
        edge: Option<String>,
    },
}

impl Cli {
    fn config(&self) -> ProvisionConfig {
        let mut config = ProvisionConfig::from_env(&OsEnvConfig);
        if let Some(root_dir) = &self.root_dir {
            config.root_dir = root_dir.clone();
        }
        if let Some(endpoint) = &self.load_balancer {
            config.load_balancer_endpoint = endpoint.clone();
        }
        if let Some(endpoint) = &self.provision_api {
            config.provision_api_endpoint = endpoint.clone();
        }
        if let Some(domain) = &self.ca_domain {
            config.ca_domain_suffix = domain.clone();
        }
        if let Some(secs) = self.timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let service = build_service(&cli, cli.config()).await?;

    let cancel = service.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::CreateEdgeClient { developer, app } => {
            let metadata = service
                .create_edge_client(&developer, &app)
                .await
                .inspect_err(report_unsaved)?;
            info!(edge = %metadata.fqdn, "Edge client created");
            print_json(&metadata)
        }
        Commands::RegisterEdgeClient { developer, app } => {
            let metadata = service
                .register_edge_client(&developer, &app)
                .await
                .inspect_err(report_unsaved)?;
            print_json(&metadata)
        }
        Commands::GetCert {
            developer,
            app,
            edge,
        } => {
            let metadata = service
                .get_cert(&developer, &app, &edge)
                .await
                .inspect_err(report_unsaved)?;
            print_json(&metadata)
        }
        Commands::Show {
            developer,
            app,
            edge,
        } => {
            let credential = service
                .load_credential(&developer, &app, edge.as_deref())
                .await?;
            print_json(&credential.to_json())
        }
    }
}

async fn build_service(cli: &Cli, config: ProvisionConfig) -> anyhow::Result<EdgeClientService> {
    let mut api = HttpProvisionApi::new(&config.provision_api_endpoint, config.request_timeout);
    if let Some(path) = &cli.ca_cert {
        let pem = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read CA certificate {:?}: {}", path, e))?;
        api = api.with_ca_cert(pem);
    }

    let directory = HttpProxyDirectory::new(config.request_timeout)
        .map_err(|e| anyhow::anyhow!("Failed to create directory client: {}", e))?;

    info!(root = %config.root_dir.display(), "Using credential root");

    Ok(EdgeClientService::new(
        config,
        Arc::new(FsStore::new()),
        Arc::new(api),
        Arc::new(directory),
        Arc::new(RcgenCsrGenerator),
    ))
}

/// Last resort so material minted remotely is not lost with the process
fn report_unsaved(err: &beame_creds::Error) {
    if let Some(issued) = err.unsaved_certificate() {
        eprintln!(
            "Certificate for {} was issued but not saved to {}:",
            issued.hostname,
            issued.edge_dir.display()
        );
        eprintln!("{}", issued.private_key_pem);
        eprintln!("{}", issued.payload.x509);
    }
    if let Some(payload) = err.unsaved_registration() {
        eprintln!("Edge client {} was registered but not saved:", payload.hostname);
        match serde_json::to_string_pretty(payload) {
            Ok(json) => eprintln!("{json}"),
            Err(_) => eprintln!("hostname={} uid={}", payload.hostname, payload.uid),
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| anyhow::anyhow!("Failed to serialize output: {}", e))?;
    println!("{json}");
    Ok(())
}
