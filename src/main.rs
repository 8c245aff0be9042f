//! dotlocal CLI - expose local services under .local domain names

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dotlocal::config::{Config, ProxyMode};
use dotlocal::state::{SavedTunnel, TunnelStore};
use dotlocal_cert::CertificateProvider;
use dotlocal_control::{normalize_domain, ListenMode, TunnelManager};
use dotlocal_proxy::{SharedProxy, SharedProxyConfig};
use dotlocal_router::RouteTable;
use dotlocal_system::{
    has_elevated_privileges, is_privileged_port, registrar::outbound_ip, LocalRegistrar,
    SystemHostsFile,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Fallback listen ports when privileged ports cannot be bound
const UNPRIVILEGED_HTTP_PORT: u16 = 8080;
const UNPRIVILEGED_HTTPS_PORT: u16 = 8443;

#[derive(Parser, Debug)]
#[command(name = "dotlocal")]
#[command(about = "Expose local services under friendly .local domain names", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.dotlocal/config.yml)
    #[arg(long, global = true, env = "DOTLOCAL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a tunnel, or every enabled tunnel from the config file
    Start {
        /// Domain to expose (".local" is appended when missing)
        domain: Option<String>,

        /// Local port of the service to expose
        #[arg(short, long, requires = "domain")]
        port: Option<u16>,

        /// Serve the domain over HTTPS with a self-signed certificate
        #[arg(long)]
        https: bool,

        /// HTTP listen port
        #[arg(long, env = "DOTLOCAL_HTTP_PORT")]
        http_port: Option<u16>,

        /// HTTPS listen port
        #[arg(long, env = "DOTLOCAL_HTTPS_PORT")]
        https_port: Option<u16>,

        /// Route every tunnel through one shared listener
        #[arg(long)]
        shared: bool,

        /// Directory holding generated certificates
        #[arg(long, env = "DOTLOCAL_CERTS_DIR")]
        certs_dir: Option<PathBuf>,

        /// Hosts file to edit
        #[arg(long, env = "DOTLOCAL_HOSTS_FILE")]
        hosts_file: Option<PathBuf>,
    },

    /// Start the tunnels saved by previous runs
    Resume {
        /// Route every tunnel through one shared listener
        #[arg(long)]
        shared: bool,
    },

    /// List saved tunnels
    List,

    /// Remove a saved tunnel
    Forget {
        domain: String,
    },

    /// Ensure a certificate exists for a domain and show where it is
    Certs {
        domain: String,

        /// Directory holding generated certificates
        #[arg(long, env = "DOTLOCAL_CERTS_DIR")]
        certs_dir: Option<PathBuf>,
    },
}

/// One tunnel to bring up
#[derive(Debug, Clone)]
struct TunnelRequest {
    domain: String,
    port: u16,
    https: bool,
    http_port: Option<u16>,
    https_port: Option<u16>,
}

impl From<&SavedTunnel> for TunnelRequest {
    fn from(saved: &SavedTunnel) -> Self {
        Self {
            domain: saved.domain.clone(),
            port: saved.port,
            https: saved.https,
            http_port: saved.http_port,
            https_port: saved.https_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    init_logging(log_level)?;

    let mut config = Config::load(cli.config.as_deref())?;
    let store = TunnelStore::new(TunnelStore::default_path());

    match cli.command {
        Commands::Start {
            domain,
            port,
            https,
            http_port,
            https_port,
            shared,
            certs_dir,
            hosts_file,
        } => {
            if certs_dir.is_some() {
                config.certs_dir = certs_dir;
            }
            if hosts_file.is_some() {
                config.hosts_file = hosts_file;
            }
            if shared {
                config.proxy.mode = ProxyMode::Shared;
            }

            let requests = match domain {
                Some(domain) => {
                    let port = port.context("--port is required when a domain is given")?;
                    vec![TunnelRequest {
                        domain,
                        port,
                        https,
                        http_port,
                        https_port,
                    }]
                }
                None => config
                    .enabled_tunnels()
                    .map(|t| TunnelRequest {
                        domain: t.domain.clone(),
                        port: t.port,
                        https: t.https,
                        http_port,
                        https_port,
                    })
                    .collect(),
            };
            if requests.is_empty() {
                bail!("Nothing to start: pass a domain and --port, or add tunnels to the config file");
            }

            run(&config, &store, requests).await
        }
        Commands::Resume { shared } => {
            if shared {
                config.proxy.mode = ProxyMode::Shared;
            }
            let saved = store.load()?;
            if saved.is_empty() {
                bail!("No saved tunnels in {}", store.path().display());
            }
            run(&config, &store, saved.iter().map(TunnelRequest::from).collect()).await
        }
        Commands::List => {
            let saved = store.load()?;
            if saved.is_empty() {
                println!("No saved tunnels");
                return Ok(());
            }
            println!("{:<32} {:>6}  {}", "DOMAIN", "PORT", "SCHEME");
            for tunnel in saved {
                println!(
                    "{:<32} {:>6}  {}",
                    tunnel.domain,
                    tunnel.port,
                    if tunnel.https { "https" } else { "http" }
                );
            }
            Ok(())
        }
        Commands::Forget { domain } => {
            let domain = normalize_domain(&domain, dotlocal_router::DEFAULT_SUFFIX)?;
            if store.remove(&domain)? {
                println!("Removed {}", domain);
            } else {
                println!("{} was not saved", domain);
            }
            Ok(())
        }
        Commands::Certs { domain, certs_dir } => {
            if certs_dir.is_some() {
                config.certs_dir = certs_dir;
            }
            let domain = normalize_domain(&domain, dotlocal_router::DEFAULT_SUFFIX)?;
            let provider = certificate_provider(&config);
            let cert = provider
                .ensure(&domain)
                .with_context(|| format!("Failed to ensure certificate for {}", domain))?;
            let paths = provider.store().paths(&domain)?;

            println!("Domain:      {}", cert.domain);
            println!("Certificate: {}", paths.cert.display());
            println!("Key:         {}", paths.key.display());
            println!("Valid from:  {}", cert.not_before);
            println!(
                "Valid until: {} ({} days left)",
                cert.not_after,
                cert.days_until_expiry()
            );
            Ok(())
        }
    }
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

fn certificate_provider(config: &Config) -> CertificateProvider {
    let lan_ip = outbound_ip();
    let provider = CertificateProvider::new(config.certs_dir());
    if lan_ip.is_loopback() {
        provider
    } else {
        provider.with_extra_ips(vec![lan_ip])
    }
}

/// Listen port, falling back to an unprivileged one without elevation
fn listen_port(port: u16, fallback: u16) -> u16 {
    if is_privileged_port(port) && !has_elevated_privileges() {
        warn!(
            "Port {} requires elevated privileges, using {} instead",
            port, fallback
        );
        fallback
    } else {
        port
    }
}

/// `scheme://domain`, with the port unless it is the scheme's default
fn public_url(scheme: &str, domain: &str, port: Option<u16>) -> String {
    let default_port = if scheme == "https" { 443 } else { 80 };
    match port {
        Some(port) if port != default_port => format!("{}://{}:{}", scheme, domain, port),
        _ => format!("{}://{}", scheme, domain),
    }
}

/// Start every request, wait for Ctrl+C, then stop everything
async fn run(config: &Config, store: &TunnelStore, requests: Vec<TunnelRequest>) -> Result<()> {
    let shared_proxy = match config.proxy.mode {
        ProxyMode::Dedicated => None,
        ProxyMode::Shared => {
            let http_port = listen_port(config.proxy.http_port, UNPRIVILEGED_HTTP_PORT);
            let https_addr = requests.iter().any(|r| r.https).then(|| {
                SocketAddr::new(
                    config.bind_ip,
                    listen_port(config.proxy.https_port, UNPRIVILEGED_HTTPS_PORT),
                )
            });
            let proxy_config = SharedProxyConfig {
                http_addr: SocketAddr::new(config.bind_ip, http_port),
                https_addr,
                proxy: dotlocal_proxy::ProxyConfig {
                    dial_timeout: Duration::from_secs(config.dial_timeout_secs),
                    response_timeout: Duration::from_secs(config.response_timeout_secs),
                },
            };
            let proxy = SharedProxy::start(proxy_config, Arc::new(RouteTable::new()))
                .await
                .context("Failed to start shared proxy")?;
            Some(Arc::new(proxy))
        }
    };

    if shared_proxy.is_none() && !has_elevated_privileges() {
        warn!("Not running with elevated privileges; editing the hosts file may fail");
    }

    let registrar = match LocalRegistrar::with_mdns() {
        Ok(registrar) => registrar,
        Err(e) => {
            warn!("mDNS responder unavailable, domains will not be announced on the network: {}", e);
            LocalRegistrar::new()
        }
    };

    let mode = match &shared_proxy {
        Some(proxy) => ListenMode::Shared(proxy.clone()),
        None => ListenMode::Dedicated,
    };
    let manager = TunnelManager::new(
        config.manager_config(),
        mode,
        Arc::new(certificate_provider(config)),
        Arc::new(registrar),
        Arc::new(SystemHostsFile::new(config.hosts_path())),
    );

    let suffix = config.manager_config().suffix;
    let mut listen_ports = HashMap::new();
    for request in &requests {
        let http_port = request.http_port.unwrap_or(config.proxy.http_port);
        let https_port = request.https_port.unwrap_or(config.proxy.https_port);

        match manager
            .start(
                &request.domain,
                i32::from(request.port),
                request.https,
                i32::from(http_port),
                i32::from(https_port),
            )
            .await
        {
            Ok(()) => {
                let domain = normalize_domain(&request.domain, &suffix)?;
                let listen_port = if request.https { https_port } else { http_port };
                listen_ports.insert(domain.clone(), listen_port);
                let saved = SavedTunnel {
                    domain,
                    port: request.port,
                    https: request.https,
                    http_port: request.http_port,
                    https_port: request.https_port,
                };
                if let Err(e) = store.upsert(saved) {
                    warn!("Failed to save tunnel state: {:#}", e);
                }
            }
            Err(e) => error!("Failed to start {}: {}", request.domain, e),
        }
    }

    if listen_ports.is_empty() {
        if let Some(proxy) = &shared_proxy {
            proxy.shutdown(Duration::from_secs(1)).await?;
        }
        bail!("No tunnel could be started");
    }

    for tunnel in manager.list().await {
        let scheme = if tunnel.use_https { "https" } else { "http" };
        let port = match &shared_proxy {
            Some(proxy) => proxy.port_for(tunnel.use_https),
            None => listen_ports.get(&tunnel.domain).copied(),
        };
        println!(
            "{} -> 127.0.0.1:{}",
            public_url(scheme, &tunnel.domain, port),
            tunnel.backend_port
        );
    }
    info!("{} tunnel(s) running, press Ctrl+C to stop", listen_ports.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    let result = manager.stop_all().await;
    if let Some(proxy) = &shared_proxy {
        if let Err(e) = proxy
            .shutdown(Duration::from_secs(config.shutdown_timeout_secs))
            .await
        {
            warn!("Failed to stop shared proxy: {}", e);
        }
    }
    result?;

    info!("All tunnels stopped");
    Ok(())
}
