//! tlsmuxd - Main entry point
//!
//! TLS-terminating reverse proxy routing by ALPN protocol and server name.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tlsmux_config::ProxyConfig;
use tlsmux_proxy::{
    bind, handshake, AcmeClient, CertificateProvider, CertificateStorage, ChallengeManager,
    ProxyContext, RenewalScheduler, RotatingTicketer, SessionKeyRotator, ShutdownSignals,
};

const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/tlsmuxd/config.json";

/// tlsmuxd - TLS multiplexing reverse proxy
#[derive(Parser, Debug)]
#[command(name = "tlsmuxd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path (JSON, or TOML with a .toml extension)
    #[arg(short = 'c', long = "config", env = "TLSMUX_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose")]
    verbose: bool,

    /// Log level when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    if cli.test {
        return test_config(&cli.config);
    }

    // The ACME HTTP client builds its TLS config from the process default provider
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;

    // Exit without waiting for connection tasks: shutdown does not drain
    match runtime.block_on(run_server(&cli.config)) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %format!("{e:#}"), "Fatal error");
            std::process::exit(1);
        }
    }
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

fn load_config(path: &Path) -> Result<ProxyConfig> {
    info!("Loading configuration from: {}", path.display());
    ProxyConfig::from_file(path).context("Failed to load configuration file")
}

/// Test configuration file and exit
fn test_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let routes = config
        .routing_table()
        .context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - {} interface(s) on port {}", config.bind_interfaces().len(), config.port);
    info!(
        "  - {} protocol(s), default {:?}",
        routes.protocols().len(),
        routes.default_protocol()
    );
    info!("  - {} hostname(s)", routes.hostnames().len());
    for protocol in routes.protocols() {
        let Some(hosts) = routes.hosts(protocol) else {
            continue;
        };
        let mut hosts: Vec<_> = hosts.values().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        for backend in hosts {
            info!("    {} -> {}", backend, backend.addr);
        }
    }

    println!(
        "tlsmuxd: configuration file {} test is successful",
        path.display()
    );

    Ok(())
}

/// Run the proxy until a termination signal or a fatal error
async fn run_server(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let routes = config.routing_table().context("Invalid configuration")?;

    let tickets = &config.session_tickets;
    let ticketer = Arc::new(
        RotatingTicketer::generate(tickets.key_capacity, tickets.rotation_interval())
            .context("Failed to generate session ticket key")?,
    );

    let storage = Arc::new(
        CertificateStorage::new(Path::new(&config.cache_dir))
            .with_context(|| format!("Failed to open certificate cache {}", config.cache_dir))?,
    );
    let challenges = ChallengeManager::new();
    let client = AcmeClient::new(
        &config.acme,
        config.email.as_deref(),
        Arc::clone(&storage),
        challenges.clone(),
    );
    info!(directory = client.directory_url(), "Using ACME directory");

    let provider = Arc::new(CertificateProvider::new(
        routes.hostnames(),
        storage,
        Arc::new(client),
        challenges,
        config.acme.renew_before_days,
    ));

    let ctx = Arc::new(
        ProxyContext::new(
            routes,
            Arc::clone(&provider),
            Arc::clone(&ticketer),
            &config.relay,
        )
        .context("Failed to build TLS configuration")?,
    );

    let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;

    let acceptors = config
        .bind_interfaces()
        .iter()
        .map(|interface| bind(interface, config.port))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to bind listener")?;

    info!(
        listeners = acceptors.len(),
        protocols = ?ctx.routes.protocols(),
        buffer_size = ctx.buffers.buffer_size(),
        dial_timeout_ms = ctx.dial_timeout.as_millis() as u64,
        "initialized"
    );

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<Result<()>> = JoinSet::new();

    for acceptor in acceptors {
        let ctx = Arc::clone(&ctx);
        tasks.spawn(async move {
            handshake::run(acceptor, ctx)
                .await
                .context("Accept loop failed")
        });
    }

    let rotator = SessionKeyRotator::new(Arc::clone(&ticketer), tickets.rotation_interval());
    let rotator_cancel = cancel.clone();
    tasks.spawn(async move {
        rotator
            .run(rotator_cancel)
            .await
            .context("Session ticket key rotation failed")
    });

    let scheduler = RenewalScheduler::new(provider);
    let scheduler_cancel = cancel.clone();
    tasks.spawn(async move {
        scheduler.run(scheduler_cancel).await;
        Ok(())
    });

    let result = loop {
        tokio::select! {
            signal = signals.recv() => {
                info!(signal = %signal, "terminating");
                break Ok(());
            }
            Some(joined) = tasks.join_next() => match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => break Err(e),
                Err(e) => break Err(anyhow!(e).context("Background task failed")),
            },
        }
    };

    cancel.cancel();
    result
}
