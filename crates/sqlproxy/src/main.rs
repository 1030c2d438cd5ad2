//! SQLProxy server binary.
//!
//! Listens for MySQL clients and relays them to one upstream server over a
//! pool of reusable, already-authenticated connections.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use sqlproxy::{ConfigOverrides, Proxy, ProxyConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqlproxy")]
#[command(version, about = "SQLProxy - pooling MySQL proxy")]
struct Args {
    /// JSON configuration file; flags override its values
    #[arg(long, env = "SQLPROXY_CONFIG")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let loaded = load_config(&args);
    let debug = loaded.as_ref().map_or(args.overrides.debug, |config| config.debug);
    init_logging(debug);

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    info!("Starting SQLProxy {}", env!("CARGO_PKG_VERSION"));
    info!("  listen: {}", config.listen);
    info!("  upstream: {}:{}", config.upstream_host, config.upstream_port);
    info!("  pool max size: {}", config.pool_max_size);
    info!("  max lifetime: {}s", config.max_lifetime_secs);
    info!("  wait timeout: {}ms", config.wait_timeout_ms);
    info!("  connect timeout: {}s", config.connect_timeout_secs);

    let proxy = match Proxy::bind(&config) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(listen = %config.listen, error = %e, "failed to start proxy");
            return ExitCode::FAILURE;
        }
    };

    match proxy.serve() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "proxy stopped with error");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> sqlproxy::Result<ProxyConfig> {
    let base = match &args.config {
        Some(path) => ProxyConfig::load(path)?,
        None => ProxyConfig::default(),
    };
    let config = base.merge(&args.overrides);
    config.validate()?;
    Ok(config)
}

/// Install the global subscriber. `RUST_LOG` wins over `--debug`.
fn init_logging(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
