//! kilnd — the Kiln daemon.
//!
//! One binary, three roles:
//! - `standalone`: pool manager API and a fetcher sidecar in one process,
//!   with runtime containers reachable on a single host
//! - `poolmgr`: the pool manager API only
//! - `fetcher`: the fetcher sidecar that runs next to every runtime
//!
//! # Usage
//!
//! ```text
//! kilnd --config kiln.toml standalone --port 8888 --data-dir /var/lib/kiln
//! kilnd fetcher --port 8000 --shared-path /userfunc --function-source-url http://poolmgr:8888
//! kilnd default-config > kiln.toml
//! ```

mod fetcher_mode;
mod pool_manager;
mod shutdown;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use kiln_core::KilnConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,kilnd=debug,kiln=debug";

#[derive(Parser)]
#[command(name = "kilnd", about = "Kiln warm-container scheduler daemon")]
struct Cli {
    /// Path to kiln.toml; defaults apply when omitted.
    #[arg(long, global = true, env = "KILN_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Pool manager and fetcher in one process (single host).
    Standalone {
        /// Pool manager API port.
        #[arg(long, env = "KILN_PORT", default_value = "8888")]
        port: u16,

        /// Directory for the metadata store.
        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,

        /// Fetcher port; overrides `fetcher.port`.
        #[arg(long, env = "KILN_FETCHER_PORT")]
        fetcher_port: Option<u16>,

        /// Shared code directory; overrides `fetcher.shared_path`.
        #[arg(long, env = "KILN_SHARED_PATH")]
        shared_path: Option<PathBuf>,

        /// Host on which runtime containers listen.
        #[arg(long, default_value = "127.0.0.1")]
        runtime_host: String,
    },

    /// Pool manager API only.
    Poolmgr {
        #[arg(long, env = "KILN_PORT", default_value = "8888")]
        port: u16,

        #[arg(long, default_value = "/var/lib/kiln")]
        data_dir: PathBuf,

        #[arg(long, default_value = "127.0.0.1")]
        runtime_host: String,
    },

    /// Fetcher sidecar.
    Fetcher {
        #[arg(long, env = "KILN_FETCHER_PORT")]
        port: Option<u16>,

        #[arg(long, env = "KILN_SHARED_PATH")]
        shared_path: Option<PathBuf>,

        /// Pool manager API used to resolve function definitions;
        /// overrides `fetcher.function_source_url`.
        #[arg(long, env = "KILN_FUNCTION_SOURCE_URL")]
        function_source_url: Option<String>,
    },

    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Standalone {
            port,
            data_dir,
            fetcher_port,
            shared_path,
            runtime_host,
        } => {
            apply_fetcher_overrides(&mut config, fetcher_port, shared_path, None);
            align_standalone(&mut config);
            pool_manager::run(config, port, data_dir, runtime_host, true).await
        }
        Command::Poolmgr {
            port,
            data_dir,
            runtime_host,
        } => pool_manager::run(config, port, data_dir, runtime_host, false).await,
        Command::Fetcher {
            port,
            shared_path,
            function_source_url,
        } => {
            apply_fetcher_overrides(&mut config, port, shared_path, function_source_url);
            fetcher_mode::run(config).await
        }
        Command::DefaultConfig => {
            print!("{}", KilnConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<KilnConfig> {
    match path {
        Some(path) => {
            let config = KilnConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?;
            info!(path = %path.display(), "configuration loaded");
            Ok(config)
        }
        None => Ok(KilnConfig::default()),
    }
}

fn apply_fetcher_overrides(
    config: &mut KilnConfig,
    port: Option<u16>,
    shared_path: Option<PathBuf>,
    function_source_url: Option<String>,
) {
    if let Some(port) = port {
        config.fetcher.port = port;
    }
    if let Some(path) = shared_path {
        config.fetcher.shared_path = path;
    }
    if function_source_url.is_some() {
        config.fetcher.function_source_url = function_source_url;
    }
}

/// In standalone mode the runtimes share this host's filesystem and reach
/// the in-process fetcher, so the pool manager must point at both.
fn align_standalone(config: &mut KilnConfig) {
    config.poolmgr.fetcher_port = config.fetcher.port;
    config.poolmgr.shared_mount_path = config.fetcher.shared_path.to_string_lossy().into_owned();
}
