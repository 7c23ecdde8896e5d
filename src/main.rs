// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use kuuzuki_bus::Bus;
use kuuzuki_core::App;
use kuuzuki_mcp::McpManager;
use kuuzuki_model::mock::EchoProvider;
use kuuzuki_model::ProviderRegistry;
use kuuzuki_permission::PermissionGate;
use kuuzuki_plugin::PluginHost;
use kuuzuki_storage::Storage;

#[derive(Parser)]
#[command(name = "kuuzuki", version, about = "Terminal AI coding assistant — session engine")]
struct Cli {
    /// Explicit config file (merged on top of the discovered layers).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr at DEBUG (overridable with KUUZUKI_LOG).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local HTTP/SSE server (the default).
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        /// Port to bind; 0 picks a free port and publishes it in the
        /// server-info file.
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
    /// Print the merged configuration as JSON.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(kuuzuki_config::load(cli.config.as_deref())?);

    match cli.command.unwrap_or(Commands::Serve {
        host: "127.0.0.1".into(),
        port: 0,
    }) {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(config.as_ref())?);
            Ok(())
        }
        Commands::Serve { host, port } => serve(config, &host, port).await,
    }
}

async fn serve(
    config: Arc<kuuzuki_config::Config>,
    host: &str,
    port: u16,
) -> anyhow::Result<()> {
    let data_dir = dirs::data_dir()
        .context("no user data directory available")?
        .join("kuuzuki");

    let bus = Bus::new();
    let storage = Arc::new(Storage::open(&data_dir, Arc::clone(&bus))?);

    // Wire adapters are supplied by embedders; the binary ships the mock so
    // the engine can be driven end-to-end out of the box.
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(EchoProvider));

    let tools = kuuzuki_tools::builtin_registry();
    let plugins = PluginHost::new(Vec::new());
    let permissions = PermissionGate::new(
        Arc::clone(&bus),
        Arc::clone(&plugins),
        kuuzuki_config::permission_from_env(),
        config.permission.clone(),
    );

    let mcp = McpManager::new(Arc::clone(&bus));
    mcp.start_all(&config.mcp, &tools).await;

    let root = std::env::current_dir().context("reading working directory")?;
    let app = App::assemble(
        bus,
        storage,
        Arc::clone(&config),
        Arc::new(providers),
        Arc::clone(&tools),
        permissions,
        plugins,
        None,
        root,
    )?;

    let result = kuuzuki_server::serve(app, host, port).await;
    mcp.shutdown_all(&tools).await;
    result
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("KUUZUKI_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
