mod node;

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use mesh_bootstrap::{AppConfig, CliArgs};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Mesh node - registers a gRPC service host and calls its peers
#[derive(Parser)]
#[command(name = "mesh-node")]
#[command(about = "Mesh node - service discovery, pooled connections and dynamic gRPC calls")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port override for the gRPC server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this node and serve until interrupted
    Serve,
    /// Print the instances registered under a service name
    List {
        /// Service name
        name: String,
    },
    /// Call a unary method on an instance of a service with a JSON request
    Call {
        /// Service name to discover instances under
        name: String,
        /// Method name, e.g. `Check`
        method: String,
        /// Fully qualified gRPC service (defaults to the service name)
        #[arg(long)]
        grpc_service: Option<String>,
        /// JSON request body
        #[arg(short, long, default_value = "{}")]
        data: String,
        /// Trace id to propagate instead of a generated one
        #[arg(long)]
        trace_id: Option<String>,
        /// User id to propagate instead of the local service name
        #[arg(long)]
        user_id: Option<String>,
    },
    /// Validate configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(ref path) = cli.config
        && !Path::new(path).is_file()
    {
        anyhow::bail!("config file does not exist: {}", path.display());
    }

    let args = CliArgs {
        config: cli.config.as_ref().map(|p| p.to_string_lossy().to_string()),
        print_config: cli.print_config,
        verbose: cli.verbose,
    };

    // defaults -> YAML -> MESH__* env -> CLI
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);
    if let Some(port) = cli.port {
        config.server.port = port;
        config.validate()?;
    }

    if cli.print_config {
        println!("Effective configuration:\n{}", config.to_yaml()?);
        return Ok(());
    }

    let _logging = mesh_bootstrap::init_logging(&config.logging)?;
    tracing::info!(service = %config.service.name, "mesh node starting");

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => node::serve(&config).await,
        Commands::List { name } => node::list(&config, &name).await,
        Commands::Call {
            name,
            method,
            grpc_service,
            data,
            trace_id,
            user_id,
        } => {
            let request = node::CallRequest {
                name,
                method,
                grpc_service,
                data,
                trace_id,
                user_id,
            };
            node::call(&config, request).await
        }
        Commands::Check => check_config(&config),
    }
}

fn check_config(config: &AppConfig) -> Result<()> {
    tracing::info!("Checking configuration...");
    println!("Configuration is valid");
    println!("{}", config.to_yaml()?);
    Ok(())
}
