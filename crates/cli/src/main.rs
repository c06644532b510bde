use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use server::config::DashboardConfig;
use server::{create_router, state::AppState};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "opsdash")]
#[command(about = "Operations dashboard backend with build orchestration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to <config dir>/opsdash/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(Args, Clone, Default)]
struct ServeArgs {
    #[arg(long, env = "SD_NODE_HOST")]
    host: Option<String>,

    #[arg(short, long, env = "SD_NODE_PORT")]
    port: Option<u16>,

    /// Directory with the built frontend to serve
    #[arg(long)]
    app_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP server (default)
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config)?;

    match cli.command {
        Some(Commands::Init { force }) => init_config(&config_path, force).await,
        Some(Commands::Serve(args)) => serve(&config_path, args).await,
        None => serve(&config_path, cli.serve).await,
    }
}

fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => DashboardConfig::default_path()
            .context("Could not determine the user config directory; pass --config"),
    }
}

async fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it.");
        return Ok(());
    }

    DashboardConfig::default()
        .write(path)
        .await
        .with_context(|| format!("Failed to write config to {}", path.display()))?;

    println!("Wrote default config to {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Set [build] repo_path and the account names for your machine");
    println!("  2. Run 'opsdash' to start the server");

    Ok(())
}

async fn serve(config_path: &Path, args: ServeArgs) -> Result<()> {
    init_tracing();

    let mut config = DashboardConfig::read(config_path)
        .await
        .context("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Config: {}", config_path.display());
    tracing::info!("Repository: {}", config.build.repo_path.display());

    let mut state = AppState::new(config);
    if let Some(app_dir) = args.app_dir {
        tracing::info!("Serving frontend from {}", app_dir.display());
        state = state.with_app_dir(app_dir);
    }
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    println!();
    println!("opsdash");
    println!("════════════════════════════════════════");
    println!();
    println!("  API Server:  http://{}", addr);
    println!("  Swagger UI:  http://{}/swagger-ui", addr);
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "opsdash=info,server=info,orchestrator=info,tower_http=info".into()
            }),
        )
        .init();
}
