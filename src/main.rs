mod cli;

use lanreel::{config, preview, server};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::path::Path;

async fn start_server(host: String, port: u16, config_path: Option<&Path>) -> Result<()> {
    // Load config
    let mut config = config::load_config_or_default(config_path)?;

    // Override host/port from CLI if specified
    config.server.host = host;
    config.server.port = port;

    tracing::info!("Starting lanreel server");
    tracing::info!(
        "Server will listen on {}:{}",
        config.server.host,
        config.server.port
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "lanreel=trace,lanreel_av=debug,tower_http=debug".to_string()
        } else {
            "lanreel=info,lanreel_av=info,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { file, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_file(&file, json))
        }
        Commands::Preview { file, output } => extract_preview(&file, output.as_deref()),
        Commands::CheckTools => check_tools(),
        Commands::Version => {
            println!("lanreel {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_file(file: &Path, json: bool) -> Result<()> {
    let ffprobe = lanreel_av::require_tool("ffprobe")?;
    let duration = lanreel_av::probe_duration(&ffprobe, file).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "file": file, "duration_secs": duration })
        );
    } else {
        println!("{}: {duration:.3}s", file.display());
    }
    Ok(())
}

fn extract_preview(file: &Path, output: Option<&Path>) -> Result<()> {
    let data = preview::extract_preview_from_file(file)
        .ok_or_else(|| anyhow::anyhow!("no displayable preview found in {}", file.display()))?;

    let out = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| file.with_extension("jpg"));
    std::fs::write(&out, &data)?;
    println!("wrote {} ({} bytes)", out.display(), data.len());
    Ok(())
}

fn check_tools() -> Result<()> {
    let mut all_ok = true;
    for tool in lanreel_av::check_tools() {
        if tool.available {
            println!("{:10} OK   {}", tool.name, tool.version.unwrap_or_default());
        } else {
            println!("{:10} MISSING", tool.name);
            all_ok = false;
        }
    }
    if !all_ok {
        anyhow::bail!("some required tools are missing");
    }
    Ok(())
}
