//! testvault - check that a dev-mode Vault server can be launched here.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use std::path::PathBuf;
use testvault::{vault_version, FixtureConfig, TestVault};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "testvault", about = "Disposable Vault servers for tests", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the output of `vault version`
    Version {
        /// Vault binary to run
        #[arg(long, env = "TESTVAULT_BINARY", default_value = "vault")]
        binary: PathBuf,
    },
    /// Launch a dev server, probe its health, and stop it again
    Check {
        /// Vault binary to run (overrides the config file)
        #[arg(long)]
        binary: Option<PathBuf>,
        /// key=value config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        match cli.command {
            Command::Version { binary } => {
                let out = vault_version(&binary).await?;
                print!("{out}");
                Ok::<(), eyre::Report>(())
            }
            Command::Check { binary, config } => check(binary, config).await,
        }
    })
}

async fn check(binary: Option<PathBuf>, config_path: Option<PathBuf>) -> eyre::Result<()> {
    let mut config = match config_path {
        Some(path) => FixtureConfig::from_file(&path)
            .wrap_err_with(|| format!("failed to load {}", path.display()))?,
        None => FixtureConfig::default(),
    };
    config.apply_env()?;
    if let Some(binary) = binary {
        config.binary = binary;
    }

    let vault = TestVault::builder()
        .config(config)
        .launch()
        .await
        .wrap_err("vault did not come up")?;

    println!("address:  {}", vault.http_addr());
    println!("attempts: {}", vault.attempts());
    match vault.client().sys().health().await {
        Ok(health) => println!(
            "health:   initialized={} sealed={} version={}",
            health.initialized, health.sealed, health.version
        ),
        Err(e) => println!("health:   unavailable ({e})"),
    }

    vault.stop().await.wrap_err("vault did not stop cleanly")?;
    println!("stopped");
    Ok(())
}
