//! localrt CLI - inspect devices and load plugins from the command line.
//!
//! # Usage
//!
//! ```bash
//! # List devices of every enabled backend
//! lrt devices
//! lrt devices --backend host --backend amdgpu --json
//!
//! # Load a plugin onto a device, then shut down
//! lrt load ./libmatmul.so --device host:0
//!
//! # Show help
//! lrt --help
//! ```

mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use localrt_core::{BackendKind, DeviceId, ExecutableArtifact, System, SystemConfig, SystemFactory};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// localrt system manager CLI.
///
/// Builds a system from configuration, reports what it found, and loads
/// executable plugins onto its devices.
#[derive(Parser)]
#[command(name = "lrt", version, about)]
struct Cli {
    /// Configuration file (default: $LOCALRT_CONFIG, then the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a system and print its devices
    Devices {
        /// Backends to enable (repeatable); replaces the configured list
        #[arg(long = "backend", value_name = "KIND")]
        backends: Vec<BackendKind>,

        /// Worker threads per host device
        #[arg(long)]
        threads: Option<usize>,

        /// Output the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a plugin onto a device
    Load {
        /// Plugin file
        path: PathBuf,

        /// Target device, e.g. `host:0` or `amdgpu:1`
        #[arg(long, default_value = "host:0")]
        device: DeviceId,

        /// Artifact identity (default: file stem)
        #[arg(long)]
        id: Option<String>,

        /// Output the residency as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the default level
    let default_level = if cli.verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut system_config = config::load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Devices {
            backends,
            threads,
            json,
        } => {
            if !backends.is_empty() {
                system_config.backends = backends;
            }
            if let Some(threads) = threads {
                system_config = system_config.with_worker_threads(threads);
            }

            let mut system = build(&system_config)?;
            let report = system.report();
            let output = if json {
                output::format_json(&report)
            } else {
                output::format_human(&report)
            };
            println!("{}", output);
            system.shutdown();
        }
        Command::Load {
            path,
            device,
            id,
            json,
        } => {
            if !system_config.backends.contains(&device.kind) {
                system_config = system_config.with_backend(device.kind);
            }
            let id = match id {
                Some(id) => id,
                None => artifact_name(&path)?,
            };

            let mut system = build(&system_config)?;
            let artifact = ExecutableArtifact::from_file(id, device.kind, path.clone());
            let loaded = system
                .load(&artifact, &device)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            info!("Loaded {} as '{}'", path.display(), loaded.artifact());
            let resident = system.residency_count();
            let output = if json {
                output::format_loaded_json(&loaded, resident)
            } else {
                output::format_loaded(&loaded, resident)
            };
            println!("{}", output);
            system.shutdown();
        }
    }

    Ok(())
}

fn build(config: &SystemConfig) -> Result<System> {
    SystemFactory::with_compiled_backends()
        .build(config)
        .context("Failed to build system")
}

/// Artifact identity derived from a plugin path: the file stem without a
/// leading `lib`.
fn artifact_name(path: &std::path::Path) -> Result<String> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .with_context(|| format!("Cannot derive artifact id from {}", path.display()))?;
    let name = stem.strip_prefix("lib").unwrap_or(stem);
    Ok(name.to_string())
}
