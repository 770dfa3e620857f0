//! installer-core - Main entry point

use anyhow::{bail, Context, Result};
use installer_core::cli::{Cli, Commands};
use installer_core::installer::{self, Installer};
use installer_core::process_guard;
use installer_core::settings::Settings;
use installer_core::{GlobalStore, QueueEvent, QueueOutcome};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Initialize logging; `RUST_LOG` overrides the default `info` level.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logger();
    debug!("installer-core {} starting up", env!("CARGO_PKG_VERSION"));

    // Children run in their own process groups; make sure they die with us.
    if let Err(e) = process_guard::install_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }

    let cli = Cli::parse_args();
    let result = match cli.command {
        Commands::Run {
            settings,
            dump_json,
            dump_yaml,
        } => run(&settings, dump_json, dump_yaml),
        Commands::Validate { settings } => validate(&settings),
        Commands::Lookup { store, key } => lookup(&store, &key),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("✗ {:#}", e);
        std::process::exit(1);
    }
}

fn load_settings(path: &Path) -> Result<Settings> {
    let settings = Settings::load(path)?;
    settings
        .validate()
        .with_context(|| format!("Invalid settings in {:?}", path))?;
    Ok(settings)
}

fn run(settings_path: &Path, dump_json: Option<PathBuf>, dump_yaml: Option<PathBuf>) -> Result<()> {
    info!("Loading settings from {:?}", settings_path);
    let settings = load_settings(settings_path)?;
    let storage = Arc::new(GlobalStore::new());
    let installer = Installer::with_storage(settings, Arc::clone(&storage));

    let outcome = installer.run(print_event)?;
    storage.debug_dump();

    // Dump even after a failure; the store shows how far the run got.
    if let Some(path) = dump_json {
        storage
            .save_json(&path)
            .with_context(|| format!("Failed to write global storage to {:?}", path))?;
        info!("Global storage written to {:?}", path);
    }
    if let Some(path) = dump_yaml {
        storage
            .save_yaml(&path)
            .with_context(|| format!("Failed to write global storage to {:?}", path))?;
        info!("Global storage written to {:?}", path);
    }

    match outcome {
        QueueOutcome::Finished => {
            println!("✓ Installation completed successfully");
            Ok(())
        }
        QueueOutcome::Failed {
            job,
            message,
            details,
            ..
        } => {
            if details.is_empty() {
                bail!("{} failed: {}", job, message)
            }
            bail!("{} failed: {}\n{}", job, message, details)
        }
        QueueOutcome::Cancelled { completed } => {
            bail!("Installation cancelled after {} job(s)", completed)
        }
    }
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobStarted { index, total, name } => {
            println!("[{}/{}] {}", index + 1, total, name);
        }
        QueueEvent::Progress { percent, status } => {
            debug!("{:5.1}% {}", percent * 100.0, status);
        }
        QueueEvent::JobFinished { name, .. } => debug!("{} finished", name),
        QueueEvent::Failed { job, message, .. } => warn!("{} failed: {}", job, message),
        QueueEvent::Finished | QueueEvent::Cancelled { .. } => {}
    }
}

fn validate(settings_path: &Path) -> Result<()> {
    info!("Validating settings file: {:?}", settings_path);
    let settings = load_settings(settings_path)?;
    let instances = settings.sequence.len();

    // Configuring every module catches bad module configuration too.
    let queue = Installer::new(settings).build_queue()?;
    println!(
        "✓ Settings file is valid: {} instance(s), {} job(s)",
        instances,
        queue.len()
    );
    Ok(())
}

fn lookup(store_path: &Path, key: &str) -> Result<()> {
    let storage = GlobalStore::new();
    if installer::is_yaml(store_path) {
        storage.load_yaml(store_path)?;
    } else {
        storage.load_json(store_path)?;
    }

    let Some(value) = storage.lookup(key) else {
        bail!("Key '{}' not found in {:?}", key, store_path);
    };
    match value.to_plain_string() {
        Some(text) => println!("{}", text),
        None => print!("{}", serde_yaml::to_string(&value).context("Failed to render value")?),
    }
    Ok(())
}
