use clap::{Parser, Subcommand};
use nova_transfer_core::config::TransferConfig;
use nova_transfer_core::device::DeviceManager;
use nova_transfer_core::plan::{Outcome, TransferPlan, TransferSummary};
use nova_transfer_core::push::PushEngine;
use nova_transfer_core::reassembly::ReassemblyCoordinator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "nova-transfer")]
#[command(about = "Chunked, bundled directory transfer to one or more Android devices over ADB")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push a host directory tree to one or more devices
    Push {
        /// Source directory on the host
        source: PathBuf,
        /// Destination directory on the device
        destination: String,
        /// Device serial to target (repeatable); defaults to all ready devices
        #[arg(short, long = "device")]
        devices: Vec<String>,
        /// Path to a config file to load instead of the default location
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// List attached devices
    Devices,
    /// Pair a device over WiFi
    Pair {
        /// Device IP address
        ip: String,
        #[arg(long, default_value_t = 5555)]
        port: u16,
    },
    /// Show or initialize the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the resolved configuration
    Show,
    /// Write the default configuration to disk if absent
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Push {
            source,
            destination,
            devices,
            config,
        } => handle_push(source, destination, devices, config).await,
        Commands::Devices => handle_devices(),
        Commands::Pair { ip, port } => handle_pair(&ip, port),
        Commands::Config { command } => handle_config(command),
    }
}

fn handle_devices() -> anyhow::Result<()> {
    let manager = DeviceManager::new();
    let targets = manager.list_targets()?;

    if targets.is_empty() {
        println!("No devices attached.");
        return Ok(());
    }

    println!("{:<20} {:<6} {}", "SERIAL", "KIND", "MODEL");
    for target in targets {
        let kind = match target.kind {
            nova_transfer_core::adb::DeviceKind::Usb => "usb",
            nova_transfer_core::adb::DeviceKind::Wifi => "wifi",
        };
        println!("{:<20} {:<6} {}", target.serial, kind, target.model);
    }

    Ok(())
}

fn handle_pair(ip: &str, port: u16) -> anyhow::Result<()> {
    let adb = nova_transfer_core::adb::AdbClient::new();
    let connected = adb.connect_wifi(ip, port)?;

    if connected {
        println!("Connected to {}:{}", ip, port);
    } else {
        println!("Failed to connect to {}:{}", ip, port);
    }

    Ok(())
}

fn handle_config(command: ConfigCommands) -> anyhow::Result<()> {
    match command {
        ConfigCommands::Show => {
            let config = TransferConfig::load()?;
            println!("{}", serde_yaml::to_string(&config)?);
        }
        ConfigCommands::Init => {
            let config = TransferConfig::default();
            config.save()?;
            println!("Wrote default configuration.");
        }
    }

    Ok(())
}

async fn handle_push(
    source: PathBuf,
    destination: String,
    device_serials: Vec<String>,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = match config_path {
        Some(path) => {
            let content = std::fs::read_to_string(&path)?;
            serde_yaml::from_str(&content)?
        }
        None => TransferConfig::load()?,
    };
    config.validate()?;

    let device_manager = DeviceManager::new();
    let targets = if device_serials.is_empty() {
        device_manager.list_ready_targets()?
    } else {
        device_serials
            .into_iter()
            .map(|serial| nova_transfer_core::device::DeviceTarget {
                serial,
                kind: nova_transfer_core::adb::DeviceKind::Usb,
                model: "unknown".to_string(),
            })
            .collect()
    };

    if targets.is_empty() {
        anyhow::bail!("no target devices; attach a device or pass --device");
    }

    info!("preparing transfer plan from {}", source.display());
    let scratch_dir = std::env::temp_dir().join("nova-transfer-scratch");
    let plan = TransferPlan::prepare(&source, &scratch_dir, targets, config)?;
    info!(
        "plan ready: {} chunked file(s), {} bundle(s), {} device(s)",
        plan.chunks.len(),
        plan.bundles.len(),
        plan.devices.len()
    );

    let cancelled = Arc::new(AtomicBool::new(false));
    {
        let cancelled = cancelled.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("cancellation requested");
                cancelled.store(true, Ordering::SeqCst);
            }
        });
    }

    let engine = Arc::new(PushEngine::new());
    let mut push_tasks = Vec::new();

    for device in &plan.devices {
        let engine = engine.clone();
        let serial = device.serial.clone();
        let plan_clone = plan.clone();
        let cancelled = cancelled.clone();

        push_tasks.push(tokio::spawn(async move {
            let result = engine.push(&serial, &plan_clone, cancelled).await;
            (serial, result)
        }));
    }

    let mut summaries = Vec::new();
    let mut reassembly_candidates = Vec::new();

    for task in push_tasks {
        let (serial, result) = task.await?;
        match result {
            Ok(report) if report.is_success() => {
                info!("push to {} succeeded ({} pushed)", serial, report.pushed);
                reassembly_candidates.push(serial);
            }
            Ok(report) => {
                error!("push to {} incomplete: {} failed, {} missing after verify", serial, report.failed.len(), report.missing_after_verify.len());
                summaries.push(TransferSummary {
                    serial,
                    push: Outcome::Failed("transfer did not verify cleanly".to_string()),
                    reassembly: Outcome::NotAttempted,
                });
            }
            Err(e) => {
                error!("push to {} failed: {}", serial, e);
                summaries.push(TransferSummary {
                    serial,
                    push: Outcome::Failed(e.to_string()),
                    reassembly: Outcome::NotAttempted,
                });
            }
        }
    }

    if !reassembly_candidates.is_empty() {
        let coordinator = ReassemblyCoordinator::new();
        let reassembled = coordinator
            .run(&reassembly_candidates, &plan.config.remote_temp_dir, &destination, &plan.config, cancelled)
            .await;
        summaries.extend(reassembled);
    }

    print_summary(&summaries);
    Ok(())
}

fn print_summary(summaries: &[TransferSummary]) {
    println!();
    println!("Transfer summary:");
    println!("{:<20} {:<10} {:<10}", "DEVICE", "PUSH", "REASSEMBLY");
    for summary in summaries {
        println!(
            "{:<20} {:<10} {:<10}",
            summary.serial,
            outcome_label(&summary.push),
            outcome_label(&summary.reassembly)
        );
    }
}

fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Outcome::Ok => "ok",
        Outcome::Failed(_) => "failed",
        Outcome::NotAttempted => "skipped",
    }
}
