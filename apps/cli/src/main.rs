use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use winstick_core::{BootMode, DeviceSource, FilesystemSpec, PipelineConfig};
use winstick_host_macos::ImageAttachService;
use winstick_plan::{build_plan, customize_plan, PlanOptions};
use winstick_safety::{require_confirmation_token, DeviceLocks};
use winstick_topology::{DiskTopologyService, TopologyEvent};
use winstick_validator::Eraser;
use winstick_wim::{PropertyUpdate, WimArchive};
use winstick_workflow_engine::{WindowsInstallerUsbParams, WindowsInstallerUsbWorkflow};

mod host;

use host::{HostDevices, HostResolver};

#[derive(Parser)]
#[command(name = "winstick")]
#[command(about = "Create bootable Windows installer USB drives", version)]
struct Cli {
    /// JSON config file with tool paths and tunables
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List block devices as JSON
    Devices {
        /// Include partitions and internal disks
        #[arg(long)]
        all: bool,
        #[arg(long)]
        pretty: bool,
    },
    /// Print device appear/disappear events until interrupted
    Watch {
        /// Stop after this many seconds
        #[arg(long)]
        duration_secs: Option<u64>,
    },
    /// Show the ISO 9660 volume descriptor of an image
    IsoInfo { image: PathBuf },
    /// Print the write plan for a mounted source tree
    Plan {
        source: PathBuf,
        destination: PathBuf,
        #[arg(long, default_value = "fat32", value_parser = parse_filesystem)]
        filesystem: FilesystemSpec,
        #[arg(long, default_value = "uefi", value_parser = parse_boot_mode)]
        boot_mode: BootMode,
        /// Mark the setup image so Windows Setup skips hardware checks
        #[arg(long)]
        patch: bool,
    },
    /// List the images of a WIM archive
    WimInfo { wim: PathBuf },
    /// Set a property on one or all images of a WIM archive
    WimSet {
        wim: PathBuf,
        key: String,
        value: String,
        /// Image index; all images when omitted
        #[arg(long)]
        image: Option<u32>,
    },
    /// Extract paths from a WIM image without their directory structure
    WimExtract {
        wim: PathBuf,
        image: u32,
        destination: PathBuf,
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Erase a disk and write a Windows installer image to it (destructive).
    /// Erasing only ever happens here, after the image and target checks.
    Write {
        image: PathBuf,
        device: String,
        #[arg(long, default_value = "WININSTALL")]
        volume: String,
        #[arg(long, default_value = "fat32", value_parser = parse_filesystem)]
        filesystem: FilesystemSpec,
        #[arg(long, default_value = "uefi", value_parser = parse_boot_mode)]
        boot_mode: BootMode,
        #[arg(long)]
        patch: bool,
        #[arg(long)]
        hash_manifest: bool,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        allow_internal: bool,
    },
    /// Issue a confirmation token for destructive commands
    Token,
}

fn parse_filesystem(value: &str) -> Result<FilesystemSpec, String> {
    FilesystemSpec::parse(value).ok_or_else(|| format!("unknown filesystem {value:?} (fat32, exfat)"))
}

fn parse_boot_mode(value: &str) -> Result<BootMode, String> {
    BootMode::parse(value).ok_or_else(|| format!("unknown boot mode {value:?} (uefi, legacy)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Devices { all, pretty } => {
            let topology =
                DiskTopologyService::new(HostDevices::detect(&config), config.monitor_interval())
                    .await?;
            let devices: Vec<_> = topology
                .list_devices()
                .await?
                .into_iter()
                .filter(|device| all || (device.whole_disk && !device.internal))
                .collect();
            print_json(&devices, pretty)
        }
        Commands::Watch { duration_secs } => watch(&config, duration_secs).await,
        Commands::IsoInfo { image } => {
            let metadata = winstick_iso::parse(&image)?;
            print_json(&metadata, true)
        }
        Commands::Plan {
            source,
            destination,
            filesystem,
            boot_mode,
            patch,
        } => {
            let Some(plan) = build_plan(&source, &destination)? else {
                println!("[]");
                return Ok(());
            };
            let options = PlanOptions {
                filesystem,
                split_part_bytes: config.fat32_split_part_bytes(),
                patch_installer_requirements: patch,
                legacy_boot: boot_mode == BootMode::Legacy,
            };
            let plan = customize_plan(plan, &destination, &options)?;
            print_json(&plan, true)
        }
        Commands::WimInfo { wim } => {
            let archive = WimArchive::open(&wim, &config.wimlib_imagex_path)?;
            print_json(&archive.images(), true)
        }
        Commands::WimSet {
            wim,
            key,
            value,
            image,
        } => {
            let mut archive = WimArchive::open(&wim, &config.wimlib_imagex_path)?;
            let update = match image {
                Some(index) => archive.set_property(&key, &value, index),
                None => archive.set_property_for_all_images(&key, &value),
            };
            match update {
                PropertyUpdate::Failed => {
                    return Err(anyhow!("could not set {key} on {}", wim.display()))
                }
                PropertyUpdate::Skipped => println!("unchanged: {key}={value}"),
                PropertyUpdate::Success => {
                    archive.apply_changes().await?;
                    println!("updated: {key}={value}");
                }
            }
            Ok(())
        }
        Commands::WimExtract {
            wim,
            image,
            destination,
            paths,
        } => {
            let archive = WimArchive::open(&wim, &config.wimlib_imagex_path)?;
            archive.extract_paths(&paths, &destination, image).await?;
            Ok(())
        }
        Commands::Write {
            image,
            device,
            volume,
            filesystem,
            boot_mode,
            patch,
            hash_manifest,
            dry_run,
            force,
            token,
            allow_internal,
        } => {
            let devices = HostDevices::detect(&config);
            let target = devices
                .describe(device.trim_start_matches("/dev/"))
                .await
                .with_context(|| format!("describe {device}"))?;
            let params = WindowsInstallerUsbParams {
                image_path: image,
                target,
                volume_name: volume,
                filesystem,
                boot_mode,
                patch_installer_requirements: patch,
                force,
                confirmation_token: token,
                allow_internal,
                hash_manifest,
                dry_run,
            };
            write(params, devices, config).await
        }
        Commands::Token => {
            println!("{}", require_confirmation_token());
            Ok(())
        }
    }
}

async fn watch(config: &PipelineConfig, duration_secs: Option<u64>) -> Result<()> {
    let topology =
        DiskTopologyService::new(HostDevices::detect(config), config.monitor_interval()).await?;
    let mut events = topology.subscribe();
    topology.start_monitoring();
    let deadline = async {
        match duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(TopologyEvent::Appeared(device)) => {
                    println!("{}", serde_json::json!({ "event": "appeared", "device": device }));
                }
                Ok(TopologyEvent::Disappeared(name)) => {
                    println!("{}", serde_json::json!({ "event": "disappeared", "name": name }));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "dropped device events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    topology.stop_monitoring();
    Ok(())
}

async fn write(
    params: WindowsInstallerUsbParams,
    devices: HostDevices,
    config: PipelineConfig,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                eprintln!("{line}");
            }
        }
    });

    let attacher = ImageAttachService::new(&config.hdiutil_path);
    let eraser = Eraser::new(&config.diskutil_path, DeviceLocks::new());
    let workflow = WindowsInstallerUsbWorkflow::new(
        params,
        devices,
        HostResolver::detect(),
        attacher,
        eraser,
        config,
    )
    .with_events(tx);
    let result = workflow.execute().await;
    drop(workflow);
    let _ = printer.await;

    print_json(&result?, true)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T, pretty: bool) -> Result<()> {
    if pretty {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", serde_json::to_string(value)?);
    }
    Ok(())
}
