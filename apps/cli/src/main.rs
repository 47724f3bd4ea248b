use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pflash_core::fallback::DryRunUpdater;
use pflash_core::hex::encode_records;
use pflash_core::session::{FirmwareSource, PartialFlasher, SessionConfig, Strategy};
use pflash_core::state::CancelToken;
use pflash_core::transport::{NotificationRouter, RoutedChannel, SimBehavior, SimConfig, SimulatedDevice};
use pflash_core::variant::{FlashTarget, HardwareVariant, Service};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Calliope mini partial flashing tool", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show signatures, records and partial flashing info of a HEX file
    Info {
        hex: PathBuf,
    },
    /// Write the records of one hardware generation as a HEX file
    Filter {
        hex: PathBuf,
        #[arg(long, default_value = "v3")]
        variant: HardwareVariant,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write the full-update binary of one hardware generation
    Bin {
        hex: PathBuf,
        #[arg(long, default_value = "v3")]
        variant: HardwareVariant,
        #[arg(short, long)]
        output: PathBuf,
        /// Also write the init packet
        #[arg(long)]
        init_packet: Option<PathBuf>,
    },
    /// Flash against a simulated device
    Simulate {
        hex: PathBuf,
        #[arg(long, default_value = "v3")]
        variant: HardwareVariant,
        /// Session configuration (TOML)
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        strategy: Option<Strategy>,
        /// Blocks in flight
        #[arg(long)]
        window: Option<usize>,
        /// Device runs a different baseline runtime
        #[arg(long)]
        baseline_mismatch: bool,
        /// Device starts in application mode
        #[arg(long)]
        application_mode: bool,
        /// Device never replies
        #[arg(long)]
        silent: bool,
    },
    /// Write the default session configuration
    Config {
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let result = match args.command {
        Commands::Info { hex } => info_cmd(&hex),
        Commands::Filter {
            hex,
            variant,
            output,
        } => filter_cmd(&hex, variant, &output),
        Commands::Bin {
            hex,
            variant,
            output,
            init_packet,
        } => bin_cmd(&hex, variant, &output, init_packet.as_deref()),
        Commands::Simulate {
            hex,
            variant,
            config,
            strategy,
            window,
            baseline_mismatch,
            application_mode,
            silent,
        } => {
            let mut config = match config {
                Some(path) => SessionConfig::load_from_file(path)?,
                None => SessionConfig::default(),
            };
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            if let Some(window) = window {
                config.window_size = window;
            }
            let behavior = SimBehavior {
                start_in_application: application_mode,
                silent,
                ..SimBehavior::default()
            };
            simulate_cmd(&hex, variant, config, behavior, baseline_mismatch)
        }
        Commands::Config { path } => {
            SessionConfig::default().save_to_file(&path)?;
            info!(path = %path.display(), "Wrote default configuration");
            Ok(())
        }
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
    }
    result
}

fn info_cmd(path: &Path) -> Result<()> {
    let source = FirmwareSource::load(path)?;
    let versions: Vec<String> = source.versions.iter().map(ToString::to_string).collect();
    println!("File:      {}", path.display());
    println!("Source id: {}", source.id);
    println!("Versions:  {}", versions.join(", "));
    println!("Records:   {}", source.records.len());
    if let Some(err) = &source.parse_error {
        println!("Parse error: {}", err);
    }

    let flasher = PartialFlasher::new(SessionConfig::default());
    for variant in HardwareVariant::ALL {
        let image = variant.memory_image(&source.records);
        println!();
        println!("{}:", variant);
        println!("  compatible: {}", variant.accepts(&source.versions));
        println!(
            "  image:      {} bytes in {} ranges",
            image.byte_len(),
            image.range_count()
        );
        match flasher.prepare(&source, variant) {
            Ok(diff) => {
                let hashes = diff.hashes();
                println!("  reference:  {}", hex_string(&hashes.reference));
                println!("  program:    {}", hex_string(&hashes.program));
                println!("  chunks:     {}", diff.chunk_count());
            }
            Err(e) => println!("  partial:    {}", e),
        }
    }
    Ok(())
}

fn filter_cmd(path: &Path, variant: HardwareVariant, output: &Path) -> Result<()> {
    let source = FirmwareSource::load(path)?;
    let filtered = variant.region_filter().apply(&source.records);
    let text = encode_records(&filtered);
    std::fs::write(output, text)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        records = filtered.len(),
        output = %output.display(),
        "Wrote filtered HEX"
    );
    Ok(())
}

fn bin_cmd(
    path: &Path,
    variant: HardwareVariant,
    output: &Path,
    init_packet: Option<&Path>,
) -> Result<()> {
    let source = FirmwareSource::load(path)?;
    let package = variant.full_image(&source.records)?;
    std::fs::write(output, &package.bin)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(bytes = package.bin.len(), output = %output.display(), "Wrote binary");
    if let Some(dat) = init_packet {
        std::fs::write(dat, &package.init_packet)
            .with_context(|| format!("Failed to write {}", dat.display()))?;
        info!(bytes = package.init_packet.len(), output = %dat.display(), "Wrote init packet");
    }
    Ok(())
}

fn simulate_cmd(
    path: &Path,
    variant: HardwareVariant,
    config: SessionConfig,
    behavior: SimBehavior,
    baseline_mismatch: bool,
) -> Result<()> {
    let source = FirmwareSource::load(path)?;
    let flasher = PartialFlasher::new(config);

    let mut sim = SimConfig {
        behavior,
        program_region: variant.profile().filter_window,
        ..SimConfig::default()
    };
    if let Ok(diff) = flasher.prepare(&source, variant) {
        let hashes = diff.hashes();
        sim.dal_hash = if baseline_mismatch {
            hashes.reference.map(|b| !b)
        } else {
            hashes.reference
        };
    }

    let router = NotificationRouter::new();
    let device = SimulatedDevice::new(router.clone(), "sim-0", sim);
    let channel = RoutedChannel::open(router, device.clone(), "sim-0");

    let mut services: Vec<Service> = variant.profile().required_services.to_vec();
    services.push(Service::PartialFlashing);
    let mut updater = DryRunUpdater::new();

    let outcome = flasher.flash(
        &source,
        variant,
        &services,
        &channel,
        &mut updater,
        CancelToken::new(),
    );

    println!("{}", outcome.message());
    println!(
        "Device: {} blocks committed, {} retransmits requested, end received: {}",
        device.blocks_committed(),
        device.retransmits_sent(),
        device.end_received()
    );
    if let Some(package) = updater.last_package() {
        println!(
            "Full update: {} byte image, {} byte init packet",
            package.bin.len(),
            package.init_packet.len()
        );
    }

    if !outcome.is_success() {
        bail!("{}", outcome.message());
    }
    Ok(())
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
