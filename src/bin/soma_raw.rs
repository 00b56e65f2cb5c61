// soma_raw - RAW to JPEG conversion CLI
// Composition root: builds every service once and shares it by Arc

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use soma_raw::arch::ArchitectureDetector;
use soma_raw::config::Config;
use soma_raw::image::HybridImageProcessor;
use soma_raw::metrics::Metrics;
use soma_raw::pool::MemoryBlockPool;
use soma_raw::raw::{is_raw_path, ConversionRequest, QualityPreset, RawConverter};
use soma_raw::temp::{EmergencyCleanupGuard, TempFileManager};
use soma_raw::tools::NativeToolManager;

#[derive(Parser)]
#[command(name = "soma_raw", version, about = "Camera RAW to JPEG conversion")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs)]
struct GlobalArgs {
    /// Root for temporary files (default ~/.soma-raw-temp)
    #[arg(long, global = true)]
    temp_dir: Option<PathBuf>,

    /// Directory holding bundled decoder binaries
    #[arg(long, global = true)]
    bundle_dir: Option<PathBuf>,

    /// Skip in-process embedded preview extraction
    #[arg(long, global = true)]
    no_native_preview: bool,

    /// Go straight to the vendor converter pipeline
    #[arg(long, global = true)]
    force_vendor: bool,

    /// Use the pure-software resize path
    #[arg(long, global = true)]
    force_software: bool,

    /// Print conversion metrics as JSON on exit
    #[arg(long, global = true)]
    metrics: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Extract the best embedded or decoded thumbnail
    Thumbnail {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Convert one RAW file to a JPEG at a quality preset
    Convert {
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// thumbnail, preview or final
        #[arg(long, default_value = "preview")]
        preset: String,
        /// Decode the full sensor image instead of a preview
        #[arg(long)]
        full_resolution: bool,
    },
    /// Convert many files concurrently into a directory
    Batch {
        inputs: Vec<PathBuf>,
        #[arg(long)]
        out_dir: PathBuf,
        #[arg(long, default_value = "preview")]
        preset: String,
        #[arg(long, default_value_t = 4)]
        jobs: usize,
    },
    /// Delete untracked temp files older than the given age
    Sweep {
        #[arg(long, default_value_t = 0)]
        max_age_hours: u64,
    },
    /// Show where each external tool resolves
    Tools,
    /// Show the detected system profile
    System,
}

impl GlobalArgs {
    fn config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(dir) = &self.temp_dir {
            config.temp_root = dir.clone();
        }
        if let Some(dir) = &self.bundle_dir {
            config.bundle_dir = dir.clone();
        }
        if self.no_native_preview {
            config.native_preview = false;
        }
        if self.force_vendor {
            config.force_vendor_fallback = true;
        }
        if self.force_software {
            config.force_software_encode = true;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let cli = Cli::parse();
    let config = cli.global.config();

    let detector = ArchitectureDetector::new();
    let profile = tokio::task::spawn_blocking(move || detector.system_info())
        .await
        .context("System detection failed")?;

    if let Command::System = cli.command {
        println!("{}", serde_json::to_string_pretty(&profile)?);
        return Ok(());
    }

    let tools = Arc::new(NativeToolManager::new(&config, profile));
    if let Command::Tools = cli.command {
        let mut resolved = serde_json::Map::new();
        for name in tools.tool_names() {
            resolved.insert(name.to_string(), serde_json::to_value(tools.resolve(name)?)?);
        }
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }

    let temps = Arc::new(
        TempFileManager::new(&config.temp_root)
            .with_context(|| format!("Failed to create temp root {}", config.temp_root.display()))?,
    );
    let _emergency = EmergencyCleanupGuard::new(Arc::clone(&temps));

    if let Command::Sweep { max_age_hours } = cli.command {
        let report = temps.sweep_orphans(Duration::from_secs(max_age_hours * 3600));
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let wiped = temps.sweep_orphans(Duration::ZERO);
    if wiped.files_deleted > 0 {
        info!("Startup sweep removed {} leftover temp files", wiped.files_deleted);
    }

    spawn_signal_handler(Arc::clone(&temps));

    let pool = Arc::new(MemoryBlockPool::new(config.pool.clone()));
    let maintenance = [
        Arc::clone(&temps).spawn_maintenance(config.orphan_sweep_interval, config.orphan_max_age),
        Arc::clone(&pool).spawn_maintenance(),
    ];

    let metrics = Metrics::new();
    let converter = Arc::new(RawConverter::new(
        config.clone(),
        tools,
        Arc::clone(&temps),
        pool,
        Arc::new(HybridImageProcessor::new(config.force_software_encode)),
        Arc::clone(&metrics),
    ));

    let outcome = run(&converter, cli.command).await;

    for task in maintenance {
        task.abort();
    }
    temps.cleanup_all();
    temps.sweep_orphans(Duration::ZERO);

    if cli.global.metrics {
        println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    }
    outcome
}

async fn run(converter: &Arc<RawConverter>, command: Command) -> Result<()> {
    match command {
        Command::Thumbnail { input, output } => {
            let jpeg = converter.extract_thumbnail(&input).await?;
            deliver(converter, &jpeg, &output).await
        }
        Command::Convert { input, output, preset, full_resolution } => {
            let mut request = ConversionRequest::new(&input, parse_preset(&preset)?);
            if full_resolution {
                request = request.full_resolution();
            }
            let jpeg = converter.convert(&request).await?;
            deliver(converter, &jpeg, &output).await
        }
        Command::Batch { inputs, out_dir, preset, jobs } => {
            batch(converter, inputs, &out_dir, parse_preset(&preset)?, jobs).await
        }
        Command::Sweep { .. } | Command::Tools | Command::System => Ok(()),
    }
}

/// Copy the finished JPEG out of the temp root, then release it
async fn deliver(converter: &RawConverter, jpeg: &soma_raw::ConvertedJpeg, output: &Path) -> Result<()> {
    let copied = tokio::fs::copy(jpeg.path(), output)
        .await
        .with_context(|| format!("Failed to write {}", output.display()));
    converter.release(jpeg);
    copied?;

    info!("{} -> {} via {}", jpeg.path().display(), output.display(), jpeg.strategy);
    for failure in &jpeg.attempts {
        warn!("   earlier attempt {} failed: {}", failure.strategy, failure.message);
    }
    Ok(())
}

async fn batch(
    converter: &Arc<RawConverter>,
    inputs: Vec<PathBuf>,
    out_dir: &Path,
    preset: QualityPreset,
    jobs: usize,
) -> Result<()> {
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;

    let permits = Arc::new(Semaphore::new(jobs.max(1)));
    let mut set = JoinSet::new();

    for input in inputs.into_iter().filter(|p| is_raw_path(p)) {
        let converter = Arc::clone(converter);
        let permits = Arc::clone(&permits);
        let output = out_dir.join(
            input
                .file_stem()
                .map(|s| format!("{}.jpg", s.to_string_lossy()))
                .unwrap_or_else(|| "output.jpg".to_string()),
        );

        set.spawn(async move {
            let _permit = permits.acquire_owned().await?;
            let jpeg = converter.convert_to_jpeg(&input, preset).await?;
            deliver(&converter, &jpeg, &output).await
        });
    }

    let mut failed = 0usize;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                error!("Conversion failed: {:#}", e);
            }
            Err(e) => {
                failed += 1;
                error!("Conversion task panicked: {}", e);
            }
        }
    }

    if failed > 0 {
        bail!("{} conversions failed", failed);
    }
    Ok(())
}

fn parse_preset(name: &str) -> Result<QualityPreset> {
    QualityPreset::from_name(name).with_context(|| format!("Unknown preset '{}'", name))
}

/// Ctrl-C / SIGTERM: synchronous best-effort cleanup, then exit
fn spawn_signal_handler(temps: Arc<TempFileManager>) {
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Termination signal received, removing tracked temp files");
        temps.emergency_cleanup();
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("SIGTERM handler unavailable: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
