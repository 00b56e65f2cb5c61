//! RAW -> JPEG conversion pipeline
//!
//! `RawConverter` walks a cascade of strategies (see `strategy`) until one
//! produces a JPEG. Every intermediate it writes goes through the temp file
//! manager under a scoped guard, so TIFF/PPM/DNG scratch files are removed
//! whether the stage succeeds or not. Only the finished JPEG outlives a call;
//! it stays tracked until the caller releases it.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{RawError, Result};
use crate::image::ImageProcessor;
use crate::metrics::{Metrics, Timer};
use crate::pool::MemoryBlockPool;
use crate::preview::NativePreviewExtractor;
use crate::strategy::{full_resolution_plan, thumbnail_plan, Attempts, PlanOptions, Strategy, StrategyFailure};
use crate::temp::{CleanupReport, TempFileKind, TempFileManager, TrackedFile};
use crate::tools::{RunOptions, ToolRunner, CLASSIC_DECODER, EMULATION_DECODER, VENDOR_CONVERTER};
use crate::validation::{canonicalize_input, extension_of};

/// Recognized camera RAW extensions (lowercase, no dot)
pub const RAW_EXTENSIONS: [&str; 12] = [
    "nef", "arw", "cr2", "cr3", "orf", "rw2", "raf", "dng", "pef", "srw", "3fr", "mef",
];

/// Formats that are already a normalized intermediate
const INTERMEDIATE_EXTENSIONS: [&str; 1] = ["dng"];

const VENDOR_SUBDIR: &str = "vendor-conversion";

pub fn is_raw_extension(ext: &str) -> bool {
    let ext = ext.trim_start_matches('.');
    RAW_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext))
}

pub fn is_raw_path(path: &Path) -> bool {
    extension_of(path).is_some_and(|ext| is_raw_extension(&ext))
}

/// Extensions the in-process preview extractor understands
pub fn supports_native_preview(ext: &str) -> bool {
    is_raw_extension(ext)
}

fn is_intermediate_extension(ext: &str) -> bool {
    INTERMEDIATE_EXTENSIONS.iter().any(|known| known.eq_ignore_ascii_case(ext))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QualityPreset {
    pub max_dimension: u32,
    pub jpeg_quality: u8,
}

impl QualityPreset {
    pub const THUMBNAIL: QualityPreset = QualityPreset { max_dimension: 512, jpeg_quality: 80 };
    pub const PREVIEW: QualityPreset = QualityPreset { max_dimension: 1920, jpeg_quality: 85 };
    pub const FINAL: QualityPreset = QualityPreset { max_dimension: 4096, jpeg_quality: 92 };

    /// Used for decoder intermediates before the caller's preset is applied
    const INTERMEDIATE: QualityPreset = QualityPreset { max_dimension: 4096, jpeg_quality: 92 };

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "thumbnail" => Some(Self::THUMBNAIL),
            "preview" => Some(Self::PREVIEW),
            "final" => Some(Self::FINAL),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConversionMode {
    /// Embedded preview or half-size decode, then re-encode
    #[default]
    Thumbnail,
    /// Full sensor decode, then re-encode
    FullResolution,
}

#[derive(Debug, Clone)]
pub struct ConversionRequest {
    pub path: PathBuf,
    pub preset: QualityPreset,
    pub mode: ConversionMode,
}

impl ConversionRequest {
    pub fn new(path: impl Into<PathBuf>, preset: QualityPreset) -> Self {
        Self {
            path: path.into(),
            preset,
            mode: ConversionMode::Thumbnail,
        }
    }

    pub fn full_resolution(mut self) -> Self {
        self.mode = ConversionMode::FullResolution;
        self
    }
}

/// A finished JPEG in the temp root. Release it with `RawConverter::release`.
#[derive(Debug, Clone, Serialize)]
pub struct ConvertedJpeg {
    pub file: TrackedFile,
    pub strategy: Strategy,
    pub size_bytes: u64,
    /// Strategies that failed before the successful one
    pub attempts: Vec<StrategyFailure>,
}

impl ConvertedJpeg {
    pub fn path(&self) -> &Path {
        &self.file.path
    }
}

/// JPEG bytes from one strategy
struct Produced {
    jpeg: Vec<u8>,
    /// Already run through the image processor at the stage's preset
    reencoded: bool,
}

pub struct RawConverter {
    config: Config,
    tools: Arc<dyn ToolRunner>,
    temps: Arc<TempFileManager>,
    pool: Arc<MemoryBlockPool>,
    images: Arc<dyn ImageProcessor>,
    preview: NativePreviewExtractor,
    metrics: Arc<Metrics>,
}

impl RawConverter {
    pub fn new(
        config: Config,
        tools: Arc<dyn ToolRunner>,
        temps: Arc<TempFileManager>,
        pool: Arc<MemoryBlockPool>,
        images: Arc<dyn ImageProcessor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let preview = NativePreviewExtractor::new(Arc::clone(&pool), config.preview_window, config.preview_timeout);
        Self {
            config,
            tools,
            temps,
            pool,
            images,
            preview,
            metrics,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn temps(&self) -> &Arc<TempFileManager> {
        &self.temps
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Delete a finished JPEG and forget it
    pub fn release(&self, jpeg: &ConvertedJpeg) -> CleanupReport {
        self.temps.cleanup(jpeg.file.id)
    }

    /// Best available embedded or decoded thumbnail, not resized
    pub async fn extract_thumbnail(&self, path: impl AsRef<Path>) -> Result<ConvertedJpeg> {
        let timer = Timer::new();
        let path = path.as_ref();

        let result = match canonicalize_input(path).await {
            Ok(input) => self.thumbnail_stage(&input, &mut Attempts::new()).await,
            Err(e) => Err(e),
        };
        self.report(path, "thumbnail", &result, &timer);
        result
    }

    /// Thumbnail cascade, then resize/rotate/encode at `preset`
    pub async fn convert_to_jpeg(&self, path: impl AsRef<Path>, preset: QualityPreset) -> Result<ConvertedJpeg> {
        let timer = Timer::new();
        let path = path.as_ref();

        let result = match canonicalize_input(path).await {
            Ok(input) => self.convert_inner(&input, preset).await,
            Err(e) => Err(e),
        };
        self.report(path, "convert", &result, &timer);
        result
    }

    pub async fn convert(&self, request: &ConversionRequest) -> Result<ConvertedJpeg> {
        match request.mode {
            ConversionMode::Thumbnail => self.convert_to_jpeg(&request.path, request.preset).await,
            ConversionMode::FullResolution => {
                let timer = Timer::new();
                let result = match canonicalize_input(&request.path).await {
                    Ok(input) => self.full_resolution_inner(&input, request.preset).await,
                    Err(e) => Err(e),
                };
                self.report(&request.path, "full-resolution", &result, &timer);
                result
            }
        }
    }

    fn plan_options(&self) -> PlanOptions {
        PlanOptions {
            native_preview: self.config.native_preview,
            force_vendor: self.config.force_vendor_fallback,
            vendor_installed: self.tools.is_available(VENDOR_CONVERTER),
        }
    }

    async fn thumbnail_stage(&self, input: &Path, attempts: &mut Attempts) -> Result<ConvertedJpeg> {
        let ext = extension_of(input).unwrap_or_default();
        let plan = thumbnail_plan(&ext, self.plan_options());
        debug!("Thumbnail plan for {}: {:?}", input.display(), plan);

        let Some((strategy, produced)) = self.run_cascade(input, &plan, QualityPreset::INTERMEDIATE, attempts).await
        else {
            return Err(RawError::AggregateFallback(attempts.failures().to_vec()));
        };

        match self.write_output(input, "thumb", &produced.jpeg).await {
            Ok(file) => Ok(ConvertedJpeg {
                file,
                strategy,
                size_bytes: produced.jpeg.len() as u64,
                attempts: attempts.failures().to_vec(),
            }),
            Err(e) => {
                attempts.record(strategy, &e);
                Err(RawError::AggregateFallback(attempts.failures().to_vec()))
            }
        }
    }

    async fn convert_inner(&self, input: &Path, preset: QualityPreset) -> Result<ConvertedJpeg> {
        let mut attempts = Attempts::new();

        if let Ok(thumb) = self.thumbnail_stage(input, &mut attempts).await {
            let strategy = thumb.strategy;
            let result = self.finish_from_thumbnail(input, &thumb, preset).await;
            self.temps.cleanup(thumb.file.id);

            match result {
                Ok(file) => return Ok(self.converted(file, strategy, &attempts)),
                Err(e) => {
                    warn!("Re-encode of {} thumbnail failed: {}", strategy, e);
                    attempts.record(strategy, &e);
                }
            }
        }

        let ext = extension_of(input).unwrap_or_default();
        if !is_raw_extension(&ext) || is_intermediate_extension(&ext) {
            return Err(attempts.into_error());
        }

        info!("Final vendor fallback for {}", input.display());
        let strategy = Strategy::VendorConverterPipeline;
        let outcome = match self.attempt(strategy, input, preset).await {
            Ok(produced) => self.finalize(input, produced, preset).await,
            Err(e) => Err(e),
        };
        self.metrics.record_strategy(strategy, outcome.is_ok(), matches!(&outcome, Err(e) if e.is_timeout()));

        match outcome {
            Ok(file) => Ok(self.converted(file, strategy, &attempts)),
            Err(e) => {
                attempts.record(strategy, &e);
                Err(attempts.into_error())
            }
        }
    }

    async fn full_resolution_inner(&self, input: &Path, preset: QualityPreset) -> Result<ConvertedJpeg> {
        let mut attempts = Attempts::new();
        let plan = full_resolution_plan(self.plan_options());

        let Some((strategy, produced)) = self.run_cascade(input, &plan, preset, &mut attempts).await else {
            return Err(attempts.into_error());
        };

        match self.finalize(input, produced, preset).await {
            Ok(file) => Ok(self.converted(file, strategy, &attempts)),
            Err(e) => {
                attempts.record(strategy, &e);
                Err(attempts.into_error())
            }
        }
    }

    fn converted(&self, file: (TrackedFile, u64), strategy: Strategy, attempts: &Attempts) -> ConvertedJpeg {
        ConvertedJpeg {
            file: file.0,
            size_bytes: file.1,
            strategy,
            attempts: attempts.failures().to_vec(),
        }
    }

    /// Try each strategy in order until one yields a JPEG
    async fn run_cascade(
        &self,
        input: &Path,
        plan: &[Strategy],
        target: QualityPreset,
        attempts: &mut Attempts,
    ) -> Option<(Strategy, Produced)> {
        for &strategy in plan {
            let timer = Timer::new();
            match self.attempt(strategy, input, target).await {
                Ok(produced) => {
                    debug!("{} succeeded in {}ms", strategy, timer.elapsed_ms());
                    self.metrics.record_strategy(strategy, true, false);
                    return Some((strategy, produced));
                }
                Err(e) => {
                    debug!("{} failed after {}ms: {}", strategy, timer.elapsed_ms(), e);
                    self.metrics.record_strategy(strategy, false, e.is_timeout());
                    attempts.record(strategy, &e);
                }
            }
        }
        None
    }

    async fn attempt(&self, strategy: Strategy, input: &Path, target: QualityPreset) -> Result<Produced> {
        let produced = match strategy {
            Strategy::NativePreview => Produced {
                jpeg: self.preview.extract(input).await?,
                reencoded: false,
            },
            Strategy::ClassicDecoderDirect => {
                let stdout = self.classic_decoder(&["-e", "-c"], input).await?;
                self.jpeg_or_reencode(stdout, target).await?
            }
            Strategy::ClassicDecoderHalfSize => {
                let ppm = self.classic_decoder(&["-h", "-c"], input).await?;
                self.reencode(ppm, target).await?
            }
            Strategy::EmulationLayerHalfSize => self.emulation_decode(input, true, target).await?,
            Strategy::EmulationLayerFullSize => self.emulation_decode(input, false, target).await?,
            Strategy::VendorConverterPipeline => self.vendor_pipeline(input, target).await?,
        };

        if produced.jpeg.is_empty() {
            return Err(RawError::execution(strategy.name(), "empty output"));
        }
        Ok(produced)
    }

    /// `dcraw <flags> <input>` with the image on stdout
    async fn classic_decoder(&self, flags: &[&str], input: &Path) -> Result<Vec<u8>> {
        let output = self
            .tools
            .run(CLASSIC_DECODER, argv(flags, &[input.as_os_str()]), self.run_options(self.config.tool_timeout))
            .await?;
        if output.stdout.is_empty() {
            return Err(RawError::execution(CLASSIC_DECODER, "empty output"));
        }
        Ok(output.stdout)
    }

    /// `dcraw_emu [-h] -T -Z <tiff> <input>`, then re-encode the TIFF
    async fn emulation_decode(&self, input: &Path, half_size: bool, target: QualityPreset) -> Result<Produced> {
        let stage = if half_size { "emu-half" } else { "emu-full" };
        let tiff = self.temps.generate_temp_path(input, stage, Some("tiff"), None);
        let guard = self.temps.guard(&tiff, TempFileKind::RawDerivative, Vec::new())?;

        let mut flags = Vec::new();
        if half_size {
            flags.push("-h");
        }
        flags.extend(["-T", "-Z"]);

        self.tools
            .run(
                EMULATION_DECODER,
                argv(&flags, &[guard.path().as_os_str(), input.as_os_str()]),
                self.run_options(self.config.tool_timeout),
            )
            .await?;

        let produced = self.reencode_file(guard.path(), EMULATION_DECODER, target).await;
        drop(guard);
        produced
    }

    /// Vendor converter to DNG in a scratch directory, then decode the DNG
    async fn vendor_pipeline(&self, input: &Path, target: QualityPreset) -> Result<Produced> {
        let out_dir = self.temps.generate_temp_path(input, "dng", None, Some(VENDOR_SUBDIR));
        tokio::fs::create_dir_all(&out_dir).await?;
        let guard = self.temps.guard(&out_dir, TempFileKind::RawDerivative, Vec::new())?;

        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "converted".to_string());
        let dng_name = format!("{}.dng", stem);

        let args = argv(
            &["-c", "-p1", "-d"],
            &[guard.path().as_os_str(), OsStr::new("-o"), OsStr::new(&dng_name), input.as_os_str()],
        );
        self.tools
            .run(VENDOR_CONVERTER, args, self.run_options(self.config.vendor_timeout))
            .await?;

        let dng = guard.path().join(&dng_name);
        match tokio::fs::metadata(&dng).await {
            Ok(m) if m.len() > 0 => {}
            _ => return Err(RawError::execution(VENDOR_CONVERTER, "no DNG produced")),
        }
        debug!("Vendor converter wrote {}", dng.display());

        let produced = match self.classic_decoder(&["-e", "-c"], &dng).await {
            Ok(stdout) => self.jpeg_or_reencode(stdout, target).await,
            Err(e) => {
                debug!("No embedded preview in DNG ({}), decoding half size", e);
                let ppm = self.classic_decoder(&["-h", "-c"], &dng).await?;
                self.reencode(ppm, target).await
            }
        };
        drop(guard);
        produced
    }

    /// Decoders sometimes emit a PPM thumbnail; only JPEG passes through untouched
    async fn jpeg_or_reencode(&self, bytes: Vec<u8>, target: QualityPreset) -> Result<Produced> {
        if infer::image::is_jpeg(&bytes) {
            Ok(Produced { jpeg: bytes, reencoded: false })
        } else {
            self.reencode(bytes, target).await
        }
    }

    async fn reencode(&self, bytes: Vec<u8>, preset: QualityPreset) -> Result<Produced> {
        let images = Arc::clone(&self.images);
        let jpeg = tokio::task::spawn_blocking(move || {
            images.reencode(&bytes, preset.max_dimension, preset.jpeg_quality)
        })
        .await
        .map_err(|e| RawError::Processing(format!("re-encode task failed: {}", e)))??;
        Ok(Produced { jpeg, reencoded: true })
    }

    /// Re-encode a decoder output file, buffered through the block pool
    async fn reencode_file(&self, path: &Path, tool: &str, preset: QualityPreset) -> Result<Produced> {
        match tokio::fs::metadata(path).await {
            Ok(m) if m.len() > 0 => {}
            _ => return Err(RawError::execution(tool, format!("no output at {}", path.display()))),
        }

        let images = Arc::clone(&self.images);
        let pool = Arc::clone(&self.pool);
        let path = path.to_path_buf();
        let jpeg = tokio::task::spawn_blocking(move || {
            pool.with_file(&path, |bytes| images.reencode(bytes, preset.max_dimension, preset.jpeg_quality))
        })
        .await
        .map_err(|e| RawError::Processing(format!("re-encode task failed: {}", e)))??;
        Ok(Produced { jpeg, reencoded: true })
    }

    /// Read the tracked thumbnail and re-encode it at the caller's preset
    async fn finish_from_thumbnail(
        &self,
        input: &Path,
        thumb: &ConvertedJpeg,
        preset: QualityPreset,
    ) -> Result<(TrackedFile, u64)> {
        let bytes = tokio::fs::read(thumb.path()).await?;
        let produced = self.reencode(bytes, preset).await?;
        self.write_output(input, "jpeg", &produced.jpeg)
            .await
            .map(|file| (file, produced.jpeg.len() as u64))
    }

    /// Apply the preset unless the strategy already did
    async fn finalize(&self, input: &Path, produced: Produced, preset: QualityPreset) -> Result<(TrackedFile, u64)> {
        let jpeg = if produced.reencoded {
            produced.jpeg
        } else {
            self.reencode(produced.jpeg, preset).await?.jpeg
        };
        self.write_output(input, "jpeg", &jpeg)
            .await
            .map(|file| (file, jpeg.len() as u64))
    }

    /// Write JPEG bytes to a fresh tracked temp path owned by the caller
    async fn write_output(&self, input: &Path, stage: &str, jpeg: &[u8]) -> Result<TrackedFile> {
        let path = self.temps.generate_temp_path(input, stage, Some("jpg"), None);
        let guard = self.temps.guard(&path, TempFileKind::Jpeg, Vec::new())?;
        tokio::fs::write(guard.path(), jpeg).await?;
        Ok(guard.keep())
    }

    fn run_options(&self, timeout: Duration) -> RunOptions {
        RunOptions {
            timeout,
            max_output_bytes: self.config.max_output_bytes,
        }
    }

    fn report(&self, path: &Path, operation: &str, result: &Result<ConvertedJpeg>, timer: &Timer) {
        let latency_ms = timer.elapsed_ms();
        self.metrics.record_conversion(result.is_ok(), latency_ms);

        match result {
            Ok(jpeg) => info!(
                target: "soma_raw::telemetry",
                file = %path.display(),
                operation,
                strategy = jpeg.strategy.name(),
                latency_ms,
                ok = true,
                "conversion finished"
            ),
            Err(e) => info!(
                target: "soma_raw::telemetry",
                file = %path.display(),
                operation,
                latency_ms,
                ok = false,
                error = %e,
                "conversion failed"
            ),
        }
    }
}

fn argv(flags: &[&str], rest: &[&OsStr]) -> Vec<OsString> {
    flags
        .iter()
        .map(OsString::from)
        .chain(rest.iter().map(|s| s.to_os_string()))
        .collect()
}
