//! soma_raw - camera RAW to JPEG conversion for the tagging pipeline
//!
//! Decoding is delegated to external tools (classic dcraw, the LibRaw
//! emulation-layer decoder, the vendor DNG converter) or to embedded previews
//! read in-process. This crate picks between them, bounds every run, and owns
//! the lifetime of every scratch file and large buffer along the way.

pub mod arch;
pub mod config;
pub mod error;
pub mod image;
pub mod metrics;
pub mod pool;
pub mod preview;
pub mod process;
pub mod raw;
pub mod strategy;
pub mod temp;
pub mod tools;
pub mod validation;

pub use crate::arch::{ArchitectureDetector, SystemProfile};
pub use crate::config::Config;
pub use crate::error::{RawError, Result};
pub use crate::image::{HybridImageProcessor, ImageProcessor};
pub use crate::metrics::Metrics;
pub use crate::pool::{MemoryBlockPool, PooledBlock, SizeBand};
pub use crate::raw::{ConversionMode, ConversionRequest, ConvertedJpeg, QualityPreset, RawConverter};
pub use crate::strategy::{Strategy, StrategyFailure};
pub use crate::temp::{TempFileId, TempFileKind, TempFileManager, TempGuard};
pub use crate::tools::{NativeToolManager, ToolRunner};
