//! Conversion strategies and cascade planning
//!
//! A cascade is an ordered list of strategies. The runner tries them in order,
//! stops at the first success and otherwise accumulates every failure into
//! one aggregate error.

use std::fmt;

use serde::Serialize;

use crate::error::RawError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Strategy {
    /// In-process embedded JPEG extraction
    NativePreview,
    /// Classic decoder `-e`: dump the embedded thumbnail as-is
    ClassicDecoderDirect,
    /// Emulation-layer decoder at half size to TIFF, then re-encode
    EmulationLayerHalfSize,
    /// Classic decoder `-h` to PPM, then re-encode
    ClassicDecoderHalfSize,
    /// Emulation-layer decoder at full size to TIFF
    EmulationLayerFullSize,
    /// Vendor converter to DNG, then decode the DNG
    VendorConverterPipeline,
}

impl Strategy {
    pub const ALL: [Strategy; 6] = [
        Strategy::NativePreview,
        Strategy::ClassicDecoderDirect,
        Strategy::EmulationLayerHalfSize,
        Strategy::ClassicDecoderHalfSize,
        Strategy::EmulationLayerFullSize,
        Strategy::VendorConverterPipeline,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::NativePreview => "native-preview",
            Strategy::ClassicDecoderDirect => "classic-direct",
            Strategy::EmulationLayerHalfSize => "emulation-half-size",
            Strategy::ClassicDecoderHalfSize => "classic-half-size",
            Strategy::EmulationLayerFullSize => "emulation-full-size",
            Strategy::VendorConverterPipeline => "vendor-converter",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One failed attempt inside a cascade
#[derive(Debug, Clone, Serialize)]
pub struct StrategyFailure {
    pub strategy: Strategy,
    pub message: String,
    pub timed_out: bool,
}

impl StrategyFailure {
    pub fn new(strategy: Strategy, message: impl Into<String>) -> Self {
        Self {
            strategy,
            message: message.into(),
            timed_out: false,
        }
    }

    pub fn from_error(strategy: Strategy, error: &RawError) -> Self {
        Self {
            strategy,
            message: error.to_string(),
            timed_out: error.is_timeout(),
        }
    }
}

/// Failures collected while walking a cascade
#[derive(Debug, Default)]
pub struct Attempts {
    failures: Vec<StrategyFailure>,
}

impl Attempts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure; an aggregate error contributes its inner attempts
    pub fn record(&mut self, strategy: Strategy, error: &RawError) {
        match error {
            RawError::AggregateFallback(inner) => self.failures.extend(inner.iter().cloned()),
            other => self.failures.push(StrategyFailure::from_error(strategy, other)),
        }
    }

    pub fn failures(&self) -> &[StrategyFailure] {
        &self.failures
    }

    pub fn into_error(self) -> RawError {
        RawError::AggregateFallback(self.failures)
    }
}

/// Inputs that decide which strategies a cascade contains
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    pub native_preview: bool,
    pub force_vendor: bool,
    pub vendor_installed: bool,
}

/// Ordered strategies for a thumbnail request on a file with `extension`
pub fn thumbnail_plan(extension: &str, options: PlanOptions) -> Vec<Strategy> {
    let ext = extension.trim_start_matches('.').to_ascii_lowercase();
    let mut plan = Vec::new();

    if options.force_vendor {
        plan.push(Strategy::VendorConverterPipeline);
        return plan;
    }

    if options.native_preview && crate::raw::supports_native_preview(&ext) {
        plan.push(Strategy::NativePreview);
    }

    if ext == "cr3" {
        plan.extend([Strategy::EmulationLayerHalfSize, Strategy::ClassicDecoderHalfSize]);
    } else {
        plan.extend([Strategy::ClassicDecoderDirect, Strategy::EmulationLayerHalfSize]);
        if options.vendor_installed {
            plan.push(Strategy::VendorConverterPipeline);
        }
    }
    plan
}

/// Ordered strategies for a full-resolution request
pub fn full_resolution_plan(options: PlanOptions) -> Vec<Strategy> {
    if options.force_vendor {
        return vec![Strategy::VendorConverterPipeline];
    }
    let mut plan = vec![Strategy::EmulationLayerFullSize];
    if options.vendor_installed {
        plan.push(Strategy::VendorConverterPipeline);
    }
    plan
}
