//! Runtime configuration
//!
//! Defaults cover a desktop install; every test/ops switch can be flipped
//! through the environment so each cascade branch is reachable on demand.

use std::path::PathBuf;
use std::time::Duration;

pub const ENV_TEMP_DIR: &str = "SOMA_RAW_TEMP_DIR";
pub const ENV_BUNDLE_DIR: &str = "SOMA_RAW_BUNDLE_DIR";
pub const ENV_NATIVE_PREVIEW: &str = "SOMA_RAW_NATIVE_PREVIEW";
pub const ENV_FORCE_VENDOR: &str = "SOMA_RAW_FORCE_VENDOR";
pub const ENV_FORCE_SOFTWARE: &str = "SOMA_RAW_FORCE_SOFTWARE";

const MB: usize = 1024 * 1024;

/// Size window an embedded preview should fall into to be used as-is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewWindow {
    pub min_bytes: usize,
    pub max_bytes: usize,
}

impl PreviewWindow {
    pub fn contains(&self, len: usize) -> bool {
        len >= self.min_bytes && len <= self.max_bytes
    }
}

impl Default for PreviewWindow {
    fn default() -> Self {
        Self {
            min_bytes: 50 * 1024,
            max_bytes: 2 * MB,
        }
    }
}

/// Memory block pool limits
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pooled blocks per band [small, medium, large, xlarge]
    pub max_blocks_per_band: [usize; 4],

    /// Ceiling used to compute the emergency threshold
    pub memory_ceiling_bytes: usize,

    /// Fraction of the ceiling above which new pooled allocations stop
    pub emergency_threshold: f64,

    /// Free blocks idle longer than this (and reused < 2 times) are evicted
    pub idle_max_age: Duration,

    /// In-use blocks held longer than this are reported as leaks
    pub leak_threshold: Duration,

    pub maintenance_interval: Duration,
}

impl PoolConfig {
    pub fn emergency_limit_bytes(&self) -> usize {
        (self.memory_ceiling_bytes as f64 * self.emergency_threshold) as usize
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_blocks_per_band: [20, 10, 4, 2],
            memory_ceiling_bytes: 2048 * MB,
            emergency_threshold: 0.85,
            idle_max_age: Duration::from_secs(5 * 60),
            leak_threshold: Duration::from_secs(10 * 60),
            maintenance_interval: Duration::from_secs(60),
        }
    }
}

/// Process-wide configuration, built once by the composition root
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of every temporary artifact (`~/.soma-raw-temp/`)
    pub temp_root: PathBuf,

    /// Directory holding bundled decoder binaries
    pub bundle_dir: PathBuf,

    /// Try in-process embedded preview extraction before any decoder
    pub native_preview: bool,

    /// Skip straight to the vendor converter pipeline
    pub force_vendor_fallback: bool,

    /// Bypass the SIMD resizer and use the pure-software path
    pub force_software_encode: bool,

    pub tool_timeout: Duration,
    pub vendor_timeout: Duration,
    pub preview_timeout: Duration,
    pub max_output_bytes: usize,
    pub preview_window: PreviewWindow,

    pub orphan_max_age: Duration,
    pub orphan_sweep_interval: Duration,

    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_root: default_temp_root(),
            bundle_dir: default_bundle_dir(),
            native_preview: true,
            force_vendor_fallback: false,
            force_software_encode: false,
            tool_timeout: Duration::from_secs(30),
            vendor_timeout: Duration::from_secs(60),
            preview_timeout: Duration::from_secs(5),
            max_output_bytes: 100 * MB,
            preview_window: PreviewWindow::default(),
            orphan_max_age: Duration::from_secs(7 * 24 * 60 * 60),
            orphan_sweep_interval: Duration::from_secs(24 * 60 * 60),
            pool: PoolConfig::default(),
        }
    }
}

impl Config {
    /// Defaults overridden by `SOMA_RAW_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env_path(ENV_TEMP_DIR) {
            config.temp_root = dir;
        }
        if let Some(dir) = env_path(ENV_BUNDLE_DIR) {
            config.bundle_dir = dir;
        }
        if let Some(flag) = env_bool(ENV_NATIVE_PREVIEW) {
            config.native_preview = flag;
        }
        if let Some(flag) = env_bool(ENV_FORCE_VENDOR) {
            config.force_vendor_fallback = flag;
        }
        if let Some(flag) = env_bool(ENV_FORCE_SOFTWARE) {
            config.force_software_encode = flag;
        }

        config
    }

    /// Defaults rooted at an explicit temp directory (tests, embedded use)
    pub fn with_temp_root(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
            ..Self::default()
        }
    }
}

fn default_temp_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".soma-raw-temp")
}

fn default_bundle_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("bin")))
        .unwrap_or_else(|| PathBuf::from("bin"))
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Parse a boolean-like flag: 1/0, true/false, yes/no, on/off (case-insensitive)
pub fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|raw| parse_bool_flag(&raw))
}
