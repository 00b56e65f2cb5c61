//! CPU architecture / platform detection
//!
//! The profile is computed once per detector and memoized. On Windows x64 the
//! detector asks the OS for the physical CPU architecture, because an x64
//! build running under ARM64 emulation reports itself as x64. Probe failures
//! degrade to "not emulated" and never surface as errors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::{RawError, Result};
use crate::process::run_blocking;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Architecture {
    X64,
    Arm64,
    X86,
    Other(String),
}

impl Architecture {
    pub fn from_target(arch: &str) -> Self {
        match arch {
            "x86_64" => Architecture::X64,
            "aarch64" => Architecture::Arm64,
            "x86" => Architecture::X86,
            other => Architecture::Other(other.to_string()),
        }
    }

    /// Directory name used for architecture-specific bundles
    pub fn bundle_dir(&self) -> &str {
        match self {
            Architecture::X64 => "x64",
            Architecture::Arm64 => "arm64",
            Architecture::X86 => "ia32",
            Architecture::Other(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Other(String),
}

impl Platform {
    pub fn from_target(os: &str) -> Self {
        match os {
            "windows" => Platform::Windows,
            "macos" => Platform::MacOs,
            "linux" => Platform::Linux,
            other => Platform::Other(other.to_string()),
        }
    }

    /// Directory name used for per-OS bundles
    pub fn bundle_dir(&self) -> &str {
        match self {
            Platform::Windows => "win32",
            Platform::MacOs => "darwin",
            Platform::Linux => "linux",
            Platform::Other(name) => name,
        }
    }

    pub fn exe_suffix(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            _ => "",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemProfile {
    pub architecture: Architecture,
    pub platform: Platform,
    /// Host CPU is ARM64 (natively, or underneath x64 emulation)
    pub is_arm64: bool,
    pub is_x64: bool,
    /// x64 process running on an ARM64 host
    pub is_emulated: bool,
}

/// Asks the OS whether the physical CPU is ARM64
pub trait EmulationProbe: Send + Sync {
    fn host_is_arm64(&self) -> Result<bool>;
}

/// Queries `Win32_Processor.Architecture` (12 = ARM64) with a bounded wait
pub struct WindowsCpuProbe {
    timeout: Duration,
}

impl Default for WindowsCpuProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

impl EmulationProbe for WindowsCpuProbe {
    fn host_is_arm64(&self) -> Result<bool> {
        let mut cmd = std::process::Command::new("powershell");
        cmd.args([
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            "(Get-CimInstance Win32_Processor).Architecture",
        ]);

        let output = run_blocking(cmd, self.timeout)?.ok_or_else(|| RawError::Timeout {
            tool: "powershell".to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        })?;

        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text.lines().any(|line| line.trim() == "12"))
    }
}

pub struct ArchitectureDetector {
    target_arch: String,
    target_os: String,
    probe: Arc<dyn EmulationProbe>,
    cached: Mutex<Option<SystemProfile>>,
}

impl ArchitectureDetector {
    pub fn new() -> Self {
        Self::with_target(
            std::env::consts::ARCH,
            std::env::consts::OS,
            Arc::new(WindowsCpuProbe::default()),
        )
    }

    /// Detector for an explicit target triple piece, e.g. to simulate
    /// Windows x64 under emulation in tests
    pub fn with_target(arch: &str, os: &str, probe: Arc<dyn EmulationProbe>) -> Self {
        Self {
            target_arch: arch.to_string(),
            target_os: os.to_string(),
            probe,
            cached: Mutex::new(None),
        }
    }

    /// Memoized system profile
    pub fn system_info(&self) -> SystemProfile {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(profile) = cached.as_ref() {
            return profile.clone();
        }

        let profile = self.detect();
        info!(
            "System profile: {:?}/{:?} (emulated: {})",
            profile.platform, profile.architecture, profile.is_emulated
        );
        *cached = Some(profile.clone());
        profile
    }

    /// Drop the memoized profile so the next call re-detects
    pub fn reset(&self) {
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn detect(&self) -> SystemProfile {
        let architecture = Architecture::from_target(&self.target_arch);
        let platform = Platform::from_target(&self.target_os);

        let is_emulated = platform == Platform::Windows
            && architecture == Architecture::X64
            && match self.probe.host_is_arm64() {
                Ok(arm64) => arm64,
                Err(e) => {
                    debug!("Emulation probe failed, assuming native: {}", e);
                    false
                }
            };

        SystemProfile {
            is_arm64: architecture == Architecture::Arm64 || is_emulated,
            is_x64: architecture == Architecture::X64,
            is_emulated,
            architecture,
            platform,
        }
    }
}

impl Default for ArchitectureDetector {
    fn default() -> Self {
        Self::new()
    }
}
