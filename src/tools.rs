//! Native tool discovery and invocation
//!
//! Logical tool names resolve to concrete executables in this order:
//!
//! 1. Bundled binary, flat per-OS directory (`<bundle>/<os>/<bin>`)
//! 2. Bundled binary, per-architecture directory (`<bundle>/<os>/<arch>/<bin>`)
//! 3. ARM64 host without a native bundle: bundled x64 binary, marked emulated
//! 4. Known system install locations
//! 5. The OS search path, and finally the bare executable name
//!
//! Results are cached per tool name for the life of the manager.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use crate::arch::{Architecture, Platform, SystemProfile};
use crate::config::Config;
use crate::error::{RawError, Result};
use crate::process::{ToolCommand, ToolOutput, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_TIMEOUT};

pub const CLASSIC_DECODER: &str = "dcraw";
pub const EMULATION_DECODER: &str = "dcraw_emu";
pub const VENDOR_CONVERTER: &str = "dng_converter";
pub const EXIFTOOL: &str = "exiftool";

/// Bundled tool that ships as an interpreter plus a script on Windows
#[derive(Debug, Clone, Copy)]
pub struct ScriptLaunch {
    pub interpreter: &'static str,
    pub script: &'static str,
}

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub binary: &'static str,
    pub windows_paths: &'static [&'static str],
    pub macos_paths: &'static [&'static str],
    pub linux_paths: &'static [&'static str],
    pub windows_script: Option<ScriptLaunch>,
}

impl ToolSpec {
    fn system_paths(&self, platform: &Platform) -> &'static [&'static str] {
        match platform {
            Platform::Windows => self.windows_paths,
            Platform::MacOs => self.macos_paths,
            Platform::Linux => self.linux_paths,
            Platform::Other(_) => &[],
        }
    }
}

pub fn default_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: CLASSIC_DECODER,
            binary: "dcraw",
            windows_paths: &[r"C:\Program Files\dcraw\dcraw.exe"],
            macos_paths: &["/opt/homebrew/bin/dcraw", "/usr/local/bin/dcraw"],
            linux_paths: &["/usr/bin/dcraw", "/usr/local/bin/dcraw"],
            windows_script: None,
        },
        ToolSpec {
            name: EMULATION_DECODER,
            binary: "dcraw_emu",
            windows_paths: &[r"C:\Program Files\LibRaw\bin\dcraw_emu.exe"],
            macos_paths: &["/opt/homebrew/bin/dcraw_emu", "/usr/local/bin/dcraw_emu"],
            linux_paths: &[
                "/usr/bin/dcraw_emu",
                "/usr/local/bin/dcraw_emu",
                "/usr/lib/libraw/bin/dcraw_emu",
            ],
            windows_script: None,
        },
        ToolSpec {
            name: VENDOR_CONVERTER,
            binary: "Adobe DNG Converter",
            windows_paths: &[
                r"C:\Program Files\Adobe\Adobe DNG Converter\Adobe DNG Converter.exe",
                r"C:\Program Files (x86)\Adobe\Adobe DNG Converter.exe",
            ],
            macos_paths: &["/Applications/Adobe DNG Converter.app/Contents/MacOS/Adobe DNG Converter"],
            linux_paths: &[],
            windows_script: None,
        },
        ToolSpec {
            name: EXIFTOOL,
            binary: "exiftool",
            windows_paths: &[r"C:\Windows\exiftool.exe"],
            macos_paths: &["/opt/homebrew/bin/exiftool", "/usr/local/bin/exiftool"],
            linux_paths: &["/usr/bin/exiftool", "/usr/local/bin/exiftool"],
            windows_script: Some(ScriptLaunch {
                interpreter: "perl",
                script: "exiftool.pl",
            }),
        },
    ]
}

/// How a location was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResolutionSource {
    BundledFlat,
    BundledArch,
    BundledEmulated,
    System,
    SearchPath,
    /// Nothing found; the bare name is left to the OS at spawn time
    BareName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedToolLocation {
    pub path: PathBuf,
    /// Prepended before caller arguments (script path for interpreter bundles)
    pub leading_args: Vec<PathBuf>,
    pub is_bundled: bool,
    pub is_emulated: bool,
    pub source: ResolutionSource,
}

impl ResolvedToolLocation {
    pub fn is_installed(&self) -> bool {
        self.source != ResolutionSource::BareName
    }
}

/// Filesystem seam used during resolution
pub trait ToolProbe: Send + Sync {
    fn is_file(&self, path: &Path) -> bool;
    fn search_path(&self, binary: &str) -> Option<PathBuf>;
}

pub struct SystemProbe;

impl ToolProbe for SystemProbe {
    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn search_path(&self, binary: &str) -> Option<PathBuf> {
        which::which(binary).ok()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// What the conversion pipeline needs from the tool layer
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Tool resolved to a real file (not just the bare-name fallback)
    fn is_available(&self, tool: &str) -> bool;

    async fn run(&self, tool: &str, args: Vec<OsString>, options: RunOptions) -> Result<ToolOutput>;
}

pub struct NativeToolManager {
    bundle_dir: PathBuf,
    profile: SystemProfile,
    specs: HashMap<&'static str, ToolSpec>,
    probe: Arc<dyn ToolProbe>,
    cache: Mutex<HashMap<String, ResolvedToolLocation>>,
}

impl NativeToolManager {
    pub fn new(config: &Config, profile: SystemProfile) -> Self {
        Self::with_probe(config.bundle_dir.clone(), profile, Arc::new(SystemProbe))
    }

    pub fn with_probe(bundle_dir: PathBuf, profile: SystemProfile, probe: Arc<dyn ToolProbe>) -> Self {
        let specs = default_specs().into_iter().map(|s| (s.name, s)).collect();
        Self {
            bundle_dir,
            profile,
            specs,
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn profile(&self) -> &SystemProfile {
        &self.profile
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.specs.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn resolve(&self, tool: &str) -> Result<ResolvedToolLocation> {
        if let Some(hit) = self.lock_cache().get(tool) {
            return Ok(hit.clone());
        }

        let spec = self
            .specs
            .get(tool)
            .ok_or_else(|| RawError::ToolNotFound(format!("unknown tool '{}'", tool)))?;

        let location = self.locate(spec);
        info!("Resolved {} -> {} ({:?})", tool, location.path.display(), location.source);

        self.lock_cache().insert(tool.to_string(), location.clone());
        Ok(location)
    }

    /// Forget every cached resolution
    pub fn clear_cache(&self) {
        self.lock_cache().clear();
    }

    pub async fn run_tool(&self, tool: &str, args: Vec<OsString>, options: RunOptions) -> Result<ToolOutput> {
        let location = self.resolve(tool)?;
        ToolCommand::new(&location.path)
            .label(tool)
            .args(location.leading_args.iter().map(|p| p.as_os_str().to_os_string()))
            .args(args)
            .timeout(options.timeout)
            .max_output_bytes(options.max_output_bytes)
            .execute()
            .await
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, ResolvedToolLocation>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn locate(&self, spec: &ToolSpec) -> ResolvedToolLocation {
        let platform = &self.profile.platform;
        let os_dir = self.bundle_dir.join(platform.bundle_dir());
        let arch_dir = os_dir.join(self.profile.architecture.bundle_dir());

        if let Some(found) = self.bundled_in(spec, &os_dir) {
            return found.into_location(ResolutionSource::BundledFlat, self.profile.is_emulated);
        }
        if let Some(found) = self.bundled_in(spec, &arch_dir) {
            return found.into_location(ResolutionSource::BundledArch, self.profile.is_emulated);
        }

        if self.profile.is_arm64 && self.profile.architecture != Architecture::X64 {
            let x64_dir = os_dir.join(Architecture::X64.bundle_dir());
            if let Some(found) = self.bundled_in(spec, &x64_dir) {
                debug!("{}: no ARM64 bundle, using x64 build under emulation", spec.name);
                return found.into_location(ResolutionSource::BundledEmulated, true);
            }
        }

        for candidate in spec.system_paths(platform) {
            let path = PathBuf::from(candidate);
            if self.probe.is_file(&path) {
                return ResolvedToolLocation {
                    path,
                    leading_args: Vec::new(),
                    is_bundled: false,
                    is_emulated: false,
                    source: ResolutionSource::System,
                };
            }
        }

        let (path, source) = match self.probe.search_path(spec.binary) {
            Some(path) => (path, ResolutionSource::SearchPath),
            None => (PathBuf::from(spec.binary), ResolutionSource::BareName),
        };
        ResolvedToolLocation {
            path,
            leading_args: Vec::new(),
            is_bundled: false,
            is_emulated: false,
            source,
        }
    }

    fn bundled_in(&self, spec: &ToolSpec, dir: &Path) -> Option<Bundled> {
        let platform = &self.profile.platform;

        if let (Platform::Windows, Some(launch)) = (platform, spec.windows_script) {
            let interpreter = dir.join(format!("{}{}", launch.interpreter, platform.exe_suffix()));
            let script = dir.join(launch.script);
            if self.probe.is_file(&interpreter) && self.probe.is_file(&script) {
                return Some(Bundled {
                    path: interpreter,
                    leading_args: vec![script],
                });
            }
        }

        let binary = dir.join(format!("{}{}", spec.binary, platform.exe_suffix()));
        self.probe.is_file(&binary).then(|| Bundled {
            path: binary,
            leading_args: Vec::new(),
        })
    }
}

struct Bundled {
    path: PathBuf,
    leading_args: Vec<PathBuf>,
}

impl Bundled {
    fn into_location(self, source: ResolutionSource, is_emulated: bool) -> ResolvedToolLocation {
        ResolvedToolLocation {
            path: self.path,
            leading_args: self.leading_args,
            is_bundled: true,
            is_emulated,
            source,
        }
    }
}

#[async_trait]
impl ToolRunner for NativeToolManager {
    fn is_available(&self, tool: &str) -> bool {
        self.resolve(tool).map(|l| l.is_installed()).unwrap_or(false)
    }

    async fn run(&self, tool: &str, args: Vec<OsString>, options: RunOptions) -> Result<ToolOutput> {
        self.run_tool(tool, args, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Probe backed by an in-memory file set that counts every access
    struct FakeFs {
        files: HashSet<PathBuf>,
        on_path: HashMap<String, PathBuf>,
        accesses: AtomicUsize,
    }

    impl FakeFs {
        fn new(files: &[PathBuf]) -> Arc<Self> {
            Arc::new(Self {
                files: files.iter().cloned().collect(),
                on_path: HashMap::new(),
                accesses: AtomicUsize::new(0),
            })
        }
    }

    impl ToolProbe for FakeFs {
        fn is_file(&self, path: &Path) -> bool {
            self.accesses.fetch_add(1, Ordering::SeqCst);
            self.files.contains(path)
        }

        fn search_path(&self, binary: &str) -> Option<PathBuf> {
            self.accesses.fetch_add(1, Ordering::SeqCst);
            self.on_path.get(binary).cloned()
        }
    }

    fn profile(arch: Architecture, platform: Platform) -> SystemProfile {
        SystemProfile {
            is_arm64: arch == Architecture::Arm64,
            is_x64: arch == Architecture::X64,
            is_emulated: false,
            architecture: arch,
            platform,
        }
    }

    fn bundle() -> PathBuf {
        PathBuf::from("/opt/app/bin")
    }

    #[test]
    fn test_flat_bundle_wins() {
        let fs = FakeFs::new(&[
            bundle().join("linux/dcraw"),
            bundle().join("linux/x64/dcraw"),
            PathBuf::from("/usr/bin/dcraw"),
        ]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), fs);

        let loc = tools.resolve(CLASSIC_DECODER).unwrap();
        assert_eq!(loc.path, bundle().join("linux/dcraw"));
        assert_eq!(loc.source, ResolutionSource::BundledFlat);
        assert!(loc.is_bundled);
        assert!(!loc.is_emulated);
    }

    #[test]
    fn test_arch_bundle_before_system() {
        let fs = FakeFs::new(&[
            bundle().join("darwin/arm64/dcraw_emu"),
            PathBuf::from("/opt/homebrew/bin/dcraw_emu"),
        ]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::Arm64, Platform::MacOs), fs);

        let loc = tools.resolve(EMULATION_DECODER).unwrap();
        assert_eq!(loc.path, bundle().join("darwin/arm64/dcraw_emu"));
        assert_eq!(loc.source, ResolutionSource::BundledArch);
    }

    #[test]
    fn test_arm64_falls_back_to_x64_bundle_as_emulated() {
        let fs = FakeFs::new(&[bundle().join("win32/x64/dcraw.exe")]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::Arm64, Platform::Windows), fs);

        let loc = tools.resolve(CLASSIC_DECODER).unwrap();
        assert_eq!(loc.path, bundle().join("win32/x64/dcraw.exe"));
        assert!(loc.is_emulated);
        assert_eq!(loc.source, ResolutionSource::BundledEmulated);
    }

    #[test]
    fn test_system_location_then_search_path_then_bare_name() {
        let fs = FakeFs::new(&[PathBuf::from("/usr/local/bin/dcraw")]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), fs);
        let loc = tools.resolve(CLASSIC_DECODER).unwrap();
        assert_eq!(loc.source, ResolutionSource::System);
        assert_eq!(loc.path, PathBuf::from("/usr/local/bin/dcraw"));

        let mut fs = FakeFs {
            files: HashSet::new(),
            on_path: HashMap::new(),
            accesses: AtomicUsize::new(0),
        };
        fs.on_path.insert("dcraw".to_string(), PathBuf::from("/home/me/bin/dcraw"));
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), Arc::new(fs));
        let loc = tools.resolve(CLASSIC_DECODER).unwrap();
        assert_eq!(loc.source, ResolutionSource::SearchPath);
        assert!(tools.is_available(CLASSIC_DECODER));

        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), FakeFs::new(&[]));
        let loc = tools.resolve(VENDOR_CONVERTER).unwrap();
        assert_eq!(loc.source, ResolutionSource::BareName);
        assert_eq!(loc.path, PathBuf::from("Adobe DNG Converter"));
        assert!(!tools.is_available(VENDOR_CONVERTER));
    }

    #[test]
    fn test_resolution_touches_filesystem_once() {
        let fs = FakeFs::new(&[PathBuf::from("/usr/bin/dcraw")]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), fs.clone());

        let first = tools.resolve(CLASSIC_DECODER).unwrap();
        let after_first = fs.accesses.load(Ordering::SeqCst);
        assert!(after_first > 0);

        for _ in 0..10 {
            assert_eq!(tools.resolve(CLASSIC_DECODER).unwrap(), first);
        }
        assert_eq!(fs.accesses.load(Ordering::SeqCst), after_first);

        tools.clear_cache();
        tools.resolve(CLASSIC_DECODER).unwrap();
        assert!(fs.accesses.load(Ordering::SeqCst) > after_first);
    }

    #[test]
    fn test_windows_script_bundle_prepends_script() {
        let fs = FakeFs::new(&[
            bundle().join("win32/perl.exe"),
            bundle().join("win32/exiftool.pl"),
        ]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Windows), fs);

        let loc = tools.resolve(EXIFTOOL).unwrap();
        assert_eq!(loc.path, bundle().join("win32/perl.exe"));
        assert_eq!(loc.leading_args, vec![bundle().join("win32/exiftool.pl")]);
        assert!(loc.is_bundled);
    }

    #[test]
    fn test_script_bundle_ignored_off_windows() {
        let fs = FakeFs::new(&[
            bundle().join("linux/perl"),
            bundle().join("linux/exiftool.pl"),
            PathBuf::from("/usr/bin/exiftool"),
        ]);
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), fs);

        let loc = tools.resolve(EXIFTOOL).unwrap();
        assert_eq!(loc.path, PathBuf::from("/usr/bin/exiftool"));
        assert!(loc.leading_args.is_empty());
    }

    #[test]
    fn test_unknown_tool() {
        let tools = NativeToolManager::with_probe(bundle(), profile(Architecture::X64, Platform::Linux), FakeFs::new(&[]));
        assert!(matches!(tools.resolve("photoshop"), Err(RawError::ToolNotFound(_))));
        assert!(!tools.is_available("photoshop"));
    }
}
