//! JIT engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default bound on retained compiled units.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 1000;

/// Directories probed, in order, for the runtime header.
pub const DEFAULT_HEADER_DIRS: [&str; 2] = ["/usr/local/lib/method_jit", "/usr/local/include"];

/// Which C compiler family drives code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Toolchain {
    /// GCC-style argv; the precompiled header is picked up via `-I`.
    #[default]
    Gcc,
    /// Clang-style argv with an explicit `-include-pch`.
    Clang,
}

impl Toolchain {
    /// Executable name, resolved through `PATH`.
    pub fn program(self) -> &'static str {
        match self {
            Toolchain::Gcc => "gcc",
            Toolchain::Clang => "clang",
        }
    }
}

/// Options snapshot taken by `init`.
///
/// The engine copies this once at startup; the worker keeps using the
/// copy even while the host tears its own state down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JitOptions {
    /// Master enable. When false, `init` is a no-op.
    pub enabled: bool,
    /// Compiler family used for the PCH and every unit.
    pub toolchain: Toolchain,
    /// Keep generated `.c`, `.so` and PCH files after use.
    pub save_temps: bool,
    /// Emit non-fatal compiler-interaction warnings.
    pub warnings: bool,
    /// Compile with `-O0 -g` instead of `-O2`.
    pub debug: bool,
    /// Progressive logging, 0-3. Above 0 the compiler's own stdio is
    /// passed through instead of being discarded.
    pub verbose: u8,
    /// Upper bound on retained compiled units; surplus tombstoned units
    /// are unloaded at submit time.
    pub max_cache_size: usize,
    /// Directory for generated files (assumed to be tmpfs).
    pub temp_dir: PathBuf,
    /// Directories probed, in order, for the runtime header.
    pub header_dirs: Vec<PathBuf>,
}

impl Default for JitOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            toolchain: Toolchain::default(),
            save_temps: false,
            warnings: false,
            debug: false,
            verbose: 0,
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            temp_dir: PathBuf::from("/tmp"),
            header_dirs: DEFAULT_HEADER_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl JitOptions {
    /// Default options with the master switch on.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    /// Enabled options compiling with `-O0 -g`.
    pub fn debug_build() -> Self {
        Self {
            enabled: true,
            debug: true,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let opts = JitOptions::default();
        assert!(!opts.enabled);
        assert!(!opts.save_temps);
        assert_eq!(opts.verbose, 0);
        assert_eq!(opts.max_cache_size, DEFAULT_MAX_CACHE_SIZE);
        assert_eq!(opts.temp_dir, PathBuf::from("/tmp"));
        assert_eq!(opts.header_dirs.len(), 2);
    }

    #[test]
    fn enabled_options() {
        assert!(JitOptions::enabled().enabled);
        let opts = JitOptions::debug_build();
        assert!(opts.enabled && opts.debug);
    }

    #[test]
    fn toolchain_programs() {
        assert_eq!(Toolchain::Gcc.program(), "gcc");
        assert_eq!(Toolchain::Clang.program(), "clang");
        assert_eq!(Toolchain::default(), Toolchain::Gcc);
    }
}
