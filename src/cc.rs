//! Compiler toolchain argv tables, temp-file naming, and the process
//! runner that drives the external C compiler.

use crate::config::{JitOptions, Toolchain};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

/// Runtime header included (via the PCH) by every emitted translation
/// unit.
pub const HEADER_FILE_NAME: &str = "vm_jit_runtime.h";

const GCC_COMMON_ARGS: &[&str] = &[
    "-O2",
    "-Wfatal-errors",
    "-fPIC",
    "-shared",
    "-w",
    "-pipe",
    "-nostartfiles",
    "-nodefaultlibs",
    "-nostdlib",
];

const GCC_COMMON_ARGS_DEBUG: &[&str] = &[
    "-O0",
    "-g",
    "-Wfatal-errors",
    "-fPIC",
    "-shared",
    "-w",
    "-pipe",
    "-nostartfiles",
    "-nodefaultlibs",
    "-nostdlib",
];

#[cfg(target_os = "macos")]
const LLVM_COMMON_ARGS: &[&str] = &[
    "-O2",
    "-dynamic",
    "-I/usr/local/include",
    "-L/usr/local/lib",
    "-w",
    "-bundle",
];

#[cfg(target_os = "macos")]
const LLVM_COMMON_ARGS_DEBUG: &[&str] = &[
    "-O0",
    "-g",
    "-dynamic",
    "-I/usr/local/include",
    "-L/usr/local/lib",
    "-w",
    "-bundle",
];

#[cfg(not(target_os = "macos"))]
const LLVM_COMMON_ARGS: &[&str] = &[
    "-O2",
    "-fPIC",
    "-shared",
    "-I/usr/local/include",
    "-L/usr/local/lib",
    "-w",
    "-bundle",
];

#[cfg(not(target_os = "macos"))]
const LLVM_COMMON_ARGS_DEBUG: &[&str] = &[
    "-O0",
    "-g",
    "-fPIC",
    "-shared",
    "-I/usr/local/include",
    "-L/usr/local/lib",
    "-w",
    "-bundle",
];

fn common_args(toolchain: Toolchain, debug: bool) -> &'static [&'static str] {
    match (toolchain, debug) {
        (Toolchain::Gcc, false) => GCC_COMMON_ARGS,
        (Toolchain::Gcc, true) => GCC_COMMON_ARGS_DEBUG,
        (Toolchain::Clang, false) => LLVM_COMMON_ARGS,
        (Toolchain::Clang, true) => LLVM_COMMON_ARGS_DEBUG,
    }
}

/// Unique file name for this process and unit: `<prefix><pid>u<id><suffix>`
/// under `dir`. The pid keeps concurrent processes from colliding.
pub(crate) fn uniq_filename(dir: &Path, prefix: &str, id: u64, suffix: &str) -> PathBuf {
    dir.join(format!("{}{}u{}{}", prefix, std::process::id(), id, suffix))
}

/// Path of the generated C file for a unit.
pub(crate) fn c_file(dir: &Path, id: u64) -> PathBuf {
    uniq_filename(dir, "_mjit", id, ".c")
}

/// Path of the compiled shared object for a unit.
pub(crate) fn so_file(dir: &Path, id: u64) -> PathBuf {
    uniq_filename(dir, "_mjit", id, ".so")
}

/// Path of the precompiled header.
pub(crate) fn pch_file(dir: &Path) -> PathBuf {
    uniq_filename(dir, "_mjit_h", 0, ".h.gch")
}

/// Name of the generated function for a unit.
pub(crate) fn funcname(id: u64) -> String {
    format!("_mjit{}", id)
}

/// Probe the configured directories, in order, for the runtime header.
pub(crate) fn find_header(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(HEADER_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

/// Argv (program name excluded) that turns the runtime header into a
/// precompiled header.
pub(crate) fn pch_argv(opts: &JitOptions, header: &Path, pch: &Path) -> Vec<String> {
    let mut args: Vec<String> = common_args(opts.toolchain, opts.debug)
        .iter()
        .map(|s| s.to_string())
        .collect();
    if opts.toolchain == Toolchain::Clang {
        args.push("-emit-pch".to_string());
    }
    args.push(header.display().to_string());
    args.push("-o".to_string());
    args.push(pch.display().to_string());
    args
}

/// Argv (program name excluded) that compiles a generated C file into a
/// shared object against the precompiled header.
pub(crate) fn object_argv(opts: &JitOptions, c_file: &Path, so_file: &Path, pch: &Path) -> Vec<String> {
    let mut args: Vec<String> = common_args(opts.toolchain, opts.debug)
        .iter()
        .map(|s| s.to_string())
        .collect();
    match opts.toolchain {
        Toolchain::Gcc => {
            args.push(format!("-I{}", opts.temp_dir.display()));
        }
        Toolchain::Clang => {
            args.push("-include-pch".to_string());
            args.push(pch.display().to_string());
            args.push("-Wl,-undefined".to_string());
            args.push("-Wl,dynamic_lookup".to_string());
        }
    }
    args.push(c_file.display().to_string());
    args.push("-o".to_string());
    args.push(so_file.display().to_string());
    args
}

/// Run an external compiler and wait for it.
///
/// With `verbose == 0` the child's stdout/stderr go to the null sink:
/// the compiler may legitimately complain about files a racing `finish`
/// already removed, and those messages must not leak. Termination by
/// signal surfaces as an `ExitStatus` without a code; spawn failure as
/// the `io::Error`.
pub(crate) fn run(program: &str, args: &[String], verbose: u8) -> std::io::Result<ExitStatus> {
    if verbose >= 2 {
        tracing::debug!(program, args = args.join(" "), "starting compiler process");
    }
    let mut command = Command::new(program);
    command.args(args);
    if verbose == 0 {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }
    let mut child = command.spawn()?;
    child.wait()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unique_filenames_carry_pid_and_id() {
        let dir = Path::new("/tmp");
        let pid = std::process::id();
        assert_eq!(
            c_file(dir, 5),
            PathBuf::from(format!("/tmp/_mjit{}u5.c", pid))
        );
        assert_eq!(
            so_file(dir, 5),
            PathBuf::from(format!("/tmp/_mjit{}u5.so", pid))
        );
        assert_eq!(
            pch_file(dir),
            PathBuf::from(format!("/tmp/_mjit_h{}u0.h.gch", pid))
        );
        assert_eq!(funcname(12), "_mjit12");
    }

    #[test]
    fn gcc_object_argv_uses_include_dir() {
        let opts = JitOptions::enabled();
        let args = object_argv(
            &opts,
            Path::new("/tmp/u.c"),
            Path::new("/tmp/u.so"),
            Path::new("/tmp/h.gch"),
        );
        assert!(args.contains(&"-O2".to_string()));
        assert!(args.contains(&"-shared".to_string()));
        assert!(args.contains(&"-I/tmp".to_string()));
        assert!(!args.iter().any(|a| a == "-include-pch"));
        // Input precedes `-o <output>`.
        let input = args.iter().position(|a| a == "/tmp/u.c").unwrap();
        let out_flag = args.iter().position(|a| a == "-o").unwrap();
        assert!(input < out_flag);
        assert_eq!(args[out_flag + 1], "/tmp/u.so");
    }

    #[test]
    fn clang_object_argv_uses_pch() {
        let opts = JitOptions {
            toolchain: Toolchain::Clang,
            ..JitOptions::enabled()
        };
        let args = object_argv(
            &opts,
            Path::new("/tmp/u.c"),
            Path::new("/tmp/u.so"),
            Path::new("/tmp/h.gch"),
        );
        let pch_flag = args.iter().position(|a| a == "-include-pch").unwrap();
        assert_eq!(args[pch_flag + 1], "/tmp/h.gch");
        assert!(args.contains(&"-Wl,dynamic_lookup".to_string()));
    }

    #[test]
    fn debug_argv_disables_optimization() {
        let opts = JitOptions::debug_build();
        let args = pch_argv(&opts, Path::new("/x/h.h"), Path::new("/x/h.h.gch"));
        assert!(args.contains(&"-O0".to_string()));
        assert!(args.contains(&"-g".to_string()));
        assert!(!args.contains(&"-O2".to_string()));
    }

    #[test]
    fn clang_pch_argv_emits_pch() {
        let opts = JitOptions {
            toolchain: Toolchain::Clang,
            ..JitOptions::enabled()
        };
        let args = pch_argv(&opts, Path::new("/x/h.h"), Path::new("/x/h.h.gch"));
        assert!(args.contains(&"-emit-pch".to_string()));
        let gcc_args = pch_argv(&JitOptions::enabled(), Path::new("/x/h.h"), Path::new("/x/h.h.gch"));
        assert!(!gcc_args.contains(&"-emit-pch".to_string()));
    }

    #[test]
    fn header_probe_respects_order() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];

        assert_eq!(find_header(&dirs), None);

        std::fs::write(second.path().join(HEADER_FILE_NAME), "x").unwrap();
        assert_eq!(
            find_header(&dirs),
            Some(second.path().join(HEADER_FILE_NAME))
        );

        std::fs::write(first.path().join(HEADER_FILE_NAME), "x").unwrap();
        assert_eq!(
            find_header(&dirs),
            Some(first.path().join(HEADER_FILE_NAME))
        );
    }

    #[test]
    fn run_surfaces_missing_program() {
        let err = run("definitely-not-a-compiler-xyz", &[], 0);
        assert!(err.is_err());
    }
}
