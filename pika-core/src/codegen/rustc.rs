//! Host compiler glue: turn generated source text into a runnable binary.
//!
//! A thin adapter around `rustc`: the source is written into a temporary
//! work directory, compiled against the `pika_core` rlib, and the path of
//! the produced executable is returned.  The work directory is removed
//! when the compiler handle drops unless artifacts are kept.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;

use crate::codegen::mangle::crate_name;
use crate::error::LispError;

/// Environment variable naming the runtime rlib explicitly.
pub const RUNTIME_RLIB_VAR: &str = "PIKA_RUNTIME_RLIB";

pub struct HostCompiler {
    work_dir: PathBuf,
    keep: bool,
}

impl HostCompiler {
    pub fn new() -> Result<HostCompiler, LispError> {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| LispError::internal(format!("clock error: {}", e)))?
            .as_nanos();
        let work_dir = std::env::temp_dir().join(format!("pika-build-{}", unique));
        std::fs::create_dir_all(&work_dir)
            .map_err(|e| LispError::io(format!("cannot create work dir: {}", e)))?;
        Ok(HostCompiler {
            work_dir,
            keep: false,
        })
    }

    /// Keep the work directory (and intermediate source) after drop.
    pub fn keep_artifacts(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Compile `source` and return the path of the produced executable.
    pub fn compile(&self, source: &str, unit: &str) -> Result<PathBuf, LispError> {
        let name = crate_name(unit);
        let src_path = self.work_dir.join(format!("{}.rs", name));
        std::fs::write(&src_path, source)
            .map_err(|e| LispError::io(format!("cannot write generated source: {}", e)))?;

        let rlib = locate_runtime()?;
        let deps = rlib
            .parent()
            .map(|d| d.join("deps"))
            .filter(|d| d.is_dir());
        let out_path = self.work_dir.join(&name);

        let mut cmd = Command::new("rustc");
        cmd.arg("--edition")
            .arg("2021")
            .arg("-O")
            .arg("--crate-name")
            .arg(&name)
            .arg("--extern")
            .arg(format!("pika_core={}", rlib.display()))
            .arg("-o")
            .arg(&out_path)
            .arg(&src_path);
        if let Some(parent) = rlib.parent() {
            cmd.arg("-L").arg(parent);
        }
        if let Some(deps) = deps {
            cmd.arg("-L").arg(format!("dependency={}", deps.display()));
        }
        debug!("rustc {:?}", cmd);

        let output = cmd
            .output()
            .map_err(|e| LispError::io(format!("cannot run rustc: {}", e)))?;
        if !output.status.success() {
            return Err(LispError::io(format!(
                "rustc failed for {}: {}",
                unit,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(out_path)
    }
}

impl Drop for HostCompiler {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_dir_all(&self.work_dir);
        }
    }
}

/// Find the `pika_core` rlib: the override variable first, then the
/// target directory next to the running executable.
fn locate_runtime() -> Result<PathBuf, LispError> {
    if let Ok(path) = std::env::var(RUNTIME_RLIB_VAR) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
        return Err(LispError::io(format!(
            "{} points at missing file {}",
            RUNTIME_RLIB_VAR,
            path.display()
        )));
    }
    let exe = std::env::current_exe()
        .map_err(|e| LispError::io(format!("cannot locate executable: {}", e)))?;
    let mut candidates = Vec::new();
    if let Some(dir) = exe.parent() {
        candidates.push(dir.join("libpika_core.rlib"));
        candidates.push(dir.join("deps"));
    }
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
        if candidate.is_dir() {
            // Cargo names dependency rlibs with a metadata hash.
            if let Ok(entries) = std::fs::read_dir(candidate) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    if name.starts_with("libpika_core") && name.ends_with(".rlib") {
                        return Ok(entry.path());
                    }
                }
            }
        }
    }
    Err(LispError::io(format!(
        "cannot locate the pika_core rlib; set {}",
        RUNTIME_RLIB_VAR
    )))
}
