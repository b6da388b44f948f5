//! # PATH Resolution
//!
//! Backs `engine.which`/`engine.isCommandAvailable` (§6, supplemental): scans
//! `PATH` for the first existing, executable match for a program name, honoring
//! Windows' `PATHEXT` when the binary name has no extension of its own.

use std::path::{Path, PathBuf};

/// Resolves `program` against `PATH`. Returns `None` if no entry has an
/// executable file by that name (or, on Windows, that stem with one of the
/// `PATHEXT` extensions).
pub async fn which(program: &str) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) {
        return exists_executable(Path::new(program)).await.then(|| PathBuf::from(program));
    }

    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        for candidate in candidates(&dir, program) {
            if exists_executable(&candidate).await {
                return Some(candidate);
            }
        }
    }
    None
}

#[cfg(windows)]
fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    let pathext = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    let has_ext = Path::new(program).extension().is_some();
    if has_ext {
        return vec![dir.join(program)];
    }
    pathext
        .split(';')
        .filter(|ext| !ext.is_empty())
        .map(|ext| dir.join(format!("{program}{ext}")))
        .collect()
}

#[cfg(not(windows))]
fn candidates(dir: &Path, program: &str) -> Vec<PathBuf> {
    vec![dir.join(program)]
}

#[cfg(unix)]
async fn exists_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn exists_executable(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_a_binary_known_to_exist_in_this_environment() {
        let found = which("sh").await;
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn returns_none_for_a_nonexistent_program() {
        let found = which("definitely-not-a-real-binary-xyz").await;
        assert!(found.is_none());
    }
}
