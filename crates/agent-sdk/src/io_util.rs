// IOUtil mapping `IOUtil.cs`.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
pub const EXE_EXTENSION: &str = ".exe";
#[cfg(not(target_os = "windows"))]
pub const EXE_EXTENSION: &str = "";

/// Path string comparison rules for the host file system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePathComparison {
    CaseSensitive,
    CaseInsensitive,
}

#[cfg(target_os = "windows")]
pub const FILE_PATH_STRING_COMPARISON: FilePathComparison = FilePathComparison::CaseInsensitive;
#[cfg(not(target_os = "windows"))]
pub const FILE_PATH_STRING_COMPARISON: FilePathComparison = FilePathComparison::CaseSensitive;

pub struct IOUtil;

impl IOUtil {
    /// Remove a file, clearing the read-only bit first. Missing files are not an error.
    pub fn delete_file(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }

        if let Ok(meta) = fs::metadata(path) {
            let mut perms = meta.permissions();
            if perms.readonly() {
                #[allow(clippy::permissions_set_readonly_false)]
                perms.set_readonly(false);
                let _ = fs::set_permissions(path, perms);
            }
        }

        fs::remove_file(path).with_context(|| format!("Failed to delete file '{}'", path.display()))
    }

    pub fn ensure_directory(path: &Path) -> Result<()> {
        if !path.is_dir() {
            fs::create_dir_all(path)
                .with_context(|| format!("Failed to create directory '{}'", path.display()))?;
        }
        Ok(())
    }

    /// Recursively copy `source` into `target`, overwriting files that already exist.
    pub fn copy_directory(source: &Path, target: &Path) -> Result<()> {
        Self::ensure_directory(target)?;
        for entry in walkdir::WalkDir::new(source).min_depth(1) {
            let entry = entry.with_context(|| format!("Failed to walk '{}'", source.display()))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .with_context(|| format!("'{}' escaped '{}'", entry.path().display(), source.display()))?;
            let destination = target.join(relative);
            if entry.file_type().is_dir() {
                Self::ensure_directory(&destination)?;
            } else {
                fs::copy(entry.path(), &destination).with_context(|| {
                    format!(
                        "Failed to copy '{}' to '{}'",
                        entry.path().display(),
                        destination.display()
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Lowercase hex SHA-256 of the path string, used for stable short labels.
    pub fn get_path_hash(path: &str) -> String {
        hex::encode(Sha256::digest(path.as_bytes()))
    }

    /// `path` equals `prefix` or lives beneath it, honouring platform case rules.
    pub fn path_starts_with(path: &str, prefix: &str) -> bool {
        match FILE_PATH_STRING_COMPARISON {
            FilePathComparison::CaseSensitive => path.starts_with(prefix),
            FilePathComparison::CaseInsensitive => {
                path.len() >= prefix.len()
                    && path
                        .get(..prefix.len())
                        .map(|head| head.eq_ignore_ascii_case(prefix))
                        .unwrap_or(false)
            }
        }
    }

    pub fn paths_equal(a: &str, b: &str) -> bool {
        match FILE_PATH_STRING_COMPARISON {
            FilePathComparison::CaseSensitive => a == b,
            FilePathComparison::CaseInsensitive => a.eq_ignore_ascii_case(b),
        }
    }

    /// Directory containing the running executable.
    pub fn get_bin_path() -> Result<PathBuf> {
        let exe = std::env::current_exe().context("Failed to resolve current executable")?;
        exe.parent()
            .map(Path::to_path_buf)
            .context("Executable has no parent directory")
    }
}
