// WhichUtil mapping `WhichUtil.cs`.
// Thin wrapper over the `which` crate that honours an explicit PATH when one is supplied.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

pub struct WhichUtil;

impl WhichUtil {
    /// Locate `command` on the agent's own PATH.
    pub fn which(command: &str, require: bool) -> Result<Option<PathBuf>> {
        Self::which_in(command, require, None)
    }

    /// Locate `command` using `path` as the search list instead of the process PATH.
    ///
    /// Handlers pass the step's prepended PATH so tools added by earlier steps resolve.
    pub fn which_in(command: &str, require: bool, path: Option<&str>) -> Result<Option<PathBuf>> {
        if command.is_empty() {
            if require {
                bail!("Value cannot be null or empty. (Parameter 'command')");
            }
            return Ok(None);
        }

        let candidate = Path::new(command);
        if candidate.is_absolute() && candidate.is_file() {
            return Ok(Some(candidate.to_path_buf()));
        }

        let found = match path {
            Some(search) => {
                let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                which::which_in(command, Some(search), cwd).ok()
            }
            None => which::which(command).ok(),
        };

        match found {
            Some(p) => Ok(Some(p)),
            None if require => bail!(
                "{command}: command not found. Make sure '{command}' is installed and its location included in the 'PATH' environment variable."
            ),
            None => Ok(None),
        }
    }
}
