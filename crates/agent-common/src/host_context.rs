// HostContext mapping `HostContext.cs`.
// Process-wide context: directory layout, settings, trace sources and the shutdown signal.

use crate::agent_settings::AgentSettings;
use crate::constants::{self, WellKnownConfigFile, WellKnownDirectory};
use crate::secret_masker::SecretMasker;
use crate::tracing::{TraceManager, Tracing};

use agent_sdk::TraceWriter;
use anyhow::Result;
use parking_lot::RwLock;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The process-wide agent context shared by every step.
pub struct HostContext {
    host_type: String,

    secret_masker: SecretMasker,

    trace_manager: TraceManager,

    /// Cancelled when the worker is asked to stop (Ctrl-C, SIGTERM).
    shutdown_token: CancellationToken,

    /// Override for the agent root directory (used in tests).
    root_override: RwLock<Option<PathBuf>>,

    /// Resolved from `AgentSettings::work_folder` once settings are loaded.
    work_override: RwLock<Option<PathBuf>>,

    settings: RwLock<AgentSettings>,
}

impl HostContext {
    pub fn new(host_type: impl Into<String>) -> Arc<Self> {
        let secret_masker = SecretMasker::new();
        Arc::new(Self {
            host_type: host_type.into(),
            trace_manager: TraceManager::new(secret_masker.clone()),
            secret_masker,
            shutdown_token: CancellationToken::new(),
            root_override: RwLock::new(None),
            work_override: RwLock::new(None),
            settings: RwLock::new(AgentSettings::default()),
        })
    }

    /// A context rooted at `root`, for tests and local runs outside an installed layout.
    pub fn with_root(host_type: impl Into<String>, root: impl Into<PathBuf>) -> Arc<Self> {
        let context = Self::new(host_type);
        context.set_root_override(root.into());
        context
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn secret_masker(&self) -> &SecretMasker {
        &self.secret_masker
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Load `.agent` from the root directory and apply its work folder.
    pub fn load_settings(&self) -> Result<AgentSettings> {
        let settings = AgentSettings::load(&self.get_config_file(WellKnownConfigFile::Agent))?;
        if !settings.work_folder.is_empty() {
            self.set_work_folder(&settings.work_folder);
        }
        *self.settings.write() = settings.clone();
        Ok(settings)
    }

    pub fn settings(&self) -> AgentSettings {
        self.settings.read().clone()
    }

    // -----------------------------------------------------------------------
    // Directory resolution
    // -----------------------------------------------------------------------

    pub fn set_root_override(&self, path: PathBuf) {
        *self.root_override.write() = Some(path);
    }

    /// Point `Work` somewhere else. Relative paths resolve against the root.
    pub fn set_work_folder(&self, work_folder: &str) {
        let path = if Path::new(work_folder).is_absolute() {
            PathBuf::from(work_folder)
        } else {
            self.get_directory(WellKnownDirectory::Root).join(work_folder)
        };
        *self.work_override.write() = Some(path);
    }

    pub fn get_directory(&self, directory: WellKnownDirectory) -> PathBuf {
        match directory {
            WellKnownDirectory::Bin => {
                if let Some(root) = self.root_override.read().as_ref() {
                    return root.join(constants::path::BIN_DIRECTORY);
                }
                env::current_exe()
                    .ok()
                    .and_then(|p| p.parent().map(|p| p.to_path_buf()))
                    .unwrap_or_else(|| PathBuf::from("."))
            }

            WellKnownDirectory::Root => {
                if let Some(root) = self.root_override.read().as_ref() {
                    return root.clone();
                }
                let bin = self.get_directory(WellKnownDirectory::Bin);
                bin.parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| bin.clone())
            }

            WellKnownDirectory::Diag => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::DIAG_DIRECTORY),

            WellKnownDirectory::Externals => self
                .get_directory(WellKnownDirectory::Root)
                .join(constants::path::EXTERNALS_DIRECTORY),

            WellKnownDirectory::LegacyPSHost => self
                .get_directory(WellKnownDirectory::Externals)
                .join(constants::path::LEGACY_PS_HOST_DIRECTORY),

            WellKnownDirectory::ServerOM => self
                .get_directory(WellKnownDirectory::Externals)
                .join(constants::path::SERVER_OM_DIRECTORY),

            WellKnownDirectory::Tasks => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TASKS_DIRECTORY),

            WellKnownDirectory::Temp => self
                .get_directory(WellKnownDirectory::Work)
                .join(constants::path::TEMP_DIRECTORY),

            WellKnownDirectory::Tools => env::var("AGENT_TOOLSDIRECTORY")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| {
                    self.get_directory(WellKnownDirectory::Work)
                        .join(constants::path::TOOL_DIRECTORY)
                }),

            WellKnownDirectory::Work => {
                if let Some(work) = self.work_override.read().as_ref() {
                    return work.clone();
                }
                self.get_directory(WellKnownDirectory::Root)
                    .join(constants::path::WORK_DIRECTORY)
            }
        }
    }

    pub fn get_config_file(&self, config_file: WellKnownConfigFile) -> PathBuf {
        let root = self.get_directory(WellKnownDirectory::Root);
        match config_file {
            WellKnownConfigFile::Agent => root.join(constants::path::AGENT_SETTINGS_FILE),
        }
    }

    // -----------------------------------------------------------------------
    // Tracing
    // -----------------------------------------------------------------------

    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// A trace source as the narrow writer the process gateway takes.
    pub fn get_trace_writer(&self, name: &str) -> Arc<dyn TraceWriter> {
        self.trace_manager.get_writer(name)
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: &str) {
        self.get_trace("HostContext")
            .info(&format!("Worker will be shutdown for {}", reason));
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_follow_root_override() {
        let ctx = HostContext::with_root("Worker", "/agent");
        assert_eq!(ctx.get_directory(WellKnownDirectory::Root), PathBuf::from("/agent"));
        assert_eq!(ctx.get_directory(WellKnownDirectory::Bin), PathBuf::from("/agent/bin"));
        assert_eq!(
            ctx.get_directory(WellKnownDirectory::LegacyPSHost),
            PathBuf::from("/agent/externals/vstshost")
        );
        assert_eq!(
            ctx.get_directory(WellKnownDirectory::ServerOM),
            PathBuf::from("/agent/externals/vstsom")
        );
        assert_eq!(
            ctx.get_directory(WellKnownDirectory::Temp),
            PathBuf::from("/agent/_work/_temp")
        );
        assert_eq!(
            ctx.get_directory(WellKnownDirectory::Tasks),
            PathBuf::from("/agent/_work/_tasks")
        );
    }

    #[test]
    fn settings_work_folder_moves_work_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".agent"), r#"{"WorkFolder":"w2"}"#).unwrap();
        let ctx = HostContext::with_root("Worker", dir.path());

        let settings = ctx.load_settings().unwrap();
        assert_eq!(settings.work_folder, "w2");
        assert_eq!(ctx.get_directory(WellKnownDirectory::Work), dir.path().join("w2"));
        assert_eq!(
            ctx.get_directory(WellKnownDirectory::Temp),
            dir.path().join("w2").join("_temp")
        );
    }

    #[test]
    fn shutdown_cancels_token() {
        let ctx = HostContext::new("Worker");
        let token = ctx.shutdown_token();
        assert!(!token.is_cancelled());
        ctx.shutdown("test");
        assert!(token.is_cancelled());
    }
}
