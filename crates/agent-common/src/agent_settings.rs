// AgentSettings mapping `ConfigurationStore.cs`.
// The `.agent` settings file written at configuration time and read by the worker.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Persisted agent configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default, rename = "AgentName")]
    pub agent_name: String,

    /// Work directory, absolute or relative to the agent root.
    #[serde(default, rename = "WorkFolder")]
    pub work_folder: String,

    #[serde(default, rename = "ServerUrl")]
    pub server_url: String,
}

impl AgentSettings {
    /// Read settings from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        let settings = serde_json::from_str(&json)
            .with_context(|| format!("Failed to deserialize agent settings from {:?}", path))?;
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write settings to {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AgentSettings::load(&dir.path().join(".agent")).unwrap();
        assert_eq!(settings, AgentSettings::default());
    }

    #[test]
    fn reads_pascal_case_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".agent");
        fs::write(
            &path,
            r#"{"AgentName":"build-01","WorkFolder":"_w","ServerUrl":"https://dev.example.com/org","PoolId":3}"#,
        )
        .unwrap();

        let settings = AgentSettings::load(&path).unwrap();
        assert_eq!(settings.agent_name, "build-01");
        assert_eq!(settings.work_folder, "_w");
        assert_eq!(settings.server_url, "https://dev.example.com/org");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".agent");
        let settings = AgentSettings {
            agent_name: "a".into(),
            work_folder: "/w".into(),
            server_url: String::new(),
        };
        settings.save(&path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("\"WorkFolder\""));
        assert_eq!(AgentSettings::load(&path).unwrap(), settings);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".agent");
        fs::write(&path, "{not json").unwrap();
        assert!(AgentSettings::load(&path).is_err());
    }
}
