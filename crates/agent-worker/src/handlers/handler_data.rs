// HandlerData mapping the `*HandlerData` execution sections of `task.json`.
// The closed set of ways a step can be executed. Every variant names exactly one
// handler strategy; the factory matches on it exhaustively.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum HandlerData {
    Process(ProcessHandlerData),
    Script(ScriptHandlerData),
    Node(NodeHandlerData),
    Node10(NodeHandlerData),
    PowerShell(PowerShellHandlerData),
    PowerShell3(PowerShell3HandlerData),
    PowerShellExe(PowerShellExeHandlerData),
    AzurePowerShell(PowerShellHandlerData),
    AgentPlugin(AgentPluginHandlerData),
    ContainerAction(ContainerActionHandlerData),
    NodeScriptAction(NodeScriptActionHandlerData),
}

impl HandlerData {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerData::Process(_) => "Process",
            HandlerData::Script(_) => "Script",
            HandlerData::Node(_) => "Node",
            HandlerData::Node10(_) => "Node10",
            HandlerData::PowerShell(_) => "PowerShell",
            HandlerData::PowerShell3(_) => "PowerShell3",
            HandlerData::PowerShellExe(_) => "PowerShellExe",
            HandlerData::AzurePowerShell(_) => "AzurePowerShell",
            HandlerData::AgentPlugin(_) => "AgentPlugin",
            HandlerData::ContainerAction(_) => "ContainerAction",
            HandlerData::NodeScriptAction(_) => "NodeScriptAction",
        }
    }
}

impl fmt::Display for HandlerData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Runs `target` through the platform shell.
///
/// The flag fields are kept as strings so they can hold `$(variable)` macros;
/// they are expanded and parsed when the handler runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessHandlerData {
    pub target: String,
    #[serde(default)]
    pub argument_format: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub modify_environment: Option<String>,
    #[serde(default)]
    pub fail_on_standard_error: Option<String>,
}

/// Generic shell step. The script body and interpreter come from the
/// `script`, `shell` and `workingDirectory` inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptHandlerData {
    /// Interpreter used when the `shell` input is absent.
    #[serde(default)]
    pub default_shell: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHandlerData {
    pub target: String,
    #[serde(default)]
    pub working_directory: String,
}

/// Legacy host script. Shared by `PowerShell` and `AzurePowerShell`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerShellHandlerData {
    pub target: String,
    #[serde(default)]
    pub argument_format: String,
    #[serde(default)]
    pub working_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerShell3HandlerData {
    pub target: String,
    #[serde(default)]
    pub working_directory: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScriptType {
    #[default]
    FilePath,
    InlineScript,
}

/// How the wrapped expression reaches `powershell.exe`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadTransportKind {
    #[default]
    Stdin,
    EncodedCommand,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerShellExeHandlerData {
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub argument_format: String,
    #[serde(default)]
    pub working_directory: String,
    #[serde(default)]
    pub script_type: ScriptType,
    #[serde(default)]
    pub inline_script: String,
    #[serde(default)]
    pub fail_on_standard_error: Option<String>,
    #[serde(default)]
    pub payload_transport: PayloadTransportKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentPluginHandlerData {
    /// Assembly-qualified plugin name, e.g. `Agent.Plugins.Repository.CheckoutTask, Agent.Plugins`.
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerActionHandlerData {
    /// A Dockerfile relative to the task directory, or `docker://<image>`.
    pub target: String,
    /// A pre-built image. Skips the build when set.
    #[serde(default)]
    pub container_image: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeScriptActionHandlerData {
    pub target: String,
}
