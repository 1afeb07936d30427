// Constants mapping `Constants.cs` from the C# agent.
// Well-known directories, platform detection and the variable names the handlers read.

use std::fmt;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Well-known directories used by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownDirectory {
    Bin,
    Diag,
    Externals,
    LegacyPSHost,
    Root,
    ServerOM,
    Tasks,
    Temp,
    Tools,
    Work,
}

impl fmt::Display for WellKnownDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Well-known configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WellKnownConfigFile {
    Agent,
}

impl fmt::Display for WellKnownConfigFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Operating system platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsPlatform {
    Linux,
    MacOS,
    Windows,
}

impl fmt::Display for OsPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OsPlatform::Linux => write!(f, "Linux"),
            OsPlatform::MacOS => write!(f, "OSX"),
            OsPlatform::Windows => write!(f, "Windows"),
        }
    }
}

// ---------------------------------------------------------------------------
// Platform detection (compile-time)
// ---------------------------------------------------------------------------

#[cfg(target_os = "linux")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;
#[cfg(target_os = "macos")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::MacOS;
#[cfg(target_os = "windows")]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Windows;
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
pub const CURRENT_PLATFORM: OsPlatform = OsPlatform::Linux;

// ---------------------------------------------------------------------------
// Top-level constants
// ---------------------------------------------------------------------------

pub use agent_sdk::path_util::PATH_VARIABLE;

/// Injected into every child so tools can detect they run under the agent.
pub const TF_BUILD: &str = "TF_BUILD";

/// Name of the worker executable, also the tracing target of the binary.
pub const WORKER_HOST_TYPE: &str = "Worker";

// ---------------------------------------------------------------------------
// Path constants
// ---------------------------------------------------------------------------

pub mod path {
    pub const BIN_DIRECTORY: &str = "bin";
    pub const DIAG_DIRECTORY: &str = "_diag";
    pub const EXTERNALS_DIRECTORY: &str = "externals";
    pub const LEGACY_PS_HOST_DIRECTORY: &str = "vstshost";
    pub const SERVER_OM_DIRECTORY: &str = "vstsom";
    pub const TASKS_DIRECTORY: &str = "_tasks";
    pub const TEMP_DIRECTORY: &str = "_temp";
    pub const TOOL_DIRECTORY: &str = "_tool";
    pub const WORK_DIRECTORY: &str = "_work";
    pub const AGENT_SETTINGS_FILE: &str = ".agent";
}

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

pub mod variables {
    pub const MACRO_PREFIX: &str = "$(";
    pub const MACRO_SUFFIX: &str = ")";

    pub mod agent {
        pub const CONTAINER_NETWORK: &str = "agent.containerNetwork";
        pub const JOB_STATUS: &str = "agent.jobstatus";
        pub const ROOT_DIRECTORY: &str = "agent.RootDirectory";
        pub const SERVER_OM_DIRECTORY: &str = "agent.ServerOMDirectory";
        pub const TEMP_DIRECTORY: &str = "agent.TempDirectory";
        pub const WORK_FOLDER: &str = "agent.workfolder";
    }

    pub mod build {
        pub const DEFINITION_NAME: &str = "build.definitionname";
        pub const REPO_NAME: &str = "build.repository.name";
        pub const REPO_PROVIDER: &str = "build.repository.provider";
    }

    pub mod system {
        pub const ACCESS_TOKEN: &str = "system.accessToken";
        pub const DEBUG: &str = "system.debug";
        pub const DEFAULT_WORKING_DIRECTORY: &str = "system.defaultworkingdirectory";
    }

    pub mod retain {
        pub const DEFAULT_ENCODING: &str = "retain.default.encoding";
    }
}
