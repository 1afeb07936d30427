// agent-common: Shared services for the pipelines agent worker.
// Directory layout, tracing with secret masking, results, the logging-command
// token parser and the handler error taxonomy. Depends on `agent-sdk`.

pub mod agent_settings;
pub mod command;
pub mod constants;
pub mod errors;
pub mod host_context;
pub mod secret_masker;
pub mod task_result;
pub mod tracing;
pub mod var_util;

pub use agent_settings::AgentSettings;
pub use command::Command;
pub use constants::{OsPlatform, WellKnownConfigFile, WellKnownDirectory, CURRENT_PLATFORM};
pub use errors::HandlerError;
pub use host_context::HostContext;
pub use secret_masker::SecretMasker;
pub use task_result::TaskResult;
pub use tracing::{TraceEventType, TraceManager, Tracing};
pub use var_util::VarUtil;
