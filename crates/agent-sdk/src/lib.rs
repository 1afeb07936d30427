// agent-sdk: Foundation layer for the pipelines agent.
// No dependencies on other agent crates: process launching, argument checks,
// string/path helpers and the plugin payload records.

pub mod arg_util;
pub mod io_util;
pub mod path_util;
pub mod process_invoker;
pub mod string_util;
pub mod task_plugin;
pub mod trace;
pub mod which_util;

pub use arg_util::{ArgUtil, ArgumentError};
pub use io_util::IOUtil;
pub use path_util::PathUtil;
pub use process_invoker::{
    OutputEncoding, OutputStream, ProcessCancelledError, ProcessDataReceivedEventArgs,
    ProcessExitCodeError, ProcessInvoker, ProcessOptions,
};
pub use string_util::StringUtil;
pub use task_plugin::{
    AgentTaskPluginExecutionContext, EndpointAuthorization, RepositoryResource, SecureFile,
    ServiceEndpoint, VariableValue,
};
pub use trace::{CollectingTraceWriter, NullTraceWriter, TraceLevel, TraceWriter, TracingTraceWriter};
pub use which_util::WhichUtil;
