// Handlers: one execution strategy per step kind, the shared base they run on,
// the hosts that launch their processes, and the factory that picks between them.

pub mod agent_plugin_handler;
pub mod container_action_handler;
pub mod handler;
pub mod handler_data;
pub mod handler_factory;
pub mod legacy_powershell_handler;
pub mod node_handler;
pub mod node_script_action_handler;
pub mod output_manager;
pub mod powershell3_handler;
pub mod powershell_exe_handler;
pub mod process_handler;
pub mod script_handler;
pub mod step_host;

pub use handler::{Handler, HandlerBase, HandlerOutcome};
pub use handler_data::HandlerData;
pub use handler_factory::{HandlerFactory, StepSpec};
pub use step_host::{ContainerStepHost, DefaultStepHost, ExecRequest, StepHost};
