// agent-worker: handler dispatch and step execution for the pipelines agent.
// Depends on `agent-sdk` and `agent-common`.
//
// Architecture:
//   StepRunner::run → HandlerFactory::create(HandlerData) → Handler::run_async
//     → StepHost::execute (host or container) → ProcessInvoker
//     → output lines → WorkerCommandManager (`##vso[...]`) → ExecutionContext

pub mod command_manager;
pub mod container;
pub mod execution_context;
pub mod handlers;
pub mod step_runner;
pub mod task_commands;
pub mod variables;
